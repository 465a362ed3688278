use crate::error::{ChatError, ChatResult};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3004";

/// Connection and logging options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Base URL of the SimpleChat server.
    #[arg(long, global = true, env = "SIMPLECHAT_URL", default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    #[arg(long, global = true, env = "SIMPLECHAT_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Timeout for non-streaming requests (conversation list, history, `--no-stream` sends).
    #[arg(long, global = true, env = "SIMPLECHAT_REQUEST_TIMEOUT", default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Longest wait between two chunks of a streamed reply. 0 waits forever.
    #[arg(long, global = true, env = "SIMPLECHAT_IDLE_TIMEOUT", default_value_t = 120)]
    pub idle_timeout_secs: u64,

    /// Use the single request/response endpoint instead of the streaming one.
    #[arg(long, global = true)]
    pub no_stream: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, env = "SIMPLECHAT_LOG", default_value = "info")]
    pub log_level: String,

    /// Log file for the terminal UI. Defaults to ~/.simplechat/logs.
    #[arg(long, global = true, env = "SIMPLECHAT_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(base_url: impl AsRef<str>) -> ChatResult<Self> {
        let base_url = normalize_base_url(base_url.as_ref());
        let parsed = reqwest::Url::parse(&base_url)
            .map_err(|err| ChatError::Config(format!("invalid server url `{}`: {}", base_url, err)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ChatError::Config(format!(
                "server url must use http or https, got `{}`",
                parsed.scheme()
            )));
        }

        Ok(Self {
            base_url,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            idle_timeout: Some(Duration::from_secs(120)),
        })
    }
}

impl TryFrom<&Settings> for ClientConfig {
    type Error = ChatError;

    fn try_from(settings: &Settings) -> ChatResult<Self> {
        let mut config = ClientConfig::new(&settings.server)?;
        config.connect_timeout = Duration::from_secs(settings.connect_timeout_secs);
        config.request_timeout = Duration::from_secs(settings.request_timeout_secs);
        config.idle_timeout = match settings.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(config)
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

pub fn default_log_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".simplechat").join("logs");
    }

    PathBuf::from("simplechat-logs")
}
