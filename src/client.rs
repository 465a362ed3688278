use crate::config::ClientConfig;
use crate::dispatch::{ReplyDispatcher, ReplyView, SendOutcome};
use crate::error::{ChatError, ChatResult, TransportErrorKind};
use crate::protocol::{
    Acknowledged, ApiEnvelope, ConversationCreated, ConversationDetail, ConversationId,
    ConversationList, ConversationSummary, SendMessageRequest, SendMessageResponse, StreamEvent,
};
use crate::stream::{EventReader, ParsedLine};
use futures::{Stream, StreamExt};
use reqwest::Client as HttpClient;
use reqwest::Response;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// HTTP client for one SimpleChat server.
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    request_timeout: Duration,
    idle_timeout: Option<Duration>,
    http: HttpClient,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> ChatResult<Self> {
        let http = HttpClient::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            base_url: config.base_url,
            request_timeout: config.request_timeout,
            idle_timeout: config.idle_timeout,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/chat/{}", self.base_url, path)
    }

    pub async fn list_conversations(&self) -> ChatResult<Vec<ConversationSummary>> {
        let response = self
            .http
            .get(self.url("conversations"))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let list: ConversationList = read_envelope(response, "list conversations").await?;
        debug!(count = list.conversations.len(), "loaded conversation list");
        Ok(list.conversations)
    }

    pub async fn create_conversation(&self) -> ChatResult<ConversationId> {
        let response = self
            .http
            .post(self.url("new"))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let created: ConversationCreated = read_envelope(response, "create conversation").await?;
        info!(conversation_id = created.conversation_id, "created conversation");
        Ok(created.conversation_id)
    }

    pub async fn fetch_messages(&self, conversation_id: ConversationId) -> ChatResult<ConversationDetail> {
        let response = self
            .http
            .get(self.url(&format!("messages/{}", conversation_id)))
            .timeout(self.request_timeout)
            .send()
            .await?;
        read_envelope(response, "load messages").await
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> ChatResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("delete/{}", conversation_id)))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let _: Acknowledged = read_envelope(response, "delete conversation").await?;
        info!(conversation_id, "deleted conversation");
        Ok(())
    }

    /// Single round trip: the reply arrives as one message.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> ChatResult<SendMessageResponse> {
        let request = SendMessageRequest {
            conversation_id,
            message: content.to_string(),
        };
        let response = self
            .http
            .post(self.url("send"))
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;
        read_envelope(response, "send message").await
    }

    /// Sends `content` through the non-streaming endpoint and renders the reply through `view`
    /// with the same conclusion guarantees as [`ChatClient::send_streaming`].
    pub async fn send_blocking<V: ReplyView>(
        &self,
        conversation_id: ConversationId,
        content: &str,
        view: V,
        cancel: &CancellationToken,
    ) -> SendOutcome {
        let mut dispatcher = ReplyDispatcher::new(view);
        dispatcher.open();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            result = self.send_message(conversation_id, content) => result,
        };

        match result {
            Ok(response) => {
                dispatcher.handle(StreamEvent::UserMessage {
                    message: Some(response.user_message),
                });
                dispatcher.handle(StreamEvent::AiChunk {
                    content: response.ai_message.content.clone(),
                });
                dispatcher.handle(StreamEvent::AiComplete {
                    message: response.ai_message,
                });
            }
            Err(err) => {
                warn!(error = %err, "send failed");
                dispatcher.fail(err);
            }
        }

        dispatcher.finish()
    }

    /// Sends `content` and renders the streamed reply through `view`.
    ///
    /// Never returns an error: every failure is folded into the [`SendOutcome`] after the view
    /// has been told to discard the reply and restore input.
    pub async fn send_streaming<V: ReplyView>(
        &self,
        conversation_id: ConversationId,
        content: &str,
        view: V,
        cancel: &CancellationToken,
    ) -> SendOutcome {
        let mut dispatcher = ReplyDispatcher::new(view);
        dispatcher.open();

        let request = SendMessageRequest {
            conversation_id,
            message: content.to_string(),
        };
        if let Err(err) = self.pump_stream(&request, &mut dispatcher, cancel).await {
            warn!(error = %err, conversation_id, "streamed send failed");
            dispatcher.fail(err);
        }

        dispatcher.finish()
    }

    async fn pump_stream<V: ReplyView>(
        &self,
        request: &SendMessageRequest,
        dispatcher: &mut ReplyDispatcher<V>,
        cancel: &CancellationToken,
    ) -> ChatResult<()> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            response = self.within_idle_limit(
                self.http.post(self.url("send-stream")).json(request).send(),
                "response",
            ) => response??,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status { status, body });
        }

        let mut stream = response.bytes_stream();
        let mut reader = EventReader::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                next = self.next_chunk(&mut stream) => next?,
            };

            let Some(chunk) = next else {
                debug!("response body ended");
                reader.finish();
                return Ok(());
            };

            for parsed in reader.feed(&chunk) {
                match parsed {
                    ParsedLine::Event(event) => dispatcher.handle(event),
                    ParsedLine::EndOfStream => {
                        debug!("received end-of-stream sentinel");
                        return Ok(());
                    }
                    ParsedLine::ParseError { payload, reason } => {
                        warn!(%reason, %payload, "skipping malformed stream event");
                    }
                    ParsedLine::NoEvent => {}
                }
            }

            // `ai_complete` and `error` are final; nothing after them can change the reply.
            if dispatcher.is_concluded() {
                return Ok(());
            }
        }
    }

    async fn next_chunk<S, B>(&self, stream: &mut S) -> ChatResult<Option<B>>
    where
        S: Stream<Item = reqwest::Result<B>> + Unpin,
    {
        let next = self.within_idle_limit(stream.next(), "data").await?;
        Ok(next.transpose()?)
    }

    /// Bounds one wait on the server by the idle timeout, when one is configured.
    async fn within_idle_limit<F: Future>(&self, wait: F, waiting_for: &str) -> ChatResult<F::Output> {
        let Some(limit) = self.idle_timeout else {
            return Ok(wait.await);
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| ChatError::Transport {
                kind: TransportErrorKind::Timeout,
                message: format!("no {} received for {:?}", waiting_for, limit),
            })
    }
}

async fn read_envelope<T: DeserializeOwned>(response: Response, action: &str) -> ChatResult<T> {
    let status = response.status();
    let body = response.text().await?;

    let envelope: ApiEnvelope<T> = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => return Err(ChatError::Status { status, body }),
        Err(err) => return Err(err.into()),
    };

    if !envelope.success {
        let error = envelope
            .error
            .unwrap_or_else(|| format!("Failed to {}", action));
        return Err(ChatError::Api(error));
    }

    envelope
        .data
        .ok_or_else(|| ChatError::Api(format!("Failed to {}: incomplete response", action)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{RecordingView, ViewCall};
    use axum::Router;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn_server(router: Router) -> ChatClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let mut config = ClientConfig::new(format!("http://{}", addr)).unwrap();
        config.idle_timeout = Some(Duration::from_secs(5));
        ChatClient::new(config).unwrap()
    }

    fn streamed(chunks: Vec<&'static str>) -> Router {
        Router::new().route(
            "/api/chat/send-stream",
            post(move || {
                let chunks = chunks.clone();
                async move {
                    let body = futures::stream::iter(
                        chunks
                            .into_iter()
                            .map(|chunk| Ok::<_, std::io::Error>(chunk.as_bytes().to_vec())),
                    );
                    Body::from_stream(body)
                }
            }),
        )
    }

    #[tokio::test]
    async fn streams_reply_across_split_chunks() {
        let client = spawn_server(streamed(vec![
            "data: {\"type\":\"user_message\"}\ndata: {\"type\":\"ai_st",
            "art\"}\ndata: {\"type\":\"ai_chunk\",\"content\":\"Hel",
            "lo\"}\n",
            "data: {\"type\":\"ai_complete\",\"message\":{\"id\":4,\"role\":\"assistant\",\"content\":\"Hello\",\"created_at\":\"2024-05-01T08:00:00.5\"}}\n",
            "data: [DONE]\n",
        ]))
        .await;

        let mut view = RecordingView::default();
        let outcome = client
            .send_streaming(1, "hi", &mut view, &CancellationToken::new())
            .await;

        match outcome {
            SendOutcome::Completed(message) => {
                assert_eq!(message.content, "Hello");
                assert_eq!(message.id, Some(4));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(view.reply_text(), "Hello");
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn body_end_without_sentinel_concludes_normally() {
        let client = spawn_server(streamed(vec![
            "data: {\"type\":\"ai_chunk\",\"content\":\"par\"}\n",
            "data: {\"type\":\"ai_chunk\",\"content\":\"tial\"}\n",
            "data: {\"type\":\"ai_chunk\"",
        ]))
        .await;

        let mut view = RecordingView::default();
        let outcome = client
            .send_streaming(1, "hi", &mut view, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, SendOutcome::Ended { ref text } if text == "partial"));
        assert_eq!(view.count(&ViewCall::Discard), 0);
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn error_event_fails_the_send() {
        let client = spawn_server(streamed(vec![
            "data: {\"type\":\"ai_chunk\",\"content\":\"x\"}\n",
            "data: not json\n",
            "data: {\"type\":\"error\",\"error\":\"API key invalid\"}\n",
            "data: [DONE]\n",
        ]))
        .await;

        let mut view = RecordingView::default();
        let outcome = client
            .send_streaming(1, "hi", &mut view, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, SendOutcome::Failed(ChatError::Stream(_))));
        assert_eq!(view.errors(), vec!["API key invalid".to_string()]);
        assert_eq!(view.count(&ViewCall::Discard), 1);
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn non_success_status_aborts_before_streaming() {
        let router = Router::new().route(
            "/api/chat/send-stream",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let client = spawn_server(router).await;

        let mut view = RecordingView::default();
        let outcome = client
            .send_streaming(1, "hi", &mut view, &CancellationToken::new())
            .await;

        match outcome {
            SendOutcome::Failed(ChatError::Status { status, body }) => {
                assert_eq!(status.as_u16(), 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected status failure, got {:?}", other),
        }
        assert_eq!(view.errors(), vec!["Failed to send message, please retry".to_string()]);
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = ChatClient::new(ClientConfig::new(format!("http://{}", addr)).unwrap()).unwrap();

        let mut view = RecordingView::default();
        let outcome = client
            .send_streaming(1, "hi", &mut view, &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            SendOutcome::Failed(ChatError::Transport {
                kind: TransportErrorKind::Connect,
                ..
            })
        ));
        assert_eq!(
            view.errors(),
            vec!["Could not reach the server, check your connection".to_string()]
        );
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_a_stalled_stream() {
        let router = Router::new().route(
            "/api/chat/send-stream",
            post(|| async {
                let head = futures::stream::once(async {
                    Ok::<_, std::io::Error>("data: {\"type\":\"ai_chunk\",\"content\":\"x\"}\n")
                });
                Body::from_stream(head.chain(futures::stream::pending()))
            }),
        );
        let client = spawn_server(router).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let mut view = RecordingView::default();
        let outcome = client.send_streaming(1, "hi", &mut view, &cancel).await;

        assert!(matches!(outcome, SendOutcome::Cancelled));
        assert_eq!(view.count(&ViewCall::Discard), 1);
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn stalled_stream_hits_idle_timeout() {
        let router = Router::new().route(
            "/api/chat/send-stream",
            post(|| async {
                Body::from_stream(futures::stream::pending::<Result<String, std::io::Error>>())
            }),
        );
        let mut client = spawn_server(router).await;
        client.idle_timeout = Some(Duration::from_millis(100));

        let mut view = RecordingView::default();
        let outcome = client
            .send_streaming(1, "hi", &mut view, &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            SendOutcome::Failed(ChatError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            })
        ));
        assert_eq!(view.errors(), vec!["Request timed out, please retry later".to_string()]);
    }

    #[tokio::test]
    async fn silent_server_hits_idle_timeout_before_headers() {
        let router = Router::new().route(
            "/api/chat/send-stream",
            post(|| std::future::pending::<&'static str>()),
        );
        let mut client = spawn_server(router).await;
        client.idle_timeout = Some(Duration::from_millis(100));

        let mut view = RecordingView::default();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            client.send_streaming(1, "hi", &mut view, &CancellationToken::new()),
        )
        .await
        .expect("send should give up on its own");

        assert!(matches!(
            outcome,
            SendOutcome::Failed(ChatError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            })
        ));
        assert_eq!(view.count(&ViewCall::Discard), 1);
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn connection_dropped_mid_body_fails_the_send() {
        let router = Router::new().route(
            "/api/chat/send-stream",
            post(|| async {
                let body = futures::stream::iter(vec![
                    Ok("data: {\"type\":\"ai_chunk\",\"content\":\"half a\"}\n".to_string()),
                    Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection reset",
                    )),
                ]);
                Body::from_stream(body)
            }),
        );
        let client = spawn_server(router).await;

        let mut view = RecordingView::default();
        let outcome = client
            .send_streaming(1, "hi", &mut view, &CancellationToken::new())
            .await;

        assert!(
            matches!(outcome, SendOutcome::Failed(ChatError::Transport { .. })),
            "got {:?}",
            outcome
        );
        assert_eq!(view.count(&ViewCall::Discard), 1);
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn stream_request_carries_conversation_and_message() {
        let seen = Arc::new(std::sync::Mutex::new(None::<Value>));
        let router = Router::new()
            .route(
                "/api/chat/send-stream",
                post(
                    |State(seen): State<Arc<std::sync::Mutex<Option<Value>>>>,
                     axum::Json(body): axum::Json<Value>| async move {
                        *seen.lock().unwrap() = Some(body);
                        "data: [DONE]\n"
                    },
                ),
            )
            .with_state(Arc::clone(&seen));
        let client = spawn_server(router).await;

        let mut view = RecordingView::default();
        client
            .send_streaming(9, "how are you?", &mut view, &CancellationToken::new())
            .await;

        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(json!({"conversation_id": 9, "message": "how are you?"}))
        );
    }

    #[tokio::test]
    async fn blocking_send_renders_whole_reply() {
        let router = Router::new().route(
            "/api/chat/send",
            post(|| async {
                axum::Json(json!({
                    "success": true,
                    "user_message": {"id": 1, "role": "user", "content": "hi", "created_at": "2024-05-01T08:00:00"},
                    "ai_message": {"id": 2, "role": "assistant", "content": "Hello there", "created_at": "2024-05-01T08:00:02"}
                }))
            }),
        );
        let client = spawn_server(router).await;

        let mut view = RecordingView::default();
        let outcome = client
            .send_blocking(1, "hi", &mut view, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, SendOutcome::Completed(ref m) if m.content == "Hello there"));
        assert_eq!(view.reply_text(), "Hello there");
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn blocking_send_surfaces_server_error_text() {
        let router = Router::new().route(
            "/api/chat/send",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(json!({"success": false, "error": "conversation not found"})),
                )
            }),
        );
        let client = spawn_server(router).await;

        let mut view = RecordingView::default();
        let outcome = client
            .send_blocking(1, "hi", &mut view, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, SendOutcome::Failed(ChatError::Api(_))));
        assert_eq!(view.errors(), vec!["conversation not found".to_string()]);
        assert_eq!(view.count(&ViewCall::Restore), 1);
    }

    #[tokio::test]
    async fn collaborator_endpoints_unwrap_envelopes() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/api/chat/conversations",
                get(|| async {
                    axum::Json(json!({
                        "success": true,
                        "conversations": [{
                            "id": 3,
                            "title": "Rust questions",
                            "message_count": 2,
                            "created_at": "2024-05-01T08:00:00",
                            "updated_at": "2024-05-01T08:05:00",
                            "last_message_time": "2024-05-01T08:05:00"
                        }]
                    }))
                }),
            )
            .route(
                "/api/chat/new",
                post(|| async { axum::Json(json!({"success": true, "conversation_id": 11})) }),
            )
            .route(
                "/api/chat/messages/:id",
                get(|| async {
                    axum::Json(json!({
                        "success": true,
                        "conversation": {
                            "id": 3,
                            "title": "Rust questions",
                            "created_at": "2024-05-01T08:00:00",
                            "updated_at": "2024-05-01T08:05:00",
                            "last_message_time": "2024-05-01T08:05:00"
                        },
                        "messages": [
                            {"id": 1, "role": "user", "content": "hi", "created_at": "2024-05-01T08:00:00"},
                            {"id": 2, "role": "assistant", "content": "hello", "created_at": "2024-05-01T08:05:00"}
                        ]
                    }))
                }),
            )
            .route(
                "/api/chat/delete/:id",
                axum::routing::delete(|State(deletes): State<Arc<AtomicUsize>>| async move {
                    deletes.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!({"success": true, "message": "deleted"}))
                }),
            )
            .with_state(Arc::clone(&deletes));
        let client = spawn_server(router).await;

        let conversations = client.list_conversations().await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].title, "Rust questions");

        assert_eq!(client.create_conversation().await.unwrap(), 11);

        let detail = client.fetch_messages(3).await.unwrap();
        assert_eq!(detail.conversation.id, 3);
        assert_eq!(detail.messages.len(), 2);
        assert_eq!(detail.messages[1].content, "hello");

        client.delete_conversation(3).await.unwrap();
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_envelope_becomes_api_error() {
        let router = Router::new().route(
            "/api/chat/delete/:id",
            axum::routing::delete(|| async {
                (
                    StatusCode::NOT_FOUND,
                    axum::Json(json!({"success": false, "error": "conversation not found"})),
                )
            }),
        );
        let client = spawn_server(router).await;

        match client.delete_conversation(42).await {
            Err(ChatError::Api(message)) => assert_eq!(message, "conversation not found"),
            other => panic!("expected api error, got {:?}", other),
        }
    }
}
