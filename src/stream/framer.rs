/// Splits `text` appended to `carry` on `\n`.
///
/// Returns the complete lines in order (without their newline) and the new carry, which is the
/// final unterminated segment and may be empty.
pub fn frame_lines(carry: &str, text: &str) -> (Vec<String>, String) {
    let combined = format!("{}{}", carry, text);
    let mut segments: Vec<String> = combined.split('\n').map(str::to_owned).collect();
    // `split` always yields at least one segment.
    let carry = segments.pop().unwrap_or_default();
    (segments, carry)
}

#[derive(Debug, Default)]
pub struct LineFramer {
    partial: String,
}

impl LineFramer {
    pub fn push(&mut self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let (lines, carry) = frame_lines(&self.partial, text);
        self.partial = carry;
        lines
    }

    #[cfg(test)]
    pub fn partial(&self) -> &str {
        &self.partial
    }

    pub fn take_partial(&mut self) -> String {
        std::mem::take(&mut self.partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_unterminated_segment_as_carry() {
        let (lines, carry) = frame_lines("da", "ta: one\ndata: two\ndata: th");
        assert_eq!(lines, vec!["data: one", "data: two"]);
        assert_eq!(carry, "data: th");
    }

    #[test]
    fn trailing_newline_leaves_empty_carry() {
        let (lines, carry) = frame_lines("", "data: one\n\n");
        assert_eq!(lines, vec!["data: one", ""]);
        assert_eq!(carry, "");
    }

    #[test]
    fn framer_accumulates_across_pushes() {
        let mut framer = LineFramer::default();
        assert!(framer.push("data: {\"a\":").is_empty());
        assert_eq!(framer.partial(), "data: {\"a\":");
        assert_eq!(framer.push("1}\r\nrest"), vec!["data: {\"a\":1}\r"]);
        assert_eq!(framer.take_partial(), "rest");
        assert_eq!(framer.partial(), "");
    }
}
