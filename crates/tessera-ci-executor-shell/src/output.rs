//! Bounded output capture.

/// Bytes of each stream kept for failure messages (64 KB).
///
/// We keep the TAIL of output since errors usually appear at the end.
pub const MAX_TAIL_BYTES: usize = 64 * 1024;

/// Maximum line length for stdout/stderr (64 KB).
/// Lines longer than this are truncated.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Marker prepended when output was truncated.
pub const TRUNCATION_MARKER: &str = "...[truncated - showing last 64 KB of output]...\n";

/// Rolling buffer that keeps the last `limit` bytes of a stream.
#[derive(Debug, Clone)]
pub struct OutputTail {
    buf: String,
    limit: usize,
    truncated: bool,
}

impl OutputTail {
    /// Create a tail buffer holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append a chunk, dropping the oldest bytes past the limit.
    pub fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        if self.buf.len() > self.limit {
            let mut start = self.buf.len() - self.limit;
            while !self.buf.is_char_boundary(start) {
                start += 1;
            }
            self.buf.drain(..start);
            self.truncated = true;
        }
    }

    /// True if bytes were dropped.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Finish, prepending the truncation marker if needed.
    pub fn into_string(self) -> String {
        if self.truncated {
            format!("{TRUNCATION_MARKER}{}", self.buf)
        } else {
            self.buf
        }
    }
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(MAX_TAIL_BYTES)
    }
}

/// Decode a raw line and cap its length.
pub(crate) fn normalize_line(raw: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(raw).into_owned();
    if line.len() > MAX_LINE_LENGTH {
        let mut end = MAX_LINE_LENGTH;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line.truncate(end);
        line.push_str("... [truncated]\n");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_last_bytes() {
        let mut tail = OutputTail::new(8);
        tail.push("hello ");
        tail.push("world\n");
        assert!(tail.is_truncated());
        assert_eq!(tail.into_string(), format!("{TRUNCATION_MARKER}o world\n"));
    }

    #[test]
    fn test_tail_untruncated() {
        let mut tail = OutputTail::default();
        tail.push("ok\n");
        assert_eq!(tail.into_string(), "ok\n");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let mut tail = OutputTail::new(3);
        tail.push("aé€");
        let s = tail.into_string();
        assert!(s.ends_with('€'));
    }

    #[test]
    fn test_normalize_line() {
        assert_eq!(normalize_line(b"abc\n"), "abc\n");
        assert_eq!(normalize_line(&[0x66, 0xff, b'\n']), "f\u{fffd}\n");
        let long = vec![b'x'; MAX_LINE_LENGTH + 10];
        let line = normalize_line(&long);
        assert!(line.ends_with("... [truncated]\n"));
        assert_eq!(line.len(), MAX_LINE_LENGTH + "... [truncated]\n".len());
    }
}
