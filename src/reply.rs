//! Server reply representation, line framing, and multi-line assembly (§4.1).

/// A single logical reply from the server: a 3-digit code, the final text
/// line, and zero or more lines preceding it in a multi-line reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    /// Builds a single-line reply.
    pub fn single(code: u16, text: impl Into<String>) -> Self {
        Reply {
            code,
            lines: vec![text.into()],
        }
    }

    /// Builds a multi-line reply; `lines` excludes the leading `"ddd-"` and
    /// trailing `"ddd "` markers, which are not part of the reply's text.
    pub fn multi(code: u16, lines: Vec<String>) -> Self {
        Reply { code, lines }
    }

    /// The 3-digit reply code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// The reply class: the first digit of the code, 1..=5.
    pub fn class(&self) -> u8 {
        (self.code / 100) as u8
    }

    /// True if this reply is preliminary (1yz) and does not consume a
    /// `pending_replies` slot.
    pub fn is_preliminary(&self) -> bool {
        self.class() == 1
    }

    /// The final (canonical) line of the reply, sans the leading code.
    pub fn last_line(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }

    /// All lines of a multi-line reply, including the final one, with the
    /// leading `"ddd "`/`"ddd-"` prefix already stripped.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The full reply text: all lines joined by `\n`.
    pub fn full_text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Incrementally assembles raw bytes from the control channel into complete
/// [`Reply`] values, honoring the FTP multi-line convention.
///
/// Grounded on `CFtpControlSocket::OnReceive`/`ParseLine` in the original
/// engine: lines are terminated by `\r`, `\n`, or NUL; empty fragments are
/// skipped; lines longer than `MAX_LINE_LEN` are truncated by dropping the
/// remainder rather than erroring.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    buf: Vec<u8>,
    multiline: Option<MultilineState>,
}

#[derive(Debug)]
struct MultilineState {
    code: u16,
    lines: Vec<String>,
}

/// Maximum accepted single-line length; anything beyond this is dropped.
const MAX_LINE_LEN: usize = 2000;
/// Size of the read buffer the control channel fills before scanning for
/// line terminators.
pub const READ_CHUNK_SIZE: usize = 4096;

impl ReplyAssembler {
    /// Builds an empty assembler.
    pub fn new() -> Self {
        ReplyAssembler::default()
    }

    /// Feeds newly-received bytes (already charset-decoded to UTF-8 by the
    /// caller) into the assembler, returning every complete reply they
    /// produced, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Reply>, crate::error::EngineError> {
        self.buf.extend_from_slice(chunk);
        let mut replies = Vec::new();
        loop {
            let Some(term_at) = self.buf.iter().position(|&b| b == b'\r' || b == b'\n' || b == 0) else {
                break;
            };
            let terminator = self.buf[term_at];
            let mut line_bytes: Vec<u8> = self.buf.drain(..=term_at).collect();
            line_bytes.truncate(line_bytes.len() - 1); // drop the terminator itself
            if terminator == b'\r' && self.buf.first() == Some(&b'\n') {
                self.buf.remove(0); // swallow the paired \n of a \r\n pair
            }
            let line_bytes = line_bytes.as_slice();
            if line_bytes.is_empty() {
                continue;
            }
            let mut line = String::from_utf8_lossy(line_bytes).into_owned();
            if line.len() > MAX_LINE_LEN {
                line.truncate(MAX_LINE_LEN);
            }
            if let Some(reply) = self.parse_line(&line)? {
                replies.push(reply);
            }
        }
        Ok(replies)
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<Reply>, crate::error::EngineError> {
        if let Some(state) = &mut self.multiline {
            if line_matches_terminator(line, state.code) {
                let state = self.multiline.take().unwrap();
                let mut lines = state.lines;
                lines.push(line[4..].trim_start().to_string());
                return Ok(Some(Reply::multi(state.code, lines)));
            }
            state.lines.push(line.to_string());
            return Ok(None);
        }

        if line.len() < 4 {
            // Too short to carry a code; buffered as a continuation line of
            // nothing in particular - treat as a stray informational line.
            return Ok(None);
        }
        let code = match line[..3].parse::<u16>() {
            Ok(c) => c,
            Err(_) => {
                return Err(crate::error::EngineError::new(crate::error::EngineErrorKind::MalformedReply(
                    line.to_string(),
                )));
            }
        };
        match line.as_bytes()[3] {
            b'-' => {
                self.multiline = Some(MultilineState {
                    code,
                    lines: vec![line[4..].trim_start().to_string()],
                });
                Ok(None)
            }
            _ => Ok(Some(Reply::single(code, line[3..].trim_start().to_string()))),
        }
    }
}

fn line_matches_terminator(line: &str, code: u16) -> bool {
    let prefix = format!("{code:03} ");
    line.starts_with(&prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_reply() {
        let mut a = ReplyAssembler::new();
        let replies = a.feed(b"230 User logged in\r\n").unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].code(), 230);
        assert_eq!(replies[0].class(), 2);
        assert_eq!(replies[0].last_line(), "User logged in");
    }

    #[test]
    fn multiline_reply_requires_exact_terminator() {
        let mut a = ReplyAssembler::new();
        let replies = a
            .feed(b"211-Features:\r\n UTF8\r\n EPSV\r\n211 End\r\n")
            .unwrap();
        assert_eq!(replies.len(), 1);
        let r = &replies[0];
        assert_eq!(r.code(), 211);
        assert_eq!(r.lines().len(), 3);
        assert_eq!(r.last_line(), "End");
    }

    #[test]
    fn multiline_line_not_matching_terminator_is_buffered() {
        let mut a = ReplyAssembler::new();
        // "212 " would terminate a 212- multiline, but this is a 211- one,
        // so a stray "212 done" line must stay buffered as a body line.
        let replies = a
            .feed(b"211-Features:\r\n212 done\r\n211 End\r\n")
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].lines().len(), 3);
    }

    #[test]
    fn preliminary_reply_class_is_one() {
        let mut a = ReplyAssembler::new();
        let replies = a.feed(b"150 Opening data connection\r\n").unwrap();
        assert!(replies[0].is_preliminary());
    }

    #[test]
    fn malformed_code_errors() {
        let mut a = ReplyAssembler::new();
        let err = a.feed(b"abc not a code\r\n");
        assert!(err.is_err());
    }

    #[test]
    fn long_line_is_truncated_not_rejected() {
        let mut a = ReplyAssembler::new();
        let mut line = b"200 ".to_vec();
        line.extend(std::iter::repeat(b'x').take(3000));
        line.extend_from_slice(b"\r\n");
        let replies = a.feed(&line).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].full_text().len() <= super::MAX_LINE_LEN);
    }
}
