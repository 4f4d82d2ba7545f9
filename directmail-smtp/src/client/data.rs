//! Message body encoding for the DATA phase (RFC 5321 Section 4.5.2).

/// Prepares a raw message body for transmission after a 354 reply.
///
/// Line endings are normalised to CRLF, any line beginning with `.` gets an
/// extra leading `.`, and the `<CRLF>.<CRLF>` terminator is appended. A body
/// that does not end with a line break is given one first.
#[must_use]
pub fn encode_data(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 64 + 5);
    let mut at_line_start = true;
    let mut previous = None;

    for &byte in body {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }

        if byte == b'\n' && previous != Some(b'\r') {
            out.push(b'\r');
        }

        out.push(byte);
        at_line_start = byte == b'\n';
        previous = Some(byte);
    }

    if out.ends_with(b"\r") {
        out.push(b'\n');
    } else if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b".\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(body: &str) -> String {
        String::from_utf8(encode_data(body.as_bytes())).unwrap_or_default()
    }

    #[test]
    fn test_normalises_line_endings() {
        assert_eq!(
            encoded("Subject: test\n\nline1\r\nline2\n"),
            "Subject: test\r\n\r\nline1\r\nline2\r\n.\r\n"
        );
    }

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(encoded(".hidden\n"), "..hidden\r\n.\r\n");
        assert_eq!(encoded("a\n.\nb\n"), "a\r\n..\r\nb\r\n.\r\n");
        assert_eq!(encoded("a\r\n..b\r\n"), "a\r\n...b\r\n.\r\n");
        assert_eq!(encoded("not.a.line.start\n"), "not.a.line.start\r\n.\r\n");
    }

    #[test]
    fn test_adds_missing_final_line_break() {
        assert_eq!(encoded("no newline"), "no newline\r\n.\r\n");
        assert_eq!(encoded("trailing cr\r"), "trailing cr\r\n.\r\n");
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(encoded(""), ".\r\n");
    }
}
