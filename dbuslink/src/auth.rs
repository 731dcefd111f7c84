//! The SASL handshake that precedes D-Bus framing on a fresh stream.
//!
//! The client opens with a single zero byte, then exchanges CR-LF
//! terminated command lines until the server answers `OK <guid>`. After
//! sending [`BEGIN`] the very next byte on the stream belongs to the
//! binary protocol.

use crate::error::*;

pub const BEGIN: &[u8] = b"BEGIN\r\n";
pub const CANCEL: &[u8] = b"CANCEL\r\n";
pub const NEGOTIATE_UNIX_FD: &[u8] = b"NEGOTIATE_UNIX_FD\r\n";

fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// `AUTH EXTERNAL` line carrying the hex-encoded decimal uid.
pub fn make_auth_external() -> Vec<u8> {
    let uid = unsafe { libc::getuid() };
    make_auth_external_for_uid(uid)
}

pub fn make_auth_external_for_uid(uid: u32) -> Vec<u8> {
    let hex_uid = hex_encode(uid.to_string().as_bytes());
    format!("AUTH EXTERNAL {}\r\n", hex_uid).into_bytes()
}

/// `AUTH ANONYMOUS` line. The credential is an arbitrary readable trace
/// token (RFC 4505 calls it "message trace").
pub fn make_auth_anonymous() -> Vec<u8> {
    make_auth_anonymous_with_trace("dbuslink")
}

pub fn make_auth_anonymous_with_trace(trace: &str) -> Vec<u8> {
    format!("AUTH ANONYMOUS {}\r\n", hex_encode(trace.as_bytes())).into_bytes()
}

/// Incremental parser for the server side of the SASL conversation.
///
/// Feed it raw bytes; it splits complete CR-LF lines and keeps a partial
/// tail. Once authenticated or failed it is terminal and consumes nothing
/// further, so bytes following the final `OK` line stay in the buffer for
/// the message parser.
#[derive(Debug, Default)]
pub struct SaslParser {
    buffer: Vec<u8>,
    authenticated: bool,
    error: Option<Vec<u8>>,
    guid: Option<String>,
}

impl SaslParser {
    pub fn new() -> SaslParser {
        SaslParser::default()
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// The raw server line that failed the handshake, if any.
    pub fn error(&self) -> Option<&[u8]> {
        self.error.as_deref()
    }

    /// The server GUID from the `OK` line.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    fn terminal(&self) -> bool {
        self.authenticated || self.error.is_some()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        while !self.terminal() {
            let eol = match self
                .buffer
                .windows(2)
                .position(|w| w == b"\r\n")
            {
                Some(p) => p,
                None => break,
            };
            let line: Vec<u8> = self.buffer.drain(..eol + 2).take(eol).collect();
            self.process_line(&line);
        }
    }

    /// Hand over any bytes received after the handshake finished.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// Turn a failed handshake into an error, or confirm success.
    pub fn check(&self) -> Result<()> {
        if let Some(line) = &self.error {
            return Err(context!(ErrorKind::Authentication(
                String::from_utf8_lossy(line).into_owned()
            )));
        }
        Ok(())
    }

    fn process_line(&mut self, line: &[u8]) {
        if line.starts_with(b"OK ") {
            self.guid = Some(String::from_utf8_lossy(&line[3..]).into_owned());
            self.authenticated = true;
        } else if line == b"AGREE_UNIX_FD" {
            // FD negotiation is not supported; the server volunteering it
            // is harmless.
        } else {
            // REJECTED, ERROR, DATA (no mechanism using it is supported)
            // and anything unrecognised all fail the handshake.
            self.error = Some(line.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_lines() {
        assert_eq!(
            make_auth_external_for_uid(1000),
            b"AUTH EXTERNAL 31303030\r\n".to_vec()
        );
        assert!(make_auth_anonymous().starts_with(b"AUTH ANONYMOUS "));
        assert!(make_auth_anonymous().ends_with(b"\r\n"));
    }

    #[test]
    fn ok_line_authenticates() {
        let mut p = SaslParser::new();
        p.feed(b"OK 1234deadbeef\r\n");
        assert!(p.authenticated());
        assert!(p.error().is_none());
        assert_eq!(p.guid(), Some("1234deadbeef"));
        assert!(p.check().is_ok());
    }

    #[test]
    fn rejected_line_is_terminal() {
        let mut p = SaslParser::new();
        p.feed(b"REJECTED EXTERNAL\r\n");
        assert!(!p.authenticated());
        assert_eq!(p.error(), Some(&b"REJECTED EXTERNAL"[..]));
        let err = p.check().unwrap_err();
        assert_eq!(
            *err.kind(),
            ErrorKind::Authentication("REJECTED EXTERNAL".into())
        );
        // Terminal: later lines are not consumed.
        p.feed(b"OK 00\r\n");
        assert!(!p.authenticated());
    }

    #[test]
    fn data_line_is_a_protocol_error() {
        let mut p = SaslParser::new();
        p.feed(b"DATA 1234\r\n");
        assert!(p.check().is_err());
    }

    #[test]
    fn partial_lines_are_buffered() {
        let mut p = SaslParser::new();
        p.feed(b"OK 12");
        assert!(!p.authenticated());
        p.feed(b"34\r");
        assert!(!p.authenticated());
        p.feed(b"\n");
        assert!(p.authenticated());
        assert_eq!(p.guid(), Some("1234"));
    }

    #[test]
    fn agree_unix_fd_is_ignored() {
        let mut p = SaslParser::new();
        p.feed(b"AGREE_UNIX_FD\r\nOK abcd\r\n");
        assert!(p.authenticated());
        assert!(p.error().is_none());
    }

    #[test]
    fn bytes_after_ok_are_left_for_the_message_stream() {
        let mut p = SaslParser::new();
        p.feed(b"OK abcd\r\nl\x01\x00\x01");
        assert!(p.authenticated());
        assert_eq!(p.into_buffer(), b"l\x01\x00\x01".to_vec());
    }
}
