/// The tokenless frame a client sends first: a 4-byte big-endian length
/// `N` (covering itself) followed by `N-4` payload bytes, whose first
/// four bytes are a discriminator.
pub struct StartupFrame<'a> {
    payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupKind {
    SslRequest,
    CancelRequest,
    StartupMessage,
    Unrecognized,
}

const SSL_REQUEST_CODE: [u8; 4] = [0x04, 0xd2, 0x16, 0x2f];
const CANCEL_REQUEST_CODE: [u8; 4] = [0x04, 0xd2, 0x16, 0x2e];
const STARTUP_MESSAGE_CODE: [u8; 4] = [0x00, 0x03, 0x00, 0x00];

impl<'a> StartupFrame<'a> {
    /// `payload` is everything after the 4-byte length prefix (`N-4` bytes).
    pub fn new(payload: &'a [u8]) -> Self {
        Self { payload }
    }

    pub fn kind(&self) -> StartupKind {
        if self.payload.len() < 4 {
            return StartupKind::Unrecognized;
        }
        match self.payload[..4].try_into().unwrap() {
            SSL_REQUEST_CODE => StartupKind::SslRequest,
            CANCEL_REQUEST_CODE => StartupKind::CancelRequest,
            STARTUP_MESSAGE_CODE => StartupKind::StartupMessage,
            _ => StartupKind::Unrecognized,
        }
    }

    /// The bytes after the 4-byte discriminator: for a `StartupMessage`,
    /// a sequence of NUL-terminated key/value strings; for `CancelRequest`,
    /// the 8-byte pid/key pair.
    pub fn body(&self) -> &'a [u8] {
        &self.payload[4.min(self.payload.len())..]
    }
}

/// Splits a `StartupMessage` body into ordered `(key, value)` pairs.
/// Empty strings (including the final double-NUL terminator) are
/// dropped before pairing, per the wire format.
pub fn parse_startup_params(body: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let strings: Vec<&[u8]> = body
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .collect();
    strings
        .chunks_exact(2)
        .map(|pair| (pair[0].to_vec(), pair[1].to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_ssl_request() {
        let frame = StartupFrame::new(&SSL_REQUEST_CODE);
        assert_eq!(frame.kind(), StartupKind::SslRequest);
    }

    #[test]
    fn recognizes_cancel_request() {
        let mut payload = CANCEL_REQUEST_CODE.to_vec();
        payload.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 2]);
        let frame = StartupFrame::new(&payload);
        assert_eq!(frame.kind(), StartupKind::CancelRequest);
        assert_eq!(frame.body(), &[0, 0, 0, 1, 0, 0, 0, 2]);
    }

    #[test]
    fn recognizes_startup_message() {
        let mut payload = STARTUP_MESSAGE_CODE.to_vec();
        payload.extend_from_slice(b"user\0alice\0database\0db1\0\0");
        let frame = StartupFrame::new(&payload);
        assert_eq!(frame.kind(), StartupKind::StartupMessage);
        let params = parse_startup_params(frame.body());
        assert_eq!(
            params,
            vec![
                (b"user".to_vec(), b"alice".to_vec()),
                (b"database".to_vec(), b"db1".to_vec()),
            ]
        );
    }

    #[test]
    fn unrecognized_discriminator() {
        let frame = StartupFrame::new(&[0, 2, 0, 0]);
        assert_eq!(frame.kind(), StartupKind::Unrecognized);
    }

    #[test]
    fn too_short_is_unrecognized() {
        let frame = StartupFrame::new(&[0, 2]);
        assert_eq!(frame.kind(), StartupKind::Unrecognized);
    }
}
