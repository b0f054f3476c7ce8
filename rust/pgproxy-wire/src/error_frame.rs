/// Builds a PostgreSQL `ErrorResponse` with severity FATAL for the given
/// SQLSTATE and message, as sent at startup to reject a session.
///
/// Wire layout: `'E'`, a big-endian u32 length covering itself and the
/// body, then `'S' "FATAL" \0 'C' <sqlstate> \0 'M' <message> \0 \0`.
pub fn fatal_error_frame(sqlstate: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + sqlstate.len() + message.len());
    body.push(b'S');
    body.extend_from_slice(b"FATAL");
    body.push(0);
    body.push(b'C');
    body.extend_from_slice(sqlstate.as_bytes());
    body.push(0);
    body.push(b'M');
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body.push(0);

    let length = (body.len() + 4) as u32;
    let mut frame = Vec::with_capacity(1 + 4 + body.len());
    frame.push(b'E');
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Convenience wrapper for the only SQLSTATE this proxy ever emits:
/// `28000`, invalid_authorization_specification.
pub fn fatal_error_frame_28000(message: &str) -> Vec<u8> {
    fatal_error_frame("28000", message)
}
