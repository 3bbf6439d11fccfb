//! Bounded request intake from the accepted auth socket.

use std::io::Read;

use linuxio_common::authproto::{AUTH_REQUEST_MAX, AuthRequest, parse_request_line};
use linuxio_common::Error;

/// Read one newline-terminated request, never buffering more than the
/// protocol cap plus one byte. Anything already received past the newline
/// is a smuggling attempt and fails the parse.
pub fn read_request(reader: &mut impl Read) -> Result<AuthRequest, Error> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    loop {
        let n = reader
            .read(&mut chunk)
            .map_err(|e| Error::Transport(format!("reading auth request: {e}")))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > AUTH_REQUEST_MAX {
            return Err(Error::InvalidArgs(format!(
                "auth request exceeds {AUTH_REQUEST_MAX} bytes"
            )));
        }
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }
    parse_request_line(&buf)
}
