//! Error taxonomy shared across the execution plane.
//!
//! Handler-visible kinds carry a stable protocol code so HTTP callers can map
//! them onto status codes. `Transport` closes the connection and `Fatal`
//! terminates the process; neither is ever serialized into a response frame.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Argument count or format violation (protocol code 400).
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Missing or wrong secret, or no such session (protocol code 401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown unit, missing mount, no active connection (protocol code 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation refused by current state, e.g. LV still mounted (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Non-zero exit from a shelled-out tool, stderr trimmed (500).
    #[error("{tool}: {detail}")]
    External { tool: String, detail: String },

    /// IPC framing violation or dial failure. Closes the connection.
    #[error("transport: {0}")]
    Transport(String),

    /// Context deadline exceeded (protocol code 504).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Setup-time failure: missing group, invalid runtime dir, bridge
    /// validation. Exits the process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Stable protocol code carried in error response frames.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Error::InvalidArgs(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::External { .. } | Error::Fatal(_) => 500,
            Error::Transport(_) => 502,
            Error::Timeout(_) => 504,
        }
    }

    /// Build an [`Error::External`] from a tool name and its raw stderr.
    #[must_use]
    pub fn external(tool: &str, stderr: &[u8]) -> Self {
        let detail = String::from_utf8_lossy(stderr).trim().to_string();
        let detail = if detail.is_empty() {
            "exited with a non-zero status".to_string()
        } else {
            detail
        };
        Error::External {
            tool: tool.to_string(),
            detail,
        }
    }

    /// True for kinds that are reported to the peer as a response frame
    /// rather than closing the connection or exiting.
    #[must_use]
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Error::Transport(_) | Error::Fatal(_))
    }
}

// The framed codec surfaces socket errors through the decoder.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::InvalidArgs("n".into()).code(), 400);
        assert_eq!(Error::Unauthorized("s".into()).code(), 401);
        assert_eq!(Error::NotFound("u".into()).code(), 404);
        assert_eq!(Error::Conflict("m".into()).code(), 409);
        assert_eq!(Error::external("pvs", b"boom").code(), 500);
        assert_eq!(Error::Transport("t".into()).code(), 502);
        assert_eq!(Error::Timeout("d".into()).code(), 504);
    }

    #[test]
    fn external_trims_stderr() {
        let err = Error::external("lvcreate", b"  Volume group \"vg0\" not found\n");
        assert_eq!(
            err.to_string(),
            "lvcreate: Volume group \"vg0\" not found"
        );
    }

    #[test]
    fn external_with_empty_stderr_still_has_detail() {
        let err = Error::external("mount", b"");
        assert_eq!(err.to_string(), "mount: exited with a non-zero status");
    }

    #[test]
    fn transport_and_fatal_are_not_reportable() {
        assert!(!Error::Transport("eof".into()).is_reportable());
        assert!(!Error::Fatal("no group".into()).is_reportable());
        assert!(Error::NotFound("x".into()).is_reportable());
    }
}
