//! Auth socket request/response lines.
//!
//! The webserver writes exactly one newline-terminated JSON request of at
//! most [`AUTH_REQUEST_MAX`] bytes; the helper answers with a single line
//! and exits. Anything after the first newline is a smuggling attempt and
//! rejected outright.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::session::{Mode, validate_session_id, validate_socket_path_shape};

/// Upper bound on the request line, newline included.
pub const AUTH_REQUEST_MAX: usize = 8 * 1024;

/// Deployment environment; anything else fails deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    #[default]
    Production,
    Development,
}

impl Env {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Env::Production => "production",
            Env::Development => "development",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub session_id: String,
    pub socket_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_path: Option<String>,
    #[serde(default)]
    pub env: Env,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cert: Option<String>,
}

impl AuthRequest {
    /// Field validation that does not need the target user's uid; the
    /// uid-qualified socket-path check runs after `getpwnam`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.user.is_empty() {
            return Err(Error::InvalidArgs("user is required".to_string()));
        }
        validate_session_id(&self.session_id)?;
        validate_socket_path_shape(&self.socket_path)?;
        Ok(())
    }

    #[must_use]
    pub fn verbose(&self) -> bool {
        matches!(self.verbose.as_deref(), Some("1" | "true"))
    }
}

/// Single-line response on the auth socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AuthResponse {
    Ok {
        mode: Mode,
        socket_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        motd: Option<String>,
    },
    Error {
        error: String,
    },
}

impl AuthResponse {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        AuthResponse::Error {
            error: message.into(),
        }
    }
}

/// Parse the single request line, rejecting oversized input and trailing
/// bytes after the first newline.
pub fn parse_request_line(raw: &[u8]) -> Result<AuthRequest, Error> {
    if raw.len() > AUTH_REQUEST_MAX {
        return Err(Error::InvalidArgs(format!(
            "auth request exceeds {AUTH_REQUEST_MAX} bytes"
        )));
    }
    let newline = raw
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::InvalidArgs("auth request is not newline-terminated".to_string()))?;
    if newline + 1 != raw.len() {
        return Err(Error::InvalidArgs(
            "unexpected data after auth request line".to_string(),
        ));
    }
    let req: AuthRequest = serde_json::from_slice(&raw[..newline])
        .map_err(|e| Error::InvalidArgs(format!("malformed auth request: {e}")))?;
    req.validate()?;
    Ok(req)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn line(json: &str) -> Vec<u8> {
        let mut v = json.as_bytes().to_vec();
        v.push(b'\n');
        v
    }

    const GOOD: &str = r#"{"user":"alice","password":"pw","session_id":"s1","socket_path":"/run/linuxio/1000/s1.sock","env":"production"}"#;

    #[test]
    fn parses_a_complete_request() {
        let req = parse_request_line(&line(GOOD)).unwrap();
        assert_eq!(req.user, "alice");
        assert_eq!(req.env, Env::Production);
        assert!(!req.verbose());
    }

    #[test]
    fn rejects_trailing_data_after_newline() {
        let mut raw = line(GOOD);
        raw.extend_from_slice(b"{\"user\":\"mallory\"}\n");
        assert!(parse_request_line(&raw).is_err());
    }

    #[test]
    fn rejects_missing_newline() {
        assert!(parse_request_line(GOOD.as_bytes()).is_err());
    }

    #[test]
    fn rejects_oversized_request() {
        let huge = format!(
            r#"{{"user":"alice","session_id":"s1","socket_path":"/run/linuxio/1000/s1.sock","secret":"{}"}}"#,
            "x".repeat(AUTH_REQUEST_MAX)
        );
        assert!(parse_request_line(&line(&huge)).is_err());
    }

    #[test]
    fn rejects_unknown_env() {
        let raw = line(
            r#"{"user":"a","session_id":"s1","socket_path":"/run/linuxio/1000/s1.sock","env":"staging"}"#,
        );
        assert!(parse_request_line(&raw).is_err());
    }

    #[test]
    fn rejects_bad_session_id() {
        let raw = line(
            r#"{"user":"a","session_id":"../evil","socket_path":"/run/linuxio/1000/s1.sock"}"#,
        );
        assert!(parse_request_line(&raw).is_err());
    }

    #[test]
    fn response_serializes_with_status_tag() {
        let ok = AuthResponse::Ok {
            mode: Mode::Privileged,
            socket_path: "/run/linuxio/1000/s1.sock".to_string(),
            motd: None,
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["mode"], "privileged");
        assert!(json.get("motd").is_none());

        let err = AuthResponse::error("Authentication failure");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "Authentication failure");
    }
}
