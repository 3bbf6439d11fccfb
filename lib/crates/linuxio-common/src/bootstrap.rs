//! One-shot bootstrap blob handed from the auth helper to the bridge.
//!
//! Delivered over the spawned child's stdin pipe and consumed exactly once;
//! it must never land on the filesystem.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::session::{validate_session_id, validate_socket_path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bootstrap {
    pub session_id: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub secret: String,
    pub server_base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cert: Option<String>,
    pub socket_path: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_fd: Option<i32>,
}

impl Bootstrap {
    /// Validate the fields the bridge refuses to start without.
    pub fn validate(&self) -> Result<(), Error> {
        validate_session_id(&self.session_id)?;
        validate_socket_path(&self.socket_path, self.uid)?;
        if self.username.is_empty() {
            return Err(Error::Fatal("bootstrap is missing username".to_string()));
        }
        if self.secret.is_empty() {
            return Err(Error::Fatal("bootstrap is missing secret".to_string()));
        }
        if self.server_base_url.is_empty() {
            return Err(Error::Fatal(
                "bootstrap is missing server_base_url".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn sample() -> Bootstrap {
        Bootstrap {
            session_id: "s1".to_string(),
            username: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            secret: "topsecret".to_string(),
            server_base_url: "https://127.0.0.1:8443".to_string(),
            server_cert: None,
            socket_path: "/run/linuxio/1000/s1.sock".to_string(),
            verbose: false,
            log_fd: None,
        }
    }

    #[test]
    fn valid_bootstrap_passes() {
        sample().validate().unwrap();
    }

    #[test]
    fn missing_secret_is_fatal() {
        let mut b = sample();
        b.secret.clear();
        assert!(matches!(b.validate(), Err(Error::Fatal(_))));
    }

    #[test]
    fn socket_path_uid_mismatch_is_rejected() {
        let mut b = sample();
        b.uid = 1001;
        assert!(b.validate().is_err());
    }

    #[test]
    fn serde_round_trip_preserves_optional_fields() {
        let mut b = sample();
        b.server_cert = Some("---cert---".to_string());
        b.log_fd = Some(7);
        let json = serde_json::to_string(&b).unwrap();
        let back: Bootstrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.server_cert.as_deref(), Some("---cert---"));
        assert_eq!(back.log_fd, Some(7));
        assert_eq!(back.session_id, b.session_id);
    }

    #[test]
    fn optional_fields_are_omitted_from_the_wire() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(!json.contains("server_cert"));
        assert!(!json.contains("log_fd"));
    }
}
