//! Session model and runtime-directory invariants.
//!
//! Every bridge socket lives under `/run/linuxio/<uid>/<sid>.sock`. The base
//! directory is root-owned and never group/world writable; each per-user
//! directory is owned by that uid and setgid to the shared bridge socket
//! group so the webserver can connect without being the session user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Base of the runtime directory tree.
pub const RUNTIME_BASE: &str = "/run/linuxio";
/// Group shared by the webserver and all bridge sockets.
pub const BRIDGE_SOCKET_GROUP: &str = "linuxio-bridge-socket";

/// Mode of `/run/linuxio` (root:linuxio-bridge-socket).
pub const BASE_DIR_MODE: u32 = 0o755;
/// Mode of `/run/linuxio/<uid>` (uid:linuxio-bridge-socket, setgid).
pub const USER_DIR_MODE: u32 = 0o2710;
/// Mode of the listening socket itself.
pub const SOCKET_MODE: u32 = 0o660;

pub const SESSION_ID_MAX_LEN: usize = 64;

/// Whether the bridge runs as root or as the authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Privileged,
    Unprivileged,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Privileged => f.write_str("privileged"),
            Mode::Unprivileged => f.write_str("unprivileged"),
        }
    }
}

/// Authenticated binding between a browser session and a bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub secret: String,
    pub socket_path: String,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Validate a session id against `[A-Za-z0-9_-]{1,64}`.
pub fn validate_session_id(id: &str) -> Result<(), Error> {
    if id.is_empty() || id.len() > SESSION_ID_MAX_LEN {
        return Err(Error::InvalidArgs(format!(
            "session id must be 1-{SESSION_ID_MAX_LEN} characters"
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(Error::InvalidArgs(
            "session id may only contain [A-Za-z0-9_-]".to_string(),
        ));
    }
    Ok(())
}

/// Canonical socket path for a session.
#[must_use]
pub fn socket_path_for(uid: u32, session_id: &str) -> String {
    format!("{RUNTIME_BASE}/{uid}/{session_id}.sock")
}

/// Structural checks on a socket path that do not need the owner uid:
/// rooted under `/run/linuxio/<decimal>/`, a single leaf component that does
/// not start with a dot, `.sock` suffix, and none of `..`, `./`, `//`.
pub fn validate_socket_path_shape(path: &str) -> Result<(), Error> {
    if path.contains("..") || path.contains("./") || path.contains("//") || path.ends_with('/') {
        return Err(Error::InvalidArgs(format!(
            "socket path {path:?} contains forbidden components"
        )));
    }
    let rest = path
        .strip_prefix(&format!("{RUNTIME_BASE}/"))
        .ok_or_else(|| {
            Error::InvalidArgs(format!("socket path must live under {RUNTIME_BASE}"))
        })?;
    let (dir, leaf) = rest
        .split_once('/')
        .ok_or_else(|| Error::InvalidArgs("socket path is missing the uid directory".to_string()))?;
    if dir.is_empty() || !dir.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidArgs(format!(
            "socket directory {dir:?} is not a decimal uid"
        )));
    }
    if leaf.contains('/') {
        return Err(Error::InvalidArgs(
            "socket path has extra directory components".to_string(),
        ));
    }
    if leaf.starts_with('.') {
        return Err(Error::InvalidArgs(
            "socket name must not start with a dot".to_string(),
        ));
    }
    let stem = leaf.strip_suffix(".sock").ok_or_else(|| {
        Error::InvalidArgs("socket name must end in .sock".to_string())
    })?;
    if stem.is_empty() {
        return Err(Error::InvalidArgs("socket name is empty".to_string()));
    }
    Ok(())
}

/// Full socket-path validation: structural checks plus uid match.
pub fn validate_socket_path(path: &str, uid: u32) -> Result<(), Error> {
    validate_socket_path_shape(path)?;
    let expected_dir = format!("{RUNTIME_BASE}/{uid}/");
    if !path.starts_with(&expected_dir) {
        return Err(Error::InvalidArgs(format!(
            "socket path {path:?} is not under the uid {uid} directory"
        )));
    }
    Ok(())
}
