//! Session → bridge-socket registry on the webserver side.
//!
//! Holds the `session_id → {socket_path, secret, uid, mode, last_ok_at}`
//! map, originates auth-socket logins, and routes API calls onto per-session
//! bridge IPC connections. Bindings whose bridge is gone are evicted on the
//! first failed dial; idle bindings are probed and evicted opportunistically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use linuxio_common::authproto::{AUTH_REQUEST_MAX, AuthRequest, AuthResponse};
use linuxio_common::{Error, Mode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::RwLock;

use crate::client::BridgeClient;

/// Default idle TTL before a binding is probed.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Binding {
    pub socket_path: String,
    pub secret: String,
    pub uid: u32,
    pub mode: Mode,
    pub last_ok_at: DateTime<Utc>,
}

pub struct SessionRegistry {
    auth_socket: PathBuf,
    idle_ttl: Duration,
    inner: RwLock<HashMap<String, Binding>>,
}

/// What the HTTP layer needs from a completed login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session_id: String,
    pub mode: Mode,
    pub motd: Option<String>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(auth_socket: impl Into<PathBuf>, idle_ttl: Duration) -> Self {
        SessionRegistry {
            auth_socket: auth_socket.into(),
            idle_ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Authenticate against the auth socket and record the binding.
    ///
    /// A session id that already has a live bridge is rejected with a
    /// stable `Conflict`; a dead binding under the same id is evicted and
    /// replaced.
    pub async fn login(&self, request: &AuthRequest) -> Result<LoginOutcome, Error> {
        request.validate()?;
        let secret = request
            .secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidArgs("login request is missing a secret".to_string()))?;

        if let Some(existing) = self.binding(&request.session_id).await {
            if BridgeClient::connect(&existing.socket_path, &existing.secret)
                .await
                .is_ok()
            {
                return Err(Error::Conflict(format!(
                    "session {} already has a live bridge",
                    request.session_id
                )));
            }
            self.evict(&request.session_id).await;
        }

        let response = self.dial_auth(request).await?;
        match response {
            AuthResponse::Ok {
                mode,
                socket_path,
                motd,
            } => {
                let uid = uid_from_socket_path(&socket_path)?;
                let binding = Binding {
                    socket_path,
                    secret,
                    uid,
                    mode,
                    last_ok_at: Utc::now(),
                };
                self.inner
                    .write()
                    .await
                    .insert(request.session_id.clone(), binding);
                tracing::info!(session = %request.session_id, %mode, "session bound");
                Ok(LoginOutcome {
                    session_id: request.session_id.clone(),
                    mode,
                    motd,
                })
            }
            AuthResponse::Error { error } => Err(Error::Unauthorized(error)),
        }
    }

    /// Route one command onto the session's bridge.
    pub async fn call(
        &self,
        session_id: &str,
        namespace: &str,
        command: &str,
        args: &[String],
    ) -> Result<serde_json::Value, Error> {
        let binding = self
            .binding(session_id)
            .await
            .ok_or_else(|| Error::Unauthorized(format!("no session {session_id}")))?;

        let mut client = match BridgeClient::connect(&binding.socket_path, &binding.secret).await {
            Ok(client) => client,
            Err(err) => {
                // ECONNREFUSED/ENOENT or auth rejection: the bridge is gone
                // or was replaced. Either way this binding is dead.
                self.evict(session_id).await;
                tracing::info!(session = %session_id, error = %err, "binding evicted");
                return Err(Error::Unauthorized(
                    "session expired; re-authenticate".to_string(),
                ));
            }
        };

        let result = client.request(namespace, command, args).await;
        if result.is_ok() {
            self.touch(session_id).await;
        }
        result
    }

    /// Open a stream on the session's bridge; the caller pumps frames on
    /// the returned client.
    pub async fn open_stream(
        &self,
        session_id: &str,
        stream_type: &str,
        args: &[String],
    ) -> Result<(BridgeClient, u32), Error> {
        let binding = self
            .binding(session_id)
            .await
            .ok_or_else(|| Error::Unauthorized(format!("no session {session_id}")))?;
        let mut client = match BridgeClient::connect(&binding.socket_path, &binding.secret).await {
            Ok(client) => client,
            Err(_) => {
                self.evict(session_id).await;
                return Err(Error::Unauthorized(
                    "session expired; re-authenticate".to_string(),
                ));
            }
        };
        let stream_id = client.open_stream(stream_type, args).await?;
        self.touch(session_id).await;
        Ok((client, stream_id))
    }

    /// Tear down a session: best-effort bridge shutdown, then eviction.
    pub async fn logout(&self, session_id: &str) {
        if let Some(binding) = self.binding(session_id).await {
            if let Ok(mut client) =
                BridgeClient::connect(&binding.socket_path, &binding.secret).await
            {
                let _ = client.request("control", "Shutdown", &[]).await;
            }
        }
        self.evict(session_id).await;
    }

    /// Probe bindings idle past the TTL; evict the ones that fail. Returns
    /// how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let now = Utc::now();
        let stale: Vec<(String, Binding)> = {
            let inner = self.inner.read().await;
            inner
                .iter()
                .filter(|(_, b)| {
                    let idle = now.signed_duration_since(b.last_ok_at);
                    idle.to_std().map(|d| d >= self.idle_ttl).unwrap_or(false)
                })
                .map(|(id, b)| (id.clone(), b.clone()))
                .collect()
        };

        let mut evicted = 0;
        for (session_id, binding) in stale {
            match BridgeClient::connect(&binding.socket_path, &binding.secret).await {
                Ok(mut client) => {
                    if client.request("control", "Ping", &[]).await.is_ok() {
                        self.touch(&session_id).await;
                        continue;
                    }
                    self.evict(&session_id).await;
                    evicted += 1;
                }
                Err(_) => {
                    self.evict(&session_id).await;
                    evicted += 1;
                }
            }
        }
        evicted
    }

    pub async fn binding(&self, session_id: &str) -> Option<Binding> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.len()
    }

    async fn evict(&self, session_id: &str) {
        self.inner.write().await.remove(session_id);
    }

    async fn touch(&self, session_id: &str) {
        if let Some(binding) = self.inner.write().await.get_mut(session_id) {
            binding.last_ok_at = Utc::now();
        }
    }

    /// One-line JSON request, one-line response on the auth socket.
    async fn dial_auth(&self, request: &AuthRequest) -> Result<AuthResponse, Error> {
        let stream = UnixStream::connect(&self.auth_socket).await.map_err(|e| {
            Error::Transport(format!(
                "dialing auth socket {}: {e}",
                self.auth_socket.display()
            ))
        })?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_vec(request)
            .map_err(|e| Error::Fatal(format!("encoding auth request: {e}")))?;
        line.push(b'\n');
        if line.len() > AUTH_REQUEST_MAX {
            return Err(Error::InvalidArgs(
                "auth request exceeds the protocol cap".to_string(),
            ));
        }
        write_half
            .write_all(&line)
            .await
            .map_err(|e| Error::Transport(format!("writing auth request: {e}")))?;

        let mut reader = BufReader::new(read_half);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| Error::Transport(format!("reading auth response: {e}")))?;
        if response_line.is_empty() {
            return Err(Error::Transport(
                "auth helper closed without a response".to_string(),
            ));
        }
        serde_json::from_str(&response_line)
            .map_err(|e| Error::Transport(format!("malformed auth response: {e}")))
    }
}

/// The uid component of a validated socket path.
fn uid_from_socket_path(socket_path: &str) -> Result<u32, Error> {
    let path = Path::new(socket_path);
    path.parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .and_then(|name| name.parse().ok())
        .ok_or_else(|| {
            Error::Transport(format!(
                "auth response socket path {socket_path:?} has no uid component"
            ))
        })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn uid_parses_from_the_socket_path() {
        assert_eq!(
            uid_from_socket_path("/run/linuxio/1000/s1.sock").unwrap(),
            1000
        );
        assert!(uid_from_socket_path("/tmp/s1.sock").is_err());
    }
}
