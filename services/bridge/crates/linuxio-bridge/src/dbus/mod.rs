//! System-bus access: the process-wide gate, the close-retry policy, and
//! per-operation timeouts.
//!
//! Every system-bus operation in this process goes through [`DbusGate::with_bus`]:
//! it serializes operations, opens a fresh connection per attempt, and
//! re-runs the operation exactly once when the transport reports the
//! closed-connection transient.

pub mod packagekit;
pub mod systemd;

use std::future::Future;
use std::time::Duration;

use linuxio_common::Error;
use tokio::sync::Mutex;

/// Sentinel substring identifying the retryable transport transient.
pub const CLOSED_CONN_SENTINEL: &str = "use of closed network connection";

/// Pause between the failed attempt and the single retry.
pub const CLOSED_CONN_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Timeout for read-only bus calls.
pub const DBUS_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for mutating bus calls.
pub const DBUS_APPLY_TIMEOUT: Duration = Duration::from_secs(8);
/// Timeout for each PackageKit update-collection phase.
pub const PK_COLLECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Timeout for a package installation transaction.
pub const PK_INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
/// Overall cap on a streamed package update.
pub const PK_UPDATE_STREAM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Run `op`; if it fails with the closed-connection sentinel, wait
/// [`CLOSED_CONN_RETRY_DELAY`] and run it exactly once more.
pub async fn retry_once_if_closed<T, F, Fut>(op: F) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    match op().await {
        Err(err) if err.to_string().contains(CLOSED_CONN_SENTINEL) => {
            tokio::time::sleep(CLOSED_CONN_RETRY_DELAY).await;
            op().await
        }
        other => other,
    }
}

/// Process-wide mutual exclusion for system-bus work.
#[derive(Default)]
pub struct DbusGate {
    lock: Mutex<()>,
}

impl DbusGate {
    #[must_use]
    pub fn new() -> Self {
        DbusGate::default()
    }

    /// Run a non-bus critical section under the gate. Host configuration
    /// rewrites use this because they pair with a systemd reload.
    pub async fn serialized<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock.lock().await;
        f()
    }

    /// Acquire the gate, open a fresh system-bus connection, and run `f`.
    /// The connection is dropped (closed) when `f` resolves; the close-retry
    /// wrapper re-opens a fresh connection for the retry attempt.
    pub async fn with_bus<T, F, Fut>(&self, f: F) -> Result<T, Error>
    where
        F: Fn(zbus::Connection) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let _guard = self.lock.lock().await;
        retry_once_if_closed(|| async {
            let conn = zbus::Connection::system()
                .await
                .map_err(|e| Error::Transport(format!("connecting to system bus: {e}")))?;
            f(conn).await
        })
        .await
    }
}

/// Map a zbus error to the taxonomy. Named D-Bus errors from the peer are
/// `External` (systemd's NoSuchUnit becomes `NotFound`); everything else is
/// a transport fault.
pub fn map_zbus_err(context: &str, err: &zbus::Error) -> Error {
    if let zbus::Error::MethodError(name, detail, _) = err {
        let name = name.as_str();
        if name.ends_with(".NoSuchUnit") || name.ends_with(".UnknownObject") {
            return Error::NotFound(format!(
                "{context}: {}",
                detail.clone().unwrap_or_else(|| name.to_string())
            ));
        }
        return Error::External {
            tool: "dbus".to_string(),
            detail: format!(
                "{context}: {name}: {}",
                detail.clone().unwrap_or_default()
            ),
        };
    }
    Error::Transport(format!("{context}: {err}"))
}

/// Apply a timeout to a bus operation, mapping expiry to `Error::Timeout`.
pub async fn with_timeout<T, Fut>(d: Duration, what: &str, fut: Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(d, fut)
        .await
        .map_err(|_| Error::Timeout(what.to_string()))?
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retry_runs_once_more_on_sentinel() {
        let calls = AtomicU32::new(0);
        let result = retry_once_if_closed(|| async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Transport(format!(
                    "read unix @->/run/dbus: {CLOSED_CONN_SENTINEL}"
                )))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_second_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = retry_once_if_closed(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Transport(CLOSED_CONN_SENTINEL.to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = retry_once_if_closed(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotFound("unit".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_taxonomy() {
        let result: Result<(), Error> = with_timeout(
            Duration::from_millis(5),
            "GetUpdates",
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
