//! Sudo capability probe for the authenticated user.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use linuxio_common::Error;

/// Default probe timeout; tunable via `LINUXIO_SUDO_TIMEOUT_PASSWORD`
/// (seconds, clamped to 1-30).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

#[must_use]
pub fn probe_timeout() -> Duration {
    std::env::var("LINUXIO_SUDO_TIMEOUT_PASSWORD")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.clamp(1, 30)))
        .unwrap_or(DEFAULT_TIMEOUT)
}

fn wait_with_timeout(child: &mut std::process::Child, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(_) => return None,
        }
    }
}

/// Run `sudo -S -p "" -v` as the target user with the supplied password on
/// stdin. Exit 0 means the user can sudo; the cached credential is
/// invalidated immediately afterwards with `sudo -k`. An empty password
/// skips the probe (unprivileged mode).
pub fn probe(uid: u32, gid: u32, password: &str) -> Result<bool, Error> {
    if password.is_empty() {
        return Ok(false);
    }

    let mut child = Command::new("sudo")
        .args(["-S", "-p", "", "-v"])
        .uid(uid)
        .gid(gid)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::External {
            tool: "sudo".to_string(),
            detail: format!("spawning probe: {e}"),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(password.as_bytes());
        let _ = stdin.write_all(b"\n");
    }

    let has_sudo = wait_with_timeout(&mut child, probe_timeout()) == Some(0);

    // Drop the timestamp sudo just cached; the probe must not leave a
    // passwordless window behind.
    if let Ok(mut kill) = Command::new("sudo")
        .arg("-k")
        .uid(uid)
        .gid(gid)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        let _ = wait_with_timeout(&mut kill, Duration::from_secs(2));
    }

    Ok(has_sudo)
}
