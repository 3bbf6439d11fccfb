//! Environment construction for the spawned bridge.
//!
//! The child never inherits the helper's environment wholesale: a fixed
//! allowlist survives (with locale/terminal values validated against a
//! conservative charset), everything else is rebuilt from the authenticated
//! identity.

use std::ffi::CString;
use std::sync::LazyLock;

use linuxio_common::authproto::Env;
use regex::Regex;

/// Charset for `LANG`/`LC_ALL` values (`en_US.UTF-8`, `C.utf8`, ...).
static LOCALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.@-]{1,64}$").expect("static regex"));
/// Charset for `TERM` values (`xterm-256color`, `screen.linux`, ...).
static TERM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+._-]{1,64}$").expect("static regex"));

const FALLBACK_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Identity and session facts that become the child's environment.
pub struct BridgeIdentity<'a> {
    pub username: &'a str,
    pub home: &'a str,
    pub uid: u32,
    pub session_id: &'a str,
    pub socket_path: &'a str,
    pub privileged: bool,
    pub env: Env,
    pub verbose: bool,
}

/// True when the value is safe to pass through to the child.
#[must_use]
pub fn locale_value_ok(value: &str) -> bool {
    LOCALE_RE.is_match(value)
}

#[must_use]
pub fn term_value_ok(value: &str) -> bool {
    TERM_RE.is_match(value)
}

/// Build the complete child environment as `KEY=value` strings. The
/// `inherited` callback supplies the helper's own values for the allowlisted
/// keys (a parameter so tests do not depend on ambient variables).
pub fn build_env(
    identity: &BridgeIdentity<'_>,
    inherited: impl Fn(&str) -> Option<String>,
) -> Vec<String> {
    let mut env = Vec::with_capacity(16);

    let path = inherited("PATH").unwrap_or_else(|| FALLBACK_PATH.to_string());
    env.push(format!("PATH={path}"));
    for key in ["LANG", "LC_ALL"] {
        if let Some(value) = inherited(key) {
            if locale_value_ok(&value) {
                env.push(format!("{key}={value}"));
            }
        }
    }
    if let Some(term) = inherited("TERM") {
        if term_value_ok(&term) {
            env.push(format!("TERM={term}"));
        }
    }

    env.push(format!("HOME={}", identity.home));
    env.push(format!("USER={}", identity.username));
    env.push(format!("LOGNAME={}", identity.username));
    env.push(format!("XDG_RUNTIME_DIR=/run/user/{}", identity.uid));

    env.push("LINUXIO_BRIDGE=1".to_string());
    env.push(format!("LINUXIO_SESSION_ID={}", identity.session_id));
    env.push(format!("LINUXIO_SOCKET_PATH={}", identity.socket_path));
    env.push(format!(
        "LINUXIO_PRIVILEGED={}",
        u8::from(identity.privileged)
    ));
    env.push(format!("LINUXIO_ENV={}", identity.env.as_str()));
    env.push(format!("LINUXIO_VERBOSE={}", u8::from(identity.verbose)));

    env
}

/// The same environment as NUL-terminated strings for `execveat`.
pub fn to_cstrings(env: &[String]) -> Result<Vec<CString>, linuxio_common::Error> {
    env.iter()
        .map(|entry| {
            CString::new(entry.as_str()).map_err(|_| {
                linuxio_common::Error::Fatal("environment value contains NUL".to_string())
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn identity() -> BridgeIdentity<'static> {
        BridgeIdentity {
            username: "alice",
            home: "/home/alice",
            uid: 1000,
            session_id: "s1",
            socket_path: "/run/linuxio/1000/s1.sock",
            privileged: true,
            env: Env::Production,
            verbose: false,
        }
    }

    #[test]
    fn allowlisted_keys_survive_with_valid_values() {
        let env = build_env(&identity(), |key| match key {
            "PATH" => Some("/usr/bin:/bin".to_string()),
            "LANG" => Some("en_US.UTF-8".to_string()),
            "TERM" => Some("xterm-256color".to_string()),
            _ => None,
        });
        assert!(env.contains(&"PATH=/usr/bin:/bin".to_string()));
        assert!(env.contains(&"LANG=en_US.UTF-8".to_string()));
        assert!(env.contains(&"TERM=xterm-256color".to_string()));
    }

    #[test]
    fn hostile_locale_values_are_dropped() {
        let env = build_env(&identity(), |key| match key {
            "LANG" => Some("en_US.UTF-8; rm -rf /".to_string()),
            "TERM" => Some("xterm\nevil".to_string()),
            _ => None,
        });
        assert!(!env.iter().any(|e| e.starts_with("LANG=")));
        assert!(!env.iter().any(|e| e.starts_with("TERM=")));
    }

    #[test]
    fn unlisted_variables_never_leak() {
        let env = build_env(&identity(), |key| match key {
            "LD_PRELOAD" => Some("/tmp/evil.so".to_string()),
            "SSH_AUTH_SOCK" => Some("/tmp/agent".to_string()),
            _ => None,
        });
        assert!(!env.iter().any(|e| e.contains("LD_PRELOAD")));
        assert!(!env.iter().any(|e| e.contains("SSH_AUTH_SOCK")));
    }

    #[test]
    fn identity_variables_are_always_present() {
        let env = build_env(&identity(), |_| None);
        assert!(env.contains(&"HOME=/home/alice".to_string()));
        assert!(env.contains(&"USER=alice".to_string()));
        assert!(env.contains(&"LOGNAME=alice".to_string()));
        assert!(env.contains(&"XDG_RUNTIME_DIR=/run/user/1000".to_string()));
        assert!(env.contains(&"LINUXIO_BRIDGE=1".to_string()));
        assert!(env.contains(&"LINUXIO_PRIVILEGED=1".to_string()));
        assert!(env.contains(&"LINUXIO_ENV=production".to_string()));
        // PATH falls back to a sane default rather than vanishing.
        assert!(env.iter().any(|e| e.starts_with("PATH=/usr/local/sbin:")));
    }

    #[test]
    fn cstring_conversion_round_trips() {
        let env = build_env(&identity(), |_| None);
        let cstrings = to_cstrings(&env).unwrap();
        assert_eq!(cstrings.len(), env.len());
    }
}
