//! Bridge environment configuration.
//!
//! The auth helper hands most state over in the bootstrap blob; the
//! `LINUXIO_*` environment variables carry only what must be visible before
//! stdin is read (mode, environment, verbosity) plus operator tunables.

use serde::Deserialize;

/// Environment variables consumed by the bridge, loaded via
/// `envy::prefixed("LINUXIO_")`:
///   - `LINUXIO_PRIVILEGED`   ("1" when the sudo probe succeeded)
///   - `LINUXIO_ENV`          (production | development)
///   - `LINUXIO_SESSION_ID`
///   - `LINUXIO_SOCKET_PATH`
///   - `LINUXIO_BRIDGE`       (always "1" under the auth helper)
///   - `LINUXIO_VERBOSE`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeEnv {
    #[serde(default)]
    pub privileged: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub socket_path: Option<String>,
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default)]
    pub verbose: Option<String>,
}

impl BridgeEnv {
    pub fn load() -> Result<Self, envy::Error> {
        envy::prefixed("LINUXIO_").from_env()
    }

    #[must_use]
    pub fn privileged(&self) -> bool {
        matches!(self.privileged.as_deref(), Some("1" | "true"))
    }

    #[must_use]
    pub fn development(&self) -> bool {
        self.env.as_deref() == Some("development")
    }

    #[must_use]
    pub fn verbose(&self) -> bool {
        matches!(self.verbose.as_deref(), Some("1" | "true"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unprivileged_production() {
        let env = BridgeEnv::default();
        assert!(!env.privileged());
        assert!(!env.development());
        assert!(!env.verbose());
    }

    #[test]
    fn flags_parse_from_strings() {
        let env = BridgeEnv {
            privileged: Some("1".to_string()),
            env: Some("development".to_string()),
            verbose: Some("true".to_string()),
            ..BridgeEnv::default()
        };
        assert!(env.privileged());
        assert!(env.development());
        assert!(env.verbose());
    }
}
