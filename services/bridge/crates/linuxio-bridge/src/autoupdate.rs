//! Automatic-update backend: unattended-upgrades where apt exists,
//! PackageKit status otherwise.
//!
//! The apt backend owns three on-disk artifacts, each replaced atomically
//! and always under the D-Bus gate because every change pairs with a
//! systemd reload.

use std::path::{Path, PathBuf};

use linuxio_common::Error;
use serde::Serialize;

use crate::dbus::{packagekit, systemd};
use crate::fsutil::atomic_write;
use crate::state::BridgeState;

pub const AUTO_UPGRADES_PATH: &str = "/etc/apt/apt.conf.d/20auto-upgrades";
pub const UNATTENDED_PATH: &str = "/etc/apt/apt.conf.d/50unattended-upgrades";
pub const APT_TIMERS: &[&str] = &["apt-daily.timer", "apt-daily-upgrade.timer"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Apt,
    PackageKit,
}

/// Search PATH for an executable, honoring only absolute PATH entries.
#[must_use]
pub fn which(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .filter(|dir| dir.is_absolute())
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// apt backend when both `apt` and `unattended-upgrades` are installed,
/// PackageKit when reachable, error otherwise.
pub async fn select_backend(state: &BridgeState) -> Result<Backend, Error> {
    if which("apt").is_some() && which("unattended-upgrades").is_some() {
        return Ok(Backend::Apt);
    }
    if packagekit::available(&state.dbus).await {
        return Ok(Backend::PackageKit);
    }
    Err(Error::NotFound(
        "no supported package backend (apt or PackageKit) found".to_string(),
    ))
}

/// `20auto-upgrades`: the periodic switches apt reads.
#[must_use]
pub fn render_auto_upgrades(enabled: bool) -> String {
    let flag = u8::from(enabled);
    format!(
        "APT::Periodic::Update-Package-Lists \"{flag}\";\nAPT::Periodic::Unattended-Upgrade \"{flag}\";\n"
    )
}

/// `50unattended-upgrades`: conservative security-only policy.
#[must_use]
pub fn render_unattended_upgrades() -> String {
    concat!(
        "Unattended-Upgrade::Allowed-Origins {\n",
        "    \"${distro_id}:${distro_codename}-security\";\n",
        "    \"${distro_id}ESMApps:${distro_codename}-apps-security\";\n",
        "};\n",
        "Unattended-Upgrade::Remove-Unused-Dependencies \"true\";\n",
        "Unattended-Upgrade::Automatic-Reboot \"false\";\n",
    )
    .to_string()
}

/// Timer drop-in pinning the apt timers to a predictable overnight window.
#[must_use]
pub fn render_timer_dropin() -> String {
    concat!(
        "[Timer]\n",
        "OnCalendar=\n",
        "OnCalendar=*-*-* 03:00\n",
        "RandomizedDelaySec=30m\n",
        "Persistent=true\n",
    )
    .to_string()
}

/// Drop-in path for one apt timer.
#[must_use]
pub fn timer_dropin_path(timer: &str) -> PathBuf {
    PathBuf::from(format!("/etc/systemd/system/{timer}.d/linuxio.conf"))
}

/// Current auto-update status as the UI reports it.
pub async fn get_auto_update(state: &BridgeState) -> Result<serde_json::Value, Error> {
    let backend = select_backend(state).await?;
    let enabled = match backend {
        Backend::Apt => std::fs::read_to_string(AUTO_UPGRADES_PATH)
            .map(|content| content.contains("Unattended-Upgrade \"1\""))
            .unwrap_or(false),
        Backend::PackageKit => false,
    };
    Ok(serde_json::json!({ "backend": backend, "enabled": enabled }))
}

/// Enable or disable automatic updates.
///
/// apt backend: write the three artifacts atomically, reload systemd, then
/// flip the apt timers. The artifact writes happen inside the gate because
/// they pair with the reload.
pub async fn set_auto_update(state: &BridgeState, enabled: bool) -> Result<serde_json::Value, Error> {
    let backend = select_backend(state).await?;
    match backend {
        Backend::Apt => {
            state
                .dbus
                .serialized(|| write_apt_artifacts(Path::new("/"), enabled))
                .await?;
            systemd::daemon_reload(&state.dbus).await?;
            for timer in APT_TIMERS {
                let action = if enabled {
                    systemd::UnitAction::Enable
                } else {
                    systemd::UnitAction::Disable
                };
                systemd::unit_action(&state.dbus, action, timer).await?;
                let run_action = if enabled {
                    systemd::UnitAction::Start
                } else {
                    systemd::UnitAction::Stop
                };
                systemd::unit_action(&state.dbus, run_action, timer).await?;
            }
            Ok(serde_json::json!({ "backend": backend, "enabled": enabled }))
        }
        Backend::PackageKit => Err(Error::Conflict(
            "automatic updates need unattended-upgrades; install apt tooling first".to_string(),
        )),
    }
}

/// Write the apt artifacts under `root` (the real filesystem in production,
/// a tempdir in tests).
pub fn write_apt_artifacts(root: &Path, enabled: bool) -> Result<(), Error> {
    let strip = |p: &str| p.trim_start_matches('/').to_string();
    let auto_path = root.join(strip(AUTO_UPGRADES_PATH));
    let unattended_path = root.join(strip(UNATTENDED_PATH));
    for parent in [auto_path.parent(), unattended_path.parent()] {
        if let Some(parent) = parent {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Fatal(format!("creating {}: {e}", parent.display())))?;
        }
    }
    atomic_write(&auto_path, render_auto_upgrades(enabled).as_bytes(), 0o644)?;
    atomic_write(
        &unattended_path,
        render_unattended_upgrades().as_bytes(),
        0o644,
    )?;
    for timer in APT_TIMERS {
        let dropin = root.join(strip(&timer_dropin_path(timer).to_string_lossy()));
        if let Some(parent) = dropin.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Fatal(format!("creating {}: {e}", parent.display())))?;
        }
        atomic_write(&dropin, render_timer_dropin().as_bytes(), 0o644)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn auto_upgrades_renders_both_states() {
        assert!(render_auto_upgrades(true).contains("Unattended-Upgrade \"1\""));
        assert!(render_auto_upgrades(false).contains("Unattended-Upgrade \"0\""));
        assert!(render_auto_upgrades(false).contains("Update-Package-Lists \"0\""));
    }

    #[test]
    fn timer_dropin_clears_before_setting() {
        let dropin = render_timer_dropin();
        let clear = dropin.find("OnCalendar=\n").unwrap();
        let set = dropin.find("OnCalendar=*-*-* 03:00").unwrap();
        assert!(clear < set);
    }

    #[test]
    fn dropin_paths_follow_the_timer_names() {
        assert_eq!(
            timer_dropin_path("apt-daily.timer"),
            PathBuf::from("/etc/systemd/system/apt-daily.timer.d/linuxio.conf")
        );
    }

    #[test]
    fn artifacts_land_under_root() {
        let dir = tempfile::tempdir().unwrap();
        write_apt_artifacts(dir.path(), true).unwrap();

        let auto = dir.path().join("etc/apt/apt.conf.d/20auto-upgrades");
        assert!(auto.exists());
        assert!(std::fs::read_to_string(auto).unwrap().contains("\"1\""));
        assert!(dir
            .path()
            .join("etc/systemd/system/apt-daily.timer.d/linuxio.conf")
            .exists());
        assert!(dir
            .path()
            .join("etc/systemd/system/apt-daily-upgrade.timer.d/linuxio.conf")
            .exists());
    }

    #[test]
    fn which_only_searches_absolute_path_entries() {
        // PATH entries are ambient; just assert the contract on a program
        // that cannot exist.
        assert!(which("linuxio-definitely-not-a-real-tool").is_none());
    }
}
