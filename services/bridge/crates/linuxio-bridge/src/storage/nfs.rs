//! NFS mount management and the fstab bookkeeping that goes with it.

use std::path::Path;
use std::sync::LazyLock;

use linuxio_common::Error;
use regex::Regex;
use serde::Serialize;

use super::fstab;
use super::mounts::{self, MountEntry};
use crate::runner::CommandRunner;

static SERVER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.-]+$").expect("static regex"));
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9/_.-]*$").expect("static regex"));

/// Mountpoints that would wreck the host if shadowed by a network mount.
pub const SYSTEM_MOUNTPOINTS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/run", "/sbin",
    "/sys", "/tmp", "/usr", "/var",
];

#[derive(Debug, Clone, Serialize)]
pub struct NfsMount {
    pub source: String,
    pub server: String,
    pub export_path: String,
    pub mountpoint: String,
    pub fs_type: String,
    pub options: String,
    pub size: u64,
    pub used: u64,
    pub free: u64,
    pub used_pct: f64,
    pub in_fstab: bool,
}

pub fn validate_server(server: &str) -> Result<(), Error> {
    if SERVER_RE.is_match(server) {
        Ok(())
    } else {
        Err(Error::InvalidArgs(format!(
            "server {server:?} must match [A-Za-z0-9.-]+"
        )))
    }
}

pub fn validate_export_path(path: &str) -> Result<(), Error> {
    if PATH_RE.is_match(path) {
        Ok(())
    } else {
        Err(Error::InvalidArgs(format!(
            "export path {path:?} must be absolute and match [A-Za-z0-9/_.-]"
        )))
    }
}

/// Validate a local mountpoint: shape plus the system-path denylist.
pub fn validate_mountpoint(mountpoint: &str) -> Result<String, Error> {
    let trimmed = mountpoint.trim();
    if !PATH_RE.is_match(trimmed) {
        return Err(Error::InvalidArgs(format!(
            "mountpoint {mountpoint:?} must be absolute and match [A-Za-z0-9/_.-]"
        )));
    }
    let canonical = if trimmed.len() > 1 {
        trimmed.trim_end_matches('/')
    } else {
        trimmed
    };
    if SYSTEM_MOUNTPOINTS.contains(&canonical) {
        return Err(Error::InvalidArgs(format!(
            "cannot mount to system path: {canonical}"
        )));
    }
    Ok(canonical.to_string())
}

/// Split an NFS source `server:/export` into its halves.
#[must_use]
pub fn split_source(source: &str) -> Option<(&str, &str)> {
    source.split_once(':')
}

/// Build the snapshot of active NFS mounts from a mount table and the
/// current fstab content. Pure so it is testable with fixtures.
#[must_use]
pub fn collect_nfs_mounts(
    mount_table: &[MountEntry],
    fstab_content: &str,
    usage: impl Fn(&str) -> Option<(u64, u64, u64, f64)>,
) -> Vec<NfsMount> {
    mount_table
        .iter()
        .filter(|m| m.fs_type == "nfs" || m.fs_type == "nfs4")
        .map(|m| {
            let (server, export_path) = split_source(&m.source).unwrap_or((m.source.as_str(), ""));
            let (size, used, free, used_pct) = usage(&m.mountpoint).unwrap_or((0, 0, 0, 0.0));
            NfsMount {
                source: m.source.clone(),
                server: server.to_string(),
                export_path: export_path.to_string(),
                mountpoint: m.mountpoint.clone(),
                fs_type: m.fs_type.clone(),
                options: m.options.clone(),
                size,
                used,
                free,
                used_pct,
                in_fstab: fstab::contains_mountpoint(fstab_content, &m.mountpoint),
            }
        })
        .collect()
}

/// List active NFS mounts with usage and fstab presence.
pub fn list_nfs_mounts(fstab_path: &Path) -> Result<Vec<NfsMount>, Error> {
    let mount_table = mounts::list_mounts()?;
    let fstab_content = std::fs::read_to_string(fstab_path).unwrap_or_default();
    Ok(collect_nfs_mounts(&mount_table, &fstab_content, |mp| {
        mounts::fs_usage(Path::new(mp))
    }))
}

/// Mount an NFS export, optionally persisting it to fstab. Validation runs
/// before any tool is spawned or file touched.
pub async fn mount_nfs(
    runner: &dyn CommandRunner,
    fstab_path: &Path,
    server: &str,
    export_path: &str,
    mountpoint: &str,
    options: &str,
    add_fstab: bool,
) -> Result<NfsMountOutcome, Error> {
    validate_server(server)?;
    validate_export_path(export_path)?;
    let mountpoint = validate_mountpoint(mountpoint)?;

    let source = format!("{server}:{export_path}");
    std::fs::create_dir_all(&mountpoint)
        .map_err(|e| Error::External {
            tool: "mkdir".to_string(),
            detail: format!("creating {mountpoint}: {e}"),
        })?;

    let mut args = vec!["-t", "nfs", source.as_str(), mountpoint.as_str()];
    if !options.is_empty() {
        args.push("-o");
        args.push(options);
    }
    let output = runner.run("mount", &args).await.map_err(|e| Error::External {
        tool: "mount".to_string(),
        detail: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(Error::external("mount", &output.stderr));
    }

    let mut persisted = false;
    if add_fstab {
        let content = std::fs::read_to_string(fstab_path).unwrap_or_default();
        let (updated, changed) = fstab::add_entry(&content, &source, &mountpoint, "nfs", options);
        if changed {
            fstab::apply(fstab_path, &updated)?;
        }
        persisted = true;
    }
    Ok(NfsMountOutcome {
        mountpoint,
        persisted,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct NfsMountOutcome {
    pub mountpoint: String,
    pub persisted: bool,
}

/// Unmount an NFS mountpoint, optionally dropping its fstab line.
pub async fn unmount_nfs(
    runner: &dyn CommandRunner,
    fstab_path: &Path,
    mountpoint: &str,
    remove_fstab: bool,
) -> Result<NfsMountOutcome, Error> {
    let mountpoint = validate_mountpoint(mountpoint)?;

    let output = runner
        .run("umount", &[mountpoint.as_str()])
        .await
        .map_err(|e| Error::External {
            tool: "umount".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::external("umount", &output.stderr));
    }

    if remove_fstab {
        let content = std::fs::read_to_string(fstab_path).unwrap_or_default();
        let (updated, removed) = fstab::remove_entry(&content, &mountpoint);
        if removed {
            fstab::apply(fstab_path, &updated)?;
        }
    }
    Ok(NfsMountOutcome {
        mountpoint,
        persisted: false,
    })
}

/// Rewrite the fstab options for an existing entry; fails if the entry is
/// absent.
pub fn update_nfs_options(
    fstab_path: &Path,
    mountpoint: &str,
    options: &str,
) -> Result<(), Error> {
    let mountpoint = validate_mountpoint(mountpoint)?;
    let content = std::fs::read_to_string(fstab_path).unwrap_or_default();
    let updated = fstab::update_options(&content, &mountpoint, options)?;
    fstab::apply(fstab_path, &updated)
}
