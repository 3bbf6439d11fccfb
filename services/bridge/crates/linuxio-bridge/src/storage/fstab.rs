//! Line-level `/etc/fstab` edits.
//!
//! The rewrite functions are pure (content in, content out) so the
//! byte-preservation contract is testable; [`apply`] performs the atomic
//! temp + fsync + rename replacement.

use std::path::Path;

use linuxio_common::Error;

use crate::fsutil::atomic_write;

pub const FSTAB_PATH: &str = "/etc/fstab";

/// Second whitespace-separated field of a non-comment line, i.e. the
/// mountpoint.
fn mountpoint_of(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    trimmed.split_whitespace().nth(1)
}

/// Append an entry unless a line for `mountpoint` already exists. Returns
/// the new content and whether anything changed; re-adding an existing
/// mountpoint is a no-op with content-identical output.
#[must_use]
pub fn add_entry(
    content: &str,
    source: &str,
    mountpoint: &str,
    fs_type: &str,
    options: &str,
) -> (String, bool) {
    if content.lines().any(|l| mountpoint_of(l) == Some(mountpoint)) {
        return (content.to_string(), false);
    }
    let options = if options.is_empty() { "defaults" } else { options };
    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("{source} {mountpoint} {fs_type} {options} 0 0\n"));
    (out, true)
}

/// Rewrite the options column of the line matching `mountpoint`; every
/// other line is preserved byte-for-byte.
pub fn update_options(content: &str, mountpoint: &str, options: &str) -> Result<String, Error> {
    let mut matched = false;
    let mut out = String::with_capacity(content.len());
    for segment in content.split_inclusive('\n') {
        let line = segment.strip_suffix('\n').unwrap_or(segment);
        if mountpoint_of(line) == Some(mountpoint) {
            matched = true;
            let fields: Vec<&str> = line.split_whitespace().collect();
            let source = fields.first().copied().unwrap_or_default();
            let fs_type = fields.get(2).copied().unwrap_or("nfs");
            let dump = fields.get(4).copied().unwrap_or("0");
            let pass = fields.get(5).copied().unwrap_or("0");
            out.push_str(&format!(
                "{source} {mountpoint} {fs_type} {options} {dump} {pass}"
            ));
            if segment.ends_with('\n') {
                out.push('\n');
            }
        } else {
            out.push_str(segment);
        }
    }
    if !matched {
        return Err(Error::Conflict(format!(
            "no fstab entry for mountpoint {mountpoint}"
        )));
    }
    Ok(out)
}

/// Drop every line whose mountpoint matches; all other lines are preserved
/// byte-for-byte. Returns the new content and whether anything was removed.
#[must_use]
pub fn remove_entry(content: &str, mountpoint: &str) -> (String, bool) {
    let mut removed = false;
    let mut out = String::with_capacity(content.len());
    for segment in content.split_inclusive('\n') {
        let line = segment.strip_suffix('\n').unwrap_or(segment);
        if mountpoint_of(line) == Some(mountpoint) {
            removed = true;
        } else {
            out.push_str(segment);
        }
    }
    (out, removed)
}

/// True when a non-comment line mounts `mountpoint`.
#[must_use]
pub fn contains_mountpoint(content: &str, mountpoint: &str) -> bool {
    content.lines().any(|l| mountpoint_of(l) == Some(mountpoint))
}

/// Atomically replace the fstab at `path`.
pub fn apply(path: &Path, content: &str) -> Result<(), Error> {
    atomic_write(path, content.as_bytes(), 0o644)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const BASE: &str = "# /etc/fstab\nUUID=abcd / ext4 errors=remount-ro 0 1\nnas:/export /mnt/media nfs defaults 0 0\n";

    #[test]
    fn add_appends_with_default_options() {
        let (out, changed) = add_entry(BASE, "nas:/backup", "/mnt/backup", "nfs", "");
        assert!(changed);
        assert!(out.ends_with("nas:/backup /mnt/backup nfs defaults 0 0\n"));
        assert!(out.starts_with(BASE));
    }

    #[test]
    fn add_is_a_noop_for_existing_mountpoint() {
        let (out, changed) = add_entry(BASE, "other:/x", "/mnt/media", "nfs", "ro");
        assert!(!changed);
        assert_eq!(out, BASE);
    }

    #[test]
    fn add_handles_missing_trailing_newline() {
        let content = "UUID=abcd / ext4 defaults 0 1";
        let (out, changed) = add_entry(content, "nas:/e", "/mnt/e", "nfs", "");
        assert!(changed);
        assert_eq!(
            out,
            "UUID=abcd / ext4 defaults 0 1\nnas:/e /mnt/e nfs defaults 0 0\n"
        );
    }

    #[test]
    fn update_rewrites_only_the_options_column() {
        let out = update_options(BASE, "/mnt/media", "ro,noatime").unwrap();
        assert!(out.contains("nas:/export /mnt/media nfs ro,noatime 0 0\n"));
        assert!(out.contains("UUID=abcd / ext4 errors=remount-ro 0 1\n"));
        assert!(out.starts_with("# /etc/fstab\n"));
    }

    #[test]
    fn update_fails_when_mountpoint_absent() {
        let err = update_options(BASE, "/mnt/nope", "ro").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn remove_preserves_other_lines_byte_for_byte() {
        let (out, removed) = remove_entry(BASE, "/mnt/media");
        assert!(removed);
        assert_eq!(out, "# /etc/fstab\nUUID=abcd / ext4 errors=remount-ro 0 1\n");
    }

    #[test]
    fn remove_of_absent_mountpoint_changes_nothing() {
        let (out, removed) = remove_entry(BASE, "/mnt/absent");
        assert!(!removed);
        assert_eq!(out, BASE);
    }

    #[test]
    fn comments_never_match_a_mountpoint() {
        let content = "# nas:/export /mnt/media nfs defaults 0 0\n";
        assert!(!contains_mountpoint(content, "/mnt/media"));
        let (_, removed) = remove_entry(content, "/mnt/media");
        assert!(!removed);
    }

    #[test]
    fn apply_round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        apply(&path, BASE).unwrap();
        let (content, _) = remove_entry(&std::fs::read_to_string(&path).unwrap(), "/mnt/media");
        apply(&path, &content).unwrap();
        assert!(!contains_mountpoint(&std::fs::read_to_string(&path).unwrap(), "/mnt/media"));
    }
}
