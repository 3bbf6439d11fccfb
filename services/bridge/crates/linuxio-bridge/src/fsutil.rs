//! Atomic file replacement for host configuration files.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use linuxio_common::Error;

/// Replace `path` atomically: write a temp file in the same directory,
/// fsync it, then rename over the target. Readers never observe a partial
/// file; a crash leaves either the old or the new content.
pub fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<(), Error> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Fatal(format!("{} has no parent directory", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::Fatal(format!("creating temp file in {}: {e}", parent.display())))?;
    tmp.write_all(contents)
        .map_err(|e| Error::Fatal(format!("writing {}: {e}", path.display())))?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::Fatal(format!("setting mode on {}: {e}", path.display())))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::Fatal(format!("fsync {}: {e}", path.display())))?;
    tmp.persist(path)
        .map_err(|e| Error::Fatal(format!("renaming over {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("fstab");
        std::fs::write(&target, "old\n").unwrap();

        atomic_write(&target, b"new\n", 0o644).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new\n");

        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn atomic_write_creates_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("20auto-upgrades");
        atomic_write(&target, b"APT::Periodic::Unattended-Upgrade \"1\";\n", 0o644).unwrap();
        assert!(target.exists());
    }
}
