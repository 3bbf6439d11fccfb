//! Mounted-filesystem listing via `/proc/self/mounts` plus `statvfs` usage.

use std::path::Path;

use linuxio_common::Error;
use serde::Serialize;

pub const PROC_MOUNTS: &str = "/proc/self/mounts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountEntry {
    pub source: String,
    pub mountpoint: String,
    pub fs_type: String,
    pub options: String,
}

/// Decode the octal escapes mount(8) uses for whitespace in paths.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let bytes = field.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(&field[i + 1..i + 4], 8) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Parse mounts-file content into entries; malformed lines are skipped.
#[must_use]
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mountpoint = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountEntry {
                source: unescape(source),
                mountpoint: unescape(mountpoint),
                fs_type: fs_type.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Current mount table.
pub fn list_mounts() -> Result<Vec<MountEntry>, Error> {
    let content = std::fs::read_to_string(PROC_MOUNTS)
        .map_err(|e| Error::Fatal(format!("reading {PROC_MOUNTS}: {e}")))?;
    Ok(parse_mounts(&content))
}

/// Filesystem usage in bytes: (size, used, free, used percent).
#[must_use]
pub fn fs_usage(path: &Path) -> Option<(u64, u64, u64, f64)> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    let block: u64 = stat.fragment_size().into();
    let blocks: u64 = stat.blocks().into();
    let avail: u64 = stat.blocks_available().into();
    let bfree: u64 = stat.blocks_free().into();
    let size = blocks * block;
    let free = avail * block;
    let used = size.saturating_sub(bfree * block);
    if size == 0 {
        return Some((0, 0, 0, 0.0));
    }
    #[allow(clippy::cast_precision_loss)]
    let used_pct = (used as f64 / size as f64) * 100.0;
    Some((size, used, free, used_pct))
}
