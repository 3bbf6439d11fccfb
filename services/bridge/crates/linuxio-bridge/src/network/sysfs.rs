//! Link attributes read from `/sys/class/net`.
//!
//! NetworkManager does not expose duplex or byte counters, so those come
//! straight from sysfs. The base directory is a parameter so tests can point
//! at a fixture tree.

use std::path::Path;

pub const SYSFS_NET: &str = "/sys/class/net";

#[derive(Debug, Clone, Default)]
pub struct LinkInfo {
    pub mac: String,
    pub mtu: u32,
    /// Mb/s; 0 when the link is down or the driver does not report it.
    pub speed: u32,
    pub duplex: String,
    pub operstate: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    read_trimmed(path)?.parse().ok()
}

/// Snapshot one interface. Missing attributes (virtual devices, down links)
/// degrade to defaults rather than failing the whole listing.
#[must_use]
pub fn read_link(base: &Path, name: &str) -> LinkInfo {
    let dir = base.join(name);
    LinkInfo {
        mac: read_trimmed(&dir.join("address")).unwrap_or_default(),
        mtu: read_number(&dir.join("mtu")).unwrap_or(0),
        speed: read_number(&dir.join("speed")).unwrap_or(0),
        duplex: read_trimmed(&dir.join("duplex")).unwrap_or_default(),
        operstate: read_trimmed(&dir.join("operstate")).unwrap_or_default(),
        rx_bytes: read_number(&dir.join("statistics/rx_bytes")).unwrap_or(0),
        tx_bytes: read_number(&dir.join("statistics/tx_bytes")).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn fixture(dir: &Path, name: &str) {
        let iface = dir.join(name);
        std::fs::create_dir_all(iface.join("statistics")).unwrap();
        std::fs::write(iface.join("address"), "aa:bb:cc:dd:ee:ff\n").unwrap();
        std::fs::write(iface.join("mtu"), "1500\n").unwrap();
        std::fs::write(iface.join("speed"), "1000\n").unwrap();
        std::fs::write(iface.join("duplex"), "full\n").unwrap();
        std::fs::write(iface.join("operstate"), "up\n").unwrap();
        std::fs::write(iface.join("statistics/rx_bytes"), "123456\n").unwrap();
        std::fs::write(iface.join("statistics/tx_bytes"), "654321\n").unwrap();
    }

    #[test]
    fn reads_a_complete_interface() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path(), "eth0");
        let link = read_link(dir.path(), "eth0");
        assert_eq!(link.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(link.mtu, 1500);
        assert_eq!(link.speed, 1000);
        assert_eq!(link.duplex, "full");
        assert_eq!(link.rx_bytes, 123_456);
        assert_eq!(link.tx_bytes, 654_321);
    }

    #[test]
    fn missing_attributes_degrade_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("veth0")).unwrap();
        let link = read_link(dir.path(), "veth0");
        assert_eq!(link.mac, "");
        assert_eq!(link.speed, 0);
        assert_eq!(link.rx_bytes, 0);
    }
}
