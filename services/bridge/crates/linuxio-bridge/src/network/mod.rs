//! NetworkManager adapter: device snapshots and IPv4 reconfiguration over
//! the system bus, IPv6 and link toggles via `nmcli`.

pub mod nmcli;
pub mod rates;
pub mod sysfs;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use linuxio_common::Error;
use serde::Serialize;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use crate::dbus::{DBUS_APPLY_TIMEOUT, DBUS_READ_TIMEOUT, map_zbus_err, with_timeout};
use crate::state::BridgeState;

const NM_DEST: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_IFACE: &str = "org.freedesktop.NetworkManager";
const DEVICE_IFACE: &str = "org.freedesktop.NetworkManager.Device";
const ACTIVE_IFACE: &str = "org.freedesktop.NetworkManager.Connection.Active";
const SETTINGS_CONN_IFACE: &str = "org.freedesktop.NetworkManager.Settings.Connection";
const IP4_CONFIG_IFACE: &str = "org.freedesktop.NetworkManager.IP4Config";
const IP6_CONFIG_IFACE: &str = "org.freedesktop.NetworkManager.IP6Config";

/// Pause between deactivating a connection and re-reading its settings, so
/// NetworkManager can settle its internal state.
const NM_SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Connection settings as NetworkManager hands them over: section → key →
/// variant.
pub type NmSettings = HashMap<String, HashMap<String, OwnedValue>>;

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub mac: String,
    pub mtu: u32,
    pub speed: u32,
    pub duplex: String,
    pub state: String,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    pub rx_bps: f64,
    pub tx_bps: f64,
    pub dns: Vec<String>,
    pub gateway: String,
    pub ipv4_method: String,
}

pub fn validate_iface(iface: &str) -> Result<(), Error> {
    if iface.is_empty() || iface.len() > 16 {
        return Err(Error::InvalidArgs(
            "interface name must be 1-16 bytes".to_string(),
        ));
    }
    if !iface
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return Err(Error::InvalidArgs(format!(
            "interface name {iface:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Parse `a.b.c.d/prefix`.
pub fn validate_cidr_v4(cidr: &str) -> Result<(Ipv4Addr, u32), Error> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::InvalidArgs(format!("{cidr:?} is not in CIDR form")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::InvalidArgs(format!("invalid IPv4 address in {cidr:?}")))?;
    let prefix: u32 = prefix
        .parse()
        .map_err(|_| Error::InvalidArgs(format!("invalid prefix in {cidr:?}")))?;
    if prefix > 32 {
        return Err(Error::InvalidArgs(format!(
            "prefix /{prefix} exceeds 32 in {cidr:?}"
        )));
    }
    Ok((addr, prefix))
}

pub fn validate_cidr_v6(cidr: &str) -> Result<(Ipv6Addr, u32), Error> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::InvalidArgs(format!("{cidr:?} is not in CIDR form")))?;
    let addr: Ipv6Addr = addr
        .parse()
        .map_err(|_| Error::InvalidArgs(format!("invalid IPv6 address in {cidr:?}")))?;
    let prefix: u32 = prefix
        .parse()
        .map_err(|_| Error::InvalidArgs(format!("invalid prefix in {cidr:?}")))?;
    if prefix > 128 {
        return Err(Error::InvalidArgs(format!(
            "prefix /{prefix} exceeds 128 in {cidr:?}"
        )));
    }
    Ok((addr, prefix))
}

/// NetworkManager carries IPv4 nameservers as 32-bit values in network byte
/// order: the raw octets of the address interpreted as a native u32.
#[must_use]
pub fn ipv4_to_nm_u32(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

#[must_use]
pub fn ipv4_from_nm_u32(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_ne_bytes())
}

/// Format 16 raw bytes as colon-separated 16-bit groups (no `::`
/// compression — the UI does that).
#[must_use]
pub fn format_ipv6_groups(bytes: &[u8]) -> String {
    bytes
        .chunks(2)
        .map(|pair| {
            let hi = u16::from(pair[0]);
            let lo = pair.get(1).map(|b| u16::from(*b)).unwrap_or(0);
            format!("{:x}", (hi << 8) | lo)
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Strip the binary address/route fields from both address-family sections;
/// they cannot round-trip safely through `Update`.
pub fn sanitize_settings(settings: &mut NmSettings) {
    for section in ["ipv4", "ipv6"] {
        if let Some(map) = settings.get_mut(section) {
            for key in ["addresses", "address-data", "routes", "route-data"] {
                map.remove(key);
            }
        }
    }
}

fn ov(value: Value<'_>) -> Result<OwnedValue, Error> {
    OwnedValue::try_from(value)
        .map_err(|e| Error::Transport(format!("building settings value: {e}")))
}

fn device_type_name(code: u32) -> &'static str {
    match code {
        1 => "ethernet",
        2 => "wifi",
        5 => "bluetooth",
        13 => "bridge",
        14 => "generic",
        16 => "tun",
        17 => "veth",
        22 => "wireguard",
        32 => "loopback",
        _ => "unknown",
    }
}

fn device_state_name(code: u32) -> &'static str {
    match code {
        10 => "unmanaged",
        20 => "unavailable",
        30 => "disconnected",
        40..=90 => "connecting",
        100 => "activated",
        110 => "deactivating",
        120 => "failed",
        _ => "unknown",
    }
}

async fn proxy<'a>(
    conn: &zbus::Connection,
    path: impl Into<OwnedObjectPath>,
    iface: &'static str,
) -> Result<zbus::Proxy<'a>, Error> {
    zbus::Proxy::new(conn, NM_DEST, path.into(), iface)
        .await
        .map_err(|e| map_zbus_err(iface, &e))
}

async fn manager(conn: &zbus::Connection) -> Result<zbus::Proxy<'static>, Error> {
    zbus::Proxy::new(conn, NM_DEST, NM_PATH, NM_IFACE)
        .await
        .map_err(|e| map_zbus_err("NetworkManager proxy", &e))
}

fn is_null_path(path: &OwnedObjectPath) -> bool {
    path.as_str() == "/"
}

/// NetworkManager uses the root object path as "none".
fn root_path() -> OwnedObjectPath {
    OwnedObjectPath::try_from("/").expect("static path")
}

async fn ip4_details(
    conn: &zbus::Connection,
    config_path: OwnedObjectPath,
) -> Result<(Vec<String>, Vec<String>, String), Error> {
    if is_null_path(&config_path) {
        return Ok((Vec::new(), Vec::new(), String::new()));
    }
    let ip4 = proxy(conn, config_path, IP4_CONFIG_IFACE).await?;
    let mut addresses = Vec::new();
    if let Ok(address_data) = ip4
        .get_property::<Vec<HashMap<String, OwnedValue>>>("AddressData")
        .await
    {
        for entry in address_data {
            let addr = entry
                .get("address")
                .and_then(|v| String::try_from(v.clone()).ok());
            let prefix = entry.get("prefix").and_then(|v| u32::try_from(v.clone()).ok());
            if let (Some(addr), Some(prefix)) = (addr, prefix) {
                addresses.push(format!("{addr}/{prefix}"));
            }
        }
    }
    let dns = ip4
        .get_property::<Vec<u32>>("Nameservers")
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|raw| ipv4_from_nm_u32(raw).to_string())
        .collect();
    let gateway = ip4.get_property::<String>("Gateway").await.unwrap_or_default();
    Ok((addresses, dns, gateway))
}

async fn ip6_addresses(
    conn: &zbus::Connection,
    config_path: OwnedObjectPath,
) -> Result<Vec<String>, Error> {
    if is_null_path(&config_path) {
        return Ok(Vec::new());
    }
    let ip6 = proxy(conn, config_path, IP6_CONFIG_IFACE).await?;
    let raw = ip6
        .get_property::<Vec<(Vec<u8>, u32, Vec<u8>)>>("Addresses")
        .await
        .unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter(|(addr, _, _)| addr.len() == 16)
        .map(|(addr, prefix, _gateway)| format!("{}/{prefix}", format_ipv6_groups(&addr)))
        .collect())
}

/// The `ipv4.method` of the profile behind an active connection.
async fn active_ipv4_method(
    conn: &zbus::Connection,
    active_path: OwnedObjectPath,
) -> Result<String, Error> {
    if is_null_path(&active_path) {
        return Ok(String::new());
    }
    let active = proxy(conn, active_path, ACTIVE_IFACE).await?;
    let settings_path: OwnedObjectPath = active
        .get_property("Connection")
        .await
        .map_err(|e| map_zbus_err("Active.Connection", &e))?;
    let settings = proxy(conn, settings_path, SETTINGS_CONN_IFACE).await?;
    let map: NmSettings = settings
        .call("GetSettings", &())
        .await
        .map_err(|e| map_zbus_err("GetSettings", &e))?;
    Ok(map
        .get("ipv4")
        .and_then(|s| s.get("method"))
        .and_then(|v| String::try_from(v.clone()).ok())
        .unwrap_or_default())
}

/// Snapshot every managed device.
pub async fn get_network_info(state: &BridgeState) -> Result<Vec<InterfaceInfo>, Error> {
    let sysfs_base = Path::new(sysfs::SYSFS_NET);
    state
        .dbus
        .with_bus(|conn| async move {
            with_timeout(DBUS_READ_TIMEOUT, "GetNetworkInfo", async {
                let manager = manager(&conn).await?;
                let devices: Vec<OwnedObjectPath> = manager
                    .call("GetDevices", &())
                    .await
                    .map_err(|e| map_zbus_err("GetDevices", &e))?;

                let mut interfaces = Vec::with_capacity(devices.len());
                for device_path in devices {
                    let device = proxy(&conn, device_path, DEVICE_IFACE).await?;
                    let name: String = device
                        .get_property("Interface")
                        .await
                        .map_err(|e| map_zbus_err("Device.Interface", &e))?;
                    if name == "lo" {
                        continue;
                    }
                    let type_code: u32 =
                        device.get_property("DeviceType").await.unwrap_or_default();
                    let state_code: u32 = device.get_property("State").await.unwrap_or_default();

                    let ip4_path: OwnedObjectPath = device
                        .get_property("Ip4Config")
                        .await
                        .unwrap_or_else(|_| root_path());
                    let ip6_path: OwnedObjectPath = device
                        .get_property("Ip6Config")
                        .await
                        .unwrap_or_else(|_| root_path());
                    let active_path: OwnedObjectPath = device
                        .get_property("ActiveConnection")
                        .await
                        .unwrap_or_else(|_| root_path());

                    let (ipv4, dns, gateway) = ip4_details(&conn, ip4_path).await?;
                    let ipv6 = ip6_addresses(&conn, ip6_path).await?;
                    let ipv4_method = active_ipv4_method(&conn, active_path)
                        .await
                        .unwrap_or_default();

                    let link = sysfs::read_link(sysfs_base, &name);
                    let (rx_bps, tx_bps) = state.net_rates.rates(
                        &name,
                        link.rx_bytes,
                        link.tx_bytes,
                        std::time::Instant::now(),
                    );

                    interfaces.push(InterfaceInfo {
                        device_type: device_type_name(type_code).to_string(),
                        mac: link.mac,
                        mtu: link.mtu,
                        speed: link.speed,
                        duplex: link.duplex,
                        state: device_state_name(state_code).to_string(),
                        ipv4,
                        ipv6,
                        rx_bps,
                        tx_bps,
                        dns,
                        gateway,
                        ipv4_method,
                        name,
                    });
                }
                Ok(interfaces)
            })
            .await
        })
        .await
}

struct ActiveConnectionRefs {
    device_path: OwnedObjectPath,
    active_path: OwnedObjectPath,
    settings_path: OwnedObjectPath,
}

async fn active_refs(
    conn: &zbus::Connection,
    iface: &str,
) -> Result<ActiveConnectionRefs, Error> {
    let manager = manager(conn).await?;
    let device_path: OwnedObjectPath = manager
        .call("GetDeviceByIpIface", &(iface,))
        .await
        .map_err(|e| map_zbus_err("GetDeviceByIpIface", &e))?;
    let device = proxy(conn, device_path.clone(), DEVICE_IFACE).await?;
    let active_path: OwnedObjectPath = device
        .get_property("ActiveConnection")
        .await
        .map_err(|e| map_zbus_err("Device.ActiveConnection", &e))?;
    if is_null_path(&active_path) {
        return Err(Error::NotFound(format!(
            "no active connection on interface {iface}"
        )));
    }
    let active = proxy(conn, active_path.clone(), ACTIVE_IFACE).await?;
    let settings_path: OwnedObjectPath = active
        .get_property("Connection")
        .await
        .map_err(|e| map_zbus_err("Active.Connection", &e))?;
    Ok(ActiveConnectionRefs {
        device_path,
        active_path,
        settings_path,
    })
}

async fn get_settings(
    conn: &zbus::Connection,
    settings_path: OwnedObjectPath,
) -> Result<(zbus::Proxy<'static>, NmSettings), Error> {
    let settings = proxy(conn, settings_path, SETTINGS_CONN_IFACE).await?;
    let mut map: NmSettings = settings
        .call("GetSettings", &())
        .await
        .map_err(|e| map_zbus_err("GetSettings", &e))?;
    sanitize_settings(&mut map);
    Ok((settings, map))
}

/// Reconfigure an interface to a static IPv4 address.
///
/// Three-step atomic reconfiguration: tear down DHCP state with
/// `method=disabled` and a full disconnect, write the manual configuration,
/// then re-activate the profile on the device.
pub async fn set_ipv4_manual(
    state: &BridgeState,
    iface: &str,
    cidr: &str,
    gateway: &str,
    dns: &[String],
) -> Result<(), Error> {
    validate_iface(iface)?;
    let (addr, prefix) = validate_cidr_v4(cidr)?;
    let gateway_addr: Ipv4Addr = gateway
        .parse()
        .map_err(|_| Error::InvalidArgs(format!("invalid gateway {gateway:?}")))?;
    let dns_nm: Vec<u32> = dns
        .iter()
        .map(|server| {
            server
                .parse::<Ipv4Addr>()
                .map(ipv4_to_nm_u32)
                .map_err(|_| Error::InvalidArgs(format!("invalid DNS server {server:?}")))
        })
        .collect::<Result<_, _>>()?;

    let iface = iface.to_string();
    state
        .dbus
        .with_bus(|conn| {
            let iface = iface.clone();
            let dns_nm = dns_nm.clone();
            async move {
                let refs = active_refs(&conn, &iface).await?;

                // Step 1: tear down DHCP state.
                let teardown = with_timeout(DBUS_APPLY_TIMEOUT, "SetIPv4Manual teardown", async {
                    let (settings, mut map) = get_settings(&conn, refs.settings_path.clone()).await?;
                    let ipv4 = map.entry("ipv4".to_string()).or_default();
                    ipv4.insert("method".to_string(), ov(Value::from("disabled"))?);
                    settings
                        .call::<_, _, ()>("Update", &(map,))
                        .await
                        .map_err(|e| map_zbus_err("Update", &e))?;

                    let device = proxy(&conn, refs.device_path.clone(), DEVICE_IFACE).await?;
                    // Both calls may race NM's own teardown; losing is fine.
                    let _ = device.call::<_, _, ()>("Disconnect", &()).await;
                    let nm = manager(&conn).await?;
                    let _ = nm
                        .call::<_, _, ()>("DeactivateConnection", &(refs.active_path.clone(),))
                        .await;
                    Ok(())
                })
                .await;
                teardown?;
                tokio::time::sleep(NM_SETTLE_DELAY).await;

                // Step 2: apply the manual configuration.
                with_timeout(DBUS_APPLY_TIMEOUT, "SetIPv4Manual apply", async {
                    let (settings, mut map) = get_settings(&conn, refs.settings_path.clone()).await?;
                    let ipv4 = map.entry("ipv4".to_string()).or_default();
                    ipv4.insert("method".to_string(), ov(Value::from("manual"))?);
                    let mut address_entry: HashMap<&str, Value<'_>> = HashMap::new();
                    address_entry.insert("address", Value::from(addr.to_string()));
                    address_entry.insert("prefix", Value::from(prefix));
                    ipv4.insert("address-data".to_string(), ov(Value::from(vec![address_entry]))?);
                    ipv4.insert("dns".to_string(), ov(Value::from(dns_nm.clone()))?);
                    ipv4.insert("gateway".to_string(), ov(Value::from(gateway_addr.to_string()))?);
                    ipv4.insert("may-fail".to_string(), ov(Value::from(false))?);
                    ipv4.insert("ignore-auto-dns".to_string(), ov(Value::from(true))?);
                    ipv4.insert("ignore-auto-routes".to_string(), ov(Value::from(true))?);
                    ipv4.insert("never-default".to_string(), ov(Value::from(false))?);
                    settings
                        .call::<_, _, ()>("Update", &(map,))
                        .await
                        .map_err(|e| map_zbus_err("Update", &e))?;
                    Ok(())
                })
                .await?;

                // Step 3: reactivate.
                with_timeout(DBUS_APPLY_TIMEOUT, "SetIPv4Manual activate", async {
                    let nm = manager(&conn).await?;
                    let _active: OwnedObjectPath = nm
                        .call(
                            "ActivateConnection",
                            &(
                                refs.settings_path.clone(),
                                refs.device_path.clone(),
                                root_path(),
                            ),
                        )
                        .await
                        .map_err(|e| map_zbus_err("ActivateConnection", &e))?;
                    Ok(())
                })
                .await
            }
        })
        .await
}

/// Return an interface to DHCP, clearing every manual remnant, then force a
/// full reload so the kernel drops the static address.
pub async fn set_ipv4_dhcp(state: &BridgeState, iface: &str) -> Result<(), Error> {
    validate_iface(iface)?;
    let iface = iface.to_string();
    state
        .dbus
        .with_bus(|conn| {
            let iface = iface.clone();
            async move {
                let refs = active_refs(&conn, &iface).await?;

                with_timeout(DBUS_APPLY_TIMEOUT, "SetIPv4DHCP apply", async {
                    let (settings, mut map) = get_settings(&conn, refs.settings_path.clone()).await?;
                    let ipv4 = map.entry("ipv4".to_string()).or_default();
                    ipv4.insert("method".to_string(), ov(Value::from("auto"))?);
                    ipv4.insert("dns".to_string(), ov(Value::from(Vec::<u32>::new()))?);
                    ipv4.insert(
                        "dns-search".to_string(),
                        ov(Value::from(Vec::<String>::new()))?,
                    );
                    ipv4.insert("ignore-auto-dns".to_string(), ov(Value::from(false))?);
                    ipv4.insert("ignore-auto-routes".to_string(), ov(Value::from(false))?);
                    for stale in ["gateway", "dns-priority", "may-fail"] {
                        ipv4.remove(stale);
                    }
                    settings
                        .call::<_, _, ()>("Update", &(map,))
                        .await
                        .map_err(|e| map_zbus_err("Update", &e))?;
                    Ok(())
                })
                .await?;

                // Full reload: deactivate, settle, reactivate.
                let nm = manager(&conn).await?;
                let _ = nm
                    .call::<_, _, ()>("DeactivateConnection", &(refs.active_path.clone(),))
                    .await;
                tokio::time::sleep(NM_SETTLE_DELAY).await;
                with_timeout(DBUS_APPLY_TIMEOUT, "SetIPv4DHCP activate", async {
                    let _active: OwnedObjectPath = nm
                        .call(
                            "ActivateConnection",
                            &(
                                refs.settings_path.clone(),
                                refs.device_path.clone(),
                                root_path(),
                            ),
                        )
                        .await
                        .map_err(|e| map_zbus_err("ActivateConnection", &e))?;
                    Ok(())
                })
                .await
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn iface_validation() {
        validate_iface("eth0").unwrap();
        validate_iface("enp3s0.100").unwrap();
        assert!(validate_iface("").is_err());
        assert!(validate_iface("eth0; rm -rf /").is_err());
        assert!(validate_iface("interface-name-too-long").is_err());
    }

    #[test]
    fn cidr_v4_parses_and_bounds_prefix() {
        let (addr, prefix) = validate_cidr_v4("192.168.1.10/24").unwrap();
        assert_eq!(addr, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(prefix, 24);
        assert!(validate_cidr_v4("192.168.1.10").is_err());
        assert!(validate_cidr_v4("192.168.1.10/33").is_err());
        assert!(validate_cidr_v4("not-an-ip/24").is_err());
    }

    #[test]
    fn cidr_v6_parses() {
        validate_cidr_v6("2001:db8::1/64").unwrap();
        assert!(validate_cidr_v6("2001:db8::1/129").is_err());
        assert!(validate_cidr_v6("192.168.1.1/24").is_err());
    }

    #[test]
    fn nm_u32_round_trips_ipv4() {
        let addr = Ipv4Addr::new(10, 0, 0, 53);
        assert_eq!(ipv4_from_nm_u32(ipv4_to_nm_u32(addr)), addr);
    }

    #[test]
    fn ipv6_groups_format_without_compression() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0x20;
        bytes[1] = 0x01;
        bytes[2] = 0x0d;
        bytes[3] = 0xb8;
        bytes[15] = 0x01;
        assert_eq!(format_ipv6_groups(&bytes), "2001:db8:0:0:0:0:0:1");
    }

    #[test]
    fn sanitize_removes_binary_fields_from_both_families() {
        let mut settings: NmSettings = HashMap::new();
        let mut ipv4 = HashMap::new();
        ipv4.insert(
            "address-data".to_string(),
            OwnedValue::try_from(Value::from(1u32)).unwrap(),
        );
        ipv4.insert(
            "method".to_string(),
            OwnedValue::try_from(Value::from("auto")).unwrap(),
        );
        let mut ipv6 = HashMap::new();
        ipv6.insert(
            "routes".to_string(),
            OwnedValue::try_from(Value::from(2u32)).unwrap(),
        );
        settings.insert("ipv4".to_string(), ipv4);
        settings.insert("ipv6".to_string(), ipv6);

        sanitize_settings(&mut settings);
        assert!(settings["ipv4"].contains_key("method"));
        assert!(!settings["ipv4"].contains_key("address-data"));
        assert!(settings["ipv6"].is_empty());
    }

    #[test]
    fn device_names_map_known_codes() {
        assert_eq!(device_type_name(1), "ethernet");
        assert_eq!(device_type_name(999), "unknown");
        assert_eq!(device_state_name(100), "activated");
        assert_eq!(device_state_name(50), "connecting");
    }
}
