//! IPv6, MTU, and link enable/disable through `nmcli`.
//!
//! IPv6 settings do not round-trip safely through the D-Bus settings maps,
//! so these operations shell out; validation still happens here before any
//! process is spawned.

use linuxio_common::Error;

use super::{validate_cidr_v6, validate_iface};
use crate::runner::CommandRunner;

async fn nmcli(runner: &dyn CommandRunner, args: &[&str]) -> Result<String, Error> {
    let output = runner.run("nmcli", args).await.map_err(|e| Error::External {
        tool: "nmcli".to_string(),
        detail: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(Error::external("nmcli", &output.stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Name of the connection profile currently bound to `iface`.
async fn connection_for(runner: &dyn CommandRunner, iface: &str) -> Result<String, Error> {
    let name = nmcli(
        runner,
        &["-g", "GENERAL.CONNECTION", "device", "show", iface],
    )
    .await?;
    if name.is_empty() {
        return Err(Error::NotFound(format!(
            "no active connection on interface {iface}"
        )));
    }
    Ok(name)
}

/// Switch the interface's IPv6 configuration to SLAAC/DHCPv6.
pub async fn set_ipv6_dhcp(runner: &dyn CommandRunner, iface: &str) -> Result<(), Error> {
    validate_iface(iface)?;
    let conn = connection_for(runner, iface).await?;
    nmcli(
        runner,
        &[
            "connection",
            "modify",
            &conn,
            "ipv6.method",
            "auto",
            "ipv6.addresses",
            "",
            "ipv6.gateway",
            "",
            "ipv6.dns",
            "",
        ],
    )
    .await?;
    nmcli(runner, &["connection", "up", &conn]).await?;
    Ok(())
}

/// Configure a static IPv6 address, with optional gateway and DNS servers.
pub async fn set_ipv6_static(
    runner: &dyn CommandRunner,
    iface: &str,
    cidr: &str,
    gateway: Option<&str>,
    dns: &[String],
) -> Result<(), Error> {
    validate_iface(iface)?;
    validate_cidr_v6(cidr)?;
    if let Some(gw) = gateway {
        gw.parse::<std::net::Ipv6Addr>()
            .map_err(|_| Error::InvalidArgs(format!("invalid IPv6 gateway {gw:?}")))?;
    }
    for server in dns {
        server
            .parse::<std::net::Ipv6Addr>()
            .map_err(|_| Error::InvalidArgs(format!("invalid IPv6 DNS server {server:?}")))?;
    }

    let conn = connection_for(runner, iface).await?;
    let dns_joined = dns.join(",");
    let mut args = vec![
        "connection",
        "modify",
        conn.as_str(),
        "ipv6.method",
        "manual",
        "ipv6.addresses",
        cidr,
    ];
    if let Some(gw) = gateway {
        args.extend_from_slice(&["ipv6.gateway", gw]);
    }
    if !dns_joined.is_empty() {
        args.extend_from_slice(&["ipv6.dns", dns_joined.as_str()]);
    }
    nmcli(runner, &args).await?;
    nmcli(runner, &["connection", "up", &conn]).await?;
    Ok(())
}

/// Change the wired MTU on the bound profile and re-activate it.
pub async fn set_mtu(runner: &dyn CommandRunner, iface: &str, mtu: u32) -> Result<(), Error> {
    validate_iface(iface)?;
    if !(576..=9216).contains(&mtu) {
        return Err(Error::InvalidArgs(format!(
            "mtu {mtu} is outside the accepted 576-9216 range"
        )));
    }
    let conn = connection_for(runner, iface).await?;
    let mtu_str = mtu.to_string();
    nmcli(
        runner,
        &[
            "connection",
            "modify",
            &conn,
            "802-3-ethernet.mtu",
            &mtu_str,
        ],
    )
    .await?;
    nmcli(runner, &["connection", "up", &conn]).await?;
    Ok(())
}

pub async fn enable_interface(runner: &dyn CommandRunner, iface: &str) -> Result<(), Error> {
    validate_iface(iface)?;
    nmcli(runner, &["device", "connect", iface]).await?;
    Ok(())
}

pub async fn disable_interface(runner: &dyn CommandRunner, iface: &str) -> Result<(), Error> {
    validate_iface(iface)?;
    nmcli(runner, &["device", "disconnect", iface]).await?;
    Ok(())
}
