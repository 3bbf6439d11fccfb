//! Wiring of every command namespace onto the adapters.

use linuxio_common::Error;
use serde_json::json;

use crate::autoupdate;
use crate::dbus::{packagekit, systemd};
use crate::journal;
use crate::network;
use crate::registry::{Emit, Registry, RequestCtx, handler, require_args};
use crate::storage::{fstab, lvm, nfs};
use crate::streams;

/// Register the full command and stream surface. Called once at startup.
pub fn register_all(registry: &mut Registry) -> Result<(), Error> {
    register_control(registry)?;
    register_dbus(registry)?;
    register_network(registry)?;
    register_storage(registry)?;
    streams::register(registry)?;
    Ok(())
}

fn register_control(registry: &mut Registry) -> Result<(), Error> {
    registry.command(
        "control",
        "Ping",
        handler(|ctx: RequestCtx, _args, emit: Emit| async move {
            emit.result(json!({
                "pong": true,
                "session_id": ctx.state.session.session_id,
                "mode": ctx.state.session.mode,
                "uptime_secs": ctx.state.started.elapsed().as_secs(),
            }))
        }),
    )?;
    registry.command(
        "control",
        "Shutdown",
        handler(|ctx: RequestCtx, _args, emit: Emit| async move {
            emit.result(json!({ "shutting_down": true }))?;
            ctx.state.shutdown.cancel();
            Ok(())
        }),
    )?;
    Ok(())
}

fn register_dbus(registry: &mut Registry) -> Result<(), Error> {
    registry.command(
        "dbus",
        "ListServices",
        handler(|ctx: RequestCtx, _args, emit: Emit| async move {
            let services = systemd::list_services(&ctx.state.dbus).await?;
            emit.result(serde_json::to_value(services).map_err(internal)?)
        }),
    )?;
    registry.command(
        "dbus",
        "GetServiceInfo",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 1, "GetServiceInfo <unit>")?;
            let info = systemd::service_info(&ctx.state.dbus, &args[0]).await?;
            emit.result(info)
        }),
    )?;

    for (command, action) in [
        ("StartService", systemd::UnitAction::Start),
        ("StopService", systemd::UnitAction::Stop),
        ("RestartService", systemd::UnitAction::Restart),
        ("ReloadService", systemd::UnitAction::Reload),
        ("EnableService", systemd::UnitAction::Enable),
        ("DisableService", systemd::UnitAction::Disable),
        ("MaskService", systemd::UnitAction::Mask),
        ("UnmaskService", systemd::UnitAction::Unmask),
    ] {
        registry.command(
            "dbus",
            command,
            handler(move |ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
                require_args(&args, 1, "<unit>")?;
                let outcome = systemd::unit_action(&ctx.state.dbus, action, &args[0]).await?;
                emit.result(outcome)
            }),
        )?;
    }

    registry.command(
        "dbus",
        "GetServiceLogs",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 1, "GetServiceLogs <unit> [lines]")?;
            let lines = match args.get(1) {
                Some(raw) => Some(
                    raw.parse()
                        .map_err(|_| Error::InvalidArgs(format!("invalid line count {raw:?}")))?,
                ),
                None => None,
            };
            let lines = journal::logs_once(ctx.state.runner.as_ref(), &args[0], lines).await?;
            emit.result(json!({ "lines": lines }))
        }),
    )?;

    registry.command(
        "dbus",
        "GetUpdates",
        handler(|ctx: RequestCtx, _args, emit: Emit| async move {
            let updates = packagekit::get_updates(&ctx.state.dbus).await?;
            emit.result(serde_json::to_value(updates).map_err(internal)?)
        }),
    )?;
    registry.command(
        "dbus",
        "InstallPackage",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 1, "InstallPackage <package-id>...")?;
            let installed = packagekit::install_packages(&ctx.state.dbus, &args).await?;
            emit.result(json!({ "installed": installed }))
        }),
    )?;

    registry.command(
        "dbus",
        "GetAutoUpdate",
        handler(|ctx: RequestCtx, _args, emit: Emit| async move {
            emit.result(autoupdate::get_auto_update(&ctx.state).await?)
        }),
    )?;
    registry.command(
        "dbus",
        "SetAutoUpdate",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 1, "SetAutoUpdate <enabled>")?;
            let enabled = parse_bool(&args[0])?;
            emit.result(autoupdate::set_auto_update(&ctx.state, enabled).await?)
        }),
    )?;
    Ok(())
}

fn register_network(registry: &mut Registry) -> Result<(), Error> {
    registry.command(
        "network",
        "GetNetworkInfo",
        handler(|ctx: RequestCtx, _args, emit: Emit| async move {
            let info = network::get_network_info(&ctx.state).await?;
            emit.result(serde_json::to_value(info).map_err(internal)?)
        }),
    )?;
    registry.command(
        "network",
        "SetIPv4Manual",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 3, "SetIPv4Manual <iface> <cidr> <gateway> [dns...]")?;
            let dns: Vec<String> = args[3..].to_vec();
            network::set_ipv4_manual(&ctx.state, &args[0], &args[1], &args[2], &dns).await?;
            emit.result(json!({ "interface": args[0], "method": "manual" }))
        }),
    )?;
    registry.command(
        "network",
        "SetIPv4DHCP",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 1, "SetIPv4DHCP <iface>")?;
            network::set_ipv4_dhcp(&ctx.state, &args[0]).await?;
            emit.result(json!({ "interface": args[0], "method": "auto" }))
        }),
    )?;
    registry.command(
        "network",
        "SetIPv6Static",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 2, "SetIPv6Static <iface> <cidr> [gateway] [dns...]")?;
            let gateway = args.get(2).map(String::as_str).filter(|s| !s.is_empty());
            let dns: Vec<String> = args.get(3..).unwrap_or_default().to_vec();
            network::nmcli::set_ipv6_static(
                ctx.state.runner.as_ref(),
                &args[0],
                &args[1],
                gateway,
                &dns,
            )
            .await?;
            emit.result(json!({ "interface": args[0], "method": "manual" }))
        }),
    )?;
    registry.command(
        "network",
        "SetIPv6DHCP",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 1, "SetIPv6DHCP <iface>")?;
            network::nmcli::set_ipv6_dhcp(ctx.state.runner.as_ref(), &args[0]).await?;
            emit.result(json!({ "interface": args[0], "method": "auto" }))
        }),
    )?;
    registry.command(
        "network",
        "SetMTU",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 2, "SetMTU <iface> <mtu>")?;
            let mtu: u32 = args[1]
                .parse()
                .map_err(|_| Error::InvalidArgs(format!("invalid mtu {:?}", args[1])))?;
            network::nmcli::set_mtu(ctx.state.runner.as_ref(), &args[0], mtu).await?;
            emit.result(json!({ "interface": args[0], "mtu": mtu }))
        }),
    )?;
    registry.command(
        "network",
        "EnableInterface",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 1, "EnableInterface <iface>")?;
            network::nmcli::enable_interface(ctx.state.runner.as_ref(), &args[0]).await?;
            emit.result(json!({ "interface": args[0], "enabled": true }))
        }),
    )?;
    registry.command(
        "network",
        "DisableInterface",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 1, "DisableInterface <iface>")?;
            network::nmcli::disable_interface(ctx.state.runner.as_ref(), &args[0]).await?;
            emit.result(json!({ "interface": args[0], "enabled": false }))
        }),
    )?;
    Ok(())
}

fn register_storage(registry: &mut Registry) -> Result<(), Error> {
    registry.command(
        "storage",
        "ListPhysicalVolumes",
        handler(|ctx: RequestCtx, _args, emit: Emit| async move {
            let pvs = lvm::list_pvs(ctx.state.runner.as_ref()).await?;
            emit.result(serde_json::to_value(pvs).map_err(internal)?)
        }),
    )?;
    registry.command(
        "storage",
        "ListVolumeGroups",
        handler(|ctx: RequestCtx, _args, emit: Emit| async move {
            let vgs = lvm::list_vgs(ctx.state.runner.as_ref()).await?;
            emit.result(serde_json::to_value(vgs).map_err(internal)?)
        }),
    )?;
    registry.command(
        "storage",
        "ListLogicalVolumes",
        handler(|ctx: RequestCtx, _args, emit: Emit| async move {
            let lvs = lvm::list_lvs(ctx.state.runner.as_ref()).await?;
            emit.result(serde_json::to_value(lvs).map_err(internal)?)
        }),
    )?;
    registry.command(
        "storage",
        "CreateLV",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 3, "CreateLV <vg> <name> <size>")?;
            lvm::create_lv(ctx.state.runner.as_ref(), &args[0], &args[1], &args[2]).await?;
            emit.result(json!({ "vg": args[0], "lv": args[1] }))
        }),
    )?;
    registry.command(
        "storage",
        "RemoveLV",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 2, "RemoveLV <vg> <name>")?;
            lvm::remove_lv(ctx.state.runner.as_ref(), &args[0], &args[1]).await?;
            emit.result(json!({ "vg": args[0], "lv": args[1], "removed": true }))
        }),
    )?;
    registry.command(
        "storage",
        "ResizeLV",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 3, "ResizeLV <vg> <name> <size>")?;
            lvm::resize_lv(ctx.state.runner.as_ref(), &args[0], &args[1], &args[2]).await?;
            emit.result(json!({ "vg": args[0], "lv": args[1], "size": args[2] }))
        }),
    )?;

    registry.command(
        "storage",
        "ListNFSMounts",
        handler(|_ctx: RequestCtx, _args, emit: Emit| async move {
            let mounts = nfs::list_nfs_mounts(std::path::Path::new(fstab::FSTAB_PATH))?;
            emit.result(serde_json::to_value(mounts).map_err(internal)?)
        }),
    )?;
    registry.command(
        "storage",
        "MountNFS",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 3, "MountNFS <server> <export> <mountpoint> [options] [add-fstab]")?;
            let options = args.get(3).map(String::as_str).unwrap_or("");
            let add_fstab = args.get(4).map(String::as_str).map_or(true, |raw| {
                matches!(raw, "1" | "true")
            });
            let outcome = nfs::mount_nfs(
                ctx.state.runner.as_ref(),
                std::path::Path::new(fstab::FSTAB_PATH),
                &args[0],
                &args[1],
                &args[2],
                options,
                add_fstab,
            )
            .await?;
            emit.result(serde_json::to_value(outcome).map_err(internal)?)
        }),
    )?;
    registry.command(
        "storage",
        "UnmountNFS",
        handler(|ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 1, "UnmountNFS <mountpoint> [remove-fstab]")?;
            let remove_fstab = args.get(1).map(String::as_str).map_or(false, |raw| {
                matches!(raw, "1" | "true")
            });
            let outcome = nfs::unmount_nfs(
                ctx.state.runner.as_ref(),
                std::path::Path::new(fstab::FSTAB_PATH),
                &args[0],
                remove_fstab,
            )
            .await?;
            emit.result(serde_json::to_value(outcome).map_err(internal)?)
        }),
    )?;
    registry.command(
        "storage",
        "UpdateNFSOptions",
        handler(|_ctx: RequestCtx, args: Vec<String>, emit: Emit| async move {
            require_args(&args, 2, "UpdateNFSOptions <mountpoint> <options>")?;
            nfs::update_nfs_options(
                std::path::Path::new(fstab::FSTAB_PATH),
                &args[0],
                &args[1],
            )?;
            emit.result(json!({ "mountpoint": args[0], "options": args[1] }))
        }),
    )?;
    Ok(())
}

fn parse_bool(raw: &str) -> Result<bool, Error> {
    match raw {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(Error::InvalidArgs(format!("expected a boolean, got {other:?}"))),
    }
}

fn internal(err: serde_json::Error) -> Error {
    Error::Fatal(format!("serializing response payload: {err}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn full_surface_registers_once() {
        let mut registry = Registry::new();
        register_all(&mut registry).unwrap();

        for (ns, cmd) in [
            ("control", "Ping"),
            ("control", "Shutdown"),
            ("dbus", "ListServices"),
            ("dbus", "RestartService"),
            ("dbus", "GetUpdates"),
            ("dbus", "SetAutoUpdate"),
            ("network", "GetNetworkInfo"),
            ("network", "SetIPv4Manual"),
            ("storage", "ListPhysicalVolumes"),
            ("storage", "UnmountNFS"),
        ] {
            assert!(registry.lookup_command(ns, cmd).is_some(), "{ns}/{cmd}");
        }
        assert!(registry.lookup_stream(streams::SERVICE_LOGS).is_some());
        assert!(registry.lookup_stream(streams::PKG_UPDATE).is_some());
    }

    #[test]
    fn registering_twice_is_deterministically_rejected() {
        let mut registry = Registry::new();
        register_all(&mut registry).unwrap();
        assert!(register_all(&mut registry).is_err());
    }

    #[test]
    fn bools_parse_strictly() {
        assert!(parse_bool("true").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("yes").is_err());
    }
}
