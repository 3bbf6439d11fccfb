//! systemd manager operations over the system bus.

use linuxio_common::Error;
use serde::{Deserialize, Serialize};
use zbus::zvariant::OwnedObjectPath;

use super::{DBUS_APPLY_TIMEOUT, DBUS_READ_TIMEOUT, DbusGate, map_zbus_err, with_timeout};

const DEST: &str = "org.freedesktop.systemd1";
const PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_IFACE: &str = "org.freedesktop.systemd1.Manager";
const UNIT_IFACE: &str = "org.freedesktop.systemd1.Unit";
const SERVICE_IFACE: &str = "org.freedesktop.systemd1.Service";

/// One row of `ListUnits`.
#[derive(Debug, Deserialize, zbus::zvariant::Type)]
struct UnitRecord(
    String,          // name
    String,          // description
    String,          // load state
    String,          // active state
    String,          // sub state
    String,          // following
    OwnedObjectPath, // unit path
    u32,             // job id
    String,          // job type
    OwnedObjectPath, // job path
);

#[derive(Debug, Clone, Serialize)]
pub struct ServiceUnit {
    pub name: String,
    pub description: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAction {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
    Mask,
    Unmask,
}

impl UnitAction {
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            UnitAction::Start => "StartUnit",
            UnitAction::Stop => "StopUnit",
            UnitAction::Restart => "RestartUnit",
            UnitAction::Reload => "ReloadUnit",
            UnitAction::Enable => "EnableUnitFiles",
            UnitAction::Disable => "DisableUnitFiles",
            UnitAction::Mask => "MaskUnitFiles",
            UnitAction::Unmask => "UnmaskUnitFiles",
        }
    }

    /// Job-based actions return a job object path; file-based actions return
    /// unit file changes.
    #[must_use]
    pub fn is_file_op(self) -> bool {
        matches!(
            self,
            UnitAction::Enable | UnitAction::Disable | UnitAction::Mask | UnitAction::Unmask
        )
    }
}

/// Unit names are user input; keep them to the systemd charset.
pub fn validate_unit_name(unit: &str) -> Result<(), Error> {
    if unit.is_empty() || unit.len() > 256 {
        return Err(Error::InvalidArgs("unit name must be 1-256 bytes".to_string()));
    }
    if !unit
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'@' | b':' | b'.' | b'_' | b'-' | b'\\'))
    {
        return Err(Error::InvalidArgs(format!(
            "unit name {unit:?} contains invalid characters"
        )));
    }
    Ok(())
}

async fn manager_proxy(conn: &zbus::Connection) -> Result<zbus::Proxy<'static>, Error> {
    zbus::Proxy::new(conn, DEST, PATH, MANAGER_IFACE)
        .await
        .map_err(|e| map_zbus_err("systemd manager proxy", &e))
}

/// Enumerate loaded units and keep the `.service` ones.
pub async fn list_services(gate: &DbusGate) -> Result<Vec<ServiceUnit>, Error> {
    gate.with_bus(|conn| async move {
        with_timeout(DBUS_READ_TIMEOUT, "ListUnits", async {
            let manager = manager_proxy(&conn).await?;
            let units: Vec<UnitRecord> = manager
                .call("ListUnits", &())
                .await
                .map_err(|e| map_zbus_err("ListUnits", &e))?;
            let mut services: Vec<ServiceUnit> = units
                .into_iter()
                .filter(|u| u.0.ends_with(".service"))
                .map(|u| ServiceUnit {
                    name: u.0,
                    description: u.1,
                    load_state: u.2,
                    active_state: u.3,
                    sub_state: u.4,
                })
                .collect();
            services.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(services)
        })
        .await
    })
    .await
}

/// Fixed property set for one service; properties missing on this systemd
/// version are simply omitted from the result.
pub async fn service_info(gate: &DbusGate, unit: &str) -> Result<serde_json::Value, Error> {
    validate_unit_name(unit)?;
    let unit_name = unit.to_string();
    gate.with_bus(|conn| {
        let unit_name = unit_name.clone();
        async move {
            with_timeout(DBUS_READ_TIMEOUT, "GetServiceInfo", async {
                let manager = manager_proxy(&conn).await?;
                let unit_path: OwnedObjectPath = manager
                    .call("GetUnit", &(unit_name.as_str(),))
                    .await
                    .map_err(|e| map_zbus_err("GetUnit", &e))?;

                let unit_proxy = zbus::Proxy::new(&conn, DEST, unit_path.clone(), UNIT_IFACE)
                    .await
                    .map_err(|e| map_zbus_err("unit proxy", &e))?;
                let service_proxy = zbus::Proxy::new(&conn, DEST, unit_path, SERVICE_IFACE)
                    .await
                    .map_err(|e| map_zbus_err("service proxy", &e))?;

                let mut info = serde_json::Map::new();
                info.insert("name".to_string(), serde_json::json!(unit_name));
                for prop in [
                    "Description",
                    "LoadState",
                    "ActiveState",
                    "SubState",
                    "UnitFileState",
                    "FragmentPath",
                ] {
                    if let Ok(value) = unit_proxy.get_property::<String>(prop).await {
                        info.insert(snake_case(prop), serde_json::json!(value));
                    }
                }
                if let Ok(pid) = service_proxy.get_property::<u32>("MainPID").await {
                    info.insert("main_pid".to_string(), serde_json::json!(pid));
                }
                for prop in ["MemoryCurrent", "TasksCurrent", "NRestarts"] {
                    if let Ok(value) = service_proxy.get_property::<u64>(prop).await {
                        info.insert(snake_case(prop), serde_json::json!(value));
                    }
                }
                Ok(serde_json::Value::Object(info))
            })
            .await
        }
    })
    .await
}

/// Start/stop/restart/reload or enable/disable/mask/unmask one unit.
/// Job-based operations use mode "replace" and return the job path without
/// awaiting `JobRemoved`; callers correlate through the returned path.
pub async fn unit_action(
    gate: &DbusGate,
    action: UnitAction,
    unit: &str,
) -> Result<serde_json::Value, Error> {
    validate_unit_name(unit)?;
    let unit_name = unit.to_string();
    gate.with_bus(|conn| {
        let unit_name = unit_name.clone();
        async move {
            with_timeout(DBUS_APPLY_TIMEOUT, action.method(), async {
                let manager = manager_proxy(&conn).await?;
                if action.is_file_op() {
                    let files = vec![unit_name.as_str()];
                    match action {
                        UnitAction::Enable => {
                            let (_carries_install_info, changes): (
                                bool,
                                Vec<(String, String, String)>,
                            ) = manager
                                .call("EnableUnitFiles", &(files, false, true))
                                .await
                                .map_err(|e| map_zbus_err("EnableUnitFiles", &e))?;
                            Ok(serde_json::json!({ "changes": changes.len() }))
                        }
                        UnitAction::Disable => {
                            let changes: Vec<(String, String, String)> = manager
                                .call("DisableUnitFiles", &(files, false))
                                .await
                                .map_err(|e| map_zbus_err("DisableUnitFiles", &e))?;
                            Ok(serde_json::json!({ "changes": changes.len() }))
                        }
                        UnitAction::Mask => {
                            let changes: Vec<(String, String, String)> = manager
                                .call("MaskUnitFiles", &(files, false, true))
                                .await
                                .map_err(|e| map_zbus_err("MaskUnitFiles", &e))?;
                            Ok(serde_json::json!({ "changes": changes.len() }))
                        }
                        _ => {
                            let changes: Vec<(String, String, String)> = manager
                                .call("UnmaskUnitFiles", &(files, false))
                                .await
                                .map_err(|e| map_zbus_err("UnmaskUnitFiles", &e))?;
                            Ok(serde_json::json!({ "changes": changes.len() }))
                        }
                    }
                } else {
                    let job: OwnedObjectPath = manager
                        .call(action.method(), &(unit_name.as_str(), "replace"))
                        .await
                        .map_err(|e| map_zbus_err(action.method(), &e))?;
                    Ok(serde_json::json!({ "job": job.as_str() }))
                }
            })
            .await
        }
    })
    .await
}

/// `systemctl daemon-reload` equivalent, used after writing timer drop-ins.
pub async fn daemon_reload(gate: &DbusGate) -> Result<(), Error> {
    gate.with_bus(|conn| async move {
        with_timeout(DBUS_APPLY_TIMEOUT, "Reload", async {
            let manager = manager_proxy(&conn).await?;
            manager
                .call::<_, _, ()>("Reload", &())
                .await
                .map_err(|e| map_zbus_err("Reload", &e))
        })
        .await
    })
    .await
}

fn snake_case(prop: &str) -> String {
    let mut out = String::with_capacity(prop.len() + 4);
    for (i, ch) in prop.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
