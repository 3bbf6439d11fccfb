//! PackageKit transactions: update listing, installation, and streamed
//! update progress.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use linuxio_common::Error;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use zbus::zvariant::OwnedObjectPath;

use super::{
    DBUS_READ_TIMEOUT, DbusGate, PK_COLLECT_TIMEOUT, PK_INSTALL_TIMEOUT, map_zbus_err,
    with_timeout,
};
use crate::registry::StreamSink;

const DEST: &str = "org.freedesktop.PackageKit";
const PATH: &str = "/org/freedesktop/PackageKit";
const IFACE: &str = "org.freedesktop.PackageKit";
const TXN_IFACE: &str = "org.freedesktop.PackageKit.Transaction";

/// PackageKit filter bitfield value for "none".
const FILTER_NONE: u64 = 1;
/// Transaction flags: plain transaction, no simulation.
const TRANSACTION_FLAG_NONE: u64 = 0;

/// Status codes that represent real work worth displaying; everything else
/// is swallowed so the UI percentage does not flicker backwards.
pub const REAL_WORK_STATUSES: &[u32] = &[8, 9, 10, 11, 13, 14, 15, 16, 35];

static CVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CVE-\d{4}-\d+").expect("static regex"));

/// RFC822-ish date as it appears in changelog headers, e.g.
/// "Tue, 03 Jun 2025 12:00:00 +0200" or "3 Jun 2025".
static CHANGELOG_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2})\s+(Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)\w*\s+(\d{4})")
        .expect("static regex")
});

/// A pending update as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateItem {
    pub package_id: String,
    pub summary: String,
    pub version: String,
    pub issued: String,
    pub changelog: String,
    pub cves: Vec<String>,
    pub restart_flag: u32,
    pub state: u32,
}

/// Full `UpdateDetail` signal body. A short or mis-typed body fails
/// deserialization and surfaces as `External`.
type UpdateDetailBody = (
    String,      // 0: package_id
    Vec<String>, // 1: updates
    Vec<String>, // 2: obsoletes
    Vec<String>, // 3: vendor_urls
    Vec<String>, // 4: bug_urls
    Vec<String>, // 5: cve_urls
    u32,         // 6: restart
    String,      // 7: update_text
    String,      // 8: changelog
    u32,         // 9: state
    String,      // 10: issued
    String,      // 11: updated
);

/// Union of the signal's CVE field and CVEs scraped from the changelog,
/// deduplicated and sorted.
#[must_use]
pub fn merge_cves(signal_cves: &[String], changelog: &str) -> Vec<String> {
    let mut set: BTreeSet<String> = signal_cves
        .iter()
        .flat_map(|entry| CVE_RE.find_iter(entry).map(|m| m.as_str().to_string()))
        .collect();
    for m in CVE_RE.find_iter(changelog) {
        set.insert(m.as_str().to_string());
    }
    set.into_iter().collect()
}

/// Normalize `issued` to RFC3339, falling back to a date scraped from the
/// changelog when the signal field is empty. Empty string when neither
/// yields a date.
#[must_use]
pub fn normalize_issued(issued: &str, changelog: &str) -> String {
    let trimmed = issued.trim();
    if !trimmed.is_empty() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return dt.with_timezone(&Utc).to_rfc3339();
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
            return dt.with_timezone(&Utc).to_rfc3339();
        }
    }
    if let Some(caps) = CHANGELOG_DATE_RE.captures(changelog) {
        let composed = format!("{} {} {}", &caps[1], &caps[2], &caps[3]);
        if let Ok(date) = NaiveDate::parse_from_str(&composed, "%d %b %Y") {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return dt.and_utc().to_rfc3339();
            }
        }
    }
    String::new()
}

/// Second `;`-separated field of a PackageKit package id.
#[must_use]
pub fn version_of(package_id: &str) -> String {
    package_id.split(';').nth(1).unwrap_or_default().to_string()
}

async fn create_transaction(conn: &zbus::Connection) -> Result<zbus::Proxy<'static>, Error> {
    let pk = zbus::Proxy::new(conn, DEST, PATH, IFACE)
        .await
        .map_err(|e| map_zbus_err("packagekit proxy", &e))?;
    let txn_path: OwnedObjectPath = pk
        .call("CreateTransaction", &())
        .await
        .map_err(|e| map_zbus_err("CreateTransaction", &e))?;
    zbus::Proxy::new(conn, DEST, txn_path, TXN_IFACE)
        .await
        .map_err(|e| map_zbus_err("transaction proxy", &e))
}

fn signal_body_err(signal: &str, err: &zbus::Error) -> Error {
    Error::External {
        tool: "packagekit".to_string(),
        detail: format!("malformed {signal} signal: {err}"),
    }
}

/// List pending updates: collect `Package` signals, then enrich with
/// `GetUpdateDetail`. Each phase is bounded by [`PK_COLLECT_TIMEOUT`].
pub async fn get_updates(gate: &DbusGate) -> Result<Vec<UpdateItem>, Error> {
    gate.with_bus(|conn| async move {
        // Phase 1: package ids and summaries.
        let packages = with_timeout(PK_COLLECT_TIMEOUT, "GetUpdates", async {
            let txn = create_transaction(&conn).await?;
            let mut package_sig = txn
                .receive_signal("Package")
                .await
                .map_err(|e| map_zbus_err("subscribing to Package", &e))?;
            let mut finished_sig = txn
                .receive_signal("Finished")
                .await
                .map_err(|e| map_zbus_err("subscribing to Finished", &e))?;
            txn.call::<_, _, ()>("GetUpdates", &(FILTER_NONE,))
                .await
                .map_err(|e| map_zbus_err("GetUpdates", &e))?;

            let mut found: Vec<(String, String)> = Vec::new();
            loop {
                tokio::select! {
                    msg = package_sig.next() => {
                        let Some(msg) = msg else { break };
                        let (_info, package_id, summary): (u32, String, String) = msg
                            .body()
                            .deserialize()
                            .map_err(|e| signal_body_err("Package", &e))?;
                        found.push((package_id, summary));
                    }
                    _ = finished_sig.next() => break,
                }
            }
            Ok(found)
        })
        .await?;

        if packages.is_empty() {
            return Ok(Vec::new());
        }

        // Phase 2: update details for every found package id.
        let ids: Vec<String> = packages.iter().map(|(id, _)| id.clone()).collect();
        let details = with_timeout(PK_COLLECT_TIMEOUT, "GetUpdateDetail", async {
            let txn = create_transaction(&conn).await?;
            let mut detail_sig = txn
                .receive_signal("UpdateDetail")
                .await
                .map_err(|e| map_zbus_err("subscribing to UpdateDetail", &e))?;
            let mut finished_sig = txn
                .receive_signal("Finished")
                .await
                .map_err(|e| map_zbus_err("subscribing to Finished", &e))?;
            let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            txn.call::<_, _, ()>("GetUpdateDetail", &(id_refs,))
                .await
                .map_err(|e| map_zbus_err("GetUpdateDetail", &e))?;

            let mut details: Vec<UpdateDetailBody> = Vec::new();
            loop {
                tokio::select! {
                    msg = detail_sig.next() => {
                        let Some(msg) = msg else { break };
                        let body: UpdateDetailBody = msg
                            .body()
                            .deserialize()
                            .map_err(|e| signal_body_err("UpdateDetail", &e))?;
                        details.push(body);
                    }
                    _ = finished_sig.next() => break,
                }
            }
            Ok(details)
        })
        .await?;

        let mut items: Vec<UpdateItem> = Vec::with_capacity(packages.len());
        for (package_id, summary) in packages {
            let detail = details.iter().find(|d| d.0 == package_id);
            let (cves, restart, changelog, state, issued) = match detail {
                Some(d) => (
                    merge_cves(&d.5, &d.8),
                    d.6,
                    d.8.clone(),
                    d.9,
                    normalize_issued(&d.10, &d.8),
                ),
                None => (Vec::new(), 0, String::new(), 0, String::new()),
            };
            items.push(UpdateItem {
                version: version_of(&package_id),
                package_id,
                summary,
                issued,
                changelog,
                cves,
                restart_flag: restart,
                state,
            });
        }
        Ok(items)
    })
    .await
}

/// Install the given package ids in one transaction. Terminal signals are
/// `ErrorCode` (fatal) and `Finished` (success).
pub async fn install_packages(gate: &DbusGate, package_ids: &[String]) -> Result<u64, Error> {
    let ids = package_ids.to_vec();
    gate.with_bus(|conn| {
        let ids = ids.clone();
        async move {
            with_timeout(PK_INSTALL_TIMEOUT, "InstallPackages", async {
                let txn = create_transaction(&conn).await?;
                let mut error_sig = txn
                    .receive_signal("ErrorCode")
                    .await
                    .map_err(|e| map_zbus_err("subscribing to ErrorCode", &e))?;
                let mut finished_sig = txn
                    .receive_signal("Finished")
                    .await
                    .map_err(|e| map_zbus_err("subscribing to Finished", &e))?;
                let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                txn.call::<_, _, ()>("InstallPackages", &(TRANSACTION_FLAG_NONE, id_refs))
                    .await
                    .map_err(|e| map_zbus_err("InstallPackages", &e))?;

                tokio::select! {
                    msg = error_sig.next() => {
                        let detail = match msg {
                            Some(msg) => {
                                let (code, message): (u32, String) = msg
                                    .body()
                                    .deserialize()
                                    .map_err(|e| signal_body_err("ErrorCode", &e))?;
                                format!("error {code}: {message}")
                            }
                            None => "transaction aborted".to_string(),
                        };
                        Err(Error::External { tool: "packagekit".to_string(), detail })
                    }
                    _ = finished_sig.next() => Ok(ids.len() as u64),
                }
            })
            .await
        }
    })
    .await
}

/// Streamed package update: progress relayed as PROGRESS frames, filtered
/// to the real-work status set. Returns the number of updated packages on
/// `Finished`.
pub async fn update_stream(
    gate: &DbusGate,
    package_ids: &[String],
    sink: &StreamSink,
    stream_id: u32,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    let ids = package_ids.to_vec();
    gate.with_bus(|conn| {
        let ids = ids.clone();
        async move {
            let txn = create_transaction(&conn).await?;
            let mut error_sig = txn
                .receive_signal("ErrorCode")
                .await
                .map_err(|e| map_zbus_err("subscribing to ErrorCode", &e))?;
            let mut finished_sig = txn
                .receive_signal("Finished")
                .await
                .map_err(|e| map_zbus_err("subscribing to Finished", &e))?;

            let props = zbus::fdo::PropertiesProxy::builder(&conn)
                .destination(DEST)
                .map_err(|e| Error::Transport(format!("properties destination: {e}")))?
                .path(txn.path().to_owned())
                .map_err(|e| Error::Transport(format!("properties path: {e}")))?
                .build()
                .await
                .map_err(|e| Error::Transport(format!("properties proxy: {e}")))?;
            let mut changed_sig = props
                .receive_properties_changed()
                .await
                .map_err(|e| Error::Transport(format!("subscribing to PropertiesChanged: {e}")))?;

            let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            txn.call::<_, _, ()>("UpdatePackages", &(TRANSACTION_FLAG_NONE, id_refs))
                .await
                .map_err(|e| map_zbus_err("UpdatePackages", &e))?;

            let mut status: u32 = 0;
            let mut percentage: u32 = 0;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(Error::Transport("stream canceled by client".to_string()));
                    }
                    sig = changed_sig.next() => {
                        let Some(sig) = sig else { continue };
                        let Ok(args) = sig.args() else { continue };
                        for (name, value) in &args.changed_properties {
                            match (*name, value.downcast_ref::<u32>().ok()) {
                                ("Status", Some(v)) => status = v,
                                ("Percentage", Some(v)) if v <= 100 => percentage = v,
                                _ => {}
                            }
                        }
                        if REAL_WORK_STATUSES.contains(&status) {
                            sink.progress(stream_id, &serde_json::json!({
                                "type": "status",
                                "status_code": status,
                                "percentage": percentage,
                            }))
                            .await;
                        }
                    }
                    msg = error_sig.next() => {
                        let detail = match msg {
                            Some(msg) => {
                                let (code, message): (u32, String) = msg
                                    .body()
                                    .deserialize()
                                    .map_err(|e| signal_body_err("ErrorCode", &e))?;
                                format!("error {code}: {message}")
                            }
                            None => "transaction aborted".to_string(),
                        };
                        return Err(Error::External { tool: "packagekit".to_string(), detail });
                    }
                    _ = finished_sig.next() => {
                        sink.progress(stream_id, &serde_json::json!({
                            "type": "status",
                            "percentage": 100,
                        }))
                        .await;
                        return Ok(ids.len() as u64);
                    }
                }
            }
        }
    })
    .await
}

/// Cheap availability probe used by auto-update backend selection.
pub async fn available(gate: &DbusGate) -> bool {
    gate.with_bus(|conn| async move {
        with_timeout(DBUS_READ_TIMEOUT, "packagekit probe", async {
            let pk = zbus::Proxy::new(&conn, DEST, PATH, IFACE)
                .await
                .map_err(|e| map_zbus_err("packagekit proxy", &e))?;
            pk.get_property::<u32>("VersionMajor")
                .await
                .map_err(|e| map_zbus_err("VersionMajor", &e))
        })
        .await
    })
    .await
    .is_ok()
}
