//! LVM reporting and mutations via the `pvs`/`vgs`/`lvs` family.
//!
//! All listing commands run with `--reportformat json --units b --nosuffix`
//! and the JSON report is parsed here; parsing is pure so canned report
//! fixtures exercise it without LVM installed.

use std::sync::LazyLock;

use linuxio_common::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::mounts::{self, MountEntry};
use crate::runner::CommandRunner;

/// `pvs` exits 5 when the host simply has no physical volumes.
const PVS_EXIT_NO_PVS: i32 = 5;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+[KMGTkmgt]?$").expect("static regex"));

#[derive(Debug, Clone, Serialize)]
pub struct PhysicalVolume {
    pub name: String,
    pub vg_name: String,
    pub size: u64,
    pub free: u64,
    pub attrs: String,
    pub fmt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeGroup {
    pub name: String,
    pub size: u64,
    pub free: u64,
    pub pv_count: u32,
    pub lv_count: u32,
    pub attrs: String,
    pub pv_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogicalVolume {
    pub name: String,
    pub vg_name: String,
    pub size: u64,
    pub path: String,
    pub attrs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_pct: Option<f64>,
}

// Raw report rows; LVM reports every value as a string.

#[derive(Debug, Deserialize)]
struct PvRow {
    pv_name: String,
    #[serde(default)]
    vg_name: String,
    pv_size: String,
    pv_free: String,
    #[serde(default)]
    pv_attr: String,
    #[serde(default)]
    pv_fmt: String,
}

#[derive(Debug, Deserialize)]
struct VgRow {
    vg_name: String,
    vg_size: String,
    vg_free: String,
    pv_count: String,
    lv_count: String,
    #[serde(default)]
    vg_attr: String,
}

#[derive(Debug, Deserialize)]
struct LvRow {
    lv_name: String,
    vg_name: String,
    lv_size: String,
    #[serde(default)]
    lv_path: String,
    #[serde(default)]
    lv_attr: String,
}

#[derive(Debug, Deserialize)]
struct LvmReport<T> {
    report: Vec<LvmReportEntry<T>>,
}

#[derive(Debug, Deserialize)]
struct LvmReportEntry<T> {
    #[serde(default = "Vec::new", alias = "pv", alias = "vg", alias = "lv")]
    rows: Vec<T>,
}

fn parse_report<T: serde::de::DeserializeOwned>(raw: &[u8], tool: &str) -> Result<Vec<T>, Error> {
    let report: LvmReport<T> = serde_json::from_slice(raw).map_err(|e| Error::External {
        tool: tool.to_string(),
        detail: format!("unparseable report: {e}"),
    })?;
    Ok(report.report.into_iter().flat_map(|e| e.rows).collect())
}

fn parse_bytes(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

fn parse_count(raw: &str) -> u32 {
    raw.trim().parse().unwrap_or(0)
}

/// Validate an LVM object name (VG or LV).
pub fn validate_name(name: &str) -> Result<(), Error> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidArgs(format!(
            "name {name:?} must match [A-Za-z0-9_-]{{1,64}}"
        )))
    }
}

/// Validate a size argument like `10G` or `512M`.
pub fn validate_size(size: &str) -> Result<(), Error> {
    if SIZE_RE.is_match(size) {
        Ok(())
    } else {
        Err(Error::InvalidArgs(format!(
            "size {size:?} must be digits with an optional K/M/G/T suffix"
        )))
    }
}

/// Device-mapper alias for an LV: dashes in names are doubled.
#[must_use]
pub fn mapper_path(vg: &str, lv: &str) -> String {
    format!(
        "/dev/mapper/{}-{}",
        vg.replace('-', "--"),
        lv.replace('-', "--")
    )
}

/// Find the mount entry backing an LV, matching both the `/dev/<vg>/<lv>`
/// and `/dev/mapper/` spellings.
#[must_use]
pub fn find_lv_mount<'a>(
    mounts: &'a [MountEntry],
    vg: &str,
    lv: &str,
    lv_path: &str,
) -> Option<&'a MountEntry> {
    let mapper = mapper_path(vg, lv);
    mounts
        .iter()
        .find(|m| m.source == lv_path || m.source == mapper)
}

pub async fn list_pvs(runner: &dyn CommandRunner) -> Result<Vec<PhysicalVolume>, Error> {
    let output = runner
        .run(
            "pvs",
            &[
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "pv_name,vg_name,pv_size,pv_free,pv_attr,pv_fmt",
            ],
        )
        .await
        .map_err(|e| Error::External {
            tool: "pvs".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        if output.status.code() == Some(PVS_EXIT_NO_PVS) {
            return Ok(Vec::new());
        }
        return Err(Error::external("pvs", &output.stderr));
    }
    let rows: Vec<PvRow> = parse_report(&output.stdout, "pvs")?;
    Ok(rows
        .into_iter()
        .map(|r| PhysicalVolume {
            name: r.pv_name,
            vg_name: r.vg_name,
            size: parse_bytes(&r.pv_size),
            free: parse_bytes(&r.pv_free),
            attrs: r.pv_attr,
            fmt: r.pv_fmt,
        })
        .collect())
}

pub async fn list_vgs(runner: &dyn CommandRunner) -> Result<Vec<VolumeGroup>, Error> {
    let output = runner
        .run(
            "vgs",
            &[
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "vg_name,vg_size,vg_free,pv_count,lv_count,vg_attr",
            ],
        )
        .await
        .map_err(|e| Error::External {
            tool: "vgs".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::external("vgs", &output.stderr));
    }
    let rows: Vec<VgRow> = parse_report(&output.stdout, "vgs")?;
    let pvs = list_pvs(runner).await.unwrap_or_default();
    Ok(rows
        .into_iter()
        .map(|r| {
            let pv_names = pvs
                .iter()
                .filter(|pv| pv.vg_name == r.vg_name)
                .map(|pv| pv.name.clone())
                .collect();
            VolumeGroup {
                name: r.vg_name,
                size: parse_bytes(&r.vg_size),
                free: parse_bytes(&r.vg_free),
                pv_count: parse_count(&r.pv_count),
                lv_count: parse_count(&r.lv_count),
                attrs: r.vg_attr,
                pv_names,
            }
        })
        .collect())
}

pub async fn list_lvs(runner: &dyn CommandRunner) -> Result<Vec<LogicalVolume>, Error> {
    let output = runner
        .run(
            "lvs",
            &[
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "lv_name,vg_name,lv_size,lv_path,lv_attr",
            ],
        )
        .await
        .map_err(|e| Error::External {
            tool: "lvs".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::external("lvs", &output.stderr));
    }
    let rows: Vec<LvRow> = parse_report(&output.stdout, "lvs")?;
    let mounts = mounts::list_mounts().unwrap_or_default();
    Ok(rows
        .into_iter()
        .map(|r| {
            let mount = find_lv_mount(&mounts, &r.vg_name, &r.lv_name, &r.lv_path);
            let usage = mount.and_then(|m| mounts::fs_usage(std::path::Path::new(&m.mountpoint)));
            LogicalVolume {
                name: r.lv_name,
                vg_name: r.vg_name,
                size: parse_bytes(&r.lv_size),
                path: r.lv_path,
                attrs: r.lv_attr,
                mountpoint: mount.map(|m| m.mountpoint.clone()),
                fs_type: mount.map(|m| m.fs_type.clone()),
                used_pct: usage.map(|(_, _, _, pct)| pct),
            }
        })
        .collect())
}

pub async fn create_lv(
    runner: &dyn CommandRunner,
    vg: &str,
    name: &str,
    size: &str,
) -> Result<(), Error> {
    validate_name(vg)?;
    validate_name(name)?;
    validate_size(size)?;
    let output = runner
        .run("lvcreate", &["-n", name, "-L", size, vg])
        .await
        .map_err(|e| Error::External {
            tool: "lvcreate".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::external("lvcreate", &output.stderr));
    }
    Ok(())
}

/// Remove an LV. Refuses while its device is mounted; the mount table is
/// the cross-check, not LVM's own opinion.
pub async fn remove_lv(runner: &dyn CommandRunner, vg: &str, name: &str) -> Result<(), Error> {
    validate_name(vg)?;
    validate_name(name)?;
    let lv_path = format!("/dev/{vg}/{name}");
    let mounts = mounts::list_mounts()?;
    if let Some(m) = find_lv_mount(&mounts, vg, name, &lv_path) {
        return Err(Error::Conflict(format!(
            "{lv_path} is mounted at {}; unmount it first",
            m.mountpoint
        )));
    }
    let target = format!("{vg}/{name}");
    let output = runner
        .run("lvremove", &["-f", &target])
        .await
        .map_err(|e| Error::External {
            tool: "lvremove".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::external("lvremove", &output.stderr));
    }
    Ok(())
}

/// Resize an LV and its filesystem (`-r`).
pub async fn resize_lv(
    runner: &dyn CommandRunner,
    vg: &str,
    name: &str,
    size: &str,
) -> Result<(), Error> {
    validate_name(vg)?;
    validate_name(name)?;
    validate_size(size)?;
    let lv_path = format!("/dev/{vg}/{name}");
    let output = runner
        .run("lvresize", &["-r", "-L", size, &lv_path])
        .await
        .map_err(|e| Error::External {
            tool: "lvresize".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::external("lvresize", &output.stderr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    use async_trait::async_trait;

    use super::*;

    /// Canned runner: one fixed output for every invocation.
    struct CannedRunner {
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    }

    #[async_trait]
    impl CommandRunner for CannedRunner {
        async fn run(&self, _program: &str, _args: &[&str]) -> anyhow::Result<Output> {
            Ok(Output {
                status: ExitStatus::from_raw(self.exit_code << 8),
                stdout: self.stdout.clone(),
                stderr: self.stderr.clone(),
            })
        }

        async fn run_with_timeout(
            &self,
            program: &str,
            args: &[&str],
            _timeout: std::time::Duration,
        ) -> anyhow::Result<Output> {
            self.run(program, args).await
        }

        async fn run_with_stdin(
            &self,
            program: &str,
            args: &[&str],
            _input: &[u8],
        ) -> anyhow::Result<Output> {
            self.run(program, args).await
        }

        fn spawn(&self, _program: &str, _args: &[&str]) -> anyhow::Result<tokio::process::Child> {
            anyhow::bail!("not expected in this test")
        }
    }

    #[tokio::test]
    async fn pvs_exit_5_means_no_pvs_not_an_error() {
        let runner = CannedRunner {
            exit_code: 5,
            stdout: Vec::new(),
            stderr: b"  No matching physical volumes found\n".to_vec(),
        };
        let pvs = list_pvs(&runner).await.unwrap();
        assert!(pvs.is_empty());
    }

    #[tokio::test]
    async fn pvs_other_failures_surface_stderr() {
        let runner = CannedRunner {
            exit_code: 2,
            stdout: Vec::new(),
            stderr: b"  Cannot access lvmetad\n".to_vec(),
        };
        let err = list_pvs(&runner).await.unwrap_err();
        assert!(matches!(err, Error::External { .. }));
        assert!(err.to_string().contains("Cannot access lvmetad"));
    }

    #[tokio::test]
    async fn successful_pvs_run_parses_rows() {
        let runner = CannedRunner {
            exit_code: 0,
            stdout: PVS_JSON.to_vec(),
            stderr: Vec::new(),
        };
        let pvs = list_pvs(&runner).await.unwrap();
        assert_eq!(pvs.len(), 2);
        assert_eq!(pvs[0].vg_name, "vg0");
        assert_eq!(pvs[1].free, 0);
    }

    #[tokio::test]
    async fn create_lv_rejects_bad_names_before_spawning() {
        let runner = CannedRunner {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let err = create_lv(&runner, "vg0", "bad/name", "10G").await.unwrap_err();
        assert_eq!(err.code(), 400);
        let err = create_lv(&runner, "vg0", "data", "10 gigs").await.unwrap_err();
        assert_eq!(err.code(), 400);
    }

    const PVS_JSON: &[u8] = br#"{
        "report": [{
            "pv": [
                {"pv_name":"/dev/sdb1","vg_name":"vg0","pv_size":"107374182400","pv_free":"53687091200","pv_attr":"a--","pv_fmt":"lvm2"},
                {"pv_name":"/dev/sdc1","vg_name":"vg0","pv_size":"107374182400","pv_free":"0","pv_attr":"a--","pv_fmt":"lvm2"}
            ]
        }]
    }"#;

    #[test]
    fn pv_report_parses() {
        let rows: Vec<PvRow> = parse_report(PVS_JSON, "pvs").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pv_name, "/dev/sdb1");
        assert_eq!(parse_bytes(&rows[0].pv_size), 107_374_182_400);
    }

    #[test]
    fn lv_report_parses_with_lv_alias() {
        let raw = br#"{"report":[{"lv":[{"lv_name":"data","vg_name":"vg0","lv_size":"1073741824","lv_path":"/dev/vg0/data","lv_attr":"-wi-ao----"}]}]}"#;
        let rows: Vec<LvRow> = parse_report(raw, "lvs").unwrap();
        assert_eq!(rows[0].lv_name, "data");
    }

    #[test]
    fn empty_report_yields_no_rows() {
        let raw = br#"{"report":[{}]}"#;
        let rows: Vec<PvRow> = parse_report(raw, "pvs").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn garbage_report_is_external_error() {
        let err = parse_report::<PvRow>(b"not json", "pvs").unwrap_err();
        assert!(matches!(err, Error::External { .. }));
    }

    #[test]
    fn names_and_sizes_validate() {
        validate_name("vg0").unwrap();
        validate_name(&"a".repeat(64)).unwrap();
        assert!(validate_name(&"a".repeat(65)).is_err());
        assert!(validate_name("vg/0").is_err());
        assert!(validate_name("").is_err());

        validate_size("10G").unwrap();
        validate_size("512").unwrap();
        validate_size("2t").unwrap();
        assert!(validate_size("10 G").is_err());
        assert!(validate_size("G10").is_err());
        assert!(validate_size("-5G").is_err());
    }

    #[test]
    fn mapper_path_doubles_dashes() {
        assert_eq!(mapper_path("vg0", "data"), "/dev/mapper/vg0-data");
        assert_eq!(
            mapper_path("my-vg", "my-lv"),
            "/dev/mapper/my--vg-my--lv"
        );
    }

    #[test]
    fn lv_mount_matches_either_spelling() {
        let mounts = vec![MountEntry {
            source: "/dev/mapper/vg0-data".to_string(),
            mountpoint: "/srv/data".to_string(),
            fs_type: "ext4".to_string(),
            options: "rw".to_string(),
        }];
        let hit = find_lv_mount(&mounts, "vg0", "data", "/dev/vg0/data").unwrap();
        assert_eq!(hit.mountpoint, "/srv/data");
        assert!(find_lv_mount(&mounts, "vg0", "other", "/dev/vg0/other").is_none());
    }
}
