//! journalctl access: one-shot log windows and the argument builder shared
//! with the follow stream.

use linuxio_common::Error;

use crate::dbus::systemd::validate_unit_name;
use crate::runner::CommandRunner;

pub const DEFAULT_LINES: u32 = 100;

/// Arguments for a one-shot window of unit logs.
#[must_use]
pub fn once_args(unit: &str, lines: u32) -> Vec<String> {
    vec![
        "-u".to_string(),
        unit.to_string(),
        "-n".to_string(),
        lines.to_string(),
        "--no-pager".to_string(),
        "-o".to_string(),
        "short-iso".to_string(),
    ]
}

/// Arguments for a follow stream; identical to the one-shot window plus `-f`.
#[must_use]
pub fn follow_args(unit: &str, lines: u32) -> Vec<String> {
    let mut args = once_args(unit, lines);
    args.insert(4, "-f".to_string());
    args
}

/// Fetch a fixed window of logs for one unit.
pub async fn logs_once(
    runner: &dyn CommandRunner,
    unit: &str,
    lines: Option<u32>,
) -> Result<Vec<String>, Error> {
    validate_unit_name(unit)?;
    let lines = lines.unwrap_or(DEFAULT_LINES);
    let args = once_args(unit, lines);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = runner
        .run("journalctl", &arg_refs)
        .await
        .map_err(|e| Error::External {
            tool: "journalctl".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::external("journalctl", &output.stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(ToString::to_string)
        .collect())
}
