//! Long-lived follow streams: journal logs and package-update progress.
//!
//! Each handler owns a cancellable context. The connection dispatcher
//! cancels it on client `STREAM_CLOSE` or EOF; the contract is that any
//! owned subprocess dies within half a second of that.

use linuxio_common::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::dbus::{PK_UPDATE_STREAM_TIMEOUT, packagekit};
use crate::dbus::systemd::validate_unit_name;
use crate::journal;
use crate::registry::{Registry, StreamCtx, stream_handler};

pub const SERVICE_LOGS: &str = "service-logs";
pub const PKG_UPDATE: &str = "pkg-update";

pub fn register(registry: &mut Registry) -> Result<(), Error> {
    registry.stream(SERVICE_LOGS, stream_handler(service_logs))?;
    registry.stream(PKG_UPDATE, stream_handler(pkg_update))?;
    Ok(())
}

/// `journalctl -f` relay: one DATA frame per line until EOF, cancellation,
/// or a read error; the child is killed on every exit path.
async fn service_logs(ctx: StreamCtx) -> Result<(), Error> {
    let unit = ctx
        .args
        .first()
        .ok_or_else(|| Error::InvalidArgs("service-logs needs a unit name".to_string()))?;
    validate_unit_name(unit)?;
    let lines: u32 = match ctx.args.get(1) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::InvalidArgs(format!("invalid line count {raw:?}")))?,
        None => journal::DEFAULT_LINES,
    };

    let args = journal::follow_args(unit, lines);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut child = ctx
        .state
        .runner
        .spawn("journalctl", &arg_refs)
        .map_err(|e| Error::External {
            tool: "journalctl".to_string(),
            detail: e.to_string(),
        })?;
    let stdout = child.stdout.take().ok_or_else(|| Error::External {
        tool: "journalctl".to_string(),
        detail: "stdout was not piped".to_string(),
    })?;
    let mut reader = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            line = reader.next_line() => {
                match line {
                    Ok(Some(line)) => ctx.sink.data(ctx.stream_id, line.into_bytes()).await,
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }

    let _ = child.kill().await;
    ctx.sink.close(ctx.stream_id).await;
    Ok(())
}

/// Streamed package update via PackageKit; progress filtering happens in
/// the adapter, the 30-minute overall cap here.
async fn pkg_update(ctx: StreamCtx) -> Result<(), Error> {
    if ctx.args.is_empty() {
        return Err(Error::InvalidArgs(
            "pkg-update needs at least one package id".to_string(),
        ));
    }

    let result = tokio::time::timeout(
        PK_UPDATE_STREAM_TIMEOUT,
        packagekit::update_stream(
            &ctx.state.dbus,
            &ctx.args,
            &ctx.sink,
            ctx.stream_id,
            &ctx.cancel,
        ),
    )
    .await
    .unwrap_or_else(|_| Err(Error::Timeout("pkg-update stream".to_string())));

    match result {
        Ok(updated) => {
            ctx.sink
                .result_ok(ctx.stream_id, &serde_json::json!({ "updated": updated }))
                .await;
        }
        Err(err) if !ctx.cancel.is_cancelled() => {
            ctx.sink
                .result_err(ctx.stream_id, &err.to_string(), err.code())
                .await;
        }
        Err(_) => {}
    }
    ctx.sink.close(ctx.stream_id).await;
    Ok(())
}
