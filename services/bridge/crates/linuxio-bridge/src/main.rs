//! Bridge entry point.
//!
//! Reads the one-shot bootstrap blob from stdin (the auth helper's pipe),
//! validates it, and serves the session socket until shutdown.

use anyhow::{Context, Result};
use linuxio_common::Bootstrap;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use linuxio_bridge::config::BridgeEnv;
use linuxio_bridge::server;
use linuxio_bridge::state::BridgeState;

#[tokio::main]
async fn main() -> Result<()> {
    let env = BridgeEnv::load().context("loading LINUXIO_* environment")?;

    let default_filter = if env.verbose() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // The bootstrap arrives on stdin and exists nowhere else. Read to EOF —
    // the parent closes its pipe end once the blob is written.
    let mut raw = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut raw)
        .await
        .context("reading bootstrap from stdin")?;
    let bootstrap: Bootstrap =
        serde_json::from_slice(&raw).context("parsing bootstrap blob")?;
    drop(raw);
    bootstrap.validate().context("validating bootstrap blob")?;

    let state = BridgeState::new(&bootstrap, env.privileged())
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("building bridge state")?;

    tracing::info!(
        session = %state.session.session_id,
        user = %state.session.username,
        mode = %state.session.mode,
        "bridge starting"
    );

    server::run(state).await
}
