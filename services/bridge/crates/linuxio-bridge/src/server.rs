//! Bridge runtime: unix listener, per-connection dispatch, graceful
//! shutdown.
//!
//! Connection state machine: OPEN → AUTHED → SERVING → CLOSED. An
//! unauthenticated peer gets to send exactly one frame; anything but a
//! matching auth request closes the socket with no response. Framing
//! violations also close silently — fuzzers get nothing to calibrate
//! against.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use linuxio_common::session::{BRIDGE_SOCKET_GROUP, SOCKET_MODE};
use linuxio_common::wire::{
    AUTH_NAMESPACE, Frame, FrameCodec, Request, Response, STREAM_NAMESPACE, StreamOpcode,
};
use linuxio_common::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::registry::{Emit, RequestCtx, StreamCtx, StreamSink};
use crate::state::BridgeState;

/// Grace period for in-flight handlers after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outbound queue depth per connection; slow readers get backpressure.
const OUTBOUND_DEPTH: usize = 64;

/// Bind the listening socket, serve until shutdown, then unlink it.
pub async fn run(state: Arc<BridgeState>) -> Result<()> {
    let socket_path = state.session.socket_path.clone();
    let path = Path::new(&socket_path);

    // A stale socket from a crashed predecessor is replaced; a symlink in
    // its place is someone playing games.
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            anyhow::bail!("socket path {socket_path} is a symlink, refusing");
        }
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {socket_path}"))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding {socket_path}"))?;
    apply_socket_permissions(path, state.session.uid);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("installing SIGINT handler")?;

    tracing::info!(socket = %socket_path, mode = %state.session.mode, "bridge listening");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        connections.spawn(async move {
                            if let Err(err) = handle_connection(state, stream).await {
                                tracing::debug!(error = %err, "connection closed with error");
                            }
                        });
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                }
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                state.shutdown.cancel();
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
                state.shutdown.cancel();
                break;
            }
            () = state.shutdown.cancelled() => break,
        }
    }

    // Stop accepting, give handlers a bounded grace, then go.
    drop(listener);
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("handlers still running after grace period, aborting them");
        connections.abort_all();
    }
    let _ = std::fs::remove_file(path);
    tracing::info!("bridge exited cleanly");
    Ok(())
}

/// 0660, owner uid, group `linuxio-bridge-socket`. The chown only works as
/// root; unprivileged bridges rely on the setgid parent directory for the
/// group, so failures there are expected and only logged.
fn apply_socket_permissions(path: &Path, uid: u32) {
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE)) {
        tracing::warn!(error = %err, "could not set socket mode");
    }
    match nix::unistd::Group::from_name(BRIDGE_SOCKET_GROUP) {
        Ok(Some(group)) => {
            if let Err(err) = nix::unistd::chown(
                path,
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(group.gid),
            ) {
                tracing::debug!(error = %err, "socket chown skipped");
            }
        }
        _ => tracing::warn!(group = BRIDGE_SOCKET_GROUP, "bridge socket group missing"),
    }
}

async fn handle_connection(state: Arc<BridgeState>, stream: UnixStream) -> Result<(), Error> {
    let framed = Framed::new(stream, FrameCodec);
    let (mut sink, mut frames) = framed.split();

    // Writer task: everything outbound funnels through one channel so
    // concurrent handlers cannot interleave partial frames.
    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let result = serve_frames(&state, &mut frames, &tx).await;

    drop(tx);
    let _ = writer.await;
    result
}

async fn serve_frames(
    state: &Arc<BridgeState>,
    frames: &mut (impl futures::Stream<Item = Result<Frame, Error>> + Unpin),
    tx: &mpsc::Sender<Frame>,
) -> Result<(), Error> {
    // OPEN: exactly one frame may arrive before authentication.
    let first = match frames.next().await {
        Some(frame) => frame?,
        None => return Ok(()),
    };
    let auth_id = match first {
        Frame::Request(req)
            if req.namespace == AUTH_NAMESPACE
                && req.args.first().map(String::as_str) == Some(state.session.secret.as_str()) =>
        {
            req.id
        }
        _ => {
            tracing::warn!("rejecting connection with bad auth frame");
            return Ok(());
        }
    };
    send(tx, Frame::Response(Response::success(
        auth_id,
        serde_json::json!({ "authenticated": true }),
    )))
    .await;

    // SERVING.
    let conn_cancel = state.shutdown.child_token();
    let next_stream_id = Arc::new(AtomicU32::new(1));
    let mut open_streams: HashMap<u32, CancellationToken> = HashMap::new();

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            () = conn_cancel.cancelled() => break,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                // Protocol violation: close without an error frame.
                conn_cancel.cancel();
                return Err(err);
            }
            None => break,
        };

        match frame {
            Frame::Request(req) if req.namespace == STREAM_NAMESPACE => {
                open_stream(state, &conn_cancel, &next_stream_id, &mut open_streams, tx, req)
                    .await;
            }
            Frame::Request(req) => {
                dispatch_command(state, &conn_cancel, tx, req);
            }
            Frame::Stream(frame) if frame.opcode == StreamOpcode::StreamClose => {
                // Idempotent: a second close for the same id misses the map.
                if let Some(cancel) = open_streams.remove(&frame.stream_id) {
                    cancel.cancel();
                }
            }
            Frame::Stream(_) | Frame::Response(_) => {
                conn_cancel.cancel();
                return Err(Error::Transport(
                    "unexpected frame kind from client".to_string(),
                ));
            }
        }
    }

    // EOF or shutdown: cancel anything this connection owns.
    conn_cancel.cancel();
    for (_, cancel) in open_streams {
        cancel.cancel();
    }
    Ok(())
}

async fn open_stream(
    state: &Arc<BridgeState>,
    conn_cancel: &CancellationToken,
    next_stream_id: &Arc<AtomicU32>,
    open_streams: &mut HashMap<u32, CancellationToken>,
    tx: &mpsc::Sender<Frame>,
    req: Request,
) {
    let Some(handler) = state.registry.lookup_stream(&req.command) else {
        send(tx, Frame::Response(Response::failure(
            req.id,
            format!("unknown stream type {:?}", req.command),
            404,
        )))
        .await;
        return;
    };

    let stream_id = next_stream_id.fetch_add(1, Ordering::Relaxed);
    let cancel = conn_cancel.child_token();
    open_streams.insert(stream_id, cancel.clone());
    send(tx, Frame::Response(Response::success(
        req.id,
        serde_json::json!({ "stream_id": stream_id }),
    )))
    .await;

    let ctx = StreamCtx {
        state: state.clone(),
        stream_id,
        args: req.args,
        cancel,
        sink: StreamSink::new(tx.clone()),
    };
    let sink = ctx.sink.clone();
    tokio::spawn(async move {
        if let Err(err) = handler(ctx).await {
            tracing::debug!(error = %err, stream_id, "stream handler failed");
            if err.is_reportable() {
                sink.result_err(stream_id, &err.to_string(), err.code()).await;
            }
            sink.close(stream_id).await;
        }
    });
}

fn dispatch_command(
    state: &Arc<BridgeState>,
    conn_cancel: &CancellationToken,
    tx: &mpsc::Sender<Frame>,
    req: Request,
) {
    let response_tx = tx.clone();
    let Some(handler) = state.registry.lookup_command(&req.namespace, &req.command) else {
        let resp = Response::failure(
            req.id,
            format!("unknown command {}/{}", req.namespace, req.command),
            404,
        );
        tokio::spawn(async move {
            let _ = response_tx.send(Frame::Response(resp)).await;
        });
        return;
    };

    let ctx = RequestCtx {
        state: state.clone(),
        cancel: conn_cancel.child_token(),
    };
    let emit = Emit::new();
    let id = req.id;
    tokio::spawn(async move {
        let outcome = handler(ctx, req.args, emit.clone()).await;
        let response = match (emit.take(), outcome) {
            (Some((true, payload, _)), _) => Response {
                id,
                ok: true,
                payload,
                error: None,
            },
            (Some((false, _, Some((message, code)))), _) => Response::failure(id, message, code),
            (Some((false, _, None)), _) => {
                Response::failure(id, "handler reported failure without detail", 500)
            }
            (None, Err(err)) => Response::from_error(id, &err),
            (None, Ok(())) => {
                Response::failure(id, "handler completed without emitting a result", 500)
            }
        };
        let _ = response_tx.send(Frame::Response(response)).await;
    });
}

async fn send(tx: &mpsc::Sender<Frame>, frame: Frame) {
    let _ = tx.send(frame).await;
}
