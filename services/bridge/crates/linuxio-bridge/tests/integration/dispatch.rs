#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use linuxio_common::Mode;
use linuxio_common::wire::{Frame, FrameCodec, Request, StreamOpcode};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use linuxio_bridge::registry::{Registry, handler, require_args, stream_handler};
use linuxio_bridge::server;
use linuxio_bridge::state::{BridgeState, SessionInfo};

const SECRET: &str = "test-secret";

fn test_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .command(
            "test",
            "Echo",
            handler(|_ctx, args, emit| async move {
                emit.result(serde_json::json!({ "echo": args }))
            }),
        )
        .unwrap();
    registry
        .command(
            "test",
            "Sleepy",
            handler(|_ctx, args, emit| async move {
                let ms: u64 = args[0].parse().unwrap_or(10);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                emit.result(serde_json::json!({ "slept_ms": ms }))
            }),
        )
        .unwrap();
    registry
        .command(
            "test",
            "NeedsTwo",
            handler(|_ctx, args, emit| async move {
                require_args(&args, 2, "NeedsTwo <a> <b>")?;
                emit.result(serde_json::json!({ "ok": true }))
            }),
        )
        .unwrap();
    registry
        .stream(
            "count",
            stream_handler(|ctx| async move {
                let n: u32 = ctx.args.first().and_then(|a| a.parse().ok()).unwrap_or(3);
                for i in 0..n {
                    ctx.sink.data(ctx.stream_id, format!("line {i}").into_bytes()).await;
                }
                ctx.sink
                    .result_ok(ctx.stream_id, &serde_json::json!({ "emitted": n }))
                    .await;
                ctx.sink.close(ctx.stream_id).await;
                Ok(())
            }),
        )
        .unwrap();
    registry
        .stream(
            "forever",
            stream_handler(|ctx| async move {
                let mut i = 0u64;
                loop {
                    tokio::select! {
                        () = ctx.cancel.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_millis(5)) => {
                            ctx.sink.data(ctx.stream_id, format!("tick {i}").into_bytes()).await;
                            i += 1;
                        }
                    }
                }
                ctx.sink.close(ctx.stream_id).await;
                Ok(())
            }),
        )
        .unwrap();
    registry
}

struct TestBridge {
    state: Arc<BridgeState>,
    socket_path: String,
    _dir: tempfile::TempDir,
}

async fn start_bridge() -> TestBridge {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir
        .path()
        .join("s1.sock")
        .to_string_lossy()
        .into_owned();
    let session = SessionInfo {
        session_id: "s1".to_string(),
        username: "alice".to_string(),
        uid: 1000,
        gid: 1000,
        secret: SECRET.to_string(),
        socket_path: socket_path.clone(),
        server_base_url: "https://127.0.0.1:8443".to_string(),
        mode: Mode::Unprivileged,
    };
    let state = BridgeState::with_registry(session, test_registry());
    tokio::spawn(server::run(state.clone()));

    // Wait for the listener to come up.
    for _ in 0..100 {
        if UnixStream::connect(&socket_path).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    TestBridge {
        state,
        socket_path,
        _dir: dir,
    }
}

type Client = Framed<UnixStream, FrameCodec>;

async fn connect(bridge: &TestBridge) -> Client {
    let stream = UnixStream::connect(&bridge.socket_path).await.unwrap();
    Framed::new(stream, FrameCodec)
}

fn request(namespace: &str, command: &str, args: &[&str], id: u64) -> Frame {
    Frame::Request(Request {
        namespace: namespace.to_string(),
        command: command.to_string(),
        args: args.iter().map(ToString::to_string).collect(),
        id,
    })
}

async fn authed_client(bridge: &TestBridge) -> Client {
    let mut client = connect(bridge).await;
    client.send(request("auth", "auth", &[SECRET], 0)).await.unwrap();
    match client.next().await.unwrap().unwrap() {
        Frame::Response(resp) => assert!(resp.ok, "auth frame rejected"),
        other => panic!("unexpected auth reply: {other:?}"),
    }
    client
}

async fn next_response(client: &mut Client) -> linuxio_common::wire::Response {
    loop {
        match client.next().await.expect("connection closed").unwrap() {
            Frame::Response(resp) => return resp,
            Frame::Stream(_) => continue,
            Frame::Request(_) => panic!("server sent a request"),
        }
    }
}

#[tokio::test]
async fn echo_round_trip_after_auth() {
    let bridge = start_bridge().await;
    let mut client = authed_client(&bridge).await;

    client
        .send(request("test", "Echo", &["a", "b"], 7))
        .await
        .unwrap();
    let resp = next_response(&mut client).await;
    assert_eq!(resp.id, 7);
    assert!(resp.ok);
    assert_eq!(resp.payload.unwrap()["echo"], serde_json::json!(["a", "b"]));
}

#[tokio::test]
async fn wrong_secret_closes_without_response() {
    let bridge = start_bridge().await;
    let mut client = connect(&bridge).await;

    client
        .send(request("auth", "auth", &["not-the-secret"], 0))
        .await
        .unwrap();
    assert!(client.next().await.is_none(), "expected silent close");
}

#[tokio::test]
async fn non_auth_first_frame_closes_without_response() {
    let bridge = start_bridge().await;
    let mut client = connect(&bridge).await;

    client.send(request("test", "Echo", &[], 1)).await.unwrap();
    assert!(client.next().await.is_none());
}

#[tokio::test]
async fn unknown_command_maps_to_404() {
    let bridge = start_bridge().await;
    let mut client = authed_client(&bridge).await;

    client.send(request("test", "Missing", &[], 3)).await.unwrap();
    let resp = next_response(&mut client).await;
    assert!(!resp.ok);
    assert_eq!(resp.error.unwrap().code, 404);
}

#[tokio::test]
async fn missing_arguments_map_to_400() {
    let bridge = start_bridge().await;
    let mut client = authed_client(&bridge).await;

    client
        .send(request("test", "NeedsTwo", &["only-one"], 4))
        .await
        .unwrap();
    let resp = next_response(&mut client).await;
    assert!(!resp.ok);
    assert_eq!(resp.error.unwrap().code, 400);
}

#[tokio::test]
async fn responses_correlate_by_id_not_order() {
    let bridge = start_bridge().await;
    let mut client = authed_client(&bridge).await;

    client
        .send(request("test", "Sleepy", &["80"], 10))
        .await
        .unwrap();
    client.send(request("test", "Echo", &["x"], 11)).await.unwrap();

    let first = next_response(&mut client).await;
    let second = next_response(&mut client).await;
    // The fast echo overtakes the sleeper.
    assert_eq!(first.id, 11);
    assert_eq!(second.id, 10);
}

#[tokio::test]
async fn stream_emits_data_result_and_close() {
    let bridge = start_bridge().await;
    let mut client = authed_client(&bridge).await;

    client.send(request("stream", "count", &["3"], 20)).await.unwrap();
    let open = next_response(&mut client).await;
    assert!(open.ok);
    let stream_id = open.payload.unwrap()["stream_id"].as_u64().unwrap() as u32;

    let mut data = Vec::new();
    let mut saw_result = false;
    loop {
        match client.next().await.unwrap().unwrap() {
            Frame::Stream(frame) => {
                assert_eq!(frame.stream_id, stream_id);
                match frame.opcode {
                    StreamOpcode::Data => data.push(frame.payload),
                    StreamOpcode::ResultOk => saw_result = true,
                    StreamOpcode::StreamClose => break,
                    other => panic!("unexpected opcode {other:?}"),
                }
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(data.len(), 3);
    assert!(saw_result);
}

#[tokio::test]
async fn unknown_stream_type_maps_to_404() {
    let bridge = start_bridge().await;
    let mut client = authed_client(&bridge).await;

    client.send(request("stream", "nope", &[], 21)).await.unwrap();
    let resp = next_response(&mut client).await;
    assert!(!resp.ok);
    assert_eq!(resp.error.unwrap().code, 404);
}

#[tokio::test]
async fn stream_close_cancels_the_handler() {
    let bridge = start_bridge().await;
    let mut client = authed_client(&bridge).await;

    client
        .send(request("stream", "forever", &[], 30))
        .await
        .unwrap();
    let open = next_response(&mut client).await;
    let stream_id = open.payload.unwrap()["stream_id"].as_u64().unwrap() as u32;

    // Let a few ticks arrive, then close.
    let mut ticks = 0;
    while ticks < 2 {
        if let Frame::Stream(frame) = client.next().await.unwrap().unwrap() {
            if frame.opcode == StreamOpcode::Data {
                ticks += 1;
            }
        }
    }
    client
        .send(Frame::Stream(linuxio_common::wire::StreamFrame::close(
            stream_id,
        )))
        .await
        .unwrap();

    // The handler acknowledges cancellation with its own close within the
    // contract window.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        let frame = tokio::time::timeout_at(deadline, client.next())
            .await
            .expect("no close within 500ms")
            .unwrap()
            .unwrap();
        if let Frame::Stream(frame) = frame {
            if frame.opcode == StreamOpcode::StreamClose && frame.stream_id == stream_id {
                break;
            }
        }
    }

    // A duplicate close for the same id is tolerated.
    client
        .send(Frame::Stream(linuxio_common::wire::StreamFrame::close(
            stream_id,
        )))
        .await
        .unwrap();
    client.send(request("test", "Echo", &["still-alive"], 31)).await.unwrap();
    let resp = next_response(&mut client).await;
    assert!(resp.ok);
}

#[tokio::test]
async fn shutdown_unlinks_the_socket() {
    let bridge = start_bridge().await;
    let _client = authed_client(&bridge).await;

    bridge.state.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!std::path::Path::new(&bridge.socket_path).exists());
}
