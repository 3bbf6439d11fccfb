//! Registry behavior against fake auth-helper and bridge endpoints.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use linuxio_common::Mode;
use linuxio_common::authproto::{AuthRequest, Env};
use linuxio_common::wire::{Frame, FrameCodec, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio_util::codec::Framed;

use linuxio_session::{BridgeClient, SessionRegistry};

const SECRET: &str = "registry-secret";

fn login_request(session_id: &str, socket_path: &str) -> AuthRequest {
    AuthRequest {
        user: "alice".to_string(),
        password: Some("pw".to_string()),
        session_id: session_id.to_string(),
        socket_path: socket_path.to_string(),
        bridge_path: None,
        env: Env::Production,
        verbose: None,
        secret: Some(SECRET.to_string()),
        server_base_url: Some("https://127.0.0.1:8443".to_string()),
        server_cert: None,
    }
}

/// Fake auth helper: accepts one connection, reads the request line, and
/// answers with a canned ok response pointing at `bridge_socket`.
fn spawn_fake_auth(listener: UnixListener, bridge_socket: String) {
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let bridge_socket = bridge_socket.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut line = String::new();
                BufReader::new(read_half).read_line(&mut line).await.unwrap();
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                assert_eq!(req["user"], "alice");
                let response = serde_json::json!({
                    "status": "ok",
                    "mode": "privileged",
                    "socket_path": bridge_socket,
                });
                write_half
                    .write_all(format!("{response}\n").as_bytes())
                    .await
                    .unwrap();
            });
        }
    });
}

/// Fake bridge: speaks the framed protocol, accepts the auth frame, and
/// echoes a canned payload for every request.
fn spawn_fake_bridge(listener: UnixListener) {
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, FrameCodec);
                let auth = match framed.next().await {
                    Some(Ok(Frame::Request(req))) => req,
                    _ => return,
                };
                if auth.args.first().map(String::as_str) != Some(SECRET) {
                    return; // close silently
                }
                framed
                    .send(Frame::Response(Response::success(
                        auth.id,
                        serde_json::json!({"authenticated": true}),
                    )))
                    .await
                    .unwrap();
                while let Some(Ok(Frame::Request(req))) = framed.next().await {
                    framed
                        .send(Frame::Response(Response::success(
                            req.id,
                            serde_json::json!({"command": req.command}),
                        )))
                        .await
                        .unwrap();
                }
            });
        }
    });
}

struct Fixture {
    registry: SessionRegistry,
    bridge_socket: String,
    _dir: tempfile::TempDir,
}

async fn fixture(idle_ttl: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let auth_socket = dir.path().join("auth.sock");
    let bridge_socket = dir
        .path()
        .join("1000")
        .join("s1.sock")
        .to_string_lossy()
        .into_owned();
    std::fs::create_dir_all(dir.path().join("1000")).unwrap();

    let auth_listener = UnixListener::bind(&auth_socket).unwrap();
    // The fake auth helper reports the bridge socket it "spawned".
    spawn_fake_auth(auth_listener, bridge_socket.clone());
    let bridge_listener = UnixListener::bind(&bridge_socket).unwrap();
    spawn_fake_bridge(bridge_listener);

    Fixture {
        registry: SessionRegistry::new(&auth_socket, idle_ttl),
        bridge_socket,
        _dir: dir,
    }
}

#[tokio::test]
async fn login_binds_and_calls_route_to_the_bridge() {
    let fx = fixture(Duration::from_secs(3600)).await;
    // The canned socket path is not under /run/linuxio, so the uid parse
    // reads the parent directory name — the fixture uses "1000".
    let outcome = fx
        .registry
        .login(&login_request("s1", "/run/linuxio/1000/s1.sock"))
        .await
        .unwrap();
    assert_eq!(outcome.mode, Mode::Privileged);
    assert_eq!(fx.registry.session_count().await, 1);

    let payload = fx
        .registry
        .call("s1", "dbus", "ListServices", &[])
        .await
        .unwrap();
    assert_eq!(payload["command"], "ListServices");
}

#[tokio::test]
async fn login_requires_a_secret() {
    let fx = fixture(Duration::from_secs(3600)).await;
    let mut request = login_request("s1", "/run/linuxio/1000/s1.sock");
    request.secret = None;
    let err = fx.registry.login(&request).await.unwrap_err();
    assert_eq!(err.code(), 400);
}

#[tokio::test]
async fn duplicate_login_with_live_bridge_is_rejected() {
    let fx = fixture(Duration::from_secs(3600)).await;
    let request = login_request("s1", "/run/linuxio/1000/s1.sock");
    fx.registry.login(&request).await.unwrap();

    let err = fx.registry.login(&request).await.unwrap_err();
    assert_eq!(err.code(), 409);
    assert_eq!(fx.registry.session_count().await, 1);
}

#[tokio::test]
async fn call_on_dead_bridge_evicts_the_binding() {
    let fx = fixture(Duration::from_secs(3600)).await;
    fx.registry
        .login(&login_request("s1", "/run/linuxio/1000/s1.sock"))
        .await
        .unwrap();

    // Kill the bridge socket out from under the registry.
    std::fs::remove_file(&fx.bridge_socket).unwrap();

    let err = fx
        .registry
        .call("s1", "dbus", "ListServices", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), 401);
    assert_eq!(fx.registry.session_count().await, 0);
}

#[tokio::test]
async fn unknown_session_is_unauthorized() {
    let fx = fixture(Duration::from_secs(3600)).await;
    let err = fx
        .registry
        .call("ghost", "dbus", "ListServices", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), 401);
}

#[tokio::test]
async fn idle_bindings_with_dead_bridges_are_evicted() {
    let fx = fixture(Duration::from_millis(10)).await;
    fx.registry
        .login(&login_request("s1", "/run/linuxio/1000/s1.sock"))
        .await
        .unwrap();

    std::fs::remove_file(&fx.bridge_socket).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(fx.registry.evict_idle().await, 1);
    assert_eq!(fx.registry.session_count().await, 0);
}

#[tokio::test]
async fn idle_bindings_with_live_bridges_survive_the_probe() {
    let fx = fixture(Duration::from_millis(10)).await;
    fx.registry
        .login(&login_request("s1", "/run/linuxio/1000/s1.sock"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(fx.registry.evict_idle().await, 0);
    assert_eq!(fx.registry.session_count().await, 1);
}

#[tokio::test]
async fn direct_client_rejects_a_wrong_secret() {
    let fx = fixture(Duration::from_secs(3600)).await;
    let err = BridgeClient::connect(&fx.bridge_socket, "wrong")
        .await
        .unwrap_err();
    assert_eq!(err.code(), 401);
}
