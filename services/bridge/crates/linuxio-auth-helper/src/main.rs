//! Auth helper entry point.
//!
//! Invoked by socket activation with the accepted auth socket on
//! stdin/stdout. Reads one request, runs the authentication pipeline, and
//! either spawns a per-session bridge (answering `{"status":"ok",...}`) or
//! answers a single-line error. Stdout belongs to the protocol; all logging
//! goes to stderr.

use std::io::Write;

use linuxio_common::authproto::{AuthRequest, AuthResponse};
use linuxio_common::session::{BRIDGE_SOCKET_GROUP, validate_socket_path};
use linuxio_common::{Bootstrap, Error, Mode};
use tracing_subscriber::EnvFilter;

use linuxio_auth_helper::{
    bridgecheck, envscrub, exit, pamauth, request, rundir, spawn, sudo,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // The accepted socket is stdin/stdout; a terminal there means someone
    // ran this by hand.
    let on_tty = unsafe { libc::isatty(0) == 1 || libc::isatty(1) == 1 };
    if on_tty {
        eprintln!("linuxio-auth-helper: refusing to run on a TTY");
        std::process::exit(exit::TTY);
    }
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("linuxio-auth-helper: must run with effective UID 0");
        std::process::exit(exit::NOT_ROOT);
    }

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            respond(&AuthResponse::error(err.to_string()));
            std::process::exit(1);
        }
    }
}

fn respond(response: &AuthResponse) {
    if let Ok(line) = serde_json::to_string(response) {
        let mut stdout = std::io::stdout();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

fn run() -> Result<i32, Error> {
    // The bridge socket group is load-bearing for every later step; bail
    // before touching PAM if the packaging is broken.
    let bridge_group = nix::unistd::Group::from_name(BRIDGE_SOCKET_GROUP)
        .map_err(|e| Error::Fatal(format!("looking up group {BRIDGE_SOCKET_GROUP}: {e}")))?
        .ok_or_else(|| {
            Error::Fatal(format!("required group {BRIDGE_SOCKET_GROUP} does not exist"))
        })?;

    let req = request::read_request(&mut std::io::stdin().lock())?;
    tracing::info!(user = %req.user, session = %req.session_id, "auth request received");

    // PAM first: nothing else happens for an unauthenticated caller.
    let mut pam = pamauth::authenticate(&req.user, req.password.clone())?;
    let motd = pam.motd.clone();

    let user = nix::unistd::User::from_name(&req.user)
        .map_err(|e| Error::Fatal(format!("getpwnam {}: {e}", req.user)))?
        .ok_or_else(|| Error::Unauthorized(format!("unknown user {}", req.user)))?;
    let uid = user.uid.as_raw();
    let gid = user.gid.as_raw();

    validate_socket_path(&req.socket_path, uid)?;

    // One live bridge per session id: a connectable socket means a second
    // spawn must be refused, a dead leftover is cleaned up.
    if std::path::Path::new(&req.socket_path).exists() {
        if std::os::unix::net::UnixStream::connect(&req.socket_path).is_ok() {
            return Err(Error::Conflict(format!(
                "session {} already has a live bridge",
                req.session_id
            )));
        }
        let _ = std::fs::remove_file(&req.socket_path);
    }

    let _user_dir = rundir::prepare(uid, bridge_group.gid.as_raw())?;

    let has_sudo = sudo::probe(uid, gid, req.password.as_deref().unwrap_or(""))?;
    let mode = if has_sudo {
        Mode::Privileged
    } else {
        Mode::Unprivileged
    };

    // Establish credentials and open the PAM session; it stays open for
    // the bridge's lifetime and tears down when dropped below.
    let pam_session = pam
        .context
        .open_session(pam_client::Flag::NONE)
        .map_err(|e| Error::Unauthorized(format!("PAM session: {e}")))?;

    let bridge_path = req
        .bridge_path
        .as_deref()
        .unwrap_or(bridgecheck::DEFAULT_BRIDGE_PATH);
    let bridge_fd = bridgecheck::validate(bridge_path)?;

    let secret = req
        .secret
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidArgs("secret is required".to_string()))?;

    let bootstrap = build_bootstrap(&req, &user, secret);
    let identity = envscrub::BridgeIdentity {
        username: &req.user,
        home: user.dir.to_str().unwrap_or("/"),
        uid,
        session_id: &req.session_id,
        socket_path: &req.socket_path,
        privileged: has_sudo,
        env: req.env,
        verbose: req.verbose(),
    };
    let envp = envscrub::to_cstrings(&envscrub::build_env(&identity, |key| {
        std::env::var(key).ok()
    }))?;
    let plan = spawn::SpawnPlan::new(
        &req.user,
        uid,
        gid,
        has_sudo,
        req.env == linuxio_common::Env::Development,
        envp,
    )?;

    let spawned = spawn::spawn_bridge(bridge_fd, &plan, &bootstrap)?;
    tracing::info!(
        pid = spawned.pid.as_raw(),
        mode = %mode,
        socket = %req.socket_path,
        "bridge spawned"
    );

    respond(&AuthResponse::Ok {
        mode,
        socket_path: req.socket_path.clone(),
        motd,
    });

    // Propagate the bridge's exit status, then run the PAM teardown:
    // dropping the session closes it and deletes credentials, dropping the
    // context ends the transaction.
    let code = spawn::wait_and_propagate(spawned.pid);
    drop(pam_session);
    drop(pam);
    Ok(code)
}

fn build_bootstrap(req: &AuthRequest, user: &nix::unistd::User, secret: String) -> Bootstrap {
    Bootstrap {
        session_id: req.session_id.clone(),
        username: req.user.clone(),
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        secret,
        server_base_url: req
            .server_base_url
            .clone()
            .unwrap_or_else(|| "https://127.0.0.1:8443".to_string()),
        server_cert: req.server_cert.clone(),
        socket_path: req.socket_path.clone(),
        verbose: req.verbose(),
        log_fd: None,
    }
}
