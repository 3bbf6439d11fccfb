//! Bootstrap pipe, fork, privilege drop, and exec of the bridge.
//!
//! Ownership of the pipe ends is explicit: the child dups the read end onto
//! stdin, the parent writes the bootstrap JSON to the write end and closes
//! it, signalling EOF. The blob never touches the filesystem.

use std::ffi::CString;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

use linuxio_common::{Bootstrap, Error};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pipe};

use crate::exit;

/// Default/s and bounds for `LINUXIO_BRIDGE_START_TIMEOUT_MS`.
pub const START_TIMEOUT_DEFAULT_MS: u64 = 5000;
pub const START_TIMEOUT_MIN_MS: u64 = 1000;
pub const START_TIMEOUT_MAX_MS: u64 = 30_000;

/// Defaults and bounds for `LINUXIO_RLIMIT_NPROC`.
pub const NPROC_DEFAULT: u64 = 1024;
pub const NPROC_MIN: u64 = 10;
pub const NPROC_MAX: u64 = 4096;

const RLIMIT_CPU_SECS: u64 = 600;
const RLIMIT_NOFILE: u64 = 2048;
const RLIMIT_AS_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// Fd the bridge binary is pinned to in the child before `close_range`.
const BRIDGE_FD: i32 = 3;

/// Clamp a raw env value into the start-timeout bounds.
#[must_use]
pub fn start_timeout(raw: Option<&str>) -> Duration {
    let ms = raw
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(START_TIMEOUT_DEFAULT_MS)
        .clamp(START_TIMEOUT_MIN_MS, START_TIMEOUT_MAX_MS);
    Duration::from_millis(ms)
}

/// Clamp a raw env value into the NPROC bounds.
#[must_use]
pub fn nproc_limit(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(NPROC_DEFAULT)
        .clamp(NPROC_MIN, NPROC_MAX)
}

/// Everything the child needs, prepared before `fork` so nothing between
/// `fork` and `exec` allocates.
pub struct SpawnPlan {
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
    pub uid: u32,
    pub gid: u32,
    pub username: CString,
    pub privileged: bool,
    pub development: bool,
    pub nproc: u64,
}

impl SpawnPlan {
    pub fn new(
        username: &str,
        uid: u32,
        gid: u32,
        privileged: bool,
        development: bool,
        envp: Vec<CString>,
    ) -> Result<Self, Error> {
        Ok(SpawnPlan {
            argv: vec![
                CString::new("linuxio-bridge")
                    .map_err(|_| Error::Fatal("argv contains NUL".to_string()))?,
            ],
            envp,
            uid,
            gid,
            username: CString::new(username)
                .map_err(|_| Error::Fatal("username contains NUL".to_string()))?,
            privileged,
            development,
            nproc: nproc_limit(std::env::var("LINUXIO_RLIMIT_NPROC").ok().as_deref()),
        })
    }
}

pub struct SpawnedBridge {
    pub pid: Pid,
}

/// Fork and exec the validated bridge fd, then deliver the bootstrap over
/// the pipe and wait for the socket to become connectable.
pub fn spawn_bridge(
    bridge_fd: OwnedFd,
    plan: &SpawnPlan,
    bootstrap: &Bootstrap,
) -> Result<SpawnedBridge, Error> {
    let blob = serde_json::to_vec(bootstrap)
        .map_err(|e| Error::Fatal(format!("encoding bootstrap: {e}")))?;
    let (read_end, write_end) =
        pipe().map_err(|e| Error::Fatal(format!("creating bootstrap pipe: {e}")))?;

    // Null-terminated pointer tables built before fork; the child only
    // dereferences memory that already exists.
    let argv: Vec<*const libc::c_char> = plan
        .argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp: Vec<*const libc::c_char> = plan
        .envp
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(write_end);
            // Never returns.
            child_exec(read_end, bridge_fd, plan, &argv, &envp);
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => return Err(Error::Fatal(format!("fork: {e}"))),
    };
    drop(read_end);
    drop(bridge_fd);

    // Parent: hand over the blob and close our end so the child sees EOF.
    let mut write_file = std::fs::File::from(write_end);
    if let Err(e) = write_file.write_all(&blob) {
        let _ = kill(child, Signal::SIGTERM);
        let _ = waitpid(child, None);
        return Err(Error::Fatal(format!("writing bootstrap: {e}")));
    }
    drop(write_file);

    let timeout = start_timeout(
        std::env::var("LINUXIO_BRIDGE_START_TIMEOUT_MS").ok().as_deref(),
    );
    wait_for_socket(&bootstrap.socket_path, timeout, child)?;
    Ok(SpawnedBridge { pid: child })
}

/// Block until the bridge exits and map its status to our exit code.
#[must_use]
pub fn wait_and_propagate(pid: Pid) -> i32 {
    match waitpid(pid, None) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
        _ => 1,
    }
}

fn wait_for_socket(socket_path: &str, timeout: Duration, child: Pid) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
            return Ok(());
        }
        // A child that died during startup will never bind the socket.
        if let Ok(WaitStatus::Exited(_, code)) = waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            return Err(Error::Fatal(format!(
                "bridge exited with status {code} before binding its socket"
            )));
        }
        if Instant::now() >= deadline {
            let _ = kill(child, Signal::SIGTERM);
            let _ = waitpid(child, None);
            return Err(Error::Timeout(format!(
                "bridge socket {socket_path} not connectable after {}ms",
                timeout.as_millis()
            )));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Post-fork child setup; every input was prepared pre-fork. Exits 127 on
/// any failure.
fn child_exec(
    pipe_read: OwnedFd,
    bridge_fd: OwnedFd,
    plan: &SpawnPlan,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> ! {
    unsafe {
        // Bootstrap pipe becomes stdin.
        if libc::dup2(pipe_read.as_raw_fd(), 0) < 0 {
            libc::_exit(exit::EXEC_FAILED);
        }

        set_rlimit(libc::RLIMIT_CPU, RLIMIT_CPU_SECS);
        set_rlimit(libc::RLIMIT_NOFILE, RLIMIT_NOFILE);
        set_rlimit(libc::RLIMIT_NPROC, plan.nproc);
        set_rlimit(libc::RLIMIT_AS, RLIMIT_AS_BYTES);

        if !plan.development {
            libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0);
        }

        if !plan.privileged {
            if libc::setgroups(0, std::ptr::null()) != 0 {
                libc::_exit(exit::EXEC_FAILED);
            }
            if libc::initgroups(plan.username.as_ptr(), plan.gid) != 0 {
                libc::_exit(exit::EXEC_FAILED);
            }
            if libc::setgid(plan.gid) != 0 {
                libc::_exit(exit::EXEC_FAILED);
            }
            if libc::setuid(plan.uid) != 0 {
                libc::_exit(exit::EXEC_FAILED);
            }
            // The drop must be irreversible.
            if libc::setuid(0) == 0 {
                libc::_exit(exit::EXEC_FAILED);
            }
        }

        // Pin the bridge fd below the close range, then drop everything
        // else above stderr.
        if libc::dup2(bridge_fd.as_raw_fd(), BRIDGE_FD) < 0 {
            libc::_exit(exit::EXEC_FAILED);
        }
        close_fds_from(BRIDGE_FD + 1);

        let empty = c"";
        libc::syscall(
            libc::SYS_execveat,
            BRIDGE_FD,
            empty.as_ptr(),
            argv.as_ptr(),
            envp.as_ptr(),
            libc::AT_EMPTY_PATH,
        );
        // Older kernels: fall back to fexecve semantics via /proc.
        libc::fexecve(BRIDGE_FD, argv.as_ptr(), envp.as_ptr());
        libc::_exit(exit::EXEC_FAILED);
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    unsafe {
        libc::setrlimit(resource, &limit);
    }
}

/// `close_range(2)` with a manual sweep fallback for kernels before 5.9.
fn close_fds_from(first: i32) {
    unsafe {
        if libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            libc::c_uint::MAX,
            0 as libc::c_uint,
        ) == 0
        {
            return;
        }
        let max = libc::sysconf(libc::_SC_OPEN_MAX);
        let max = if max > 0 { max as i32 } else { 1024 };
        for fd in first..max {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_timeout_clamps_into_bounds() {
        assert_eq!(start_timeout(None), Duration::from_millis(5000));
        assert_eq!(start_timeout(Some("250")), Duration::from_millis(1000));
        assert_eq!(start_timeout(Some("60000")), Duration::from_millis(30000));
        assert_eq!(start_timeout(Some("8000")), Duration::from_millis(8000));
        assert_eq!(start_timeout(Some("junk")), Duration::from_millis(5000));
    }

    #[test]
    fn nproc_clamps_into_bounds() {
        assert_eq!(nproc_limit(None), 1024);
        assert_eq!(nproc_limit(Some("1")), 10);
        assert_eq!(nproc_limit(Some("999999")), 4096);
        assert_eq!(nproc_limit(Some("2048")), 2048);
    }
}
