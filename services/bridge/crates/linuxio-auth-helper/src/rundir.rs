//! Runtime directory preparation under `/run/linuxio`.
//!
//! Everything is done through directory fds (the `openat` family) so a
//! concurrently-renamed path cannot redirect the ownership and mode fixes.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use linuxio_common::session::{BASE_DIR_MODE, RUNTIME_BASE, USER_DIR_MODE};
use linuxio_common::Error;

const DIR_FLAGS: libc::c_int = libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC;

fn cstr(value: &str) -> Result<CString, Error> {
    CString::new(value).map_err(|_| Error::Fatal(format!("path {value:?} contains NUL")))
}

fn last_errno() -> std::io::Error {
    std::io::Error::last_os_error()
}

fn open_dir(path: &str) -> Result<Option<OwnedFd>, Error> {
    let c_path = cstr(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), DIR_FLAGS) };
    if fd >= 0 {
        return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }));
    }
    let err = last_errno();
    if err.raw_os_error() == Some(libc::ENOENT) {
        Ok(None)
    } else {
        Err(Error::Fatal(format!("opening {path}: {err}")))
    }
}

fn open_dir_at(dir: &OwnedFd, name: &str) -> Result<OwnedFd, Error> {
    let c_name = cstr(name)?;
    let fd = unsafe { libc::openat(dir.as_raw_fd(), c_name.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(Error::Fatal(format!(
            "opening {RUNTIME_BASE}/{name}: {}",
            last_errno()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn fstat_fd(fd: RawFd, what: &str) -> Result<libc::stat, Error> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return Err(Error::Fatal(format!("fstat {what}: {}", last_errno())));
    }
    Ok(unsafe { stat.assume_init() })
}

fn enforce(fd: &OwnedFd, what: &str, uid: u32, gid: u32, mode: u32) -> Result<(), Error> {
    if unsafe { libc::fchown(fd.as_raw_fd(), uid, gid) } != 0 {
        return Err(Error::Fatal(format!("chown {what}: {}", last_errno())));
    }
    if unsafe { libc::fchmod(fd.as_raw_fd(), mode) } != 0 {
        return Err(Error::Fatal(format!("chmod {what}: {}", last_errno())));
    }
    Ok(())
}

/// Prepare `/run/linuxio` and `/run/linuxio/<uid>`, enforcing the ownership
/// and mode invariants. Returns the per-user directory fd so the caller can
/// keep it pinned across the spawn.
pub fn prepare(uid: u32, bridge_gid: u32) -> Result<OwnedFd, Error> {
    let base = match open_dir(RUNTIME_BASE)? {
        Some(fd) => fd,
        None => {
            let c_base = cstr(RUNTIME_BASE)?;
            if unsafe { libc::mkdir(c_base.as_ptr(), BASE_DIR_MODE) } != 0 {
                let err = last_errno();
                if err.raw_os_error() != Some(libc::EEXIST) {
                    return Err(Error::Fatal(format!("creating {RUNTIME_BASE}: {err}")));
                }
            }
            open_dir(RUNTIME_BASE)?
                .ok_or_else(|| Error::Fatal(format!("{RUNTIME_BASE} vanished after mkdir")))?
        }
    };

    let base_stat = fstat_fd(base.as_raw_fd(), RUNTIME_BASE)?;
    if base_stat.st_uid != 0 {
        return Err(Error::Fatal(format!("{RUNTIME_BASE} is not owned by root")));
    }
    if base_stat.st_mode & 0o022 != 0 {
        return Err(Error::Fatal(format!(
            "{RUNTIME_BASE} is group or world writable"
        )));
    }
    enforce(&base, RUNTIME_BASE, 0, bridge_gid, BASE_DIR_MODE)?;

    let name = uid.to_string();
    let c_name = cstr(&name)?;
    if unsafe { libc::mkdirat(base.as_raw_fd(), c_name.as_ptr(), USER_DIR_MODE) } != 0 {
        let err = last_errno();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(Error::Fatal(format!(
                "creating {RUNTIME_BASE}/{name}: {err}"
            )));
        }
    }
    let user_dir = open_dir_at(&base, &name)?;
    let user_stat = fstat_fd(user_dir.as_raw_fd(), &name)?;
    if user_stat.st_mode & libc::S_IFMT != libc::S_IFDIR {
        return Err(Error::Fatal(format!(
            "{RUNTIME_BASE}/{name} is not a directory"
        )));
    }
    enforce(&user_dir, &name, uid, bridge_gid, USER_DIR_MODE)?;

    Ok(user_dir)
}
