//! TOCTOU-safe validation of the bridge binary.
//!
//! The binary is opened with `O_PATH | O_NOFOLLOW` and every check runs
//! against that fd; the same fd is later handed to `execveat`, so the file
//! that was validated is the file that runs, whatever happens to the path
//! in between.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use linuxio_common::Error;

pub const DEFAULT_BRIDGE_PATH: &str = "/usr/local/bin/linuxio-bridge";

/// The stat fields the policy reads, independent of the raw struct layout.
#[derive(Debug, Clone, Copy)]
pub struct StatFacts {
    pub mode: u32,
    pub uid: u32,
}

impl From<&libc::stat> for StatFacts {
    fn from(stat: &libc::stat) -> Self {
        StatFacts {
            mode: stat.st_mode,
            uid: stat.st_uid,
        }
    }
}

/// Pure file-mode policy for the bridge binary, factored out of the fd
/// plumbing so it is testable with synthetic stat values.
pub fn check_binary_stat(stat: StatFacts) -> Result<(), Error> {
    if stat.mode & libc::S_IFMT != libc::S_IFREG {
        return Err(Error::Fatal("bridge is not a regular file".to_string()));
    }
    if stat.uid != 0 {
        return Err(Error::Fatal("bridge is not owned by root".to_string()));
    }
    if stat.mode & 0o022 != 0 {
        return Err(Error::Fatal(
            "bridge is group or world writable".to_string(),
        ));
    }
    if stat.mode & 0o111 == 0 {
        return Err(Error::Fatal("bridge is not executable".to_string()));
    }
    if stat.mode & (libc::S_ISUID | libc::S_ISGID) != 0 {
        return Err(Error::Fatal(
            "bridge must not carry setuid or setgid bits".to_string(),
        ));
    }
    Ok(())
}

/// Same policy for the directory containing the binary.
pub fn check_parent_stat(stat: StatFacts) -> Result<(), Error> {
    if stat.uid != 0 {
        return Err(Error::Fatal(
            "bridge directory is not owned by root".to_string(),
        ));
    }
    if stat.mode & 0o022 != 0 {
        return Err(Error::Fatal(
            "bridge directory is group or world writable".to_string(),
        ));
    }
    Ok(())
}

fn cstr(value: &str) -> Result<CString, Error> {
    CString::new(value).map_err(|_| Error::Fatal(format!("path {value:?} contains NUL")))
}

fn open_flags(path: &str, flags: libc::c_int) -> Result<OwnedFd, Error> {
    let c_path = cstr(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
    if fd < 0 {
        return Err(Error::Fatal(format!(
            "opening {path}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn fstat_facts(fd: &OwnedFd, what: &str) -> Result<StatFacts, Error> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) } != 0 {
        return Err(Error::Fatal(format!(
            "fstat {what}: {}",
            std::io::Error::last_os_error()
        )));
    }
    let stat = unsafe { stat.assume_init() };
    Ok(StatFacts::from(&stat))
}

/// Validate the bridge binary and return the held fd for `execveat`.
pub fn validate(bridge_path: &str) -> Result<OwnedFd, Error> {
    let fd = open_flags(
        bridge_path,
        libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
    )?;
    check_binary_stat(fstat_facts(&fd, bridge_path)?)?;

    // Resolve the directory that actually contains the opened file — not
    // whatever the caller-supplied path claims — and apply the same
    // ownership policy to it.
    let proc_link = format!("/proc/self/fd/{}", fd.as_raw_fd());
    let resolved: PathBuf = std::fs::read_link(&proc_link)
        .map_err(|e| Error::Fatal(format!("resolving bridge fd: {e}")))?;
    let parent = resolved
        .parent()
        .ok_or_else(|| Error::Fatal("bridge has no parent directory".to_string()))?;
    let parent_str = parent
        .to_str()
        .ok_or_else(|| Error::Fatal("bridge directory path is not UTF-8".to_string()))?;
    let parent_fd = open_flags(
        parent_str,
        libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
    )?;
    check_parent_stat(fstat_facts(&parent_fd, parent_str)?)?;

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(mode: u32, uid: u32) -> StatFacts {
        StatFacts { mode, uid }
    }

    #[test]
    fn a_root_owned_regular_executable_passes() {
        check_binary_stat(facts(libc::S_IFREG | 0o755, 0)).expect("valid binary");
    }

    #[test]
    fn setuid_bit_fails_validation() {
        assert!(check_binary_stat(facts(libc::S_IFREG | 0o4755, 0)).is_err());
    }

    #[test]
    fn setgid_bit_fails_validation() {
        assert!(check_binary_stat(facts(libc::S_IFREG | 0o2755, 0)).is_err());
    }

    #[test]
    fn group_writable_binary_fails() {
        assert!(check_binary_stat(facts(libc::S_IFREG | 0o775, 0)).is_err());
    }

    #[test]
    fn non_root_owner_fails() {
        assert!(check_binary_stat(facts(libc::S_IFREG | 0o755, 1000)).is_err());
    }

    #[test]
    fn non_regular_file_fails() {
        assert!(check_binary_stat(facts(libc::S_IFLNK | 0o755, 0)).is_err());
    }

    #[test]
    fn unexecutable_file_fails() {
        assert!(check_binary_stat(facts(libc::S_IFREG | 0o644, 0)).is_err());
    }

    #[test]
    fn world_writable_parent_fails() {
        assert!(check_parent_stat(facts(libc::S_IFDIR | 0o777, 0)).is_err());
        check_parent_stat(facts(libc::S_IFDIR | 0o755, 0)).expect("valid directory");
    }

    #[test]
    fn validate_rejects_a_missing_binary() {
        assert!(validate("/nonexistent/linuxio-bridge").is_err());
    }
}
