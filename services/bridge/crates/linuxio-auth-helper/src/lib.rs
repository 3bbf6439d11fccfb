pub mod bridgecheck;
pub mod conv;
pub mod envscrub;
pub mod pamauth;
pub mod request;
pub mod rundir;
pub mod spawn;
pub mod sudo;

/// Exit codes fixed by the auth-socket contract.
pub mod exit {
    /// Invoked from a TTY instead of the socket activation path.
    pub const TTY: i32 = 2;
    /// Effective UID is not root.
    pub const NOT_ROOT: i32 = 126;
    /// The bridge binary could not be executed.
    pub const EXEC_FAILED: i32 = 127;
}
