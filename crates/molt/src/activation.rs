//! The socket-activation environment.
//!
//! Inherited file descriptors are advertised from parent to child with the
//! `LISTEN_FDS` / `LISTEN_PID` convention: descriptors 3..3+N are live
//! sockets, `LISTEN_PID` names the intended recipient (0 means "whoever
//! receives them"). The same variables are written when spawning a
//! successor process.

use std::env;
use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// Number of inherited file descriptors.
pub(crate) const ENV_LISTEN_FDS: &str = "LISTEN_FDS";
/// Intended recipient pid, or 0 for "any".
pub(crate) const ENV_LISTEN_PID: &str = "LISTEN_PID";

/// The first passed file descriptor. 0..2 are stdio.
pub(crate) const LISTEN_FDS_START: RawFd = 3;

/// Returns the inherited file descriptors advertised by the environment.
///
/// Empty when no activation is present, or when `LISTEN_PID` names a
/// different process (the descriptors are not for us; that is not an
/// error). Malformed values fail with [`Error::BadEnvironment`].
pub(crate) fn listen_fds() -> Result<Vec<RawFd>> {
    let count = listen_fds_count()?;
    Ok((0..count).map(|i| LISTEN_FDS_START + i as RawFd).collect())
}

fn listen_fds_count() -> Result<usize> {
    let pid_str = match env::var(ENV_LISTEN_PID) {
        Ok(v) if !v.is_empty() => v,
        // No activation at all.
        _ => return Ok(0),
    };
    let pid: u32 = pid_str.parse().map_err(|_| Error::BadEnvironment {
        var: ENV_LISTEN_PID,
        reason: format!("not a pid: {pid_str:?}"),
    })?;
    // Addressed to some other process: report no inheritance. This happens
    // legitimately when a service manager restarts a sibling.
    if pid != 0 && pid != std::process::id() {
        return Ok(0);
    }
    let count_str = env::var(ENV_LISTEN_FDS).map_err(|_| Error::BadEnvironment {
        var: ENV_LISTEN_FDS,
        reason: format!("missing while {ENV_LISTEN_PID} is set"),
    })?;
    let count: usize = count_str.parse().map_err(|_| Error::BadEnvironment {
        var: ENV_LISTEN_FDS,
        reason: format!("not a count: {count_str:?}"),
    })?;
    Ok(count)
}

/// Removes the activation variables so unrelated child spawns do not
/// re-inherit them. Called once adoption has succeeded.
pub(crate) fn clear_env() {
    env::remove_var(ENV_LISTEN_PID);
    env::remove_var(ENV_LISTEN_FDS);
}

/// The variables to overlay on the current environment when spawning a
/// successor that should adopt `count` descriptors.
pub(crate) fn child_env(count: usize) -> [(&'static str, String); 2] {
    [
        (ENV_LISTEN_FDS, count.to_string()),
        (ENV_LISTEN_PID, "0".to_string()),
    ]
}

/// Environment variables are process-wide; every test that reads or writes
/// the activation variables serializes on this lock.
#[cfg(test)]
pub(crate) static TEST_ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
