//! Start-up and shutdown sequencing: logging, real-time scheduling, memory
//! locking, signal installation, and daemonization.

use std::io::Write;

use log::{debug, warn};

use crate::error::Error;
use crate::options::Opt;

/// Configure `stderrlog`, layering `--debug`/`--verbose` into a single
/// verbosity level.
pub fn configure_logging(opt: &Opt) -> anyhow::Result<()> {
    let verbosity = if opt.debug {
        3 + opt.verbose as usize
    } else {
        opt.verbose as usize
    };
    stderrlog::new()
        .module(module_path!())
        .module("vmeirqd")
        .verbosity(verbosity)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;
    Ok(())
}

/// Attempt to set `SCHED_FIFO` at maximum priority and lock all memory.
/// Failure due to lack of privilege is logged and otherwise ignored; the
/// daemon falls back to running at default priority when not run as root.
pub fn set_realtime_priority() {
    let policy = libc::SCHED_FIFO;
    let max_priority = unsafe { libc::sched_get_priority_max(policy) };
    let sched_param = libc::sched_param {
        sched_priority: max_priority,
    };

    let rc = unsafe { libc::sched_setscheduler(0, policy, &sched_param) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!("permission denied setting real-time priority: must run as root");
            warn!("falling back to running at default priority");
        } else {
            warn!("failed to set real-time priority: {err}");
        }
        return;
    }

    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        warn!(
            "failed to lock memory: {}",
            std::io::Error::last_os_error()
        );
        return;
    }

    debug!("successfully set real-time priority and locked memory");
}

/// Detach from the controlling terminal unless `foreground` is set (keep the
/// working directory, but close standard descriptors since there will be no
/// terminal to receive them).
pub fn daemonize(foreground: bool) -> Result<(), Error> {
    if foreground {
        return Ok(());
    }
    let rc = unsafe { libc::daemon(0, 0) };
    if rc != 0 {
        return Err(Error::transport(format!(
            "daemon() failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Write the daemon's pid to `path`, if configured.
pub fn write_pid_file(path: &std::path::Path) -> Result<(), Error> {
    let pid = std::process::id();
    let mut file = std::fs::File::create(path).map_err(Error::from)?;
    writeln!(file, "{pid}").map_err(Error::from)?;
    Ok(())
}
