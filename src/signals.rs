//! Signal handling: `SIGTERM` for graceful exit, `SIGUSR1` to dump the
//! status report. Both are blocked everywhere except during the dispatcher's
//! blocking wait, which uses `ppoll`'s signal-mask argument to unblock them
//! only for the duration of the wait itself. The handler does nothing but
//! record which signal fired in an atomic; all real handling happens
//! after `ppoll` returns `EINTR`.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::Error;

static CAUGHT_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_signal(sig: libc::c_int) {
    CAUGHT_SIGNAL.store(sig, Ordering::SeqCst);
}

/// Signal observed by the dispatcher after a `ppoll` wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caught {
    Term,
    Usr1,
    Other(i32),
}

/// Install handlers for `SIGTERM`/`SIGUSR1` and block both outside of the
/// dispatcher's poll wait. Must be called once at start-up, before the
/// dispatcher loop begins.
pub fn install() -> Result<(), Error> {
    unsafe {
        let mut blockset: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut blockset);
        libc::sigaddset(&mut blockset, libc::SIGTERM);
        libc::sigaddset(&mut blockset, libc::SIGUSR1);

        if libc::sigprocmask(libc::SIG_BLOCK, &blockset, std::ptr::null_mut()) != 0 {
            return Err(Error::transport(format!(
                "sigprocmask failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_signal as usize;
        sa.sa_mask = blockset;
        sa.sa_flags = 0;

        if libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut()) != 0 {
            return Err(Error::transport("sigaction(SIGTERM) failed".to_string()));
        }
        if libc::sigaction(libc::SIGUSR1, &sa, std::ptr::null_mut()) != 0 {
            return Err(Error::transport("sigaction(SIGUSR1) failed".to_string()));
        }
    }
    Ok(())
}

/// Block on `poll`-equivalent readiness of `fds`, unblocking `SIGTERM`/
/// `SIGUSR1` only for the duration of the wait by passing an empty signal
/// mask to `ppoll`.
///
/// Returns `Ok(Some(n))` with the number of ready descriptors, or
/// `Ok(None)` if a signal interrupted the wait (call [`take_caught`] to see
/// which one).
pub fn ppoll(fds: &mut [libc::pollfd]) -> Result<Option<usize>, Error> {
    unsafe {
        let mut emptyset: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut emptyset);

        let rc = libc::ppoll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            std::ptr::null(),
            &emptyset,
        );

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(Error::transport(format!("ppoll failed: {err}")));
        }
        Ok(Some(rc as usize))
    }
}

/// Fetch and clear whichever signal the handler last recorded.
pub fn take_caught() -> Caught {
    let sig = CAUGHT_SIGNAL.swap(0, Ordering::SeqCst);
    match sig {
        s if s == libc::SIGTERM => Caught::Term,
        s if s == libc::SIGUSR1 => Caught::Usr1,
        other => Caught::Other(other),
    }
}
