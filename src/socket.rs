//! Local sequenced-packet socket surface.
//!
//! `std::os::unix::net::UnixListener` only supports `SOCK_STREAM`, so the
//! listener and client connections here are built directly on raw `libc`
//! socket calls, the same unsafe-FFI style used elsewhere in this crate for
//! operations std doesn't expose. Socket names starting with `@` bind into
//! the Linux abstract namespace (no filesystem entry, no unlink needed); all
//! other names are filesystem paths that are unlinked before bind and on
//! clean exit.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::Error;

const SUN_PATH_MAX: usize = 108;

/// Fill a `sockaddr_un` for `name`, handling the `@`-prefix abstract-namespace
/// convention. Returns the populated address and its length for use with
/// `bind`/`connect`.
fn build_sockaddr(name: &str) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let is_abstract = name.starts_with('@');
    let path_bytes = if is_abstract { &name.as_bytes()[1..] } else { name.as_bytes() };

    if path_bytes.len() >= SUN_PATH_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket name too long",
        ));
    }

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let path_field = unsafe {
        std::slice::from_raw_parts_mut(addr.sun_path.as_mut_ptr() as *mut u8, SUN_PATH_MAX)
    };
    if is_abstract {
        // Leading NUL marks an abstract-namespace address; the rest of the
        // name follows without a terminator.
        path_field[0] = 0;
        path_field[1..1 + path_bytes.len()].copy_from_slice(path_bytes);
    } else {
        path_field[..path_bytes.len()].copy_from_slice(path_bytes);
        path_field[path_bytes.len()] = 0;
    }

    let path_len = if is_abstract {
        1 + path_bytes.len()
    } else {
        path_bytes.len() + 1
    };
    let len = (mem::size_of::<libc::sa_family_t>() + path_len) as libc::socklen_t;
    Ok((addr, len))
}

fn unlink_if_filesystem(name: &str) {
    if name.starts_with('@') {
        return;
    }
    let Ok(cname) = CString::new(name) else {
        return;
    };
    // Best-effort: ENOENT is expected and not logged as an error.
    unsafe {
        if libc::unlink(cname.as_ptr()) != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                log::error!("couldn't unlink {name}: {err}");
            }
        }
    }
}

fn raw_seqpacket_socket(cloexec: bool) -> io::Result<OwnedFd> {
    let mut ty = libc::SOCK_SEQPACKET;
    if cloexec {
        ty |= libc::SOCK_CLOEXEC;
    }
    let fd = unsafe { libc::socket(libc::AF_UNIX, ty, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A bound, listening `SOCK_SEQPACKET` socket.
pub struct Listener {
    fd: OwnedFd,
    name: String,
}

impl Listener {
    /// Bind and listen at `name`, unlinking any stale filesystem socket
    /// first when `name` does not begin with `@`.
    pub fn bind(name: &str) -> Result<Self, Error> {
        unlink_if_filesystem(name);

        let fd = raw_seqpacket_socket(false).map_err(Error::from)?;
        let (addr, len) = build_sockaddr(name).map_err(Error::from)?;

        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if rc != 0 {
            return Err(Error::transport(format!(
                "bind({name}) failed: {}",
                io::Error::last_os_error()
            )));
        }

        // A seqpacket listener here expects to be drained promptly, not to
        // queue a deep backlog.
        let rc = unsafe { libc::listen(fd.as_raw_fd(), 0) };
        if rc != 0 {
            return Err(Error::transport(format!(
                "listen({name}) failed: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Accept one pending connection. The accepted socket is opened with
    /// close-on-exec set, matching every other descriptor this daemon
    /// creates.
    pub fn accept(&self) -> Result<UnixStream, Error> {
        let fd = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::transport(format!(
                "accept4() failed: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(unsafe { UnixStream::from_raw_fd(fd) })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        unlink_if_filesystem(&self.name);
    }
}

/// Connect to a server's `SOCK_SEQPACKET` listener, with `SOCK_CLOEXEC` set
/// on the client side.
pub fn connect(name: &str) -> Result<UnixStream, Error> {
    let fd = raw_seqpacket_socket(true).map_err(Error::from)?;
    let (addr, len) = build_sockaddr(name).map_err(Error::from)?;

    let rc = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc != 0 {
        return Err(Error::transport(format!(
            "connect({name}) failed: {}",
            io::Error::last_os_error()
        )));
    }

    use std::os::fd::IntoRawFd;
    Ok(unsafe { UnixStream::from_raw_fd(fd.into_raw_fd()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn abstract_socket_round_trips_and_leaves_no_trace() {
        let name = "@vmeirqd-test-abstract-1";
        let listener = Listener::bind(name).unwrap();

        let mut client = connect(name).unwrap();
        let mut server = listener.accept().unwrap();

        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn filesystem_socket_is_created_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmeirqd-test.sock");
        let name = path.to_str().unwrap().to_string();

        {
            let _listener = Listener::bind(&name).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
