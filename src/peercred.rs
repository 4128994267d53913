//! Unix peer-credential resolution via `SO_PEERCRED`.
//!
//! A single raw `getsockopt` call, read while the stream's file descriptor
//! is still owned by the task resolving it, so no separate lock is needed
//! to keep the fd alive across the call.

use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tokio::net::UnixStream;

use crate::source::{RemoteAddr, UNRESOLVED_PID, UNRESOLVED_UID};

/// Resolve the peer credentials of `stream`, bound to `socket_path` (the
/// listener's own bind path, known ahead of time rather than re-derived per
/// connection). Produces the sentinel pid/uid only if the kernel call itself
/// fails; never from a successful `getsockopt`.
pub fn resolve(stream: &UnixStream, socket_path: &Path) -> io::Result<RemoteAddr> {
    let (pid, uid) = resolve_fd(stream.as_raw_fd());
    Ok(RemoteAddr {
        pid,
        uid,
        socket: socket_path.to_path_buf(),
    })
}

#[cfg(target_os = "linux")]
fn resolve_fd(fd: i32) -> (i32, u32) {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if rc != 0 || len as usize != std::mem::size_of::<libc::ucred>() || ucred.pid == 0 {
        return (UNRESOLVED_PID, UNRESOLVED_UID);
    }

    (ucred.pid, ucred.uid)
}

#[cfg(not(target_os = "linux"))]
fn resolve_fd(_fd: i32) -> (i32, u32) {
    (UNRESOLVED_PID, UNRESOLVED_UID)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn resolves_own_process_over_a_socketpair() {
        let (a, _b) = UnixStream::pair().unwrap();
        let addr = resolve(&a, &PathBuf::from("/run/test.socket")).unwrap();
        assert!(addr.is_resolved());
        assert_eq!(addr.uid, unsafe { libc::getuid() });
    }
}
