//! Per-connection cancellation.
//!
//! Long-running waits need to unblock when the caller's request context is
//! cancelled, as well as on deadline or condition-signal. HTTP/1.1 has no
//! per-request cancellation distinct from the underlying
//! connection closing, so a [`tokio_util::sync::CancellationToken`] is
//! created once per accepted connection and handed to every request served
//! on it via `Extension`; a background watcher flips it the moment the peer
//! closes its side.
//!
//! Detecting that close without taking the socket away from hyper (which
//! owns the read/write halves for the lifetime of the connection) means
//! polling rather than registering a second reactor interest on the same fd
//! — two interests on one fd in the same epoll instance is not supported.
//! The watcher issues a non-blocking `MSG_PEEK` recv on a timer; it never
//! consumes bytes hyper would otherwise read, so the two are safe to run
//! concurrently.

use std::os::unix::io::RawFd;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How often the watcher polls for peer close. A tighter interval notices
/// disconnects sooner at the cost of more wakeups; long-poll waits already
/// bound by the `timeout` query param make this a latency, not a
/// correctness, tradeoff.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Spawn a background task that cancels `token` once `fd`'s peer closes (a
/// zero-length `MSG_PEEK` read) or the socket reports an error other than
/// "would block". Returns immediately; the watcher stops on its own once
/// `token` is already cancelled by something else (e.g. the connection
/// finishing normally).
pub fn watch_for_disconnect(fd: RawFd, token: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            match peek(fd) {
                PeekResult::Open => continue,
                PeekResult::Closed | PeekResult::Error => {
                    token.cancel();
                    return;
                }
                PeekResult::WouldBlock => continue,
            }
        }
    });
}

enum PeekResult {
    Open,
    Closed,
    WouldBlock,
    Error,
}

fn peek(fd: RawFd) -> PeekResult {
    let mut byte = [0u8; 1];
    let rc = unsafe {
        libc::recv(
            fd,
            byte.as_mut_ptr() as *mut libc::c_void,
            byte.len(),
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };

    if rc > 0 {
        PeekResult::Open
    } else if rc == 0 {
        PeekResult::Closed
    } else {
        let errno = std::io::Error::last_os_error();
        match errno.kind() {
            std::io::ErrorKind::WouldBlock => PeekResult::WouldBlock,
            _ => PeekResult::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn cancels_when_peer_drops() {
        let (a, b) = UnixStream::pair().unwrap();
        let token = CancellationToken::new();
        watch_for_disconnect(a.as_raw_fd(), token.clone());

        drop(b);
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("watcher should observe peer close within the timeout");
    }

    #[tokio::test]
    async fn stays_open_while_peer_connected() {
        let (a, _b) = UnixStream::pair().unwrap();
        let token = CancellationToken::new();
        watch_for_disconnect(a.as_raw_fd(), token.clone());

        let woke = tokio::time::timeout(POLL_INTERVAL * 3, token.cancelled()).await;
        assert!(woke.is_err(), "token must not cancel while the peer is still connected");
    }
}
