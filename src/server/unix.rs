//! Unix-socket listener: accepts connections, resolves peer credentials, and
//! hands each stream to axum with the resolved credential encoded into the
//! connection's remote-address string.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;

use crate::peercred;
use crate::router::Daemon;

/// Bind `path`, removing a stale socket file left behind by a prior run, and
/// serve `router` over it until the process is asked to stop.
pub async fn serve(path: &Path, daemon: Arc<Daemon>) -> anyhow::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    log::info!("unix socket listening path={}", path.display());

    let socket_path: PathBuf = path.to_path_buf();

    loop {
        let (stream, _peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("unix accept failed: {e}");
                continue;
            }
        };

        let remote_addr = match peercred::resolve(&stream, &socket_path) {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("peer credential resolution failed: {e}");
                continue;
            }
        };

        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::router::serve_connection(daemon, stream, Some(remote_addr.encode()), false).await {
                log::warn!("unix connection error: {e}");
            }
        });
    }
}
