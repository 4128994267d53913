//! The two listeners this daemon binds: the unix-socket peer-credential
//! endpoint and, optionally, the mTLS endpoint.

pub mod tls;
pub mod unix;

use std::sync::Arc;

use crate::config::Config;
use crate::router::Daemon;

/// Start every configured listener. Each runs its own accept loop for the
/// lifetime of the process; this function returns only if a listener fails
/// to bind in the first place.
pub async fn start(config: &Config, daemon: Arc<Daemon>) -> anyhow::Result<()> {
    let unix_daemon = daemon.clone();
    let unix_socket = config.unix_socket.clone();
    let unix_task = tokio::spawn(async move { unix::serve(&unix_socket, unix_daemon).await });

    match &config.tls {
        Some(tls_config) => {
            let tls_config = tls_config.clone();
            let tls_daemon = daemon.clone();
            let tls_task = tokio::spawn(async move { tls::serve(&tls_config, tls_daemon).await });

            tokio::select! {
                res = unix_task => res?,
                res = tls_task => res?,
            }
        }
        None => unix_task.await?,
    }
}
