pub mod cancel;
pub mod config;
pub mod error;
pub mod identity;
pub mod notices;
pub mod peercred;
pub mod policy;
pub mod router;
pub mod server;
pub mod source;

use std::sync::Arc;

use self::config::Config;
use self::router::Daemon;

/// Build the process-wide [`Daemon`] state and run every configured
/// listener until the process is asked to stop. A single function `main`
/// hands the loaded config to, so integration tests can start the same
/// server the binary does without going through `main`.
pub async fn startup(config: Config) -> anyhow::Result<()> {
    let daemon = Arc::new(Daemon::new(config)?);
    server::start(&daemon.config, daemon.clone()).await
}
