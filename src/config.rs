use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// TLS listener configuration. Client certificates are accepted from any
/// presenter (no CA-chain trust): identity is resolved by exact DER match
/// against the identity store, not by certificate authority.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Tls {
    ///
    /// address the mTLS listener binds to
    ///
    pub listen: SocketAddr,
    ///
    /// server certificate chain file (PEM)
    ///
    pub certificate: String,
    ///
    /// server private key file (PEM)
    ///
    pub private_key: String,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// path of the unix socket peer-credential endpoints bind to
    ///
    #[serde(default = "Config::unix_socket")]
    pub unix_socket: PathBuf,
    ///
    /// mTLS listener; omit to run unix-socket-only
    ///
    #[serde(default)]
    pub tls: Option<Tls>,
    ///
    /// on-disk location of the identity store's durable JSON state
    ///
    #[serde(default = "Config::identities_path")]
    pub identities_path: PathBuf,
    ///
    /// how long an admin-opened enrollment window stays open before it
    /// auto-closes
    ///
    #[serde(default = "Config::enrollment_timeout_secs")]
    pub enrollment_timeout_secs: u64,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn unix_socket() -> PathBuf {
        PathBuf::from("/run/access-core.socket")
    }

    fn identities_path() -> PathBuf {
        PathBuf::from("/var/lib/access-core/identities.json")
    }

    fn enrollment_timeout_secs() -> u64 {
        10 * 60
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: access-cored --config /etc/access-core/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configuration from the config file named on the command line.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(&Cli::parse().config)?)?)
    }
}
