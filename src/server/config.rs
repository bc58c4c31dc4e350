//! Command-line and environment configuration.

use std::time::Duration;

use clap::Parser;
use tracing::info;

pub const DEFAULT_PORT: u16 = 3780;
pub const DEFAULT_ACTIVITY_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_REGISTRATION_TIMEOUT_MS: u64 = 10_000;

#[derive(Parser, Debug)]
#[command(about = "Federated activity stream server", author, version)]
pub struct Cli {
    /// Hostname advertised to peers and used in redirects
    #[arg(long = "local-hostname", env = "STREAMER_LOCAL_HOSTNAME")]
    pub local_hostname: Option<String>,

    /// Port to listen on
    #[arg(long = "local-port", env = "STREAMER_LOCAL_PORT", default_value_t = DEFAULT_PORT)]
    pub local_port: u16,

    /// Peer server to join at startup
    #[arg(long = "remote-hostname", env = "STREAMER_REMOTE_HOSTNAME")]
    pub remote_hostname: Option<String>,

    /// Port of the peer server to join
    #[arg(long = "remote-port", env = "STREAMER_REMOTE_PORT", default_value_t = DEFAULT_PORT)]
    pub remote_port: u16,

    /// Federation secret shared by every server (random if omitted)
    #[arg(long = "secret", env = "STREAMER_SECRET")]
    pub secret: Option<String>,

    /// Milliseconds between server announcements
    #[arg(
        long = "activity-interval",
        env = "STREAMER_ACTIVITY_INTERVAL",
        value_name = "MS",
        value_parser = clap::value_parser!(u64).range(1..),
        default_value_t = DEFAULT_ACTIVITY_INTERVAL_MS
    )]
    pub activity_interval: u64,

    /// Milliseconds before a stalled registration is abandoned
    #[arg(
        long = "registration-timeout",
        env = "STREAMER_REGISTRATION_TIMEOUT",
        value_name = "MS",
        value_parser = clap::value_parser!(u64).range(1..),
        default_value_t = DEFAULT_REGISTRATION_TIMEOUT_MS
    )]
    pub registration_timeout: u64,
}

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub local_hostname: String,
    pub local_port: u16,
    pub remote_hostname: Option<String>,
    pub remote_port: u16,
    pub secret: String,
    pub activity_interval: Duration,
    pub registration_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_hostname: "localhost".into(),
            local_port: DEFAULT_PORT,
            remote_hostname: None,
            remote_port: DEFAULT_PORT,
            secret: random_secret(),
            activity_interval: Duration::from_millis(DEFAULT_ACTIVITY_INTERVAL_MS),
            registration_timeout: Duration::from_millis(DEFAULT_REGISTRATION_TIMEOUT_MS),
        }
    }
}

impl Settings {
    /// Whether `hostname:port` names this server.
    pub fn is_self(&self, hostname: &str, port: u16) -> bool {
        port == self.local_port && hostname.eq_ignore_ascii_case(&self.local_hostname)
    }
}

impl From<Cli> for Settings {
    fn from(cli: Cli) -> Self {
        Self {
            local_hostname: cli.local_hostname.unwrap_or_else(system_hostname),
            local_port: cli.local_port,
            remote_hostname: cli.remote_hostname,
            remote_port: cli.remote_port,
            secret: cli.secret.unwrap_or_else(|| {
                let secret = random_secret();
                info!(secret, "no federation secret given, generated one");
                secret
            }),
            activity_interval: Duration::from_millis(cli.activity_interval),
            registration_timeout: Duration::from_millis(cli.registration_timeout),
        }
    }
}

fn system_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".into())
}

fn random_secret() -> String {
    format!("{:032x}", rand::random::<u128>())
}
