//! Command line and environment configuration.

use crate::configs::{QuorumOverride, QuorumTable, WhitelistRule, WhitelistTable};
use crate::retry::Backoff;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Timers and retry budgets used by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub verify_interval: Duration,
    /// Reconnect budget for a single failed config command
    pub command_reconnect: Duration,
    /// Reconnect budget before the config push is retried at setup
    pub setup_reconnect: Duration,
    /// Reconnect budget of the health verifier
    pub health_reconnect: Duration,
    pub report_timeout: Duration,
    /// How long a stopping session waits for the log to close after game over
    pub log_flush_grace: Duration,
    /// How long `VerifyInfo` waits for a log line
    pub verify_info_wait: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            verify_interval: Duration::from_secs(10),
            command_reconnect: Duration::from_secs(10),
            setup_reconnect: Duration::from_secs(120),
            health_reconnect: Duration::from_secs(300),
            report_timeout: Duration::from_secs(120),
            log_flush_grace: Duration::from_secs(30),
            verify_info_wait: Duration::from_secs(5),
        }
    }
}

/// Immutable settings shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub timings: Timings,
    pub quorum: QuorumTable,
    pub whitelists: WhitelistTable,
    pub backoff: Backoff,
    pub configs_dir: PathBuf,
    pub archive_dir: PathBuf,
    /// Address game servers send their logs to
    pub log_address: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            quorum: QuorumTable::default(),
            whitelists: WhitelistTable::default(),
            backoff: Backoff::default(),
            configs_dir: PathBuf::from("./configs"),
            archive_dir: PathBuf::from("./logs"),
            log_address: "127.0.0.1:8002".to_string(),
        }
    }
}

/// Match server warden
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Address the RPC server binds to
    #[clap(long, env = "WARDEN_RPC_ADDR", default_value = "127.0.0.1:8001")]
    pub rpc_addr: String,

    /// Address the UDP log listener binds to
    #[clap(long, env = "WARDEN_LOGS_BIND", default_value = "0.0.0.0:8002")]
    pub logs_bind: String,

    /// Log address announced to game servers (defaults to the bind address)
    #[clap(long, env = "WARDEN_LOGS_PUBLIC")]
    pub logs_public: Option<String>,

    /// Directory holding server config files
    #[clap(long, env = "WARDEN_CONFIGS_DIR", default_value = "./configs")]
    pub configs_dir: PathBuf,

    /// Directory finished match logs are written to
    #[clap(long, env = "WARDEN_ARCHIVE_DIR", default_value = "./logs")]
    pub archive_dir: PathBuf,

    /// Seconds between health checks
    #[clap(long, env = "WARDEN_VERIFY_INTERVAL", default_value = "10")]
    pub verify_interval: u64,

    /// Seconds a report vote stays open
    #[clap(long, env = "WARDEN_REPORT_TIMEOUT", default_value = "120")]
    pub report_timeout: u64,

    /// Seconds the health check keeps reconnecting before giving up
    #[clap(long, env = "WARDEN_HEALTH_RECONNECT", default_value = "300")]
    pub health_reconnect: u64,

    /// Seconds setup keeps reconnecting before giving up
    #[clap(long, env = "WARDEN_SETUP_RECONNECT", default_value = "120")]
    pub setup_reconnect: u64,

    /// Report quorum override, e.g. `sixes=4` (repeatable)
    #[clap(long = "quorum", env = "WARDEN_QUORUM", value_delimiter = ',')]
    pub quorum: Vec<QuorumOverride>,

    /// Whitelist rule `prefix:<id>=<file>` or `exact:<id>=<file>`; replaces the defaults
    #[clap(long = "whitelist-rule", env = "WARDEN_WHITELIST_RULES", value_delimiter = ',')]
    pub whitelist_rules: Vec<WhitelistRule>,

    /// Echo every routed game log line at debug level
    #[clap(long, env = "WARDEN_PRINT_LOG_MESSAGES")]
    pub print_log_messages: bool,
}

impl Args {
    pub fn into_settings(self) -> SessionSettings {
        let timings = Timings {
            verify_interval: Duration::from_secs(self.verify_interval.max(1)),
            report_timeout: Duration::from_secs(self.report_timeout),
            health_reconnect: Duration::from_secs(self.health_reconnect),
            setup_reconnect: Duration::from_secs(self.setup_reconnect),
            ..Timings::default()
        };

        let mut quorum = QuorumTable::default();
        for o in &self.quorum {
            quorum.set(o.format, o.votes);
        }

        let whitelists = if self.whitelist_rules.is_empty() {
            WhitelistTable::default()
        } else {
            WhitelistTable::new(self.whitelist_rules)
        };

        SessionSettings {
            timings,
            quorum,
            whitelists,
            backoff: Backoff::default(),
            configs_dir: self.configs_dir,
            archive_dir: self.archive_dir,
            log_address: self.logs_public.unwrap_or(self.logs_bind),
        }
    }
}
