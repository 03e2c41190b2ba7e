//! Streams config files to a game server one command at a time.

use crate::configs::config_lines;
use crate::error::{Result, WardenError};
use crate::rcon::{RconError, RconLink, MAX_BODY_LEN};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of a config push.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecReport {
    /// Commands the server accepted
    pub sent: usize,
    /// Commands the server did not recognise
    pub unknown: usize,
    /// Commands dropped for length or repeated transport failure
    pub skipped: usize,
}

pub struct ConfigExecutor {
    root: PathBuf,
    reconnect_timeout: Duration,
}

impl ConfigExecutor {
    pub fn new(root: impl Into<PathBuf>, reconnect_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            reconnect_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True if `relative` exists under the configs root.
    pub async fn exists(&self, relative: &str) -> bool {
        tokio::fs::metadata(self.root.join(relative))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Sends every command in `relative` over `link`.
    ///
    /// Unknown commands are counted and skipped. A transport failure gets one
    /// reconnect and one retry of the failing line; if the reconnect itself
    /// fails the push stops with that error.
    pub async fn exec_file(&self, link: &RconLink, relative: &str) -> Result<ExecReport> {
        let path = self.root.join(relative);
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WardenError::ConfigMissing(relative.to_string())
            } else {
                WardenError::Io(e)
            }
        })?;

        debug!("Executing {} on {}", relative, link.host());
        let mut report = ExecReport::default();

        for line in config_lines(&contents) {
            if line.len() > MAX_BODY_LEN {
                warn!("{}: skipping command of {} bytes", relative, line.len());
                report.skipped += 1;
                continue;
            }

            match link.query(line).await {
                Ok(_) => report.sent += 1,
                Err(RconError::UnknownCommand(_)) => report.unknown += 1,
                Err(e) => {
                    warn!("{}: `{}` failed ({}), reconnecting", relative, line, e);
                    link.reconnect(self.reconnect_timeout).await?;
                    match link.query(line).await {
                        Ok(_) => report.sent += 1,
                        Err(RconError::UnknownCommand(_)) => report.unknown += 1,
                        Err(e) => {
                            warn!("{}: skipping `{}` after retry ({})", relative, line, e);
                            report.skipped += 1;
                        }
                    }
                }
            }
        }

        debug!(
            "{}: {} sent, {} unknown, {} skipped",
            relative, report.sent, report.unknown, report.skipped
        );
        Ok(report)
    }
}
