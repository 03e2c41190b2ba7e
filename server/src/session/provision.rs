//! One-time server setup and config pushes.

use super::{Session, SessionState, WhitelistSetting};
use crate::configs::{config_name, format_config_name};
use crate::error::{Result, WardenError};
use crate::rcon::RconError;
use log::{debug, error, info, warn};
use shared::Format;
use std::sync::Arc;

impl Session {
    /// Brings the server into match shape. On failure the link is closed,
    /// the log route is dropped and the session never becomes active.
    pub async fn provision(self: &Arc<Self>) -> Result<()> {
        let result = self.provision_steps().await;
        if let Err(e) = &result {
            error!("#{}: setup failed: {}", self.match_id(), e);
            self.abandon().await;
        }
        result
    }

    /// Releases a session that will never be started.
    pub async fn abandon(&self) {
        self.link.close().await;
        if let Some(secret) = self.secret.lock().take() {
            self.deps.router.deregister(secret);
        }
        self.log_rx.lock().take();
        *self.state.lock() = SessionState::Terminated;
    }

    async fn provision_steps(&self) -> Result<()> {
        let id = self.match_id();
        let config = &self.config;

        debug!("#{}: Connecting to {}", id, config.info.host);
        self.link.connect().await?;

        debug!("#{}: Kicking all players", id);
        self.link.kick_all().await?;

        debug!("#{}: Setting server password", id);
        self.link.set_server_password(&config.info.server_password).await?;

        debug!("#{}: Setting whitelist", id);
        self.apply_whitelist().await?;

        let league = config_name(&config.map, config.format, &config.league)?;
        if !self.executor.exists(&league).await {
            return Err(WardenError::ConfigMissing(league));
        }

        debug!("#{}: Changing map to {}", id, config.map);
        self.link.change_map(&config.map).await?;

        debug!("#{}: Redirecting logs", id);
        self.open_log_route().await?;

        debug!("#{}: Executing config", id);
        self.push_configs().await?;

        info!("#{}: Configured {} on {}", id, config.map, config.info.host);
        Ok(())
    }

    async fn apply_whitelist(&self) -> Result<()> {
        let id = &self.config.whitelist;
        if id.is_empty() {
            return Ok(());
        }

        let setting = match self.link.set_cvar("tftrue_whitelist_id", id).await {
            Ok(()) => WhitelistSetting::Plugin(id.clone()),
            Err(RconError::UnknownCommand(_)) => match self.settings.whitelists.lookup(id) {
                Some(file) => {
                    self.link.set_cvar("mp_tournament_whitelist", file).await?;
                    WhitelistSetting::File(file.to_string())
                }
                None => {
                    warn!("#{}: no whitelist file for {}", self.match_id(), id);
                    WhitelistSetting::Unset
                }
            },
            Err(e) => return Err(e.into()),
        };
        *self.whitelist.lock() = setting;
        Ok(())
    }

    /// Registers a log route under a fresh secret and points the server at
    /// the listener.
    async fn open_log_route(&self) -> Result<()> {
        let router = &self.deps.router;
        let secret = router.fresh_secret();
        let rx = router.register(secret);
        *self.secret.lock() = Some(secret);
        *self.log_rx.lock() = Some(rx);

        self.deps.backend.set_secret(self.match_id(), secret).await;

        self.link.query(&format!("sv_logsecret {}", secret)).await?;
        self.link
            .query(&format!("logaddress_add {}", self.settings.log_address))
            .await?;
        self.link.query("log on").await?;
        Ok(())
    }

    /// Config files for this match, in execution order.
    pub fn config_files(&self) -> Result<Vec<String>> {
        let format = self.config.format;
        let mut files = Vec::with_capacity(4);
        if format != Format::Debug {
            files.push("base.cfg".to_string());
        }
        files.push(format_config_name(format));
        files.push(config_name(&self.config.map, format, &self.config.league)?);
        if format != Format::Debug {
            files.push("after_format.cfg".to_string());
        }
        Ok(files)
    }

    async fn exec_configs(&self) -> Result<()> {
        for file in self.config_files()? {
            let report = self.executor.exec_file(&self.link, &file).await?;
            if report.unknown > 0 || report.skipped > 0 {
                debug!(
                    "#{}: {}: {} unknown, {} skipped",
                    self.match_id(),
                    file,
                    report.unknown,
                    report.skipped
                );
            }
        }
        Ok(())
    }

    /// Runs the config sequence, reconnecting and retrying it once on failure.
    pub async fn push_configs(&self) -> Result<()> {
        match self.exec_configs().await {
            Ok(()) => Ok(()),
            Err(
                e @ (WardenError::ConfigMissing(_)
                | WardenError::InvalidMapName(_)
                | WardenError::InvalidLeague(_)),
            ) => Err(e),
            Err(e) => {
                warn!("#{}: config push failed ({}), reconnecting", self.match_id(), e);
                self.link.reconnect(self.settings.timings.setup_reconnect).await?;
                self.exec_configs().await
            }
        }
    }

    /// Re-runs the config sequence, optionally reloading the map first.
    pub async fn re_exec_config(&self, change_map: bool) -> Result<()> {
        if change_map {
            self.link.change_map(&self.config.map).await?;
        }
        self.push_configs().await
    }

    /// Pushes the anti-idle config. Missing files are only logged.
    pub(super) async fn push_soap_off(&self) {
        match self.executor.exec_file(&self.link, "soap_off.cfg").await {
            Ok(_) => debug!("#{}: soap_off.cfg executed", self.match_id()),
            Err(e) => warn!("#{}: soap_off.cfg failed: {}", self.match_id(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_setup_sequence() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.session();
        assert_ok!(session.provision().await);

        let commands = harness.server.commands();
        let pos = |prefix: &str| {
            commands
                .iter()
                .position(|c| c.starts_with(prefix))
                .unwrap_or_else(|| panic!("missing {}", prefix))
        };
        assert_eq!(pos("kickall"), 0);
        assert!(pos("sv_password") < pos("tftrue_whitelist_id"));
        assert!(pos("tftrue_whitelist_id") < pos("changelevel cp_badlands"));
        assert!(pos("changelevel") < pos("sv_logsecret"));
        assert!(pos("sv_logsecret") < pos("logaddress_add"));
        assert!(pos("log on") < pos("exec_marker base"));
        assert!(pos("exec_marker base") < pos("exec_marker format"));
        assert!(pos("exec_marker format") < pos("exec_marker league"));
        assert!(pos("exec_marker league") < pos("exec_marker after"));

        let secret = session.secret().unwrap();
        assert!(harness.router.contains(secret));
        assert_eq!(harness.book.secret(1), Some(secret));
        assert_eq!(harness.server.cvar("sv_password").as_deref(), Some("serverpw"));
        assert_eq!(session.whitelist(), WhitelistSetting::Plugin("ugc_6v6".to_string()));
    }

    #[tokio::test]
    async fn test_whitelist_falls_back_to_file() {
        let harness = Harness::new(Format::Sixes);
        harness.server.mark_unknown("tftrue_whitelist_id");
        let session = harness.session();
        assert_ok!(session.provision().await);

        assert_eq!(
            session.whitelist(),
            WhitelistSetting::File("item_whitelist_ugc_6v6.txt".to_string())
        );
        assert_eq!(
            harness.server.cvar("mp_tournament_whitelist").as_deref(),
            Some("item_whitelist_ugc_6v6.txt")
        );
    }

    #[tokio::test]
    async fn test_debug_skips_base_configs() {
        let harness = Harness::new(Format::Debug);
        let session = harness.session();
        assert_eq!(
            assert_ok!(session.config_files()),
            vec!["formats/debug.cfg".to_string(), "ugc/cp_debug.cfg".to_string()]
        );
        assert_ok!(session.provision().await);
        assert!(!harness.server.commands().iter().any(|c| c == "exec_marker base"));
    }

    #[tokio::test]
    async fn test_missing_league_config() {
        let harness = Harness::new(Format::Sixes);
        harness.fixture.remove("ugc/cp_sixes.cfg");
        let session = harness.session();

        let err = assert_err!(session.provision().await);
        assert!(matches!(err, WardenError::ConfigMissing(ref f) if f == "ugc/cp_sixes.cfg"));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(harness.router.is_empty());
        assert_eq!(harness.server.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let harness = Harness::new(Format::Sixes);
        harness.server.set_reachable(false);
        let session = harness.session();

        let err = assert_err!(session.provision().await);
        assert!(matches!(err, WardenError::Rcon(RconError::ConnectionRefused)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_sequence_restarts_after_reconnect() {
        let mut harness = Harness::new(Format::Sixes);
        harness.set_timings(|t| {
            t.command_reconnect = Duration::from_secs(2);
            t.setup_reconnect = Duration::from_secs(60);
        });
        let session = harness.session();
        assert_ok!(session.provision().await);
        harness.server.clear_commands();

        // The line retry can't reconnect; the sequence retry can, once the
        // server is back at 3s
        harness.server.drop_connection_on("exec_marker format");
        harness.server.set_reachable(false);
        let (result, _) = tokio::join!(session.push_configs(), async {
            sleep(Duration::from_secs(3)).await;
            harness.server.set_reachable(true);
        });
        assert_ok!(result);

        assert_eq!(harness.server.count_commands("exec_marker base"), 2);
        assert_eq!(harness.server.count_commands("exec_marker format"), 1);
        assert_eq!(harness.server.count_commands("exec_marker league"), 1);
        assert_eq!(harness.server.count_commands("exec_marker after"), 1);
        let commands = harness.server.commands();
        assert_eq!(commands.last().map(String::as_str), Some("exec_marker after"));
        assert_eq!(harness.server.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_re_exec_changes_map_first() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.session();
        assert_ok!(session.provision().await);
        harness.server.clear_commands();

        assert_ok!(session.re_exec_config(true).await);
        let commands = harness.server.commands();
        assert_eq!(commands[0], "changelevel cp_badlands");
        assert!(commands.contains(&"exec_marker after".to_string()));
    }
}
