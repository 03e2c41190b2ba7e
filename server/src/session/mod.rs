//! One supervised game server per active match.
//!
//! A [`Session`] is created by the RPC surface, provisioned synchronously
//! (see `provision`), registered and then started. Starting spawns a run
//! task whose body is the log-event dispatcher (`dispatch`, with the `!rep`
//! protocol in `report`). The run task also spawns the health verifier
//! (`verifier`) and, once the dispatcher returns, raises the stop signal,
//! waits for the verifier and tears the session down.
//!
//! ```text
//! Provisioning --> Active --> Ending --> Terminated
//! ```

mod dispatch;
mod provision;
mod report;
mod verifier;

use crate::archive::{LogArchive, LogUploader};
use crate::backend::Backend;
use crate::events::EventSink;
use crate::exec::ConfigExecutor;
use crate::ledger::ReportLedger;
use crate::listener::LogRouter;
use crate::logline::LogMessage;
use crate::rcon::{Connector, RconLink};
use crate::registry::Registry;
use crate::roster::Roster;
use crate::settings::SessionSettings;
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{Event, Format, MatchId, PlayerId, ServerInfo, SetupArgs, Team};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use dispatch::{Dispatcher, Internal};

/// Resolves once the stop flag is raised.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Provisioning,
    Active,
    Ending,
    Terminated,
}

/// What a session was asked to set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchConfig {
    pub match_id: MatchId,
    pub map: String,
    pub league: String,
    pub format: Format,
    pub whitelist: String,
    pub info: ServerInfo,
}

impl From<&SetupArgs> for MatchConfig {
    fn from(args: &SetupArgs) -> Self {
        Self {
            match_id: args.match_id,
            map: args.map.clone(),
            league: args.league.clone(),
            format: args.format,
            whitelist: args.whitelist.clone(),
            info: args.info.clone(),
        }
    }
}

/// Which whitelist mechanism the server accepted at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistSetting {
    /// `tftrue_whitelist_id <id>`
    Plugin(String),
    /// `mp_tournament_whitelist <file>`
    File(String),
    Unset,
}

/// Services shared by every session.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub backend: Arc<dyn Backend>,
    pub events: Arc<dyn EventSink>,
    pub router: Arc<LogRouter>,
    pub ledger: Arc<ReportLedger>,
    pub uploader: Option<Arc<dyn LogUploader>>,
    pub registry: Arc<Registry<Session>>,
}

pub struct Session {
    config: MatchConfig,
    settings: Arc<SessionSettings>,
    deps: Collaborators,
    link: RconLink,
    executor: ConfigExecutor,
    archive: LogArchive,
    roster: Roster,
    /// Set once a terminal event has been published
    ended: AtomicBool,
    state: Mutex<SessionState>,
    stop_tx: watch::Sender<bool>,
    secret: Mutex<Option<u64>>,
    whitelist: Mutex<WhitelistSetting>,
    log_rx: Mutex<Option<mpsc::UnboundedReceiver<LogMessage>>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Mutex<Option<mpsc::UnboundedReceiver<Internal>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        config: MatchConfig,
        roster: Roster,
        settings: Arc<SessionSettings>,
        deps: Collaborators,
    ) -> Arc<Self> {
        let link = RconLink::new(
            &config.info.host,
            &config.info.rcon_password,
            Arc::clone(&deps.connector),
            settings.backoff,
        );
        let executor = ConfigExecutor::new(&settings.configs_dir, settings.timings.command_reconnect);
        let archive = LogArchive::new(&settings.archive_dir);
        let (stop_tx, _) = watch::channel(false);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            settings,
            deps,
            link,
            executor,
            archive,
            roster,
            ended: AtomicBool::new(false),
            state: Mutex::new(SessionState::Provisioning),
            stop_tx,
            secret: Mutex::new(None),
            whitelist: Mutex::new(WhitelistSetting::Unset),
            log_rx: Mutex::new(None),
            internal_tx,
            internal_rx: Mutex::new(Some(internal_rx)),
            task: Mutex::new(None),
        })
    }

    pub fn match_id(&self) -> MatchId {
        self.config.match_id
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn link(&self) -> &RconLink {
        &self.link
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn secret(&self) -> Option<u64> {
        *self.secret.lock()
    }

    pub fn whitelist(&self) -> WhitelistSetting {
        self.whitelist.lock().clone()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Spawns the run task. Only the first call has any effect.
    pub fn start(self: &Arc<Self>) {
        let Some(log_rx) = self.log_rx.lock().take() else {
            warn!("#{}: start called twice", self.match_id());
            return;
        };
        let Some(internal_rx) = self.internal_rx.lock().take() else {
            warn!("#{}: start called twice", self.match_id());
            return;
        };
        *self.state.lock() = SessionState::Active;
        info!("#{}: session active", self.match_id());

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.run(log_rx, internal_rx).await });
        *self.task.lock() = Some(handle);
    }

    async fn run(
        self: Arc<Self>,
        log_rx: mpsc::UnboundedReceiver<LogMessage>,
        internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        let supervisor = tokio::spawn(verifier::run(Arc::clone(&self)));

        Dispatcher::new(Arc::clone(&self), log_rx, internal_rx).run().await;

        self.signal_stop();
        if let Err(e) = supervisor.await {
            warn!("#{}: verifier task failed: {}", self.match_id(), e);
        }
        self.teardown().await;
    }

    /// Drops any open `!rep` vote against `player`, e.g. after they were
    /// replaced from outside the game.
    pub fn cancel_reports_against(&self, player: PlayerId) {
        if self.internal_tx.send(Internal::CancelReports { target: player }).is_err() {
            debug!("#{}: no dispatcher to cancel reports", self.match_id());
        }
    }

    /// Raises the stop signal. Idempotent.
    pub fn signal_stop(&self) {
        let was_stopping = self.stop_tx.send_replace(true);
        let mut state = self.state.lock();
        if *state == SessionState::Active {
            *state = SessionState::Ending;
        }
        if !was_stopping {
            debug!("#{}: stop requested", self.match_id());
        }
    }

    /// Waits for the run task to finish.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("#{}: run task failed: {}", self.match_id(), e);
            }
        }
    }

    /// Releases everything the session holds on the server and in shared
    /// state. Runs at most once.
    async fn teardown(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Terminated {
                return;
            }
            *state = SessionState::Ending;
        }
        let match_id = self.match_id();

        // After End the match may already be running again on this server
        let superseded = self.deps.registry.superseded(match_id, self);
        if superseded {
            debug!("#{}: newer session owns the server, skipping cleanup", match_id);
        } else if self.link.is_connected().await {
            let del = format!("logaddress_del {}", self.settings.log_address);
            if let Err(e) = self.link.query(&del).await {
                debug!("#{}: {} failed: {}", match_id, del, e);
            }
            if let Err(e) = self.link.say("Lobby Ended.").await {
                debug!("#{}: couldn't announce end: {}", match_id, e);
            }
        }
        self.link.close().await;

        if let Some(secret) = self.secret.lock().take() {
            self.deps.router.deregister(secret);
        }
        if self.deps.registry.remove_if_same(match_id, self) {
            self.deps.backend.release(match_id).await;
        }
        // A newer session may already own this match id
        if !self.deps.registry.contains(match_id) {
            self.deps.ledger.clear_match(match_id);
        }

        *self.state.lock() = SessionState::Terminated;
        info!("#{}: session terminated", match_id);
    }

    /// Publishes a non-terminal event unless the match has ended.
    fn emit(&self, event: Event) {
        if self.is_ended() {
            debug!("#{}: dropping {} after end", self.match_id(), event.name());
            return;
        }
        self.deps.events.publish(event);
    }

    /// Publishes a terminal event. Only the first one goes out.
    fn finish(&self, event: Event) -> bool {
        if self
            .ended
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("#{}: dropping {}, already ended", self.match_id(), event.name());
            return false;
        }
        self.deps.events.publish(event);
        true
    }

    /// `Err` carries the kick reason for a player who may not be on the server.
    async fn admission(&self, player: PlayerId) -> Result<(), String> {
        match self.roster.admission(player) {
            Some(admission) => match admission.reason() {
                Some(reason) => Err(reason.to_string()),
                None => Ok(()),
            },
            None => self.deps.backend.is_allowed(self.match_id(), player).await,
        }
    }

    async fn team_of(&self, player: PlayerId) -> Option<Team> {
        if self.roster.admission(player) == Some(crate::roster::Admission::Allowed) {
            if let Some(entry) = self.roster.entry(player) {
                return Some(entry.team);
            }
        }
        self.deps.backend.team_of(self.match_id(), player).await
    }

    async fn slot_occupant(&self, team: Team, slot: &str) -> Option<PlayerId> {
        match self.roster.occupant(team, slot) {
            Some(player) => Some(player),
            None => self.deps.backend.slot_occupant(self.match_id(), team, slot).await,
        }
    }

    async fn name_of(&self, player: PlayerId) -> String {
        if let Some(entry) = self.roster.entry(player) {
            return entry.name;
        }
        self.deps
            .backend
            .name_of(self.match_id(), player)
            .await
            .unwrap_or_else(|| player.steam3())
    }

    /// Announces in chat, logging rather than failing.
    async fn say(&self, text: &str) {
        if let Err(e) = self.link.say(text).await {
            warn!("#{}: say failed: {}", self.match_id(), e);
        }
    }

    /// Re-asserts the server password if it drifted.
    async fn assert_password(&self) {
        let expected = &self.config.info.server_password;
        match self.link.server_password().await {
            Ok(actual) if &actual == expected => {}
            Ok(_) => {
                info!("#{}: server password changed, restoring", self.match_id());
                if let Err(e) = self.link.set_server_password(expected).await {
                    warn!("#{}: couldn't restore password: {}", self.match_id(), e);
                }
            }
            Err(e) => debug!("#{}: couldn't read sv_password: {}", self.match_id(), e),
        }
    }

    /// Stores the finished log, preferring the uploader, and returns the
    /// upload id and archive path that were produced.
    async fn store_log(&self, contents: &str) -> (Option<u64>, Option<String>) {
        let match_id = self.match_id();
        if let Some(uploader) = &self.deps.uploader {
            let title = format!("Match #{}", match_id);
            match uploader.upload(&title, &self.config.map, contents).await {
                Ok(id) => {
                    info!("#{}: log uploaded as {}", match_id, id);
                    return (Some(id), None);
                }
                Err(e) => warn!("#{}: log upload failed: {}", match_id, e),
            }
        }

        match self.archive.write(match_id, contents).await {
            Ok(path) => (None, Some(path.display().to_string())),
            Err(e) => {
                warn!("#{}: couldn't archive log: {}", match_id, e);
                (None, None)
            }
        }
    }
}
