//! The session's event task: consumes routed log lines in order.

use super::{stopped, Session};
use crate::logline::{LogEvent, LogMessage, PlayerData};
use crate::playtime::PlaytimeTracker;
use log::{debug, info, warn};
use shared::{Event, PlayerId, Team};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Messages the session sends itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Internal {
    ReportExpired { team: Team, slot: String, token: u64 },
    CancelReports { target: PlayerId },
}

/// An open `!rep` vote waiting for quorum.
pub(crate) struct PendingReport {
    pub(crate) target: PlayerId,
    pub(crate) token: u64,
    pub(crate) timer: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

pub struct Dispatcher {
    pub(crate) session: Arc<Session>,
    log_rx: mpsc::UnboundedReceiver<LogMessage>,
    pub(crate) internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    playtime: PlaytimeTracker,
    log_buffer: String,
    connected: HashSet<PlayerId>,
    soap_pushed: bool,
    game_over: bool,
    pub(crate) pending: HashMap<(Team, String), PendingReport>,
    pub(crate) next_token: u64,
    pub(crate) substituted: HashSet<PlayerId>,
}

impl Dispatcher {
    pub(crate) fn new(
        session: Arc<Session>,
        log_rx: mpsc::UnboundedReceiver<LogMessage>,
        internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) -> Self {
        let internal_tx = session.internal_tx.clone();
        Self {
            session,
            log_rx,
            internal_tx,
            internal_rx,
            playtime: PlaytimeTracker::new(),
            log_buffer: String::new(),
            connected: HashSet::new(),
            soap_pushed: false,
            game_over: false,
            pending: HashMap::new(),
            next_token: 0,
            substituted: HashSet::new(),
        }
    }

    /// Processes log lines and timer expiries until the match finishes, the
    /// log route closes or stop is raised.
    pub async fn run(mut self) {
        let mut stop = self.session.stop_rx();
        let match_id = self.session.match_id();

        loop {
            tokio::select! {
                message = self.log_rx.recv() => {
                    let Some(message) = message else {
                        debug!("#{}: log route closed", match_id);
                        return;
                    };
                    if self.handle(message).await == Flow::Finished {
                        return;
                    }
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
                _ = stopped(&mut stop) => {
                    break;
                }
            }
        }

        if self.game_over {
            self.drain().await;
        }
    }

    /// After a stop that arrived between game over and log close, keeps
    /// reading until the log closes or the grace period runs out.
    async fn drain(&mut self) {
        let match_id = self.session.match_id();
        let grace = self.session.settings.timings.log_flush_grace;
        info!("#{}: waiting up to {:?} for the log to close", match_id, grace);

        let deadline = sleep(grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                message = self.log_rx.recv() => match message {
                    Some(message) => {
                        if self.handle(message).await == Flow::Finished {
                            return;
                        }
                    }
                    None => return,
                },
                _ = &mut deadline => {
                    warn!("#{}: log did not close within {:?}", match_id, grace);
                    return;
                }
            }
        }
    }

    async fn handle(&mut self, message: LogMessage) -> Flow {
        self.log_buffer.push_str(&message.raw);
        self.log_buffer.push('\n');

        match message.event {
            LogEvent::PlayerConnected { player, .. } => self.on_connect(player).await,
            LogEvent::PlayerDisconnected { player, .. } => self.on_disconnect(player).await,
            LogEvent::Say { player, text } => self.on_chat(player, &text).await,
            LogEvent::ClassChange { player, class } | LogEvent::Spawned { player, class } => {
                self.playtime.observe(player.player, class);
            }
            LogEvent::ServerCvar { name, .. } if name == "sv_password" => {
                // The logged value is masked, so ask the server.
                self.session.assert_password().await;
            }
            LogEvent::TournamentStarted => {
                self.soap_pushed = true;
                self.session.push_soap_off().await;
            }
            LogEvent::GameOver { reason } => {
                info!("#{}: game over ({})", self.session.match_id(), reason);
                self.game_over = true;
            }
            LogEvent::LogFileClosed if self.game_over => {
                self.finish_match().await;
                return Flow::Finished;
            }
            _ => {}
        }
        Flow::Continue
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ReportExpired { team, slot, token } => {
                self.expire_report(team, slot, token).await;
            }
            Internal::CancelReports { target } => self.cancel_reports(target),
        }
    }

    async fn on_connect(&mut self, player: PlayerData) {
        let session = Arc::clone(&self.session);
        if let Err(reason) = session.admission(player.player).await {
            info!(
                "#{}: kicking {} ({}): {}",
                session.match_id(),
                player.name,
                player.player.steam3(),
                reason
            );
            if let Err(e) = session.link.kick_user_id(player.user_id, &reason).await {
                warn!("#{}: kick failed: {}", session.match_id(), e);
            }
            return;
        }

        session.emit(Event::PlayerConnected {
            match_id: session.match_id(),
            player: player.player,
        });
        self.connected.insert(player.player);

        if !self.soap_pushed && self.connected.len() >= session.config.format.roster_size() {
            self.soap_pushed = true;
            session.push_soap_off().await;
        }
    }

    async fn on_disconnect(&mut self, player: PlayerData) {
        let session = Arc::clone(&self.session);
        self.playtime.pause_at(player.player, Instant::now());
        // Players replaced mid-match still leave the live count
        self.connected.remove(&player.player);
        if session.admission(player.player).await.is_err() {
            return;
        }
        session.emit(Event::PlayerDisconnected {
            match_id: session.match_id(),
            player: player.player,
        });
    }

    async fn finish_match(&mut self) {
        let session = Arc::clone(&self.session);
        let class_times = self.playtime.snapshot();
        let (log_id, archive) = session.store_log(&self.log_buffer).await;

        session.finish(Event::MatchEnded {
            match_id: session.match_id(),
            log_id,
            archive,
            class_times,
        });
        info!("#{}: match ended", session.match_id());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{log_line, player_token, Harness};
    use shared::Format;
    use std::time::Duration;

    fn connect_line(n: u32) -> String {
        log_line(&format!(
            "{} connected, address \"10.0.0.{}:27005\"",
            player_token(n, "Unassigned"),
            n
        ))
    }

    #[tokio::test]
    async fn test_connect_emits_and_pushes_soap_once() {
        let harness = Harness::new(Format::Ultiduo);
        let session = harness.started_session().await;

        for n in 0..4 {
            harness.send_log(&session, &connect_line(n + 1));
        }
        harness.send_log(&session, &log_line("Tournament mode started"));
        harness.settle().await;

        let connected = harness
            .sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::PlayerConnected { .. }))
            .count();
        assert_eq!(connected, 4);
        // Once for the full roster, once for the tournament start
        assert_eq!(harness.server.count_commands("exec_marker soap"), 2);
    }

    #[tokio::test]
    async fn test_stranger_is_kicked() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.send_log(&session, &connect_line(500));
        harness.settle().await;

        assert!(harness
            .server
            .commands()
            .contains(&"kickid 500 \"You're not in this lobby.\"".to_string()));
        assert!(harness.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_of_member() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.send_log(&session, &connect_line(1));
        harness.send_log(
            &session,
            &log_line(&format!(
                "{} disconnected (reason \"Disconnect by user.\")",
                player_token(1, "Red")
            )),
        );
        harness.settle().await;

        let events = harness.sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Event::PlayerDisconnected { .. }));
    }

    #[tokio::test]
    async fn test_replaced_player_leaves_live_count() {
        let harness = Harness::new(Format::Ultiduo);
        let session = harness.started_session().await;

        for n in 1..=3 {
            harness.send_log(&session, &connect_line(n));
        }
        harness.settle().await;
        session.roster().replace(harness.player(3).player);
        harness.send_log(
            &session,
            &log_line(&format!("{} disconnected (reason \"Kicked\")", player_token(3, "Red"))),
        );
        harness.send_log(&session, &connect_line(4));
        harness.settle().await;
        // Three players on the server, the roster needs four
        assert_eq!(harness.server.count_commands("exec_marker soap"), 0);

        session.roster().allow(shared::RosterEntry {
            player: shared::PlayerId::from_account(5),
            team: Team::Red,
            slot: "slot2".to_string(),
            name: "player5".to_string(),
        });
        harness.send_log(&session, &connect_line(5));
        harness.settle().await;
        assert_eq!(harness.server.count_commands("exec_marker soap"), 1);
    }

    #[tokio::test]
    async fn test_password_drift_restored() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.server.set_cvar("sv_password", "hijacked");
        harness.send_log(
            &session,
            &log_line("server_cvar: \"sv_password\" \"***PROTECTED***\""),
        );
        harness.settle().await;

        assert_eq!(harness.server.cvar("sv_password").as_deref(), Some("serverpw"));
    }

    #[tokio::test]
    async fn test_log_closed_without_game_over_is_ignored() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.send_log(&session, &log_line("Log file closed."));
        harness.settle().await;

        assert!(harness.sink.events().is_empty());
        assert_eq!(session.state(), super::super::SessionState::Active);
    }

    #[tokio::test]
    async fn test_game_over_then_log_closed_ends_match() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.send_log(&session, &connect_line(1));
        harness.send_log(
            &session,
            &log_line(&format!("{} changed role to \"medic\"", player_token(1, "Red"))),
        );
        harness.send_log(&session, &log_line("World triggered \"Game_Over\" reason \"Reached Win Limit\""));
        harness.send_log(&session, &log_line("Log file closed."));
        session.join().await;

        let ended: Vec<_> = harness
            .sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::MatchEnded { .. }))
            .collect();
        assert_eq!(ended.len(), 1);
        match &ended[0] {
            Event::MatchEnded { archive, class_times, .. } => {
                assert!(archive.as_deref().unwrap().ends_with("1.log"));
                assert!(class_times.contains_key(&harness.players[0].player));
            }
            _ => unreachable!(),
        }
        assert!(!harness.registry.contains(1));
        assert_eq!(session.state(), super::super::SessionState::Terminated);
        assert!(harness.server.commands().contains(&"say \"Lobby Ended.\"".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_game_over_waits_for_log_close() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.send_log(&session, &log_line("World triggered \"Game_Over\" reason \"Reached Win Limit\""));
        harness.settle().await;
        session.signal_stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        harness.send_log(&session, &log_line("Log file closed."));
        session.join().await;

        assert!(harness
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, Event::MatchEnded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_grace() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.send_log(&session, &log_line("World triggered \"Game_Over\" reason \"Reached Win Limit\""));
        harness.settle().await;
        session.signal_stop();
        session.join().await;

        assert!(harness.sink.events().is_empty());
        assert_eq!(session.state(), super::super::SessionState::Terminated);
    }
}
