//! `!rep` and `!sub` handling.
//!
//! Votes are stored in the shared [`ReportLedger`](crate::ledger::ReportLedger).
//! The first vote against a slot opens a timer keyed by (team, slot); its
//! expiry comes back through the dispatcher's internal channel, so expiry,
//! new votes and quorum are all handled on the same task.

use super::dispatch::{Dispatcher, Internal, PendingReport};
use crate::chat::{ChatCommand, TeamArg, REP_USAGE, SUB_USAGE};
use crate::error::WardenError;
use crate::logline::PlayerData;
use log::{debug, info, warn};
use shared::{Event, PlayerId, Team};
use std::sync::Arc;
use std::time::Duration;

fn describe(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        60 => "1 minute".to_string(),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{} seconds", s),
    }
}

impl Dispatcher {
    pub(super) async fn on_chat(&mut self, player: PlayerData, text: &str) {
        let Some(command) = ChatCommand::parse(text) else {
            return;
        };
        let session = Arc::clone(&self.session);

        match command {
            ChatCommand::SubWithArgument => session.say(SUB_USAGE).await,
            ChatCommand::ReportUsage => session.say(REP_USAGE).await,
            ChatCommand::Sub => {
                if self.substitute(player.player, true) {
                    let name = session.name_of(player.player).await;
                    session.say(&format!("{} asked to be substituted.", name)).await;
                }
            }
            ChatCommand::Report { team, slot } => self.report(player, team, slot).await,
            ChatCommand::SoapOff => session.push_soap_off().await,
        }
    }

    /// Emits a substitution unless the player was already substituted.
    fn substitute(&mut self, player: PlayerId, self_requested: bool) -> bool {
        if !self.substituted.insert(player) {
            debug!("#{}: {} already substituted", self.session.match_id(), player);
            return false;
        }
        self.session.emit(Event::PlayerSubstituted {
            match_id: self.session.match_id(),
            player,
            self_requested,
        });
        true
    }

    async fn report(&mut self, reporter: PlayerData, team_arg: TeamArg, slot: String) {
        let session = Arc::clone(&self.session);
        let match_id = session.match_id();

        let Some(reporter_team) = session.team_of(reporter.player).await else {
            session.say("!rep: Only players in this lobby can report.").await;
            return;
        };
        let team = team_arg.resolve(reporter_team);
        let slot = slot.to_ascii_lowercase();

        let Some(target) = session.slot_occupant(team, &slot).await else {
            session.say("!rep: Unknown or empty slot").await;
            return;
        };

        if self.substituted.contains(&target)
            || session.deps.backend.is_reported(match_id, target).await
        {
            session.say("!rep: Already reported").await;
            return;
        }

        if target == reporter.player {
            self.substitute(target, true);
            let name = session.name_of(target).await;
            session.say(&format!("{} asked to be substituted.", name)).await;
            return;
        }

        let ledger = Arc::clone(&session.deps.ledger);
        if let Err(e) = ledger.record_vote(reporter.player, target, match_id) {
            if let WardenError::AlreadyReported { .. } = e {
                let name = session.name_of(target).await;
                session
                    .say(&format!("!rep: {} already reported {}", reporter.name, name))
                    .await;
            } else {
                warn!("#{}: couldn't record vote: {}", match_id, e);
            }
            return;
        }

        let votes = ledger.count_votes(target, match_id);
        let needed = session.settings.quorum.get(session.config.format);
        let name = session.name_of(target).await;
        let key = (team, slot.clone());

        if votes >= needed {
            if let Some(pending) = self.pending.remove(&key) {
                pending.timer.abort();
            }
            ledger.reset_votes(target, match_id);
            self.substitute(target, false);
            info!("#{}: {} reported by vote", match_id, name);
            session
                .say(&format!("Reporting {} {}: {}", team, slot, name))
                .await;
            return;
        }

        if votes == 1 {
            self.open_vote(team, slot, target);
        }
        session
            .say(&format!(
                "Got {} votes for reporting player {} ({} needed)",
                votes, name, needed
            ))
            .await;
    }

    /// Starts the timeout for the first vote against (team, slot).
    fn open_vote(&mut self, team: Team, slot: String, target: PlayerId) {
        self.next_token += 1;
        let token = self.next_token;
        let wait = self.session.settings.timings.report_timeout;
        let tx = self.internal_tx.clone();
        let expired = Internal::ReportExpired {
            team,
            slot: slot.clone(),
            token,
        };

        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            // The dispatcher may already be gone.
            let _ = tx.send(expired);
        });

        if let Some(old) = self
            .pending
            .insert((team, slot), PendingReport { target, token, timer })
        {
            old.timer.abort();
        }
    }

    /// Closes every open vote against `target` without announcing it.
    pub(super) fn cancel_reports(&mut self, target: PlayerId) {
        let keys: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.target == target)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(pending) = self.pending.remove(&key) {
                pending.timer.abort();
                debug!(
                    "#{}: cancelled vote on {} {}",
                    self.session.match_id(),
                    key.0,
                    key.1
                );
            }
        }
    }

    pub(super) async fn expire_report(&mut self, team: Team, slot: String, token: u64) {
        let key = (team, slot);
        match self.pending.get(&key) {
            Some(pending) if pending.token == token => {}
            _ => {
                debug!("#{}: ignoring stale report timer", self.session.match_id());
                return;
            }
        }
        let Some(pending) = self.pending.remove(&key) else {
            return;
        };

        let session = Arc::clone(&self.session);
        session
            .deps
            .ledger
            .reset_votes(pending.target, session.match_id());
        let (team, slot) = key;
        session
            .say(&format!(
                "Reporting {} {} failed, couldn't get enough !rep in {}.",
                team,
                slot,
                describe(session.settings.timings.report_timeout)
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{log_line, player_token, Harness};
    use shared::Format;
    use tokio::time::advance;

    fn say(n: u32, team: &str, text: &str) -> String {
        log_line(&format!("{} say \"{}\"", player_token(n, team), text))
    }

    fn substitutions(harness: &Harness) -> Vec<(PlayerId, bool)> {
        harness
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::PlayerSubstituted {
                    player,
                    self_requested,
                    ..
                } => Some((player, self_requested)),
                _ => None,
            })
            .collect()
    }

    // Harness rosters alternate teams: odd accounts are red, even are blu,
    // and account n sits in slot "slot{(n + 1) / 2}".

    #[test]
    fn test_describe() {
        assert_eq!(describe(Duration::from_secs(60)), "1 minute");
        assert_eq!(describe(Duration::from_secs(120)), "2 minutes");
        assert_eq!(describe(Duration::from_secs(45)), "45 seconds");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_fires_once() {
        // Sixes needs 5 votes
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;
        let target = harness.player(2).player;

        for reporter in [1, 3, 5, 7, 9] {
            harness.send_log(&session, &say(reporter, "Red", "!rep their slot1"));
        }
        // A sixth vote after quorum finds the target already substituted
        harness.send_log(&session, &say(11, "Red", "!rep their slot1"));
        harness.settle().await;

        assert_eq!(substitutions(&harness), vec![(target, false)]);
        assert_eq!(harness.ledger.count_votes(target, 1), 0);
        assert!(harness.server.said("Reporting blu slot1: player2"));
        assert!(harness.server.said("!rep: Already reported"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soapoff_pushes_config() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.send_log(&session, &say(4, "Blue", "!soapoff"));
        harness.settle().await;

        assert_eq!(harness.server.count_commands("exec_marker soap"), 1);
        assert!(substitutions(&harness).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_vote_refused() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;
        let target = harness.player(2).player;

        harness.send_log(&session, &say(1, "Red", "!rep their slot1"));
        harness.send_log(&session, &say(1, "Red", "!rep blu slot1"));
        harness.settle().await;

        assert_eq!(harness.ledger.count_votes(target, 1), 1);
        assert!(harness.server.said("!rep: player1 already reported player2"));
        assert!(substitutions(&harness).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_report_bypasses_ledger() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;
        let me = harness.player(1).player;

        harness.send_log(&session, &say(1, "Red", "!rep our slot1"));
        harness.settle().await;

        assert_eq!(substitutions(&harness), vec![(me, true)]);
        assert!(harness.ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resets_votes() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;
        let target = harness.player(2).player;

        harness.send_log(&session, &say(1, "Red", "!rep their slot1"));
        harness.send_log(&session, &say(3, "Red", "!rep their slot1"));
        harness.settle().await;
        assert_eq!(harness.ledger.count_votes(target, 1), 2);

        advance(Duration::from_secs(121)).await;
        harness.settle().await;

        assert_eq!(harness.ledger.count_votes(target, 1), 0);
        assert!(harness
            .server
            .said("Reporting blu slot1 failed, couldn't get enough !rep in 2 minutes."));

        // Voting can start over
        harness.send_log(&session, &say(1, "Red", "!rep their slot1"));
        harness.settle().await;
        assert_eq!(harness.ledger.count_votes(target, 1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_cancels_timer() {
        let mut harness = Harness::new(Format::Ultiduo);
        harness.set_quorum(Format::Ultiduo, 2);
        let session = harness.started_session().await;

        harness.send_log(&session, &say(1, "Red", "!rep their slot1"));
        harness.send_log(&session, &say(3, "Red", "!rep their slot1"));
        harness.settle().await;
        assert_eq!(substitutions(&harness).len(), 1);

        advance(Duration::from_secs(300)).await;
        harness.settle().await;
        assert!(!harness.server.said_containing("failed, couldn't get enough"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_usage_messages() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.send_log(&session, &say(1, "Red", "!sub their slot2"));
        harness.send_log(&session, &say(1, "Red", "!rep"));
        harness.send_log(&session, &say(1, "Red", "!rep red slot9"));
        harness.send_log(&session, &say(900, "Red", "!rep their slot1"));
        harness.settle().await;

        assert!(harness.server.said(SUB_USAGE));
        assert!(harness.server.said(REP_USAGE));
        assert!(harness.server.said("!rep: Unknown or empty slot"));
        assert!(harness.server.said("!rep: Only players in this lobby can report."));
        assert!(substitutions(&harness).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_is_immediate() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;
        let me = harness.player(4).player;

        harness.send_log(&session, &say(4, "Blue", "!sub"));
        harness.send_log(&session, &say(4, "Blue", "!sub"));
        harness.settle().await;

        assert_eq!(substitutions(&harness), vec![(me, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_team_say_is_ignored() {
        let harness = Harness::new(Format::Sixes);
        let session = harness.started_session().await;

        harness.send_log(
            &session,
            &log_line(&format!("{} say_team \"!sub\"", player_token(4, "Blue"))),
        );
        harness.settle().await;
        assert!(substitutions(&harness).is_empty());
    }
}
