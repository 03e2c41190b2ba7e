//! Periodic health and configuration checks.

use super::{stopped, Session, WhitelistSetting};
use log::{debug, error, info, warn};
use shared::Event;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};

/// Supervising loop: checks the server every verify interval until stop is
/// raised or the server is lost.
pub(super) async fn run(session: Arc<Session>) {
    let mut stop = session.stop_rx();
    let match_id = session.match_id();

    let probed = tokio::select! {
        healthy = probe(&session) => healthy,
        _ = stopped(&mut stop) => return,
    };
    if !probed {
        lose_server(&session);
        return;
    }

    let mut ticker = interval(session.settings.timings.verify_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut stop) => {
                debug!("#{}: verifier stopped", match_id);
                return;
            }
        }
        // A check in progress runs to completion so the link is left in a
        // usable state for teardown.
        if !verify(&session).await {
            if session.is_stopping() {
                debug!("#{}: server lost while stopping", match_id);
            } else {
                lose_server(&session);
            }
            return;
        }
    }
}

/// Makes sure the link works before the first tick.
async fn probe(session: &Session) -> bool {
    if session.link.query("status").await.is_ok() {
        return true;
    }
    reconnect(session).await
}

async fn reconnect(session: &Session) -> bool {
    let budget = session.settings.timings.health_reconnect;
    match session.link.reconnect(budget).await {
        Ok(()) => {
            info!("#{}: reconnected to {}", session.match_id(), session.link.host());
            true
        }
        Err(e) => {
            error!(
                "#{}: lost {} after {:?}: {}",
                session.match_id(),
                session.link.host(),
                budget,
                e
            );
            false
        }
    }
}

fn lose_server(session: &Session) {
    session.finish(Event::DisconnectedFromServer {
        match_id: session.match_id(),
    });
    session.signal_stop();
}

/// One health check. Returns false when the server is gone for good.
async fn verify(session: &Session) -> bool {
    let match_id = session.match_id();
    let expected = &session.config.info.server_password;

    match session.link.server_password().await {
        Ok(actual) if &actual == expected => {}
        Ok(_) => {
            info!("#{}: server password drifted, restoring", match_id);
            if let Err(e) = session.link.set_server_password(expected).await {
                warn!("#{}: couldn't restore password: {}", match_id, e);
            }
        }
        Err(e) => {
            warn!("#{}: health check failed: {}", match_id, e);
            if !reconnect(session).await {
                return false;
            }
            if let Err(e) = session.link.set_server_password(expected).await {
                warn!("#{}: couldn't restore password: {}", match_id, e);
            }
        }
    }

    check_whitelist(session).await;

    match session.link.players().await {
        Ok(players) => session.emit(Event::RosterSnapshot {
            match_id,
            players: players.into_iter().map(|p| p.player).collect(),
        }),
        Err(e) => debug!("#{}: status failed: {}", match_id, e),
    }
    true
}

async fn check_whitelist(session: &Session) {
    let (cvar, value) = match session.whitelist() {
        WhitelistSetting::Plugin(id) => ("tftrue_whitelist_id", id),
        WhitelistSetting::File(file) => ("mp_tournament_whitelist", file),
        WhitelistSetting::Unset => return,
    };
    match session.link.cvar(cvar).await {
        Ok(actual) if actual == value => {}
        Ok(actual) => {
            info!("#{}: {} drifted to {:?}, restoring", session.match_id(), cvar, actual);
            if let Err(e) = session.link.set_cvar(cvar, &value).await {
                warn!("#{}: couldn't restore {}: {}", session.match_id(), cvar, e);
            }
        }
        Err(e) => debug!("#{}: couldn't read {}: {}", session.match_id(), cvar, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::testing::Harness;
    use shared::{Format, PlayerId};
    use std::time::Duration;
    use tokio::time::sleep;

    fn fast(harness: &mut Harness) {
        harness.set_timings(|t| {
            t.verify_interval = Duration::from_secs(10);
            t.health_reconnect = Duration::from_secs(20);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_restores_password_and_snapshots() {
        let mut harness = Harness::new(Format::Sixes);
        fast(&mut harness);
        let session = harness.started_session().await;
        harness.server.add_player(7, "player1", PlayerId::from_account(1));

        harness.server.set_cvar("sv_password", "");
        harness.server.set_cvar("tftrue_whitelist_id", "other");
        sleep(Duration::from_secs(11)).await;
        harness.settle().await;

        assert_eq!(harness.server.cvar("sv_password").as_deref(), Some("serverpw"));
        assert_eq!(harness.server.cvar("tftrue_whitelist_id").as_deref(), Some("ugc_6v6"));
        let snapshots: Vec<_> = harness
            .sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::RosterSnapshot { .. }))
            .collect();
        assert_eq!(
            snapshots[0],
            Event::RosterSnapshot {
                match_id: 1,
                players: vec![PlayerId::from_account(1)]
            }
        );
        session.signal_stop();
        session.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_server_ends_session() {
        let mut harness = Harness::new(Format::Sixes);
        fast(&mut harness);
        let session = harness.started_session().await;

        harness.server.set_reachable(false);
        harness.server.disconnect_all();
        session.join().await;

        let disconnects = harness
            .sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::DisconnectedFromServer { .. }))
            .count();
        assert_eq!(disconnects, 1);
        assert!(session.is_ended());
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!harness.registry.contains(1));
        assert!(harness.router.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_check() {
        let mut harness = Harness::new(Format::Sixes);
        fast(&mut harness);
        let session = harness.started_session().await;

        // The tick at 10s finds the link dead and starts reconnecting
        harness.server.set_reachable(false);
        harness.server.disconnect_all();
        sleep(Duration::from_millis(10_500)).await;

        session.signal_stop();
        harness.server.set_reachable(true);
        session.join().await;

        assert_eq!(harness.server.connection_count(), 2);
        assert!(harness.server.said("Lobby Ended."));
        assert!(!session.is_ended());
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let mut harness = Harness::new(Format::Sixes);
        fast(&mut harness);
        let session = harness.started_session().await;

        harness.server.disconnect_all();
        sleep(Duration::from_secs(11)).await;
        harness.settle().await;

        assert!(!session.is_ended());
        assert_eq!(harness.server.connection_count(), 2);
        session.signal_stop();
        session.join().await;
        assert!(harness.sink.events().iter().all(|e| !matches!(e, Event::DisconnectedFromServer { .. })));
    }
}
