//! Per-player, per-class time accounting.

use shared::{ClassTimes, PlayerClass, PlayerId};
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct PlaytimeTracker {
    running: HashMap<PlayerId, (PlayerClass, Instant)>,
    totals: HashMap<PlayerId, ClassTimes>,
}

impl PlaytimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, player: PlayerId, class: PlayerClass) {
        self.observe_at(player, class, Instant::now());
    }

    /// Credits the time since the player's previous observation to the class
    /// they were on, then restarts their clock on `class`.
    pub fn observe_at(&mut self, player: PlayerId, class: PlayerClass, at: Instant) {
        if let Some((previous, since)) = self.running.insert(player, (class, at)) {
            self.totals
                .entry(player)
                .or_default()
                .add(previous, at.saturating_duration_since(since));
        }
    }

    /// Stops the player's clock, e.g. on disconnect.
    pub fn pause_at(&mut self, player: PlayerId, at: Instant) {
        if let Some((class, since)) = self.running.remove(&player) {
            self.totals
                .entry(player)
                .or_default()
                .add(class, at.saturating_duration_since(since));
        }
    }

    pub fn snapshot(&self) -> HashMap<PlayerId, ClassTimes> {
        self.snapshot_at(Instant::now())
    }

    /// Totals including each running class up to `now`. Does not mutate.
    pub fn snapshot_at(&self, now: Instant) -> HashMap<PlayerId, ClassTimes> {
        let mut snapshot = self.totals.clone();
        for (player, (class, since)) in &self.running {
            snapshot
                .entry(*player)
                .or_default()
                .add(*class, now.saturating_duration_since(*since));
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::time::Duration;

    #[test]
    fn test_first_observation_is_baseline() {
        let mut tracker = PlaytimeTracker::new();
        let t0 = Instant::now();
        let p = PlayerId::from_account(1);

        tracker.observe_at(p, PlayerClass::Scout, t0);
        let snap = tracker.snapshot_at(t0);
        assert_eq!(snap[&p].total(), Duration::ZERO);
    }

    #[test]
    fn test_time_goes_to_previous_class() {
        let mut tracker = PlaytimeTracker::new();
        let t0 = Instant::now();
        let p = PlayerId::from_account(1);

        tracker.observe_at(p, PlayerClass::Scout, t0);
        tracker.observe_at(p, PlayerClass::Medic, t0 + Duration::from_secs(60));
        tracker.observe_at(p, PlayerClass::Scout, t0 + Duration::from_secs(90));

        let snap = tracker.snapshot_at(t0 + Duration::from_secs(100));
        assert_eq!(snap[&p].get(PlayerClass::Scout), Duration::from_secs(70));
        assert_eq!(snap[&p].get(PlayerClass::Medic), Duration::from_secs(30));
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let mut tracker = PlaytimeTracker::new();
        let t0 = Instant::now();
        let p = PlayerId::from_account(1);
        tracker.observe_at(p, PlayerClass::Demoman, t0);

        let first = tracker.snapshot_at(t0 + Duration::from_secs(10));
        let second = tracker.snapshot_at(t0 + Duration::from_secs(10));
        assert_eq!(first, second);
        assert_eq!(first[&p].get(PlayerClass::Demoman), Duration::from_secs(10));
    }

    #[test]
    fn test_pause_stops_clock() {
        let mut tracker = PlaytimeTracker::new();
        let t0 = Instant::now();
        let p = PlayerId::from_account(1);
        tracker.observe_at(p, PlayerClass::Spy, t0);
        tracker.pause_at(p, t0 + Duration::from_secs(5));

        let snap = tracker.snapshot_at(t0 + Duration::from_secs(50));
        assert_eq!(snap[&p].get(PlayerClass::Spy), Duration::from_secs(5));
    }

    #[test]
    fn test_fractional_seconds_accumulate() {
        let mut tracker = PlaytimeTracker::new();
        let t0 = Instant::now();
        let p = PlayerId::from_account(1);

        tracker.observe_at(p, PlayerClass::Sniper, t0);
        tracker.observe_at(p, PlayerClass::Engineer, t0 + Duration::from_millis(1250));
        let snap = tracker.snapshot_at(t0 + Duration::from_millis(4000));

        assert_approx_eq!(snap[&p].get(PlayerClass::Sniper).as_secs_f64(), 1.25, 1e-9);
        assert_approx_eq!(snap[&p].total().as_secs_f64(), 4.0, 1e-9);
    }
}
