//! Per-session allow-list.
//!
//! The roster answers admission questions locally so a connect or a `!rep`
//! does not need a backend round trip. It starts from the setup arguments
//! and follows `AllowPlayer`/`DisallowPlayer`. Players it knows nothing
//! about are referred to the [`Backend`](crate::backend::Backend).

use parking_lot::RwLock;
use shared::{PlayerId, RosterEntry, Team};
use std::collections::HashMap;

/// What the roster says about a player joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Banned,
    Replaced,
}

impl Admission {
    /// Kick reason shown to a player who may not join, if any.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Admission::Allowed => None,
            Admission::Banned => Some("You are banned from this lobby."),
            Admission::Replaced => Some("You have been replaced."),
        }
    }
}

#[derive(Debug, Clone)]
struct Seat {
    admission: Admission,
    entry: Option<RosterEntry>,
}

/// Seats by player, behind a lock so RPC calls and the session's event
/// task can share it.
#[derive(Debug, Default)]
pub struct Roster {
    seats: RwLock<HashMap<PlayerId, Seat>>,
}

impl Roster {
    /// Seats every entry, then applies bans on top.
    pub fn new(players: &[RosterEntry], banned: &[PlayerId]) -> Self {
        let roster = Roster::default();
        for entry in players {
            roster.allow(entry.clone());
        }
        for player in banned {
            roster.ban(*player);
        }
        roster
    }

    /// Seats a player, replacing any earlier admission or entry.
    pub fn allow(&self, entry: RosterEntry) {
        self.seats.write().insert(
            entry.player,
            Seat {
                admission: Admission::Allowed,
                entry: Some(entry),
            },
        );
    }

    /// Refuses `player` for the rest of the match.
    pub fn ban(&self, player: PlayerId) {
        self.set(player, Admission::Banned);
    }

    /// Marks a player replaced, keeping their seat for reference.
    pub fn replace(&self, player: PlayerId) {
        self.set(player, Admission::Replaced);
    }

    fn set(&self, player: PlayerId, admission: Admission) {
        self.seats
            .write()
            .entry(player)
            .and_modify(|seat| seat.admission = admission)
            .or_insert(Seat {
                admission,
                entry: None,
            });
    }

    /// `None` when the roster has no opinion about `player`.
    pub fn admission(&self, player: PlayerId) -> Option<Admission> {
        self.seats.read().get(&player).map(|seat| seat.admission)
    }

    /// Team, slot and name recorded for `player`.
    pub fn entry(&self, player: PlayerId) -> Option<RosterEntry> {
        self.seats.read().get(&player).and_then(|seat| seat.entry.clone())
    }

    /// Allowed player currently holding `slot` on `team`.
    pub fn occupant(&self, team: Team, slot: &str) -> Option<PlayerId> {
        self.seats
            .read()
            .values()
            .filter(|seat| seat.admission == Admission::Allowed)
            .filter_map(|seat| seat.entry.as_ref())
            .find(|entry| entry.team == team && entry.slot.eq_ignore_ascii_case(slot))
            .map(|entry| entry.player)
    }

    /// Players currently admitted, sorted.
    pub fn allowed(&self) -> Vec<PlayerId> {
        let mut players: Vec<_> = self
            .seats
            .read()
            .iter()
            .filter(|(_, seat)| seat.admission == Admission::Allowed)
            .map(|(player, _)| *player)
            .collect();
        players.sort();
        players
    }

    pub fn len(&self) -> usize {
        self.seats.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u32, team: Team, slot: &str) -> RosterEntry {
        RosterEntry {
            player: PlayerId::from_account(n),
            team,
            slot: slot.to_string(),
            name: format!("player{}", n),
        }
    }

    #[test]
    fn test_roster_admissions() {
        let roster = Roster::new(
            &[entry(1, Team::Red, "scout1"), entry(2, Team::Blu, "medic")],
            &[PlayerId::from_account(3)],
        );

        assert_eq!(roster.admission(PlayerId::from_account(1)), Some(Admission::Allowed));
        assert_eq!(roster.admission(PlayerId::from_account(3)), Some(Admission::Banned));
        assert_eq!(roster.admission(PlayerId::from_account(4)), None);
        assert_eq!(roster.len(), 3);
        assert_eq!(
            roster.allowed(),
            vec![PlayerId::from_account(1), PlayerId::from_account(2)]
        );
    }

    #[test]
    fn test_replace_frees_slot() {
        let roster = Roster::new(&[entry(1, Team::Red, "scout1")], &[]);
        assert_eq!(roster.occupant(Team::Red, "Scout1"), Some(PlayerId::from_account(1)));

        roster.replace(PlayerId::from_account(1));
        assert_eq!(roster.admission(PlayerId::from_account(1)), Some(Admission::Replaced));
        assert_eq!(roster.occupant(Team::Red, "scout1"), None);
        assert!(roster.entry(PlayerId::from_account(1)).is_some());

        roster.allow(entry(5, Team::Red, "scout1"));
        assert_eq!(roster.occupant(Team::Red, "scout1"), Some(PlayerId::from_account(5)));
    }

    #[test]
    fn test_reasons() {
        assert_eq!(Admission::Allowed.reason(), None);
        assert_eq!(Admission::Replaced.reason(), Some("You have been replaced."));
    }
}
