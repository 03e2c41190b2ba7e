//! Queries a session makes against the matchmaking backend.
//!
//! [`LobbyBook`] is the in-process implementation. It is populated by the RPC
//! surface from the same setup, allow and disallow calls the backend issues,
//! so the warden can answer roster questions without calling back out.

use async_trait::async_trait;
use parking_lot::RwLock;
use shared::{MatchId, PlayerId, RosterEntry, Team};
use std::collections::{HashMap, HashSet};

/// Lobby questions a session cannot answer from its own roster.
///
/// Every method is scoped to a match. Implementations must be cheap to call
/// from a session's event task, which awaits them inline.
#[async_trait]
pub trait Backend: Send + Sync {
    /// `Err` carries the reason shown to a player who may not join.
    async fn is_allowed(&self, match_id: MatchId, player: PlayerId) -> Result<(), String>;

    /// Team a lobby member plays on.
    async fn team_of(&self, match_id: MatchId, player: PlayerId) -> Option<Team>;

    /// Member seated in `slot` on `team`. Slots compare case-insensitively.
    async fn slot_occupant(&self, match_id: MatchId, team: Team, slot: &str) -> Option<PlayerId>;

    /// Display name for chat messages.
    async fn name_of(&self, match_id: MatchId, player: PlayerId) -> Option<String>;

    /// True once a player has been substituted out of the match.
    async fn is_reported(&self, match_id: MatchId, player: PlayerId) -> bool;

    /// Records the log secret the session registered, for diagnostics.
    async fn set_secret(&self, match_id: MatchId, secret: u64);

    /// Called once the session for `match_id` has been torn down.
    async fn release(&self, _match_id: MatchId) {}
}

#[derive(Debug, Default)]
struct Lobby {
    players: HashMap<PlayerId, RosterEntry>,
    reported: HashSet<PlayerId>,
    secret: Option<u64>,
}

/// Lobbies by match id, kept in memory.
#[derive(Debug, Default)]
pub struct LobbyBook {
    lobbies: RwLock<HashMap<MatchId, Lobby>>,
}

impl LobbyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a lobby from the setup roster, replacing any previous one.
    pub fn register(&self, match_id: MatchId, players: &[RosterEntry]) {
        let lobby = Lobby {
            players: players.iter().map(|e| (e.player, e.clone())).collect(),
            ..Lobby::default()
        };
        self.lobbies.write().insert(match_id, lobby);
    }

    /// Seats or re-seats a player and clears their reported mark.
    pub fn upsert(&self, match_id: MatchId, entry: RosterEntry) {
        let mut lobbies = self.lobbies.write();
        let lobby = lobbies.entry(match_id).or_default();
        lobby.reported.remove(&entry.player);
        lobby.players.insert(entry.player, entry);
    }

    /// Removes a player from their seat and marks them reported.
    pub fn disallow(&self, match_id: MatchId, player: PlayerId) {
        if let Some(lobby) = self.lobbies.write().get_mut(&match_id) {
            lobby.players.remove(&player);
            lobby.reported.insert(player);
        }
    }

    /// Drops the lobby when its session ends or setup fails.
    pub fn forget(&self, match_id: MatchId) {
        self.lobbies.write().remove(&match_id);
    }

    pub fn secret(&self, match_id: MatchId) -> Option<u64> {
        self.lobbies.read().get(&match_id).and_then(|l| l.secret)
    }

    pub fn contains(&self, match_id: MatchId) -> bool {
        self.lobbies.read().contains_key(&match_id)
    }
}

#[async_trait]
impl Backend for LobbyBook {
    async fn is_allowed(&self, match_id: MatchId, player: PlayerId) -> Result<(), String> {
        let lobbies = self.lobbies.read();
        let lobby = lobbies
            .get(&match_id)
            .ok_or_else(|| "The lobby hasn't started yet.".to_string())?;
        if lobby.players.contains_key(&player) {
            Ok(())
        } else {
            Err("You're not in this lobby.".to_string())
        }
    }

    async fn team_of(&self, match_id: MatchId, player: PlayerId) -> Option<Team> {
        let lobbies = self.lobbies.read();
        lobbies.get(&match_id)?.players.get(&player).map(|e| e.team)
    }

    async fn slot_occupant(&self, match_id: MatchId, team: Team, slot: &str) -> Option<PlayerId> {
        let lobbies = self.lobbies.read();
        lobbies
            .get(&match_id)?
            .players
            .values()
            .find(|e| e.team == team && e.slot.eq_ignore_ascii_case(slot))
            .map(|e| e.player)
    }

    async fn name_of(&self, match_id: MatchId, player: PlayerId) -> Option<String> {
        let lobbies = self.lobbies.read();
        lobbies
            .get(&match_id)?
            .players
            .get(&player)
            .map(|e| e.name.clone())
    }

    async fn is_reported(&self, match_id: MatchId, player: PlayerId) -> bool {
        self.lobbies
            .read()
            .get(&match_id)
            .map(|l| l.reported.contains(&player))
            .unwrap_or(false)
    }

    async fn set_secret(&self, match_id: MatchId, secret: u64) {
        self.lobbies.write().entry(match_id).or_default().secret = Some(secret);
    }

    async fn release(&self, match_id: MatchId) {
        self.forget(match_id);
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

    #[tokio::test]
    async fn test_is_allowed_reasons() {
        let book = LobbyBook::new();
        let p1 = PlayerId::from_account(1);
        assert_eq!(
            book.is_allowed(7, p1).await,
            Err("The lobby hasn't started yet.".to_string())
        );

        book.register(7, &[entry(1, Team::Red, "medic")]);
        assert_eq!(book.is_allowed(7, p1).await, Ok(()));
        assert_eq!(
            book.is_allowed(7, PlayerId::from_account(2)).await,
            Err("You're not in this lobby.".to_string())
        );
    }

    #[tokio::test]
    async fn test_slots_and_teams() {
        let book = LobbyBook::new();
        book.register(7, &[entry(1, Team::Red, "medic"), entry(2, Team::Blu, "medic")]);

        assert_eq!(book.team_of(7, PlayerId::from_account(2)).await, Some(Team::Blu));
        assert_eq!(
            book.slot_occupant(7, Team::Red, "Medic").await,
            Some(PlayerId::from_account(1))
        );
        assert_eq!(book.slot_occupant(7, Team::Red, "scout1").await, None);
        assert_eq!(
            book.name_of(7, PlayerId::from_account(1)).await.as_deref(),
            Some("player1")
        );
    }

    #[tokio::test]
    async fn test_disallow_marks_reported() {
        let book = LobbyBook::new();
        let p1 = PlayerId::from_account(1);
        book.register(7, &[entry(1, Team::Red, "medic")]);

        book.disallow(7, p1);
        assert!(book.is_reported(7, p1).await);
        assert!(book.is_allowed(7, p1).await.is_err());
        assert_eq!(book.slot_occupant(7, Team::Red, "medic").await, None);

        book.upsert(7, entry(1, Team::Blu, "scout1"));
        assert!(!book.is_reported(7, p1).await);
    }

    #[tokio::test]
    async fn test_secret_roundtrip() {
        let book = LobbyBook::new();
        book.register(3, &[]);
        book.set_secret(3, 424242).await;
        assert_eq!(book.secret(3), Some(424242));

        book.forget(3);
        assert!(!book.contains(3));
    }
}
