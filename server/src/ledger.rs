//! Store of `!rep` votes shared by every session.
//!
//! A vote is a (reporter, target, match) triple. Sessions record votes as
//! chat commands arrive and count them against the format's quorum; the
//! triple is unique, so one player can only push a target one step closer to
//! substitution per match. Votes are dropped when a target is substituted,
//! when the vote window for a slot expires and when the match is torn down.

use crate::error::{Result, WardenError};
use parking_lot::Mutex;
use shared::{MatchId, PlayerId};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Vote {
    reporter: PlayerId,
    target: PlayerId,
    match_id: MatchId,
}

/// Set of (reporter, target, match) votes.
#[derive(Debug, Default)]
pub struct ReportLedger {
    votes: Mutex<HashSet<Vote>>,
}

impl ReportLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a vote, rejecting a reporter who already voted for `target`.
    pub fn record_vote(&self, reporter: PlayerId, target: PlayerId, match_id: MatchId) -> Result<()> {
        let vote = Vote {
            reporter,
            target,
            match_id,
        };
        if !self.votes.lock().insert(vote) {
            return Err(WardenError::AlreadyReported { reporter, target });
        }
        Ok(())
    }

    /// Number of distinct reporters currently voting against `target`.
    pub fn count_votes(&self, target: PlayerId, match_id: MatchId) -> usize {
        self.votes
            .lock()
            .iter()
            .filter(|v| v.target == target && v.match_id == match_id)
            .count()
    }

    /// Whether `reporter` already has a vote against `target` in this match.
    pub fn has_voted(&self, reporter: PlayerId, target: PlayerId, match_id: MatchId) -> bool {
        self.votes.lock().contains(&Vote {
            reporter,
            target,
            match_id,
        })
    }

    /// Whether any vote against `target` is open in this match.
    pub fn is_reported(&self, target: PlayerId, match_id: MatchId) -> bool {
        self.votes
            .lock()
            .iter()
            .any(|v| v.target == target && v.match_id == match_id)
    }

    /// Drops every vote against `target` in this match.
    ///
    /// Called when the target is substituted, when the vote window expires
    /// and when the backend allows or disallows the player again.
    pub fn reset_votes(&self, target: PlayerId, match_id: MatchId) {
        self.votes
            .lock()
            .retain(|v| !(v.target == target && v.match_id == match_id));
    }

    /// Drops every vote of a match, on teardown.
    pub fn clear_match(&self, match_id: MatchId) {
        self.votes.lock().retain(|v| v.match_id != match_id);
    }

    pub fn len(&self) -> usize {
        self.votes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.lock().is_empty()
    }
}
