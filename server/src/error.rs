//! Error types surfaced by the warden library.

use crate::rcon::RconError;
use shared::{MatchId, PlayerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Server doesn't exist (match #{0}).")]
    NoSuchSession(MatchId),

    #[error("A server is already set up for match #{0}.")]
    SessionExists(MatchId),

    #[error("Invalid Map Name: {0}")]
    InvalidMapName(String),

    #[error("Invalid League Name: {0}")]
    InvalidLeague(String),

    #[error("Config doesn't exist: {0}")]
    ConfigMissing(String),

    #[error("{reporter} has already reported {target}")]
    AlreadyReported { reporter: PlayerId, target: PlayerId },

    #[error("Server doesn't support log redirection. Make sure your server isn't blocking outgoing logs.")]
    LogRedirection,

    #[error(transparent)]
    Rcon(#[from] RconError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;
