//! # Match Warden Library
//!
//! This library supervises the game servers a matchmaking backend hands out
//! for competitive matches. For every active match it keeps one session that
//! provisions the server over RCON, follows the server's log stream, enforces
//! the lobby roster, runs player-driven substitution votes and reports what
//! happened back to the backend as events.
//!
//! ## Core Responsibilities
//!
//! ### Provisioning
//! A new session kicks everyone off the server, sets the join password and
//! item whitelist, changes to the match map, points the server's logs at the
//! warden and executes the config sequence for the match's format and league.
//!
//! ### Log Following
//! Game servers stream their logs over UDP. Each session owns a random log
//! secret; the [`listener`] routes signed packets to the session that owns
//! the secret, and the session parses them in order ([`logline`]).
//!
//! ### Roster Enforcement
//! Players who are not part of the lobby, were banned or were replaced are
//! kicked as soon as they connect ([`roster`], [`backend`]).
//!
//! ### Substitution Votes
//! `!rep` and `!sub` chat commands are handled per session; votes are stored
//! in a process-wide [`ledger`] so a quorum needs distinct reporters.
//!
//! ### Health Checks
//! A verifier re-asserts the server password and whitelist on a fixed
//! interval, publishes roster snapshots and gives the server up after a
//! bounded reconnect budget.
//!
//! ## Module Organization
//!
//! - [`rcon`]: Source RCON transport and the session-facing [`rcon::RconLink`]
//! - [`configs`], [`exec`]: config file resolution and execution
//! - [`session`]: the per-match lifecycle
//! - [`registry`]: active sessions by match id
//! - [`rpc`]: the request/reply surface the backend talks to
//! - [`settings`]: command line and environment configuration
//! - `testing`: in-process fakes used by the test suites (`testing` feature)
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warden::listener::LogRouter;
//! use warden::rcon::TcpConnector;
//! use warden::rpc::{serve, Warden};
//! use warden::settings::SessionSettings;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Arc::new(LogRouter::new(false));
//!     let warden = Arc::new(Warden::new(
//!         Arc::new(SessionSettings::default()),
//!         Arc::new(TcpConnector::default()),
//!         router,
//!         None,
//!     ));
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8001").await?;
//!     serve(listener, warden).await?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod backend;
pub mod chat;
pub mod configs;
pub mod error;
pub mod events;
pub mod exec;
pub mod ledger;
pub mod listener;
pub mod logline;
pub mod playtime;
pub mod rcon;
pub mod registry;
pub mod retry;
pub mod roster;
pub mod rpc;
pub mod session;
pub mod settings;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
