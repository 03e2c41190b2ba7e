//! Remote control channel to a game server.
//!
//! [`Connector`] and [`Rcon`] are the transport seam: a connector opens an
//! authenticated connection, a connection executes one command at a time.
//! [`RconLink`] is what sessions hold. It owns at most one live connection,
//! knows how to reconnect within a time budget, and layers the game-specific
//! commands (say, kick, changelevel, cvar queries) on top of raw `exec`.
//!
//! [`TcpConnector`] speaks the Source RCON protocol over TCP.

use crate::retry::Backoff;
use async_trait::async_trait;
use log::{debug, info, warn};
use shared::PlayerId;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Largest command body the protocol carries.
pub const MAX_BODY_LEN: usize = 4096;

const SERVERDATA_AUTH: i32 = 3;
const SERVERDATA_AUTH_RESPONSE: i32 = 2;
const SERVERDATA_EXECCOMMAND: i32 = 2;
const SERVERDATA_RESPONSE_VALUE: i32 = 0;

#[derive(Debug, Error)]
pub enum RconError {
    #[error("Couldn't connect to the server: Connection timed out.")]
    Timeout,

    #[error("Couldn't connect to the server: Connection Refused.")]
    ConnectionRefused,

    #[error("Authentication Failed. Please check your RCON Address/Password.")]
    AuthFailed,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("RCON connection is closed")]
    Closed,

    #[error("RCON protocol error: {0}")]
    Protocol(String),

    #[error("RCON I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RconError {
    /// True when the error means the connection itself is unusable.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RconError::UnknownCommand(_))
    }
}

/// One authenticated connection.
#[async_trait]
pub trait Rcon: Send {
    /// Executes a command and returns the server's textual response.
    async fn exec(&mut self, command: &str) -> Result<String, RconError>;

    async fn close(&mut self);
}

/// Opens authenticated connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, password: &str) -> Result<Box<dyn Rcon>, RconError>;
}

/// A player line from `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlinePlayer {
    pub user_id: u32,
    pub name: String,
    pub player: PlayerId,
}

/// Extracts the value from a cvar query response such as
/// `"sv_password" = "secret" ( def. "" )`.
pub fn parse_cvar_value(response: &str) -> Option<String> {
    let line = response.lines().find(|line| line.contains("\" = \""))?;
    let rest = &line[line.find("\" = \"")? + 5..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Parses the player table out of `status` output. Bots and malformed lines
/// are skipped.
pub fn parse_status(response: &str) -> Vec<OnlinePlayer> {
    response
        .lines()
        .filter_map(|line| {
            let line = line.trim().strip_prefix('#')?;
            let open = line.find('"')?;
            let close = line.rfind('"')?;
            if close <= open {
                return None;
            }
            let user_id = line[..open].trim().parse().ok()?;
            let name = line[open + 1..close].to_string();
            let player = line[close + 1..].split_whitespace().next()?.parse().ok()?;
            Some(OnlinePlayer {
                user_id,
                name,
                player,
            })
        })
        .collect()
}

fn quote(text: &str) -> String {
    text.replace('"', "'")
}

/// Session-owned handle to a game server's control channel.
pub struct RconLink {
    host: String,
    password: String,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    conn: Mutex<Option<Box<dyn Rcon>>>,
}

impl RconLink {
    pub fn new(host: &str, password: &str, connector: Arc<dyn Connector>, backoff: Backoff) -> Self {
        Self {
            host: host.to_string(),
            password: password.to_string(),
            connector,
            backoff,
            conn: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Single connection attempt, replacing any existing connection.
    pub async fn connect(&self) -> Result<(), RconError> {
        let fresh = self.connector.connect(&self.host, &self.password).await?;
        let mut conn = self.conn.lock().await;
        if let Some(mut old) = conn.replace(fresh) {
            old.close().await;
        }
        Ok(())
    }

    /// Drops the current connection and reconnects, retrying with backoff
    /// until `budget` is spent.
    pub async fn reconnect(&self, budget: Duration) -> Result<(), RconError> {
        let mut conn = self.conn.lock().await;
        if let Some(mut old) = conn.take() {
            old.close().await;
        }

        info!("Reconnecting to {} (budget {:?})", self.host, budget);
        let fresh = self
            .backoff
            .retry_within(budget, |attempt| {
                debug!("Connecting to {} (attempt {})", self.host, attempt);
                self.connector.connect(&self.host, &self.password)
            })
            .await?;
        *conn = Some(fresh);
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(mut old) = self.conn.lock().await.take() {
            old.close().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    pub async fn query(&self, command: &str) -> Result<String, RconError> {
        let mut conn = self.conn.lock().await;
        match conn.as_mut() {
            Some(c) => c.exec(command).await,
            None => Err(RconError::Closed),
        }
    }

    pub async fn say(&self, text: &str) -> Result<(), RconError> {
        self.query(&format!("say \"{}\"", quote(text))).await.map(|_| ())
    }

    pub async fn kick_user_id(&self, user_id: u32, reason: &str) -> Result<(), RconError> {
        self.query(&format!("kickid {} \"{}\"", user_id, quote(reason)))
            .await
            .map(|_| ())
    }

    pub async fn kick_all(&self) -> Result<(), RconError> {
        self.query("kickall").await.map(|_| ())
    }

    pub async fn change_map(&self, map: &str) -> Result<(), RconError> {
        self.query(&format!("changelevel {}", map)).await.map(|_| ())
    }

    pub async fn cvar(&self, name: &str) -> Result<String, RconError> {
        let response = self.query(name).await?;
        parse_cvar_value(&response)
            .ok_or_else(|| RconError::Protocol(format!("no value for cvar {}", name)))
    }

    pub async fn set_cvar(&self, name: &str, value: &str) -> Result<(), RconError> {
        self.query(&format!("{} \"{}\"", name, quote(value)))
            .await
            .map(|_| ())
    }

    pub async fn server_password(&self) -> Result<String, RconError> {
        self.cvar("sv_password").await
    }

    pub async fn set_server_password(&self, password: &str) -> Result<(), RconError> {
        self.set_cvar("sv_password", password).await
    }

    pub async fn players(&self) -> Result<Vec<OnlinePlayer>, RconError> {
        Ok(parse_status(&self.query("status").await?))
    }
}

/// Opens [`SourceRcon`] connections over TCP.
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, password: &str) -> Result<Box<dyn Rcon>, RconError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(host)).await {
            Err(_) => return Err(RconError::Timeout),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(RconError::ConnectionRefused)
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => return Err(RconError::Timeout),
            Ok(Err(e)) => return Err(RconError::Io(e)),
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;

        let mut conn = SourceRcon {
            stream,
            next_id: 1,
            command_timeout: self.command_timeout,
        };
        timeout(self.connect_timeout, conn.authenticate(password))
            .await
            .map_err(|_| RconError::Timeout)??;
        debug!("Authenticated with {}", host);
        Ok(Box::new(conn))
    }
}

/// Source RCON connection: little-endian `size | id | type | body\0 | \0`
/// packets over a single TCP stream.
pub struct SourceRcon {
    stream: TcpStream,
    next_id: i32,
    command_timeout: Duration,
}

impl SourceRcon {
    fn take_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    async fn write_packet(&mut self, id: i32, kind: i32, body: &str) -> Result<(), RconError> {
        let size = (body.len() + 10) as i32;
        let mut packet = Vec::with_capacity(body.len() + 14);
        packet.extend_from_slice(&size.to_le_bytes());
        packet.extend_from_slice(&id.to_le_bytes());
        packet.extend_from_slice(&kind.to_le_bytes());
        packet.extend_from_slice(body.as_bytes());
        packet.extend_from_slice(&[0, 0]);
        self.stream.write_all(&packet).await?;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<(i32, i32, String), RconError> {
        let size = self.stream.read_i32_le().await?;
        if !(10..=(MAX_BODY_LEN as i32 + 10)).contains(&size) {
            return Err(RconError::Protocol(format!("bad packet size {}", size)));
        }
        let mut buf = vec![0u8; size as usize];
        self.stream.read_exact(&mut buf).await?;

        let id = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let kind = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let body = String::from_utf8_lossy(&buf[8..buf.len() - 2]).into_owned();
        Ok((id, kind, body))
    }

    async fn authenticate(&mut self, password: &str) -> Result<(), RconError> {
        let id = self.take_id();
        self.write_packet(id, SERVERDATA_AUTH, password).await?;

        // An empty RESPONSE_VALUE precedes the AUTH_RESPONSE.
        loop {
            let (reply_id, kind, _) = self.read_packet().await?;
            if kind != SERVERDATA_AUTH_RESPONSE {
                continue;
            }
            return if reply_id == -1 {
                Err(RconError::AuthFailed)
            } else if reply_id == id {
                Ok(())
            } else {
                Err(RconError::Protocol(format!("unexpected auth id {}", reply_id)))
            };
        }
    }

    async fn exec_inner(&mut self, command: &str) -> Result<String, RconError> {
        let id = self.take_id();
        let marker = self.take_id();
        self.write_packet(id, SERVERDATA_EXECCOMMAND, command).await?;
        // The server answers an empty RESPONSE_VALUE only after the command's
        // output, so its echo marks the end of a multi-packet response.
        self.write_packet(marker, SERVERDATA_RESPONSE_VALUE, "").await?;

        let mut response = String::new();
        loop {
            let (reply_id, _, body) = self.read_packet().await?;
            if reply_id == marker {
                break;
            }
            if reply_id == id {
                response.push_str(&body);
            }
        }

        if response.starts_with("Unknown command") {
            return Err(RconError::UnknownCommand(command.to_string()));
        }
        Ok(response)
    }
}

#[async_trait]
impl Rcon for SourceRcon {
    async fn exec(&mut self, command: &str) -> Result<String, RconError> {
        if command.len() > MAX_BODY_LEN {
            return Err(RconError::Protocol(format!(
                "command of {} bytes is too long",
                command.len()
            )));
        }
        timeout(self.command_timeout, self.exec_inner(command))
            .await
            .map_err(|_| RconError::Timeout)?
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            warn!("Error closing RCON stream: {}", e);
        }
    }
}
