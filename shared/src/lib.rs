use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Offset between a 32-bit account id and its 64-bit community id.
pub const STEAM_ID_BASE: u64 = 76_561_197_960_265_728;
/// Largest frame accepted on the RPC socket.
pub const MAX_FRAME_LEN: usize = 1 << 20;

pub type MatchId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

/// 64-bit community id of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u64);

impl PlayerId {
    pub fn from_account(account: u32) -> Self {
        PlayerId(STEAM_ID_BASE + account as u64)
    }

    pub fn account(&self) -> u32 {
        self.0.saturating_sub(STEAM_ID_BASE) as u32
    }

    /// The `[U:1:N]` form used in server logs and `status` output.
    pub fn steam3(&self) -> String {
        format!("[U:1:{}]", self.account())
    }

    fn parse_steam3(s: &str) -> Option<Self> {
        let inner = s.strip_prefix("[U:1:")?.strip_suffix(']')?;
        inner.parse::<u32>().ok().map(PlayerId::from_account)
    }

    fn parse_steam2(s: &str) -> Option<Self> {
        let mut parts = s.strip_prefix("STEAM_")?.split(':');
        let _universe = parts.next()?;
        let y: u64 = parts.next()?.parse().ok()?;
        let z: u64 = parts.next()?.parse().ok()?;
        if y > 1 || parts.next().is_some() {
            return None;
        }
        let account = z.checked_mul(2)?.checked_add(y)?;
        if account > u32::MAX as u64 {
            return None;
        }
        Some(PlayerId(STEAM_ID_BASE + account))
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlayerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(id) = Self::parse_steam3(s).or_else(|| Self::parse_steam2(s)) {
            return Ok(id);
        }
        match s.parse::<u64>() {
            Ok(id) if id > STEAM_ID_BASE => Ok(PlayerId(id)),
            _ => Err(ParseError(format!("not a player id: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Format {
    Sixes,
    Highlander,
    Fours,
    Ultiduo,
    Bball,
    Debug,
}

impl Format {
    pub const ALL: [Format; 6] = [
        Format::Sixes,
        Format::Highlander,
        Format::Fours,
        Format::Ultiduo,
        Format::Bball,
        Format::Debug,
    ];

    /// Name used in config file paths.
    pub fn name(&self) -> &'static str {
        match self {
            Format::Sixes => "sixes",
            Format::Highlander => "highlander",
            Format::Fours => "fours",
            Format::Ultiduo => "ultiduo",
            Format::Bball => "bball",
            Format::Debug => "debug",
        }
    }

    pub fn team_size(&self) -> usize {
        match self {
            Format::Sixes => 6,
            Format::Highlander => 9,
            Format::Fours => 4,
            Format::Ultiduo | Format::Bball => 2,
            Format::Debug => 1,
        }
    }

    /// Players needed on the server for a full match.
    pub fn roster_size(&self) -> usize {
        self.team_size() * 2
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sixes" | "6v6" => Ok(Format::Sixes),
            "highlander" | "9v9" | "hl" => Ok(Format::Highlander),
            "fours" | "4v4" => Ok(Format::Fours),
            "ultiduo" => Ok(Format::Ultiduo),
            "bball" => Ok(Format::Bball),
            "debug" => Ok(Format::Debug),
            other => Err(ParseError(format!("unknown format: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Team {
    Red,
    Blu,
}

impl Team {
    pub fn opposite(&self) -> Team {
        match self {
            Team::Red => Team::Blu,
            Team::Blu => Team::Red,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Red => "red",
            Team::Blu => "blu",
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Team {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "red" => Ok(Team::Red),
            "blu" | "blue" => Ok(Team::Blu),
            other => Err(ParseError(format!("unknown team: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlayerClass {
    Scout,
    Soldier,
    Pyro,
    Demoman,
    Heavy,
    Engineer,
    Medic,
    Sniper,
    Spy,
}

impl FromStr for PlayerClass {
    type Err = ParseError;

    /// Accepts the names the game writes into its logs.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scout" => Ok(PlayerClass::Scout),
            "soldier" => Ok(PlayerClass::Soldier),
            "pyro" => Ok(PlayerClass::Pyro),
            "demoman" => Ok(PlayerClass::Demoman),
            "heavyweapons" | "heavy" => Ok(PlayerClass::Heavy),
            "engineer" => Ok(PlayerClass::Engineer),
            "medic" => Ok(PlayerClass::Medic),
            "sniper" => Ok(PlayerClass::Sniper),
            "spy" => Ok(PlayerClass::Spy),
            other => Err(ParseError(format!("unknown class: {}", other))),
        }
    }
}

/// Time a player spent on each class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassTimes {
    pub times: BTreeMap<PlayerClass, Duration>,
}

impl ClassTimes {
    pub fn add(&mut self, class: PlayerClass, played: Duration) {
        *self.times.entry(class).or_default() += played;
    }

    pub fn get(&self, class: PlayerClass) -> Duration {
        self.times.get(&class).copied().unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.times.values().sum()
    }
}

/// Outbound notification for the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PlayerConnected {
        match_id: MatchId,
        player: PlayerId,
    },
    PlayerDisconnected {
        match_id: MatchId,
        player: PlayerId,
    },
    PlayerSubstituted {
        match_id: MatchId,
        player: PlayerId,
        self_requested: bool,
    },
    MatchEnded {
        match_id: MatchId,
        log_id: Option<u64>,
        archive: Option<String>,
        class_times: HashMap<PlayerId, ClassTimes>,
    },
    DisconnectedFromServer {
        match_id: MatchId,
    },
    RosterSnapshot {
        match_id: MatchId,
        players: Vec<PlayerId>,
    },
}

impl Event {
    pub fn match_id(&self) -> MatchId {
        match self {
            Event::PlayerConnected { match_id, .. }
            | Event::PlayerDisconnected { match_id, .. }
            | Event::PlayerSubstituted { match_id, .. }
            | Event::MatchEnded { match_id, .. }
            | Event::DisconnectedFromServer { match_id }
            | Event::RosterSnapshot { match_id, .. } => *match_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::PlayerConnected { .. } => "playerConn",
            Event::PlayerDisconnected { .. } => "playerDisc",
            Event::PlayerSubstituted { .. } => "playerSub",
            Event::MatchEnded { .. } => "matchEnded",
            Event::DisconnectedFromServer { .. } => "discFromServer",
            Event::RosterSnapshot { .. } => "rosterSnapshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub host: String,
    pub rcon_password: String,
    pub server_password: String,
}

/// A player's seat in a lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub player: PlayerId,
    pub team: Team,
    pub slot: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupArgs {
    pub match_id: MatchId,
    pub info: ServerInfo,
    pub format: Format,
    pub league: String,
    pub whitelist: String,
    pub map: String,
    pub players: Vec<RosterEntry>,
    pub banned: Vec<PlayerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    VerifyInfo { info: ServerInfo },
    SetupServer(SetupArgs),
    ReExecConfig { match_id: MatchId, change_map: bool },
    End { match_id: MatchId },
    AllowPlayer { match_id: MatchId, entry: RosterEntry },
    DisallowPlayer { match_id: MatchId, player: PlayerId },
    Say { match_id: MatchId, text: String },
    Exists { match_id: MatchId },
    GetEvent { wait_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    Exists(bool),
    Event(Option<Event>),
    Error(String),
}

/// Serializes `value` behind a 4-byte big-endian length prefix.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    let body = bincode::serialize(value)?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads the body length out of a frame header.
pub fn frame_len(header: [u8; 4]) -> Result<usize, ParseError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ParseError(format!("frame of {} bytes exceeds limit", len)));
    }
    Ok(len)
}

pub fn decode_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(body)
}
