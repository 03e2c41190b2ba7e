//! Parser for game server log lines.
//!
//! Lines look like `L 10/19/2026 - 21:04:11: <body>`. Player-scoped bodies
//! start with a player token, `"Name<userid><[U:1:N]><Team>"`, followed by the
//! action. Only the actions the warden reacts to are recognised; everything
//! else parses as [`LogEvent::Other`].

use shared::{PlayerClass, PlayerId, Team};

const TIMESTAMP_LEN: usize = 23;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerData {
    pub name: String,
    pub user_id: u32,
    pub player: PlayerId,
    pub team: Option<Team>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    PlayerConnected { player: PlayerData, address: String },
    PlayerDisconnected { player: PlayerData, reason: String },
    Say { player: PlayerData, text: String },
    TeamSay { player: PlayerData, text: String },
    ClassChange { player: PlayerData, class: PlayerClass },
    Spawned { player: PlayerData, class: PlayerClass },
    ServerCvar { name: String, value: String },
    GameOver { reason: String },
    TournamentStarted,
    LogFileClosed,
    Other,
}

/// A routed log line and what it means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// The line as it goes into the match log, `L ` prefix included
    pub raw: String,
    pub event: LogEvent,
}

impl LogMessage {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\0', '\n', '\r']);
        let raw = if line.starts_with("L ") {
            line.to_string()
        } else {
            format!("L {}", line)
        };
        let event = parse_line(&raw);
        LogMessage { raw, event }
    }
}

fn strip_timestamp(line: &str) -> &str {
    let line = line.strip_prefix("L ").unwrap_or(line);
    let bytes = line.as_bytes();
    let stamped = bytes.len() >= TIMESTAMP_LEN
        && bytes[2] == b'/'
        && bytes[5] == b'/'
        && &bytes[10..13] == b" - "
        && &bytes[21..23] == b": ";
    if stamped {
        &line[TIMESTAMP_LEN..]
    } else {
        line
    }
}

fn parse_team(team: &str) -> Option<Team> {
    match team {
        "Red" | "RED" => Some(Team::Red),
        "Blue" | "BLU" | "Blu" => Some(Team::Blu),
        _ => None,
    }
}

/// Parses the inside of a player token, `Name<userid><[U:1:N]><Team>`.
fn parse_player_token(token: &str) -> Option<PlayerData> {
    let mut parts = token.rsplitn(4, '<');
    let team = parts.next()?.strip_suffix('>')?;
    let steam = parts.next()?.strip_suffix('>')?;
    let user_id = parts.next()?.strip_suffix('>')?.parse().ok()?;
    let name = parts.next()?;
    Some(PlayerData {
        name: name.to_string(),
        user_id,
        player: steam.parse().ok()?,
        team: parse_team(team),
    })
}

/// Splits a player-scoped body into the player and the rest of the line.
/// Names may contain quotes and brackets, so each candidate end of the token
/// is tried until one parses.
fn split_player(body: &str) -> Option<(PlayerData, &str)> {
    let inner = body.strip_prefix('"')?;
    let mut from = 0;
    while let Some(pos) = inner[from..].find(">\"") {
        let end = from + pos + 1;
        if let Some(player) = parse_player_token(&inner[..end]) {
            return Some((player, inner[end + 1..].trim_start()));
        }
        from = end;
    }
    None
}

fn quoted(s: &str) -> Option<&str> {
    s.trim().strip_prefix('"')?.strip_suffix('"')
}

/// First quoted value in `s`, e.g. `"Game_Over" reason "x"` -> `Game_Over`.
fn first_quoted(s: &str) -> Option<&str> {
    let start = s.find('"')? + 1;
    let len = s[start..].find('"')?;
    Some(&s[start..start + len])
}

pub fn parse_line(line: &str) -> LogEvent {
    let body = strip_timestamp(line);

    if let Some((player, action)) = split_player(body) {
        return parse_player_action(player, action);
    }

    if let Some(rest) = body.strip_prefix("server_cvar: ") {
        let mut values = rest.splitn(2, "\" \"");
        if let (Some(name), Some(value)) = (values.next(), values.next()) {
            return LogEvent::ServerCvar {
                name: name.trim_start_matches('"').to_string(),
                value: value.trim_end_matches('"').to_string(),
            };
        }
        return LogEvent::Other;
    }

    if let Some(rest) = body.strip_prefix("World triggered ") {
        if first_quoted(rest) == Some("Game_Over") {
            let reason = rest
                .split_once(" reason ")
                .and_then(|(_, r)| quoted(r))
                .unwrap_or_default();
            return LogEvent::GameOver {
                reason: reason.to_string(),
            };
        }
        return LogEvent::Other;
    }

    if body.starts_with("Tournament mode started") {
        return LogEvent::TournamentStarted;
    }
    if body.starts_with("Log file closed") {
        return LogEvent::LogFileClosed;
    }
    LogEvent::Other
}

fn parse_player_action(player: PlayerData, action: &str) -> LogEvent {
    if let Some(rest) = action.strip_prefix("connected, address ") {
        return LogEvent::PlayerConnected {
            player,
            address: quoted(rest).unwrap_or(rest).to_string(),
        };
    }
    if let Some(rest) = action.strip_prefix("disconnected") {
        let reason = rest
            .trim()
            .strip_prefix("(reason ")
            .and_then(|r| r.strip_suffix(')'))
            .and_then(quoted)
            .unwrap_or_default();
        return LogEvent::PlayerDisconnected {
            player,
            reason: reason.to_string(),
        };
    }
    if let Some(text) = action.strip_prefix("say_team ").and_then(quoted) {
        return LogEvent::TeamSay {
            player,
            text: text.to_string(),
        };
    }
    if let Some(text) = action.strip_prefix("say ").and_then(quoted) {
        return LogEvent::Say {
            player,
            text: text.to_string(),
        };
    }
    if let Some(class) = action
        .strip_prefix("changed role to ")
        .and_then(quoted)
        .and_then(|c| c.parse().ok())
    {
        return LogEvent::ClassChange { player, class };
    }
    if let Some(class) = action
        .strip_prefix("spawned as ")
        .and_then(quoted)
        .and_then(|c| c.parse().ok())
    {
        return LogEvent::Spawned { player, class };
    }
    LogEvent::Other
}
