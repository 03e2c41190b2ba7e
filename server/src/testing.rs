//! In-process fakes for exercising sessions without a game server.
//!
//! [`MockServer`] behaves like a game server's RCON side: it tracks cvars,
//! connections and players, and can forward log lines the way
//! `logaddress_add` would. [`Harness`] wires a full set of collaborators
//! around one and hands out sessions for match #1.

use crate::archive::{LogUploader, UploadError};
use crate::backend::{Backend, LobbyBook};
use crate::events::EventSink;
use crate::ledger::ReportLedger;
use crate::listener::{encode_packet, LogRouter};
use crate::rcon::{Connector, OnlinePlayer, Rcon, RconError};
use crate::registry::Registry;
use crate::roster::Roster;
use crate::session::{Collaborators, MatchConfig, Session};
use crate::settings::{SessionSettings, Timings};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::{Event, Format, PlayerId, RosterEntry, ServerInfo, SetupArgs, Team};
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const MOCK_HOST: &str = "mock:27015";
pub const RCON_PASSWORD: &str = "rconpw";
pub const SERVER_PASSWORD: &str = "serverpw";

/// Prefixes a log body with a timestamp.
pub fn log_line(body: &str) -> String {
    format!("L 10/19/2026 - 21:04:11: {}", body)
}

/// Quoted player token for harness account `n`, whose user id is also `n`.
pub fn player_token(n: u32, team: &str) -> String {
    format!("\"player{}<{}><[U:1:{}]><{}>\"", n, n, n, team)
}

enum Forward {
    Off,
    Router(Arc<LogRouter>),
    Udp(UdpSocket),
}

struct ServerState {
    password: String,
    reachable: bool,
    unknown: HashSet<String>,
    drop_on: Option<String>,
    commands: Vec<String>,
    cvars: HashMap<String, String>,
    live: HashSet<u64>,
    next_conn: u64,
    connections: usize,
    players: Vec<OnlinePlayer>,
    log_on: bool,
    log_targets: Vec<String>,
    forward: Forward,
}

impl ServerState {
    fn status(&self) -> String {
        let mut out = String::from(
            "hostname: mock\n# userid name uniqueid connected ping loss state adr\n",
        );
        for p in &self.players {
            out.push_str(&format!(
                "#{:>7} \"{}\" {} 00:10 50 0 active 10.0.0.1:27005\n",
                p.user_id,
                p.name,
                p.player.steam3()
            ));
        }
        out
    }

    fn run(&mut self, command: &str) -> Result<String, RconError> {
        let (head, rest) = match command.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (command, ""),
        };
        if self.unknown.contains(head) {
            return Err(RconError::UnknownCommand(head.to_string()));
        }

        match head {
            "status" => return Ok(self.status()),
            "say" | "kickid" | "kickall" | "changelevel" => {}
            "logaddress_add" => self.log_targets.push(rest.to_string()),
            "logaddress_del" => self.log_targets.retain(|t| t != rest),
            "log" => self.log_on = rest == "on",
            _ if rest.is_empty() => {
                return Ok(match self.cvars.get(head) {
                    Some(value) => format!("\"{}\" = \"{}\" ( def. \"\" )\n", head, value),
                    None => String::new(),
                });
            }
            _ => {
                let value = rest.trim_matches('"').to_string();
                self.cvars.insert(head.to_string(), value);
            }
        }
        Ok(String::new())
    }

    fn emit_log(&self, line: &str) {
        if !self.log_on {
            return;
        }
        let Some(secret) = self.cvars.get("sv_logsecret").and_then(|s| s.parse().ok()) else {
            return;
        };
        let packet = encode_packet(secret, line);
        match &self.forward {
            Forward::Off => {}
            Forward::Router(router) => {
                router.route(&packet);
            }
            Forward::Udp(socket) => {
                for target in &self.log_targets {
                    if let Ok(addr) = target.parse::<SocketAddr>() {
                        let _ = socket.send_to(&packet, addr);
                    }
                }
            }
        }
    }
}

/// Scriptable stand-in for a game server's RCON endpoint.
#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new(password: &str) -> Self {
        let state = ServerState {
            password: password.to_string(),
            reachable: true,
            unknown: HashSet::new(),
            drop_on: None,
            commands: Vec::new(),
            cvars: HashMap::from([("sv_password".to_string(), String::new())]),
            live: HashSet::new(),
            next_conn: 0,
            connections: 0,
            players: Vec::new(),
            log_on: false,
            log_targets: Vec::new(),
            forward: Forward::Off,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Makes every command whose first word is `head` fail as unknown.
    pub fn mark_unknown(&self, head: &str) {
        self.state.lock().unknown.insert(head.to_string());
    }

    /// The next time `command` arrives, its connection dies instead.
    pub fn drop_connection_on(&self, command: &str) {
        self.state.lock().drop_on = Some(command.to_string());
    }

    /// Every command received, unknown ones included.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn said(&self, text: &str) -> bool {
        let expected = format!("say \"{}\"", text.replace('"', "'"));
        self.state.lock().commands.iter().any(|c| *c == expected)
    }

    pub fn said_containing(&self, fragment: &str) -> bool {
        self.state
            .lock()
            .commands
            .iter()
            .any(|c| c.starts_with("say ") && c.contains(fragment))
    }

    pub fn cvar(&self, name: &str) -> Option<String> {
        self.state.lock().cvars.get(name).cloned()
    }

    pub fn set_cvar(&self, name: &str, value: &str) {
        self.state
            .lock()
            .cvars
            .insert(name.to_string(), value.to_string());
    }

    pub fn log_secret(&self) -> Option<u64> {
        self.state
            .lock()
            .cvars
            .get("sv_logsecret")
            .and_then(|s| s.parse().ok())
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Successful connects so far.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections
    }

    /// Kills every open connection, as a server restart would.
    pub fn disconnect_all(&self) {
        self.state.lock().live.clear();
    }

    pub fn add_player(&self, user_id: u32, name: &str, player: PlayerId) {
        self.state.lock().players.push(OnlinePlayer {
            user_id,
            name: name.to_string(),
            player,
        });
    }

    pub fn remove_player(&self, player: PlayerId) {
        self.state.lock().players.retain(|p| p.player != player);
    }

    /// Delivers forwarded log lines straight into `router`.
    pub fn forward_logs(&self, router: Arc<LogRouter>) {
        self.state.lock().forward = Forward::Router(router);
    }

    /// Sends forwarded log lines over UDP to every `logaddress_add` target.
    pub fn forward_logs_udp(&self) {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind mock log socket");
        self.state.lock().forward = Forward::Udp(socket);
    }

    /// Emits one log line, if logging is on and forwarding is set up.
    pub fn send_log(&self, line: &str) {
        self.state.lock().emit_log(line);
    }

    fn connect(&self, password: &str) -> Result<u64, RconError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(RconError::ConnectionRefused);
        }
        if password != state.password {
            return Err(RconError::AuthFailed);
        }
        state.next_conn += 1;
        let id = state.next_conn;
        state.live.insert(id);
        state.connections += 1;
        Ok(id)
    }

    fn exec(&self, conn: u64, command: &str) -> Result<String, RconError> {
        let mut state = self.state.lock();
        if !state.live.contains(&conn) {
            return Err(RconError::Closed);
        }
        if state.drop_on.as_deref() == Some(command) {
            state.drop_on = None;
            state.live.remove(&conn);
            return Err(RconError::Closed);
        }
        state.commands.push(command.to_string());
        let response = state.run(command)?;
        state.emit_log(&log_line(&format!(
            "rcon from \"127.0.0.1:40000\": command \"{}\"",
            command
        )));
        Ok(response)
    }

    fn hang_up(&self, conn: u64) {
        self.state.lock().live.remove(&conn);
    }
}

struct MockRcon {
    id: u64,
    server: MockServer,
}

#[async_trait]
impl Rcon for MockRcon {
    async fn exec(&mut self, command: &str) -> Result<String, RconError> {
        self.server.exec(self.id, command)
    }

    async fn close(&mut self) {
        self.server.hang_up(self.id);
    }
}

impl Drop for MockRcon {
    fn drop(&mut self) {
        self.server.hang_up(self.id);
    }
}

pub struct MockConnector {
    server: MockServer,
}

impl MockConnector {
    pub fn shared(server: &MockServer) -> Arc<dyn Connector> {
        Arc::new(Self {
            server: server.clone(),
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _host: &str, password: &str) -> Result<Box<dyn Rcon>, RconError> {
        let id = self.server.connect(password)?;
        Ok(Box::new(MockRcon {
            id,
            server: self.server.clone(),
        }))
    }
}

/// Keeps every published event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Uploader with a fixed answer.
pub struct StaticUploader {
    id: Option<u64>,
}

impl StaticUploader {
    pub fn returning(id: u64) -> Self {
        Self { id: Some(id) }
    }

    pub fn failing() -> Self {
        Self { id: None }
    }
}

#[async_trait]
impl LogUploader for StaticUploader {
    async fn upload(&self, _title: &str, _map: &str, _contents: &str) -> Result<u64, UploadError> {
        self.id
            .ok_or_else(|| UploadError::Unavailable("log host offline".to_string()))
    }
}

/// Temporary config directory, removed on drop.
pub struct ConfigFixture {
    dir: TempDir,
}

impl ConfigFixture {
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("warden-")
            .tempdir()
            .expect("create fixture dir");
        Self { dir }
    }

    /// Config tree every harness session can run: one marker command per file.
    pub fn standard() -> Self {
        let fixture = Self::new();
        fixture.write("base.cfg", "// shared settings\nexec_marker base\n");
        fixture.write("after_format.cfg", "exec_marker after\n");
        fixture.write("soap_off.cfg", "exec_marker soap\n");
        for format in Format::ALL {
            fixture.write(
                &format!("formats/{}.cfg", format.name()),
                "exec_marker format\n",
            );
            fixture.write(
                &format!("ugc/cp_{}.cfg", format.name()),
                "exec_marker league\n",
            );
        }
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create fixture subdir");
        }
        std::fs::write(path, contents).expect("write fixture file");
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.path().join(relative)).expect("remove fixture file");
    }
}

impl Default for ConfigFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborators, settings and a roster for match #1 on a [`MockServer`].
///
/// Roster: accounts `1..=roster_size`, odd ones on red, even ones on blu.
/// Account `n` is named `player{n}` and sits in slot `slot{(n + 1) / 2}`.
pub struct Harness {
    pub fixture: ConfigFixture,
    pub server: MockServer,
    pub sink: Arc<RecordingSink>,
    pub book: Arc<LobbyBook>,
    pub router: Arc<LogRouter>,
    pub ledger: Arc<ReportLedger>,
    pub registry: Arc<Registry<Session>>,
    pub deps: Collaborators,
    pub settings: Arc<SessionSettings>,
    pub players: Vec<RosterEntry>,
    pub format: Format,
    pub map: String,
}

impl Harness {
    pub fn new(format: Format) -> Self {
        let fixture = ConfigFixture::standard();
        let server = MockServer::new(RCON_PASSWORD);
        let sink = Arc::new(RecordingSink::default());
        let book = Arc::new(LobbyBook::new());
        let router = Arc::new(LogRouter::new(false));
        let ledger = Arc::new(ReportLedger::new());
        let registry = Arc::new(Registry::new());

        let settings = SessionSettings {
            timings: Timings {
                // Keeps roster snapshots out of tests that don't ask for them
                verify_interval: Duration::from_secs(3600),
                ..Timings::default()
            },
            configs_dir: fixture.path().to_path_buf(),
            archive_dir: fixture.path().join("logs"),
            ..SessionSettings::default()
        };

        let players: Vec<RosterEntry> = (1..=format.roster_size() as u32)
            .map(|n| RosterEntry {
                player: PlayerId::from_account(n),
                team: if n % 2 == 1 { Team::Red } else { Team::Blu },
                slot: format!("slot{}", (n + 1) / 2),
                name: format!("player{}", n),
            })
            .collect();
        book.register(1, &players);

        let deps = Collaborators {
            connector: MockConnector::shared(&server),
            backend: Arc::clone(&book) as Arc<dyn Backend>,
            events: Arc::clone(&sink) as Arc<dyn EventSink>,
            router: Arc::clone(&router),
            ledger: Arc::clone(&ledger),
            uploader: None,
            registry: Arc::clone(&registry),
        };

        Self {
            fixture,
            server,
            sink,
            book,
            router,
            ledger,
            registry,
            deps,
            settings: Arc::new(settings),
            players,
            format,
            map: "cp_badlands".to_string(),
        }
    }

    pub fn setup_args(&self) -> SetupArgs {
        SetupArgs {
            match_id: 1,
            info: ServerInfo {
                host: MOCK_HOST.to_string(),
                rcon_password: RCON_PASSWORD.to_string(),
                server_password: SERVER_PASSWORD.to_string(),
            },
            format: self.format,
            league: "ugc".to_string(),
            whitelist: "ugc_6v6".to_string(),
            map: self.map.clone(),
            players: self.players.clone(),
            banned: Vec::new(),
        }
    }

    /// Roster entry of account `n`.
    pub fn player(&self, n: u32) -> &RosterEntry {
        &self.players[n as usize - 1]
    }

    pub fn set_quorum(&mut self, format: Format, votes: usize) {
        Arc::make_mut(&mut self.settings).quorum.set(format, votes);
    }

    pub fn set_timings(&mut self, f: impl FnOnce(&mut Timings)) {
        f(&mut Arc::make_mut(&mut self.settings).timings);
    }

    /// A fresh, unprovisioned session.
    pub fn session(&self) -> Arc<Session> {
        Session::new(
            MatchConfig::from(&self.setup_args()),
            Roster::new(&self.players, &[]),
            Arc::clone(&self.settings),
            self.deps.clone(),
        )
    }

    /// A provisioned, registered and running session.
    pub async fn started_session(&self) -> Arc<Session> {
        let session = self.session();
        session.provision().await.expect("provision");
        self.registry
            .insert(1, Arc::clone(&session))
            .expect("register session");
        session.start();
        self.server.clear_commands();
        session
    }

    /// Routes one line to `session` as if the server had logged it.
    pub fn send_log(&self, session: &Session, line: &str) {
        let secret = session.secret().expect("session has a log route");
        self.router.route(&encode_packet(secret, line));
    }

    fn activity(&self) -> (usize, usize) {
        (self.server.commands().len(), self.sink.len())
    }

    /// Lets spawned tasks run until commands and events stop changing.
    pub async fn settle(&self) {
        let mut last = self.activity();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let now = self.activity();
            if now == last {
                return;
            }
            last = now;
        }
    }
}
