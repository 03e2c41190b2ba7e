//! RPC surface used by the matchmaking backend.
//!
//! Requests and replies are `shared::Request` / `shared::Reply`, bincode
//! encoded behind a 4-byte big-endian length. A connection may carry any
//! number of request/reply pairs.

use crate::archive::LogUploader;
use crate::backend::{Backend, LobbyBook};
use crate::error::{Result, WardenError};
use crate::events::{EventQueue, EventSink};
use crate::ledger::ReportLedger;
use crate::listener::LogRouter;
use crate::rcon::{Connector, RconLink};
use crate::registry::Registry;
use crate::roster::Roster;
use crate::session::{Collaborators, MatchConfig, Session};
use crate::settings::SessionSettings;
use log::{debug, error, info};
use serde::Serialize;
use shared::{
    decode_body, encode_frame, frame_len, Event, MatchId, PlayerId, Reply, Request, RosterEntry,
    ServerInfo, SetupArgs,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Kick reason for a player removed through `DisallowPlayer`.
pub const REPLACED_REASON: &str = "You have been replaced.";

/// The warden service: owns the shared state every session uses.
pub struct Warden {
    settings: Arc<SessionSettings>,
    lobbies: Arc<LobbyBook>,
    queue: Arc<EventQueue>,
    deps: Collaborators,
}

impl Warden {
    pub fn new(
        settings: Arc<SessionSettings>,
        connector: Arc<dyn Connector>,
        router: Arc<LogRouter>,
        uploader: Option<Arc<dyn LogUploader>>,
    ) -> Self {
        let lobbies = Arc::new(LobbyBook::new());
        let queue = Arc::new(EventQueue::new());
        let deps = Collaborators {
            connector,
            backend: Arc::clone(&lobbies) as Arc<dyn Backend>,
            events: Arc::clone(&queue) as Arc<dyn EventSink>,
            router,
            ledger: Arc::new(ReportLedger::new()),
            uploader,
            registry: Arc::new(Registry::new()),
        };
        Self {
            settings,
            lobbies,
            queue,
            deps,
        }
    }

    pub fn registry(&self) -> &Registry<Session> {
        &self.deps.registry
    }

    pub fn lobbies(&self) -> &LobbyBook {
        &self.lobbies
    }

    pub fn ledger(&self) -> &ReportLedger {
        &self.deps.ledger
    }

    /// Checks that a server accepts RCON and sends its logs to the listener.
    pub async fn verify_info(&self, info: &ServerInfo) -> Result<()> {
        let link = RconLink::new(
            &info.host,
            &info.rcon_password,
            Arc::clone(&self.deps.connector),
            self.settings.backoff,
        );
        link.connect().await?;

        let router = &self.deps.router;
        let secret = router.fresh_secret();
        let mut rx = router.register(secret);
        let log_address = &self.settings.log_address;

        let result = async {
            link.query(&format!("sv_logsecret {}", secret)).await?;
            link.query(&format!("logaddress_add {}", log_address)).await?;
            link.query("log on").await?;
            link.query("status").await?;
            match timeout(self.settings.timings.verify_info_wait, rx.recv()).await {
                Ok(Some(_)) => Ok(()),
                _ => Err(WardenError::LogRedirection),
            }
        }
        .await;

        if let Err(e) = link.query(&format!("logaddress_del {}", log_address)).await {
            debug!("logaddress_del on {} failed: {}", info.host, e);
        }
        router.deregister(secret);
        link.close().await;
        result
    }

    /// Provisions a server and starts supervising it.
    ///
    /// The match id is reserved for the whole setup, so a concurrent setup of
    /// the same match fails fast instead of fighting over the server's log
    /// secret.
    pub async fn setup_server(&self, args: SetupArgs) -> Result<()> {
        let match_id = args.match_id;
        let reservation = self.deps.registry.reserve(match_id)?;
        info!("#{}: setting up {} on {}", match_id, args.map, args.info.host);

        self.lobbies.register(match_id, &args.players);
        let session = Session::new(
            MatchConfig::from(&args),
            Roster::new(&args.players, &args.banned),
            Arc::clone(&self.settings),
            self.deps.clone(),
        );

        if let Err(e) = session.provision().await {
            self.lobbies.forget(match_id);
            return Err(e);
        }
        reservation.fill(Arc::clone(&session));
        session.start();
        Ok(())
    }

    pub async fn re_exec_config(&self, match_id: MatchId, change_map: bool) -> Result<()> {
        let session = self.deps.registry.get(match_id)?;
        session.re_exec_config(change_map).await
    }

    /// Retires a session. Its run task does the rest.
    pub fn end(&self, match_id: MatchId) -> Result<()> {
        let session = self
            .deps
            .registry
            .remove(match_id)
            .ok_or(WardenError::NoSuchSession(match_id))?;
        info!("#{}: end requested", match_id);
        self.lobbies.forget(match_id);
        session.signal_stop();
        Ok(())
    }

    pub fn allow_player(&self, match_id: MatchId, entry: RosterEntry) -> Result<()> {
        let session = self.deps.registry.get(match_id)?;
        self.deps.ledger.reset_votes(entry.player, match_id);
        session.roster().allow(entry.clone());
        self.lobbies.upsert(match_id, entry);
        Ok(())
    }

    pub async fn disallow_player(&self, match_id: MatchId, player: PlayerId) -> Result<()> {
        let session = self.deps.registry.get(match_id)?;
        session.roster().replace(player);
        self.lobbies.disallow(match_id, player);
        self.deps.ledger.reset_votes(player, match_id);
        session.cancel_reports_against(player);

        let online = session.link().players().await?;
        if let Some(p) = online.iter().find(|p| p.player == player) {
            session.link().kick_user_id(p.user_id, REPLACED_REASON).await?;
        }
        Ok(())
    }

    pub async fn say(&self, match_id: MatchId, text: &str) -> Result<()> {
        let session = self.deps.registry.get(match_id)?;
        session.link().say(text).await?;
        Ok(())
    }

    pub fn exists(&self, match_id: MatchId) -> bool {
        self.deps.registry.contains(match_id)
    }

    pub async fn get_event(&self, wait: Duration) -> Option<Event> {
        self.queue.next(wait).await
    }

    pub async fn handle(&self, request: Request) -> Reply {
        let result = match request {
            Request::VerifyInfo { info } => self.verify_info(&info).await,
            Request::SetupServer(args) => self.setup_server(args).await,
            Request::ReExecConfig {
                match_id,
                change_map,
            } => self.re_exec_config(match_id, change_map).await,
            Request::End { match_id } => self.end(match_id),
            Request::AllowPlayer { match_id, entry } => self.allow_player(match_id, entry),
            Request::DisallowPlayer { match_id, player } => {
                self.disallow_player(match_id, player).await
            }
            Request::Say { match_id, text } => self.say(match_id, &text).await,
            Request::Exists { match_id } => return Reply::Exists(self.exists(match_id)),
            Request::GetEvent { wait_ms } => {
                return Reply::Event(self.get_event(Duration::from_millis(wait_ms)).await)
            }
        };

        match result {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::Error(e.to_string()),
        }
    }
}

/// Reads one frame. `None` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(decode_body(&body)?))
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.write_all(&encode_frame(value)?).await?;
    writer.flush().await?;
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, warden: Arc<Warden>) -> Result<()> {
    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        debug!("RPC {:?}", request);
        let reply = warden.handle(request).await;
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}

/// Accepts RPC connections until the listener fails.
pub async fn serve(listener: TcpListener, warden: Arc<Warden>) -> io::Result<()> {
    info!("RPC listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("RPC connection from {}", addr);
        let warden = Arc::clone(&warden);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, warden).await {
                error!("RPC connection {} failed: {}", addr, e);
            }
        });
    }
}

/// Sends one request and waits for its reply.
pub async fn call(stream: &mut TcpStream, request: &Request) -> Result<Reply> {
    write_frame(stream, request).await?;
    read_frame(stream)
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{log_line, player_token, Harness, MockConnector};
    use shared::{Format, Team};
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    fn warden(harness: &Harness) -> Warden {
        Warden::new(
            Arc::clone(&harness.settings),
            MockConnector::shared(&harness.server),
            Arc::clone(&harness.router),
            None,
        )
    }

    #[tokio::test]
    async fn test_setup_end_lifecycle() {
        let harness = Harness::new(Format::Sixes);
        let warden = warden(&harness);

        assert_ok!(warden.setup_server(harness.setup_args()).await);
        assert!(warden.exists(1));
        assert!(matches!(
            assert_err!(warden.setup_server(harness.setup_args()).await),
            WardenError::SessionExists(1)
        ));

        let session = assert_ok!(warden.registry().get(1));
        assert_ok!(warden.end(1));
        assert!(!warden.exists(1));
        session.join().await;
        assert!(harness.router.is_empty());
        assert!(matches!(warden.end(1), Err(WardenError::NoSuchSession(1))));
    }

    #[tokio::test]
    async fn test_concurrent_setup_keeps_one_session() {
        let harness = Harness::new(Format::Sixes);
        let warden = warden(&harness);

        let (a, b) = tokio::join!(
            warden.setup_server(harness.setup_args()),
            warden.setup_server(harness.setup_args())
        );
        assert!(a.is_ok() != b.is_ok());
        assert!(matches!(a.and(b), Err(WardenError::SessionExists(1))));
        assert!(!warden.registry().is_reserved(1));

        let session = assert_ok!(warden.registry().get(1));
        assert_eq!(session.secret(), harness.server.log_secret());
        assert_eq!(harness.router.len(), 1);
        assert!(harness.router.contains(session.secret().unwrap()));
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported() {
        let mut harness = Harness::new(Format::Sixes);
        harness.map = "badlands".to_string();
        let warden = warden(&harness);

        let reply = warden.handle(Request::SetupServer(harness.setup_args())).await;
        assert_eq!(reply, Reply::Error("Invalid Map Name: badlands".to_string()));
        assert!(!warden.exists(1));
        assert!(!warden.lobbies().contains(1));
    }

    #[tokio::test]
    async fn test_disallow_kicks_and_marks_reported() {
        let harness = Harness::new(Format::Sixes);
        let warden = warden(&harness);
        assert_ok!(warden.setup_server(harness.setup_args()).await);

        let victim = harness.player(3).player;
        harness.server.add_player(17, "player3", victim);
        assert_ok!(warden.ledger().record_vote(harness.player(2).player, victim, 1));

        assert_ok!(warden.disallow_player(1, victim).await);
        assert!(harness
            .server
            .commands()
            .contains(&"kickid 17 \"You have been replaced.\"".to_string()));
        assert!(warden.lobbies().is_reported(1, victim).await);
        assert!(!warden.ledger().is_reported(victim, 1));

        // Reconnecting is refused from now on
        let session = assert_ok!(warden.registry().get(1));
        harness.send_log(
            &session,
            &log_line(&format!("{} connected, address \"1.2.3.4:5\"", player_token(3, ""))),
        );
        harness.settle().await;
        assert_eq!(harness.server.count_commands("kickid 3 "), 1);
    }

    #[tokio::test]
    async fn test_league_cannot_escape_configs() {
        let harness = Harness::new(Format::Sixes);
        let warden = warden(&harness);
        let mut args = harness.setup_args();
        args.league = "../../etc".to_string();

        assert_eq!(
            warden.handle(Request::SetupServer(args)).await,
            Reply::Error("Invalid League Name: ../../etc".to_string())
        );
        assert!(!warden.exists(1));
        assert_eq!(harness.server.count_commands("changelevel"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disallow_closes_open_vote() {
        let harness = Harness::new(Format::Sixes);
        let warden = warden(&harness);
        assert_ok!(warden.setup_server(harness.setup_args()).await);
        let session = assert_ok!(warden.registry().get(1));

        // player1 (red) opens a vote on blu slot1, held by player2
        harness.send_log(
            &session,
            &log_line(&format!("{} say \"!rep their slot1\"", player_token(1, "Red"))),
        );
        harness.settle().await;
        assert!(harness.server.said_containing("Got 1 votes"));

        assert_ok!(warden.disallow_player(1, harness.player(2).player).await);
        sleep(harness.settings.timings.report_timeout + Duration::from_secs(1)).await;
        harness.settle().await;

        assert!(!harness.server.said_containing("failed"));
        assert!(!warden.ledger().is_reported(harness.player(2).player, 1));
    }

    #[tokio::test]
    async fn test_allow_player_adds_seat() {
        let harness = Harness::new(Format::Sixes);
        let warden = warden(&harness);
        assert_ok!(warden.setup_server(harness.setup_args()).await);

        let newcomer = RosterEntry {
            player: PlayerId::from_account(4242),
            team: Team::Blu,
            slot: "slot9".to_string(),
            name: "newcomer".to_string(),
        };
        assert_ok!(warden.allow_player(1, newcomer.clone()));

        let session = assert_ok!(warden.registry().get(1));
        assert_eq!(session.roster().entry(newcomer.player), Some(newcomer.clone()));
        assert_eq!(warden.lobbies().is_allowed(1, newcomer.player).await, Ok(()));
        assert!(matches!(
            warden.allow_player(2, newcomer),
            Err(WardenError::NoSuchSession(2))
        ));
    }

    #[tokio::test]
    async fn test_say_and_missing_session() {
        let harness = Harness::new(Format::Sixes);
        let warden = warden(&harness);
        assert_ok!(warden.setup_server(harness.setup_args()).await);

        assert_eq!(
            warden
                .handle(Request::Say {
                    match_id: 1,
                    text: "glhf".to_string()
                })
                .await,
            Reply::Ok
        );
        assert!(harness.server.said("glhf"));
        assert_eq!(
            warden.handle(Request::Exists { match_id: 9 }).await,
            Reply::Exists(false)
        );
        assert_eq!(
            warden.handle(Request::End { match_id: 9 }).await,
            Reply::Error("Server doesn't exist (match #9).".to_string())
        );
    }

    #[tokio::test]
    async fn test_verify_info_errors() {
        let harness = Harness::new(Format::Sixes);
        let warden = warden(&harness);

        let wrong = ServerInfo {
            host: "mock:27015".to_string(),
            rcon_password: "nope".to_string(),
            server_password: String::new(),
        };
        assert_eq!(
            warden.handle(Request::VerifyInfo { info: wrong }).await,
            Reply::Error(
                "Authentication Failed. Please check your RCON Address/Password.".to_string()
            )
        );

        harness.server.set_reachable(false);
        let info = harness.setup_args().info;
        assert_eq!(
            warden.handle(Request::VerifyInfo { info }).await,
            Reply::Error("Couldn't connect to the server: Connection Refused.".to_string())
        );
    }

    #[tokio::test]
    async fn test_verify_info_sees_logs() {
        let harness = Harness::new(Format::Sixes);
        harness.server.forward_logs(Arc::clone(&harness.router));
        let warden = warden(&harness);

        assert_ok!(warden.verify_info(&harness.setup_args().info).await);
        assert!(harness.router.is_empty());
        let del = format!("logaddress_del {}", harness.settings.log_address);
        assert!(harness.server.commands().contains(&del));
        assert_eq!(harness.server.live_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_info_without_logs() {
        let harness = Harness::new(Format::Sixes);
        let warden = warden(&harness);

        let info = harness.setup_args().info;
        let err = assert_err!(warden.verify_info(&info).await);
        assert!(matches!(err, WardenError::LogRedirection));
        assert!(harness.router.is_empty());
        assert_eq!(harness.server.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_frames_over_tcp() {
        let harness = Harness::new(Format::Sixes);
        let warden = Arc::new(warden(&harness));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::clone(&warden)));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = assert_ok!(call(&mut stream, &Request::Exists { match_id: 1 }).await);
        assert_eq!(reply, Reply::Exists(false));

        let reply = assert_ok!(call(&mut stream, &Request::GetEvent { wait_ms: 10 }).await);
        assert_eq!(reply, Reply::Event(None));
    }
}
