//! Sends one request to a running warden and prints the reply.

use clap::{Parser, Subcommand};
use shared::{Format, MatchId, PlayerId, Reply, Request, RosterEntry, ServerInfo, SetupArgs, Team};
use tokio::net::TcpStream;
use warden::rpc::call;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Warden RPC address
    #[clap(short = 'a', long, env = "WARDEN_RPC_ADDR", default_value = "127.0.0.1:8001")]
    addr: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// Game server address, host:port
    #[clap(long)]
    host: String,

    /// RCON password
    #[clap(long)]
    rcon_password: String,

    /// Join password players are given
    #[clap(long, default_value = "")]
    server_password: String,
}

impl From<ServerArgs> for ServerInfo {
    fn from(args: ServerArgs) -> Self {
        ServerInfo {
            host: args.host,
            rcon_password: args.rcon_password,
            server_password: args.server_password,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check RCON access and log redirection
    Verify {
        #[clap(flatten)]
        server: ServerArgs,
    },
    /// Provision a server and start supervising it
    Setup {
        match_id: MatchId,
        #[clap(flatten)]
        server: ServerArgs,
        #[clap(long)]
        map: String,
        #[clap(long)]
        format: Format,
        #[clap(long, default_value = "ugc")]
        league: String,
        #[clap(long, default_value = "")]
        whitelist: String,
        /// Roster entry `<steamid>:<team>:<slot>:<name>` (repeatable)
        #[clap(long = "player", value_parser = parse_entry)]
        players: Vec<RosterEntry>,
        /// Banned steam id (repeatable)
        #[clap(long = "ban")]
        banned: Vec<PlayerId>,
    },
    /// Re-run the config sequence
    Reexec {
        match_id: MatchId,
        #[clap(long)]
        change_map: bool,
    },
    /// Stop supervising a match
    End {
        match_id: MatchId,
    },
    /// Seat a player in a running match
    Allow {
        match_id: MatchId,
        #[clap(value_parser = parse_entry)]
        entry: RosterEntry,
    },
    /// Replace a player and kick them if present
    Disallow {
        match_id: MatchId,
        player: PlayerId,
    },
    /// Print a message in server chat
    Say {
        match_id: MatchId,
        text: String,
    },
    /// Whether a match is being supervised
    Exists {
        match_id: MatchId,
    },
    /// Wait for the next event
    Event {
        #[clap(long, default_value = "5000")]
        wait_ms: u64,
    },
}

fn parse_entry(s: &str) -> Result<RosterEntry, String> {
    let mut parts = s.splitn(4, ':');
    let (Some(player), Some(team), Some(slot), Some(name)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected <steamid>:<team>:<slot>:<name>, got {}", s));
    };
    Ok(RosterEntry {
        player: player.parse::<PlayerId>().map_err(|e| e.to_string())?,
        team: team.parse::<Team>().map_err(|e| e.to_string())?,
        slot: slot.to_string(),
        name: name.to_string(),
    })
}

impl From<Command> for Request {
    fn from(command: Command) -> Self {
        match command {
            Command::Verify { server } => Request::VerifyInfo {
                info: server.into(),
            },
            Command::Setup {
                match_id,
                server,
                map,
                format,
                league,
                whitelist,
                players,
                banned,
            } => Request::SetupServer(SetupArgs {
                match_id,
                info: server.into(),
                format,
                league,
                whitelist,
                map,
                players,
                banned,
            }),
            Command::Reexec {
                match_id,
                change_map,
            } => Request::ReExecConfig {
                match_id,
                change_map,
            },
            Command::End { match_id } => Request::End { match_id },
            Command::Allow { match_id, entry } => Request::AllowPlayer { match_id, entry },
            Command::Disallow { match_id, player } => Request::DisallowPlayer { match_id, player },
            Command::Say { match_id, text } => Request::Say { match_id, text },
            Command::Exists { match_id } => Request::Exists { match_id },
            Command::Event { wait_ms } => Request::GetEvent { wait_ms },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let request = Request::from(args.command);

    let mut stream = TcpStream::connect(&args.addr).await?;
    match call(&mut stream, &request).await? {
        Reply::Ok => println!("ok"),
        Reply::Exists(exists) => println!("{}", exists),
        Reply::Event(Some(event)) => println!("{:?}", event),
        Reply::Event(None) => println!("no event"),
        Reply::Error(message) => {
            eprintln!("error: {}", message);
            std::process::exit(1);
        }
    }
    Ok(())
}
