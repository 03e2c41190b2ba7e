//! UDP log receiver.
//!
//! Game servers stream their logs to the address given in `logaddress_add`.
//! Each packet is `\xFF\xFF\xFF\xFF` followed by `R<line>` or, when the
//! server has `sv_logsecret` set, `S<secret><line>`. The secret is what ties a
//! packet to a session, so unsigned packets are dropped.

use crate::logline::LogMessage;
use log::{debug, error, trace, warn};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const HEADER: [u8; 4] = [0xFF; 4];
const MAX_PACKET: usize = 2048;

/// Splits a log packet into its secret and line.
pub fn decode_packet(packet: &[u8]) -> Option<(Option<u64>, String)> {
    let rest = packet.strip_prefix(&HEADER)?;
    let (kind, rest) = rest.split_first()?;
    match kind {
        b'R' => Some((None, String::from_utf8_lossy(rest).into_owned())),
        b'S' => {
            let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
            let secret = std::str::from_utf8(&rest[..digits]).ok()?.parse().ok()?;
            let line = String::from_utf8_lossy(&rest[digits..]).into_owned();
            Some((Some(secret), line))
        }
        _ => None,
    }
}

/// Builds a signed log packet, as a game server would send it.
pub fn encode_packet(secret: u64, line: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(line.len() + 16);
    packet.extend_from_slice(&HEADER);
    packet.push(b'S');
    packet.extend_from_slice(secret.to_string().as_bytes());
    packet.extend_from_slice(line.as_bytes());
    packet.push(0);
    packet
}

/// Routes log lines to sessions by log secret.
#[derive(Debug, Default)]
pub struct LogRouter {
    routes: RwLock<HashMap<u64, mpsc::UnboundedSender<LogMessage>>>,
    print_messages: bool,
}

impl LogRouter {
    pub fn new(print_messages: bool) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            print_messages,
        }
    }

    /// Picks a secret no current route uses.
    pub fn fresh_secret(&self) -> u64 {
        let mut rng = rand::thread_rng();
        let routes = self.routes.read();
        loop {
            let secret = rng.gen_range(10_000_000..i32::MAX as u64);
            if !routes.contains_key(&secret) {
                return secret;
            }
        }
    }

    pub fn register(&self, secret: u64) -> mpsc::UnboundedReceiver<LogMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.routes.write().insert(secret, tx).is_some() {
            warn!("Log route {} replaced", secret);
        }
        rx
    }

    pub fn deregister(&self, secret: u64) {
        self.routes.write().remove(&secret);
    }

    pub fn contains(&self, secret: u64) -> bool {
        self.routes.read().contains_key(&secret)
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Delivers one packet. Returns false if nobody took it.
    pub fn route(&self, packet: &[u8]) -> bool {
        let Some((secret, line)) = decode_packet(packet) else {
            trace!("Ignoring malformed log packet ({} bytes)", packet.len());
            return false;
        };
        let Some(secret) = secret else {
            trace!("Ignoring unsigned log line");
            return false;
        };

        let Some(tx) = self.routes.read().get(&secret).cloned() else {
            trace!("No route for log secret {}", secret);
            return false;
        };

        let message = LogMessage::parse(&line);
        if self.print_messages {
            debug!("{}", message.raw);
        }
        tx.send(message).is_ok()
    }
}

/// Receives log packets until the socket fails for good.
pub async fn run_listener(socket: UdpSocket, router: Arc<LogRouter>) {
    let mut buffer = [0u8; MAX_PACKET];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, _addr)) => {
                router.route(&buffer[..len]);
            }
            Err(e) => {
                error!("Error receiving log packet: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
