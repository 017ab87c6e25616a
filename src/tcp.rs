//! Game-facing TCP back-end.
//!
//! Game services connect, announce their alias on the first line, and then
//! exchange newline-delimited JSON. The request pump drains the ingress
//! channel toward the addressed link; each link's reader stamps inbound
//! records with the registered alias and feeds the egress channel.

use crate::protocol::{ClientReq, ServerRes};
use crate::util::next_id;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

struct GameLink {
    // Distinguishes this registration from a later one under the same
    // alias, so teardown never removes a successor's entry.
    generation: u64,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

pub struct GameServer {
    allowlist: Arc<HashSet<String>>,
    links: DashMap<String, GameLink>,
    egress_tx: mpsc::Sender<ServerRes>,
    shutdown: CancellationToken,
}

impl GameServer {
    pub fn new(
        allowlist: Arc<HashSet<String>>,
        egress_tx: mpsc::Sender<ServerRes>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            allowlist,
            links: DashMap::new(),
            egress_tx,
            shutdown,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener, ingress_rx: mpsc::Receiver<ClientReq>) {
        let pump = self.clone();
        tokio::spawn(async move { pump.request_pump(ingress_rx).await });
        info!("gateway tcp server is listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move { server.register(socket, peer).await });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }
        info!("gateway tcp server shutting down");
    }

    // Reads the alias line, claims the slot, and runs the link reader until
    // the socket dies. Sockets announcing an unknown or taken alias are
    // dropped without a reply.
    async fn register(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let mut first_line = String::new();
        match reader.read_line(&mut first_line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let alias = first_line.trim().to_string();
        if !self.allowlist.contains(&alias) {
            debug!(%peer, alias = %alias, "rejected registration for unknown alias");
            return;
        }

        let generation = next_id();
        match self.links.entry(alias.clone()) {
            Entry::Occupied(_) => {
                // First holder keeps the slot; it may still be serving.
                warn!(alias = %alias, %peer, "alias already registered; dropping new socket");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(GameLink {
                    generation,
                    writer: Arc::new(Mutex::new(write_half)),
                });
            }
        }

        let span = info_span!("game", alias = %alias, %peer);
        async {
            info!("game registered");
            self.link_reader(&alias, reader).await;
            self.links
                .remove_if(&alias, |_, link| link.generation == generation);
            info!("game disconnected");
        }
        .instrument(span)
        .await;
    }

    // Scans newline-delimited records until EOF, a read error, a parse
    // error, or shutdown. Parse errors break the link; the game reconnects
    // and re-registers.
    async fn link_reader(&self, alias: &str, mut reader: BufReader<OwnedReadHalf>) {
        let mut line = String::new();
        loop {
            line.clear();
            let n = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                read = reader.read_line(&mut line) => match read {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "game read failed");
                        return;
                    }
                },
            };
            if n == 0 {
                return;
            }

            let mut res: ServerRes = match serde_json::from_str(line.trim()) {
                Ok(res) => res,
                Err(e) => {
                    warn!(error = %e, "unparseable game record; breaking link");
                    return;
                }
            };
            // Whatever the game wrote, delivery happens under the alias it
            // registered with.
            res.server = alias.to_string();
            if self.egress_tx.send(res).await.is_err() {
                return;
            }
        }
    }

    /// Forwards client requests to the addressed game until the ingress
    /// channel closes.
    async fn request_pump(&self, mut ingress_rx: mpsc::Receiver<ClientReq>) {
        while let Some(req) = ingress_rx.recv().await {
            let Some(writer) = self.links.get(&req.server).map(|link| link.writer.clone()) else {
                warn!(server = %req.server, user_id = req.user_id, "request for unconnected game; dropping");
                continue;
            };
            let mut line = match serde_json::to_vec(&req) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "failed to serialize client request");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = writer.lock().await.write_all(&line).await {
                // The link reader owns liveness; a failed write alone does
                // not evict the alias.
                error!(server = %req.server, error = %e, "game write failed");
            }
        }
        debug!("ingress channel closed; pump exiting");
    }
}
