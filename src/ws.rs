//! Client-facing WebSocket front-end.
//!
//! Owns the connection table, the admission limiter, and the egress fan-out.
//! Each accepted socket gets a reader task (codec + session binding +
//! request routing) and a writer task fed by an ordered frame channel that
//! the egress pump, control replies, and liveness replies all share.

use crate::codec::{self, OpCode, WsCodec, WsError};
use crate::config;
use crate::protocol::ClientReq;
use crate::session::{self, SessionStore};
use crate::util::next_id;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, RateLimiter};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug)]
enum ConnError {
    // Socket-level read failure.
    Io(std::io::Error),
    // Framing violation; indistinguishable from hostile traffic.
    Codec(WsError),
    // Upgrade request carried no session id.
    MissingSessionId,
    // The session store had no usable session for the presented id.
    SessionRejected,
}

impl From<std::io::Error> for ConnError {
    fn from(e: std::io::Error) -> Self {
        ConnError::Io(e)
    }
}

impl From<WsError> for ConnError {
    fn from(e: WsError) -> Self {
        ConnError::Codec(e)
    }
}

/// Egress-facing view of one client socket, kept in the connection table so
/// the fan-out path can route without touching the reader task.
pub(crate) struct ClientHandle {
    conn_id: u64,
    user_id: AtomicI64,
    // Alias of the last allowlisted request; the broadcast filter key.
    server: RwLock<String>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

pub(crate) type ConnTable = DashMap<i64, Arc<ClientHandle>>;

// Reader-task-local connection state.
struct Conn {
    id: u64,
    user_id: i64,
    token: CancellationToken,
    frames_tx: mpsc::UnboundedSender<Vec<u8>>,
    handle: Option<Arc<ClientHandle>>,
}

pub struct WsServer {
    store: Arc<dyn SessionStore>,
    allowlist: Arc<HashSet<String>>,
    connections: Arc<ConnTable>,
    ingress_tx: mpsc::Sender<ClientReq>,
    limiter: DefaultDirectRateLimiter,
    shutdown: CancellationToken,
    connected: AtomicUsize,
}

impl WsServer {
    pub fn new(
        store: Arc<dyn SessionStore>,
        allowlist: Arc<HashSet<String>>,
        connections: Arc<ConnTable>,
        ingress_tx: mpsc::Sender<ClientReq>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            allowlist,
            connections,
            ingress_tx,
            limiter: RateLimiter::direct(config::admission_quota()),
            shutdown,
            connected: AtomicUsize::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let ticker = self.clone();
        tokio::spawn(async move { ticker.tick_loop().await });
        info!("gateway ws server is listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move { server.handle_connection(socket, peer).await });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }
        info!("gateway ws server shutting down");
    }

    async fn tick_loop(&self) {
        let mut interval = tokio::time::interval(config::CONNECTION_LOG_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    info!(connected = self.connected.load(Ordering::Relaxed), "connected clients");
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        self.connected.fetch_add(1, Ordering::Relaxed);
        // Admission gate: paces raw accepts before any upgrade or session
        // work happens for this socket. Nothing is written until admitted.
        let admitted = tokio::select! {
            _ = self.limiter.until_ready() => true,
            _ = self.shutdown.cancelled() => false,
        };
        if !admitted {
            debug!(%peer, "connection dropped during shutdown");
            self.connected.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        let conn_id = next_id();
        let span = info_span!("conn", conn_id, %peer, user_id = tracing::field::Empty);
        let (read_half, write_half) = socket.into_split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(frames_rx, write_half));

        let mut conn = Conn {
            id: conn_id,
            user_id: 0,
            token: self.shutdown.child_token(),
            frames_tx,
            handle: None,
        };

        let result = self
            .connection_loop(&mut conn, read_half)
            .instrument(span.clone())
            .await;
        if let Err(e) = result {
            span.in_scope(|| warn!(error = ?e, "connection closed"));
        }

        if conn.user_id != 0 {
            // Only this socket's own entry goes; a displacing successor
            // under the same user id is left alone.
            self.connections
                .remove_if(&conn.user_id, |_, handle| handle.conn_id == conn.id);
        }
        self.connected.fetch_sub(1, Ordering::Relaxed);
        span.in_scope(|| info!(user_id = conn.user_id, "client disconnected"));
    }

    async fn connection_loop(
        &self,
        conn: &mut Conn,
        mut read_half: OwnedReadHalf,
    ) -> Result<(), ConnError> {
        let mut wsc = WsCodec::new();
        loop {
            let n = tokio::select! {
                // Cancelled when a newer socket binds the same user or the
                // gateway shuts down.
                _ = conn.token.cancelled() => return Ok(()),
                read = read_half.read_buf(wsc.buf_mut()) => read?,
            };
            if n == 0 {
                return Ok(());
            }

            if !wsc.is_streaming() {
                let Some(handshake) = wsc.upgrade()? else {
                    continue;
                };
                // The 101 goes out before binding, matching the wire order
                // clients expect from the upgrade.
                let _ = conn.frames_tx.send(handshake.response);
                self.bind(conn, handshake.params.get("sid")).await?;
            }

            let decoded = wsc.decode()?;
            for reply in decoded.replies {
                let _ = conn.frames_tx.send(reply);
            }
            for message in decoded.messages {
                self.process_message(conn, message).await;
            }
            if decoded.close {
                return Ok(());
            }
        }
    }

    async fn bind(&self, conn: &mut Conn, sid: Option<&String>) -> Result<(), ConnError> {
        let Some(sid) = sid else {
            return Err(ConnError::MissingSessionId);
        };
        let Some(user) = session::lookup(self.store.as_ref(), sid).await else {
            return Err(ConnError::SessionRejected);
        };
        if user.id == 0 {
            return Err(ConnError::SessionRejected);
        }

        // Displace any previous socket for this user before taking the slot.
        if let Some((_, old)) = self.connections.remove(&user.id) {
            info!(user_id = user.id, "displacing previous connection");
            old.cancel.cancel();
        }
        let handle = Arc::new(ClientHandle {
            conn_id: conn.id,
            user_id: AtomicI64::new(user.id),
            server: RwLock::new(String::new()),
            frames: conn.frames_tx.clone(),
            cancel: conn.token.clone(),
        });
        self.connections.insert(user.id, handle.clone());
        conn.user_id = user.id;
        conn.handle = Some(handle);

        tracing::Span::current().record("user_id", user.id);
        info!(user_name = %user.user_name, game_id = user.game_id, "session bound");
        Ok(())
    }

    async fn process_message(&self, conn: &Conn, message: codec::Message) {
        if message.payload.as_ref() == b"Ping" {
            // Application-level liveness probe; answered in place, never
            // forwarded.
            let _ = conn
                .frames_tx
                .send(codec::encode_frame(OpCode::Binary, b"Pong"));
            return;
        }

        let mut req: ClientReq = match serde_json::from_slice(&message.payload) {
            Ok(req) => req,
            Err(e) => {
                warn!(user_id = conn.user_id, error = %e, "unparseable client message");
                return;
            }
        };
        if !self.allowlist.contains(&req.server) {
            return;
        }
        if let Some(handle) = &conn.handle {
            *handle.server.write() = req.server.clone();
        }
        // The wire value is never trusted.
        req.user_id = conn.user_id;
        if self.ingress_tx.send(req).await.is_err() {
            warn!("ingress channel closed; dropping request");
        }
    }
}

/// Delivers game responses to clients until the egress channel closes.
///
/// Each record is serialized once; a non-zero `user_id` unicasts to that
/// user's socket, zero fans out to every socket whose server attribute
/// matches the originating game.
pub(crate) async fn egress_pump(
    mut egress_rx: mpsc::Receiver<crate::protocol::ServerRes>,
    connections: Arc<ConnTable>,
) {
    while let Some(res) = egress_rx.recv().await {
        let payload = match serde_json::to_vec(&res) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize game response");
                continue;
            }
        };
        let frame = codec::encode_frame(OpCode::Binary, &payload);

        if res.user_id != 0 {
            let Some(handle) = connections.get(&res.user_id) else {
                continue;
            };
            if *handle.server.read() != res.server {
                continue;
            }
            if handle.frames.send(frame).is_err() {
                warn!(user_id = res.user_id, "dropped response for closed connection");
            }
        } else {
            for entry in connections.iter() {
                if *entry.server.read() != res.server {
                    continue;
                }
                if entry.frames.send(frame.clone()).is_err() {
                    warn!(
                        user_id = entry.user_id.load(Ordering::Relaxed),
                        server = %res.server,
                        "dropped broadcast for closed connection"
                    );
                }
            }
        }
    }
    debug!("egress channel closed; pump exiting");
}

async fn writer_task(mut frames_rx: mpsc::UnboundedReceiver<Vec<u8>>, mut half: OwnedWriteHalf) {
    while let Some(frame) = frames_rx.recv().await {
        if let Err(e) = half.write_all(&frame).await {
            debug!(error = %e, "client write failed");
            break;
        }
    }
    let _ = half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::Quota;
    use std::num::NonZeroU32;

    fn test_handle(conn_id: u64, user_id: i64) -> Arc<ClientHandle> {
        let (frames, _rx) = mpsc::unbounded_channel();
        Arc::new(ClientHandle {
            conn_id,
            user_id: AtomicI64::new(user_id),
            server: RwLock::new(String::new()),
            frames,
            cancel: CancellationToken::new(),
        })
    }

    #[test]
    fn stale_close_does_not_evict_the_successor() {
        let table = ConnTable::new();
        table.insert(7, test_handle(1, 7));
        // A newer socket binds the same user.
        table.insert(7, test_handle(2, 7));

        // The displaced socket's teardown runs afterwards.
        table.remove_if(&7, |_, handle| handle.conn_id == 1);
        assert_eq!(table.get(&7).expect("successor stays").conn_id, 2);

        // The successor's own teardown does remove it.
        table.remove_if(&7, |_, handle| handle.conn_id == 2);
        assert!(table.get(&7).is_none());
    }

    #[test]
    fn admission_never_exceeds_burst_without_replenishment() {
        // One token an hour: no replenishment happens inside the test, so
        // exactly the burst is admitted.
        let quota = Quota::per_hour(NonZeroU32::new(1).unwrap())
            .allow_burst(NonZeroU32::new(10).unwrap());
        let limiter = RateLimiter::direct(quota);

        for _ in 0..10 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }
}
