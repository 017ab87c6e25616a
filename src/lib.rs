pub mod codec;
pub mod config;
pub mod protocol;
pub mod session;
pub mod tcp;
pub mod util;
pub mod ws;

use crate::session::SessionStore;

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runs the gateway on the given listeners until shutdown.
///
/// The front-end and back-end talk only through the two bounded channels:
/// client requests flow in on ingress, game responses flow back on egress.
pub async fn run(
    ws_listener: TcpListener,
    tcp_listener: TcpListener,
    store: Arc<dyn SessionStore>,
    game_list: Vec<String>,
) -> std::io::Result<()> {
    let ws_addr = ws_listener.local_addr()?;
    let tcp_addr = tcp_listener.local_addr()?;
    tracing::info!(%ws_addr, %tcp_addr, games = game_list.len(), "starting gateway");

    let shutdown = CancellationToken::new();
    let allowlist: Arc<HashSet<String>> = Arc::new(game_list.into_iter().collect());
    let (ingress_tx, ingress_rx) = mpsc::channel(config::INGRESS_CHANNEL_CAPACITY);
    let (egress_tx, egress_rx) = mpsc::channel(config::EGRESS_CHANNEL_CAPACITY);
    let connections: Arc<ws::ConnTable> = Arc::new(DashMap::new());

    let game_server = Arc::new(tcp::GameServer::new(
        allowlist.clone(),
        egress_tx,
        shutdown.clone(),
    ));
    tokio::spawn(game_server.run(tcp_listener, ingress_rx));
    tokio::spawn(ws::egress_pump(egress_rx, connections.clone()));

    // Ctrl-C flips the shutdown token; accept loops stop, per-connection
    // tasks unwind, and the pumps drain out as the channels close.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let ws_server = Arc::new(ws::WsServer::new(
        store,
        allowlist,
        connections,
        ingress_tx,
        shutdown,
    ));
    ws_server.run(ws_listener).await;
    Ok(())
}
