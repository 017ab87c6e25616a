use game_gateway::{config, session::RedisSessionStore};
use std::sync::Arc;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::capture();
        tracing::error!(%info, ?backtrace, "panic");
    }));
}

#[tokio::main]
async fn main() {
    // Load .env locally; safe to ignore when not present.
    let _ = dotenvy::dotenv();
    init_tracing();

    // Mandatory knobs abort here before any sockets open.
    let ws_addr = config::ws_addr();
    let tcp_addr = config::tcp_addr();
    let game_list = config::game_list();
    let redis_url = config::redis_url();

    let store = match RedisSessionStore::connect(&redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to reach the session store");
            return; // Abort startup when the session store is unreachable
        }
    };

    let ws_listener = match tokio::net::TcpListener::bind(ws_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%ws_addr, error = %e, "failed to bind ws address");
            return; // Abort startup on bind failure
        }
    };
    let tcp_listener = match tokio::net::TcpListener::bind(tcp_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%tcp_addr, error = %e, "failed to bind tcp address");
            return;
        }
    };

    if let Err(e) = game_gateway::run(ws_listener, tcp_listener, store, game_list).await {
        tracing::error!(error = %e, "gateway error");
    }
}
