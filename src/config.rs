use governor::Quota;
use std::num::NonZeroU32;
use std::time::Duration;
use std::{env, net::SocketAddr};

// Runtime/server knobs. Listen addresses and the game list are mandatory;
// a gateway without them has nothing to do, so startup aborts.

pub fn ws_addr() -> SocketAddr {
    env::var("GATEWAY_WS_ADDR")
        .expect("GATEWAY_WS_ADDR must be set")
        .parse()
        .expect("GATEWAY_WS_ADDR must be a socket address")
}

pub fn tcp_addr() -> SocketAddr {
    env::var("GATEWAY_TCP_ADDR")
        .expect("GATEWAY_TCP_ADDR must be set")
        .parse()
        .expect("GATEWAY_TCP_ADDR must be a socket address")
}

pub fn redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Aliases a game service may register under, and the only values accepted in
/// a client request's `server` field. Fixed for the life of the process.
pub fn game_list() -> Vec<String> {
    let raw = env::var("GATEWAY_GAME_LIST").expect("GATEWAY_GAME_LIST must be set");
    let list = parse_game_list(&raw);
    assert!(
        !list.is_empty(),
        "GATEWAY_GAME_LIST must name at least one game"
    );
    list
}

fn parse_game_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|alias| !alias.is_empty())
        .map(str::to_string)
        .collect()
}

// All client traffic funnels through a single buffered hop in each direction.
pub const INGRESS_CHANNEL_CAPACITY: usize = 1;
pub const EGRESS_CHANNEL_CAPACITY: usize = 1;

pub const CONNECTION_LOG_INTERVAL: Duration = Duration::from_secs(60);

const ADMISSION_RATE_PER_SECOND: u32 = 2000;
const ADMISSION_BURST: u32 = 10;

/// Token bucket pacing accepted client sockets ahead of any upgrade or
/// session-store work.
pub fn admission_quota() -> Quota {
    let rate = NonZeroU32::new(ADMISSION_RATE_PER_SECOND).expect("admission rate is non-zero");
    let burst = NonZeroU32::new(ADMISSION_BURST).expect("admission burst is non-zero");
    Quota::per_second(rate).allow_burst(burst)
}
