// Shared bootstrap for gateway integration tests: one gateway per test
// binary on ephemeral ports, backed by an in-memory session store.
use async_trait::async_trait;
use game_gateway::protocol::session_key;
use game_gateway::session::SessionStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Aliases the test gateway allows. Tests use disjoint aliases so the suite
/// can run in parallel against the shared gateway.
pub const GAME_LIST: &[&str] = &["slots", "poker", "dice", "bingo", "lotto", "crash", "rummy"];

pub struct Gateway {
    pub ws_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
}

struct MemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn fetch(&self, key: &str) -> Result<Option<String>, String> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }
}

static GATEWAY: OnceLock<Gateway> = OnceLock::new();

/// Boots the gateway once for the whole test binary and returns its ports.
pub fn ensure_gateway() -> &'static Gateway {
    GATEWAY.get_or_init(|| {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        // An OS thread with its own runtime outlives the per-test runtimes.
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().expect("test runtime");
            runtime.block_on(async move {
                let ws_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("bind ws port");
                let tcp_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("bind tcp port");
                addr_tx
                    .send((
                        ws_listener.local_addr().expect("ws addr"),
                        tcp_listener.local_addr().expect("tcp addr"),
                    ))
                    .expect("publish addrs");

                let store = Arc::new(MemorySessionStore {
                    entries: Mutex::new(seeded_sessions()),
                });
                let game_list = GAME_LIST.iter().map(|alias| alias.to_string()).collect();
                game_gateway::run(ws_listener, tcp_listener, store, game_list)
                    .await
                    .expect("gateway failed");
            });
        });

        let (ws_addr, tcp_addr) = addr_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("gateway did not start");
        wait_until_accepting(ws_addr);
        wait_until_accepting(tcp_addr);
        Gateway { ws_addr, tcp_addr }
    })
}

fn seeded_sessions() -> HashMap<String, String> {
    let mut entries = HashMap::new();
    for user_id in [42i64, 142, 143, 242, 342, 442, 542] {
        entries.insert(
            session_key(&format!("sid-{user_id}")),
            serde_json::json!({
                "id": user_id,
                "userId": format!("op-{user_id}"),
                "userName": format!("user-{user_id}"),
                "agentId": 1,
                "agentName": "agent",
                "userSessionId": format!("ext-{user_id}"),
                "gameId": 9,
                "callbackUrl": "",
                "callbackKey": ""
            })
            .to_string(),
        );
    }
    // A record the store can hand back but the gateway must still reject.
    entries.insert(
        session_key("sid-zero"),
        serde_json::json!({"id": 0}).to_string(),
    );
    entries
}

fn wait_until_accepting(addr: SocketAddr) {
    for _ in 0..100 {
        if std::net::TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("gateway did not become ready in time");
}

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect_client(gateway: &Gateway, sid: &str) -> WsClient {
    let (client, _) = connect_async(format!("ws://{}/?sid={sid}", gateway.ws_addr))
        .await
        .expect("websocket handshake");
    client
}

pub struct GameLink {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

/// Connects a fake game service and announces `alias`.
pub async fn register_game(gateway: &Gateway, alias: &str) -> GameLink {
    let socket = TcpStream::connect(gateway.tcp_addr)
        .await
        .expect("connect game port");
    let (read_half, write_half) = socket.into_split();
    let mut link = GameLink {
        reader: BufReader::new(read_half),
        writer: write_half,
    };
    link.writer
        .write_all(format!("{alias}\n").as_bytes())
        .await
        .expect("send alias");
    // Give the gateway a beat to install the link before traffic flows.
    tokio::time::sleep(Duration::from_millis(100)).await;
    link
}

pub async fn read_game_line(link: &mut GameLink) -> String {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), link.reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a game line")
        .expect("game read failed");
    line
}

/// Asserts no line reaches the game within a short window.
pub async fn expect_no_game_line(link: &mut GameLink) {
    let mut line = String::new();
    let read = tokio::time::timeout(
        Duration::from_millis(300),
        link.reader.read_line(&mut line),
    )
    .await;
    assert!(read.is_err(), "unexpected game line: {line:?}");
}
