use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session-store key holding the [`UserSession`] for a session id.
pub fn session_key(session_id: &str) -> String {
    format!("yuying:user:session:{session_id}")
}

/// Key listing the users attached to a game service.
///
/// Maintained by the game services; the gateway only documents the layout.
pub fn server_users_key(server: &str) -> String {
    format!("yuying:server:user:{server}")
}

/// Key recording which game service a user is currently on.
///
/// Maintained by the game services; the gateway only documents the layout.
pub fn user_server_key(user_id: i64) -> String {
    format!("yuying:user:server:{user_id}")
}

/// A client request on its way to a game service.
///
/// `user_id` is stamped with the bound session's id before the request leaves
/// the gateway; the value a client puts on the wire is discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientReq {
    pub server: String,
    #[serde(default)]
    pub user_id: i64,
    pub msg: ClientMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMsg {
    pub event: String,
    // Opaque payload; carried through untouched.
    #[serde(default)]
    pub data: Value,
}

/// A game-service response on its way to one client (`user_id` set) or to
/// every client on the originating game (`user_id` zero).
///
/// `server` is overwritten with the registered alias of the link the record
/// arrived on, whatever the game wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRes {
    #[serde(default, skip_serializing_if = "user_id_is_zero")]
    pub user_id: i64,
    #[serde(default)]
    pub server: String,
    pub event: String,
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub data: Value,
}

fn user_id_is_zero(user_id: &i64) -> bool {
    *user_id == 0
}

/// User descriptor held by the session store.
///
/// Read at bind time and discarded; the gateway never mutates or caches it.
/// `user_id` and `user_session_id` are the operator's identifiers, distinct
/// from the numeric `id` the gateway routes on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSession {
    pub id: i64,
    pub user_id: String,
    pub user_name: String,
    pub agent_id: i64,
    pub agent_name: String,
    pub user_session_id: String,
    pub game_id: i64,
    pub callback_url: String,
    pub callback_key: String,
}
