//! Request/response bodies for the RPC surface, plus the error envelope.

use mpf_schemas::mastodon::Status;
use mpf_schemas::{
    FetchOutcome, ListDirection, ReadMode, SetStatusAction, Settings, StatusMeta, StreamState,
    StreamStatusState, UserInfo,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

/// Frontend bootstrap document.
#[derive(Debug, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub default_server: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_info: UserInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    pub server_addr: String,
    #[serde(default)]
    pub invite_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    pub authorize_addr: String,
    pub out_of_band: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenRequest {
    pub server_addr: String,
    pub auth_code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub user_info: UserInfo,
}

/// Stream counters plus the live fetching flag.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamInfo {
    #[serde(flatten)]
    pub stream: StreamState,
    pub fetching: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRequest {
    pub stid: i64,
    #[serde(default)]
    pub position: i64,
    pub direction: ListDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub asid: i64,
    pub server_addr: String,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListItem {
    pub position: i64,
    pub sid: i64,
    pub status: Status,
    pub account: AccountSummary,
    pub meta: StatusMeta,
    pub state: StreamStatusState,
}

/// Whether a direction has (or may have) more content beyond the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListState {
    Partial,
    Done,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub items: Vec<ListItem>,
    pub stream_info: StreamInfo,
    pub forward_position: i64,
    pub backward_position: i64,
    pub forward_state: ListState,
    pub backward_state: ListState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub stid: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub fetched_count: i64,
    pub outcome: FetchOutcome,
    pub stream_info: StreamInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetReadRequest {
    pub stid: i64,
    pub last_read: i64,
    pub mode: ReadMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetReadResponse {
    pub stream_info: StreamInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetStatusRequest {
    /// Upstream status id.
    pub status_id: String,
    pub action: SetStatusAction,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetStatusResponse {
    pub status: Status,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub status_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchItem {
    pub sid: i64,
    pub status: Status,
    pub meta: StatusMeta,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub items: Vec<SearchItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateSettingsRequest {
    pub settings: Settings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmptyResponse {}
