//! Shared types for the mastopoof workspace: entity state records persisted
//! as JSON `state` columns, per-user settings with override flags, and the
//! enums used across the stream engine and the RPC surface.

use serde::{Deserialize, Serialize};

pub mod error;
pub mod mastodon;

pub use error::{Error, Result};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Notification summary derived from the upstream notifications endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationState {
    #[default]
    Unknown,
    None,
    Some,
    More,
}

/// Per-status-per-stream "already seen" marker, set at ingestion time from
/// the reblog dedup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlreadySeen {
    #[default]
    Unknown,
    Yes,
    No,
}

/// Reblog dedup policy lever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeenReblogs {
    Hide,
    Show,
}

/// Read-cursor update mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadMode {
    Advance,
    Absolute,
}

/// Direction of a `List` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListDirection {
    Initial,
    Forward,
    Backward,
}

/// Action for the `SetStatus` RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetStatusAction {
    Favourite,
    Unfavourite,
    Refresh,
}

/// Outcome of one `Fetch` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchOutcome {
    More,
    Done,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Shipped defaults, resolved at startup and sent to the frontend alongside
/// the user's own record.
pub const DEFAULT_LIST_COUNT: i64 = 20;
pub const DEFAULT_SEEN_REBLOGS: SeenReblogs = SeenReblogs::Hide;

/// An int setting with its per-field override flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SettingInt64 {
    pub value: i64,
    pub overridden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingSeenReblogs {
    pub value: SeenReblogs,
    pub overridden: bool,
}

impl Default for SettingSeenReblogs {
    fn default() -> Self {
        Self {
            value: DEFAULT_SEEN_REBLOGS,
            overridden: false,
        }
    }
}

/// Per-user settings record. Replaced atomically by `UpdateSettings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub list_count: SettingInt64,
    #[serde(default)]
    pub seen_reblogs: SettingSeenReblogs,
}

impl Settings {
    /// Override flag true => user value, else the shipped default.
    pub fn list_count(&self) -> i64 {
        if self.list_count.overridden {
            self.list_count.value
        } else {
            DEFAULT_LIST_COUNT
        }
    }

    pub fn seen_reblogs(&self) -> SeenReblogs {
        if self.seen_reblogs.overridden {
            self.seen_reblogs.value
        } else {
            DEFAULT_SEEN_REBLOGS
        }
    }
}

/// Resolved defaults shipped to the frontend in `UserInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsDefaults {
    pub list_count: i64,
    pub seen_reblogs: SeenReblogs,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            list_count: DEFAULT_LIST_COUNT,
            seen_reblogs: DEFAULT_SEEN_REBLOGS,
        }
    }
}

// ---------------------------------------------------------------------------
// Entity state records (JSON `state` columns)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserState {
    pub uid: i64,
    /// Stream shown by default for this user.
    pub default_stid: i64,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AccountState {
    pub asid: i64,
    pub uid: i64,
    pub server_addr: String,
    /// Account id on the upstream server.
    pub account_id: String,
    pub username: String,
    pub access_token: String,
    /// Greatest upstream status id ever ingested from the home timeline.
    /// `None` before the first fetch.
    #[serde(default)]
    pub last_home_status_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppRegState {
    /// `sha256(server_addr|scopes|redirect_uri)`, hex-encoded.
    pub key: String,
    pub server_addr: String,
    pub scopes: String,
    pub redirect_uri: String,
    pub client_id: String,
    pub client_secret: String,
    /// Authorization URL returned at registration time.
    pub auth_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamState {
    pub stid: i64,
    pub uid: i64,
    /// 0 iff the stream has no positioned content; else >= 1.
    #[serde(default)]
    pub first_position: i64,
    #[serde(default)]
    pub last_position: i64,
    /// Highest position the user has seen. 0 = nothing read.
    #[serde(default)]
    pub last_read: i64,
    /// Count of pool rows (position IS NULL) for this stream.
    #[serde(default)]
    pub remaining: i64,
    #[serde(default)]
    pub last_fetch_secs: Option<i64>,
    #[serde(default)]
    pub notification_state: NotificationState,
    #[serde(default)]
    pub notification_count: i64,
}

impl StreamState {
    pub fn new(stid: i64, uid: i64) -> Self {
        Self {
            stid,
            uid,
            ..Default::default()
        }
    }
}

/// Per-status metadata computed at ingestion (filter evaluation results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatusMeta {
    #[serde(default)]
    pub filters: Vec<FilterMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterMatch {
    pub id: String,
    pub matched: bool,
}

/// Per-status-per-stream state stored on the StreamContent row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamStatusState {
    #[serde(default)]
    pub already_seen: AlreadySeen,
}

/// Resolved user info returned by `Login` and `Token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user: UserState,
    pub default_stid: i64,
    pub settings: Settings,
    pub defaults: SettingsDefaults,
}

impl UserInfo {
    pub fn for_user(user: UserState) -> Self {
        let default_stid = user.default_stid;
        let settings = user.settings;
        Self {
            user,
            default_stid,
            settings,
            defaults: SettingsDefaults::default(),
        }
    }
}
