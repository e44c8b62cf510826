//! Upstream Mastodon payload types.
//!
//! Only the fields the stream engine actually reads are modeled; everything
//! else rides along in the flattened `extra` map so a stored payload
//! round-trips through deserialize/serialize without losing data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A status as returned by the upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reblog: Option<Box<Status>>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favourited: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Status {
    /// The status whose content/tags are subject to filtering: the reblogged
    /// status when this is a boost, otherwise the status itself.
    pub fn unwrapped(&self) -> &Status {
        match &self.reblog {
            Some(inner) => inner,
            None => self,
        }
    }

    /// Upstream id of the reblogged status, if this is a boost.
    pub fn reblog_id(&self) -> Option<&str> {
        self.reblog.as_ref().map(|s| s.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A server-side filter as returned by `/api/v1/filters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub id: String,
    pub phrase: String,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The account record returned by `verify_credentials`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MastodonAccount {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A timeline read marker (`/api/v1/markers`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub last_read_id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
