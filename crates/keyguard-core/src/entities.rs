//! Key and Api entities as they are stored at the origin and cached on nodes.
//!
//! A request arrives carrying a key *hash*, never an id, so the hash is the
//! cache key for the fast lookup path. Every key belongs to exactly one key
//! auth group (`key_auth_id`), and the Api owning that group is cached
//! separately under the same `key_auth_id`.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// How accurately a key's rate limit must be enforced across the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RatelimitKind {
    /// Each node enforces the limit on its own counter.
    #[default]
    Fast,
    /// The limit is enforced fleet-wide against a shared counter.
    Consistent,
}

impl RatelimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatelimitKind::Fast => "fast",
            RatelimitKind::Consistent => "consistent",
        }
    }
}

impl std::fmt::Display for RatelimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-key rate limit attached at key creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRatelimit {
    #[serde(default)]
    pub kind: RatelimitKind,
    /// Requests admitted per window.
    pub limit: u64,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

/// An API key as known by the origin store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    /// Content-derived hash; the only identifier requests carry.
    pub hash: String,
    pub key_auth_id: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Visible prefix of the plaintext key, for display only.
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,
    #[serde(default)]
    pub ratelimit: Option<KeyRatelimit>,
    /// Remaining uses, if the key is usage-capped.
    #[serde(default)]
    pub remaining: Option<i64>,
}

impl Key {
    pub fn new(
        id: impl Into<String>,
        hash: impl Into<String>,
        key_auth_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
            key_auth_id: key_auth_id.into(),
            workspace_id: String::new(),
            name: None,
            start: None,
            owner_id: None,
            meta: None,
            created_at: OffsetDateTime::now_utc(),
            expires: None,
            ratelimit: None,
            remaining: None,
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = workspace_id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_expires(mut self, expires: OffsetDateTime) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_ratelimit(mut self, ratelimit: KeyRatelimit) -> Self {
        self.ratelimit = Some(ratelimit);
        self
    }

    pub fn with_remaining(mut self, remaining: i64) -> Self {
        self.remaining = Some(remaining);
        self
    }

    /// Whether the key's expiry lies at or before `now`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires.is_some_and(|exp| exp <= now)
    }
}

/// How keys of an Api are presented by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Key,
    Jwt,
}

/// An API grouping keys under a single key auth group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Api {
    pub id: String,
    pub key_auth_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub workspace_id: String,
    /// Source addresses allowed to use keys of this Api; empty allows all.
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub auth_type: AuthType,
}

impl Api {
    pub fn new(id: impl Into<String>, key_auth_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key_auth_id: key_auth_id.into(),
            name: String::new(),
            workspace_id: String::new(),
            ip_whitelist: Vec::new(),
            auth_type: AuthType::Key,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = workspace_id.into();
        self
    }

    pub fn with_ip_whitelist(mut self, ips: Vec<String>) -> Self {
        self.ip_whitelist = ips;
        self
    }
}
