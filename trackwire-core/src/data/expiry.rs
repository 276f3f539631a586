//! Expiration policies for persistent event data

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How long a persistent data item lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Expiry {
    /// Until explicitly deleted
    Forever,
    /// Until the current session ends
    Session,
    /// Until the next time the data manager is created
    UntilRestart,
    /// Until a fixed point in time
    At { expires_at: DateTime<Utc> },
}

impl Expiry {
    /// Expire `duration` from now
    pub fn after(duration: Duration) -> Self {
        Self::after_from(Utc::now(), duration)
    }

    pub fn after_from(now: DateTime<Utc>, duration: Duration) -> Self {
        Expiry::At {
            expires_at: now + duration,
        }
    }

    /// Whether a time-based expiry has elapsed at `now`.
    ///
    /// Session and restart scoped items never expire by time alone.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Expiry::At { expires_at } => *expires_at <= now,
            _ => false,
        }
    }
}

/// Stored value with its expiry tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    pub value: Value,
    pub expiry: Expiry,
}
