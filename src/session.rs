//! Game sessions
//!
//! A session is the time box a competition runs in. Sessions are created by
//! an administrator; the engine only reads them.

use crate::types::{Cash, SessionId, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSession {
    pub id: SessionId,
    pub name: String,
    /// Cash every new portfolio in this session starts with
    pub starting_cash: Cash,
    pub starts_at: Timestamp,
    /// Open-ended when `None`
    pub ends_at: Option<Timestamp>,
    pub is_active: bool,
}

impl GameSession {
    pub fn new(name: impl Into<String>, starting_cash: Cash, starts_at: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            starting_cash,
            starts_at,
            ends_at: None,
            is_active: false,
        }
    }

    pub fn ending_at(mut self, ends_at: Timestamp) -> Self {
        self.ends_at = Some(ends_at);
        self
    }

    /// Whether trades may be placed at `now`
    pub fn is_open_at(&self, now: Timestamp) -> bool {
        now >= self.starts_at && self.ends_at.map_or(true, |end| now < end)
    }
}
