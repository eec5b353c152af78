//! Presence registry — live roster of connected clients.
//!
//! DESIGN
//! ======
//! One record per live connection, created on connect and dropped on
//! disconnect. `isDrawing` is never stored; it is derived at snapshot time
//! from the current drawing-turn holder so the roster cannot disagree with
//! the arbiter. The registry never broadcasts on its own: the gateway decides
//! when a snapshot goes out.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::frame::now_ms;
use crate::state::ConnectionId;

/// Display colors handed out to new connections.
pub const PALETTE: [&str; 15] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E9",
    "#F8B500", "#FF8C94", "#6C5CE7", "#00B894", "#E17055",
];

/// A connected client as seen by every other client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub connection_id: ConnectionId,
    /// Milliseconds since Unix epoch.
    pub joined_at: i64,
    pub color: String,
    pub initial: String,
    pub is_drawing: bool,
    /// Milliseconds since Unix epoch of the last drawing-turn transition.
    pub last_status_change: i64,
}

/// Partial client info sent with `update-user-info`. Absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfoPatch {
    pub color: Option<String>,
    pub initial: Option<String>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    clients: HashMap<ConnectionId, ClientRecord>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with a random palette color and A-Z initial.
    pub fn add_client(&mut self, connection_id: ConnectionId) -> ClientRecord {
        let mut rng = rand::rng();
        let color = PALETTE[rng.random_range(0..PALETTE.len())].to_owned();
        let initial = char::from(rng.random_range(b'A'..=b'Z')).to_string();
        let now = now_ms();

        let record = ClientRecord {
            connection_id,
            joined_at: now,
            color,
            initial,
            is_drawing: false,
            last_status_change: now,
        };
        self.clients.insert(connection_id, record.clone());
        record
    }

    /// Shallow-merge display fields. Returns false for unknown connections.
    pub fn update_client(&mut self, connection_id: ConnectionId, patch: ClientInfoPatch) -> bool {
        let Some(record) = self.clients.get_mut(&connection_id) else {
            return false;
        };
        if let Some(color) = patch.color {
            record.color = color;
        }
        if let Some(initial) = patch.initial {
            record.initial = initial;
        }
        true
    }

    /// Stamp a drawing-turn transition for `connection_id`.
    pub fn mark_status_change(&mut self, connection_id: ConnectionId) {
        if let Some(record) = self.clients.get_mut(&connection_id) {
            record.last_status_change = now_ms();
        }
    }

    pub fn remove_client(&mut self, connection_id: ConnectionId) -> Option<ClientRecord> {
        self.clients.remove(&connection_id)
    }

    #[cfg(test)]
    #[must_use]
    pub fn get(&self, connection_id: ConnectionId) -> Option<&ClientRecord> {
        self.clients.get(&connection_id)
    }

    #[cfg(test)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Roster ordered by join time, with `isDrawing` derived from `holder`.
    #[must_use]
    pub fn snapshot(&self, holder: Option<ConnectionId>) -> Vec<ClientRecord> {
        let mut records: Vec<ClientRecord> = self
            .clients
            .values()
            .map(|record| ClientRecord { is_drawing: holder == Some(record.connection_id), ..record.clone() })
            .collect();
        records.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        records
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
