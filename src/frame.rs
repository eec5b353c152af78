//! Frame — the universal message type for `SyncBoard`.
//!
//! ARCHITECTURE
//! ============
//! Every websocket message in either direction is a Frame: a named event
//! plus an arbitrary JSON payload. The gateway routes on `event` and hands
//! `data` to the matching handler, which owns its validation.
//!
//! DESIGN
//! ======
//! - Payloads are client-owned shapes (stroke paths, note records), so
//!   `data` is an untyped `serde_json::Value` rather than a flat map.
//! - `from` is stamped by the server on inbound frames with the sender's
//!   connection id; clients cannot spoof it.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Frame data key for grepable error codes.
pub const FRAME_CODE: &str = "code";

/// Event name for error replies sent to the originating connection only.
pub const EVENT_ERROR: &str = "error";

// =============================================================================
// TYPES
// =============================================================================

/// The universal message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    #[serde(default = "now_ms")]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create an event frame. Entry point for every outbound message.
    pub fn event(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self { id: Uuid::new_v4(), ts: now_ms(), from: None, event: event.into(), data }
    }

    /// Create an error frame from a plain string.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::event(EVENT_ERROR, serde_json::json!({ FRAME_MESSAGE: message.into() }))
    }

    /// Create a structured error frame from a typed error, echoing the event
    /// that triggered it.
    #[must_use]
    pub fn error_from(event: &str, err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::event(
            EVENT_ERROR,
            serde_json::json!({
                FRAME_CODE: err.error_code(),
                FRAME_MESSAGE: err.to_string(),
                "event": event,
            }),
        )
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
