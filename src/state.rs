//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is the one explicit context object for the process: it is
//! built once at startup (after the initial load from the document store)
//! and cloned into every Axum handler, websocket task, and background
//! sweeper. There are no module-level singletons.
//!
//! All board state lives behind a single `RwLock<BoardState>`. Handlers take
//! the write lock, mutate, snapshot what they need, and release it before
//! any broadcast or store I/O, so each inbound event is applied atomically
//! and persistence never blocks the hot path.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::db::{DocumentStore, Record};
use crate::frame::Frame;
use crate::services::document::SharedDocument;
use crate::services::persistence::DrawingSaveGate;
use crate::services::presence::PresenceRegistry;
use crate::services::scheduler::Scheduler;
use crate::services::turn::TurnArbiter;

/// Identity of one live websocket connection.
pub type ConnectionId = Uuid;

/// Fixed id of the single shared canvas.
pub const MAIN_DRAWING_ID: &str = "main-drawing";

// =============================================================================
// DRAWING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawOperation {
    Draw,
    Update,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawSource {
    Client,
    Server,
}

/// The shared canvas: an ordered list of client-owned stroke payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    pub id: String,
    pub paths: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DrawOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DrawSource>,
}

impl Drawing {
    #[must_use]
    pub fn empty() -> Self {
        Self { id: MAIN_DRAWING_ID.to_owned(), paths: Vec::new(), operation: None, source: None }
    }

    /// Rebuild from a stored record. Missing or non-array `paths` become
    /// empty and unknown enum values are dropped; the id is always fixed.
    #[must_use]
    pub fn from_record(record: &Record) -> Self {
        let paths = match record.get("paths") {
            Some(serde_json::Value::Array(paths)) => paths.clone(),
            _ => Vec::new(),
        };
        let operation = record
            .get("operation")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let source = record
            .get("source")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        Self { id: MAIN_DRAWING_ID.to_owned(), paths, operation, source }
    }

    #[must_use]
    pub fn to_record(&self) -> Record {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(record)) => record,
            _ => Record::new(),
        }
    }
}

impl Default for Drawing {
    fn default() -> Self {
        Self::empty()
    }
}

// =============================================================================
// STICKY NOTE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A sticky note. Identity is `id`; `_id` is the storage-side identifier.
///
/// Every field besides `id` is optional so the same type carries both full
/// records and partial `updateNote` patches. Fields the server does not know
/// about are kept in `extra` and round-trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyNote {
    #[serde(default, deserialize_with = "deserialize_note_id")]
    pub id: String,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Milliseconds since Unix epoch, stamped by the server on every change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_content_update: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_final_content: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_final_position: bool,
    #[serde(flatten)]
    pub extra: Record,
}

impl StickyNote {
    /// Overlay every field present in `patch`. Transient flags always take
    /// the patch's values since they describe the latest edit only.
    pub fn merge(&mut self, patch: StickyNote) {
        if let Some(storage_id) = patch.storage_id {
            self.storage_id = Some(storage_id);
        }
        if let Some(text) = patch.text {
            self.text = Some(text);
        }
        if let Some(color) = patch.color {
            self.color = Some(color);
        }
        if let Some(position) = patch.position {
            self.position = Some(position);
        }
        if let Some(last_updated) = patch.last_updated {
            self.last_updated = Some(last_updated);
        }
        self.is_content_update = patch.is_content_update;
        self.is_final_content = patch.is_final_content;
        self.is_final_position = patch.is_final_position;
        self.extra.extend(patch.extra);
    }

    /// Storage form: transient flags are stripped.
    #[must_use]
    pub fn to_record(&self) -> Record {
        let persisted = StickyNote {
            is_content_update: false,
            is_final_content: false,
            is_final_position: false,
            ..self.clone()
        };
        match serde_json::to_value(persisted) {
            Ok(serde_json::Value::Object(record)) => record,
            _ => Record::new(),
        }
    }

    #[must_use]
    pub fn from_record(record: Record) -> Option<Self> {
        let note: Self = serde_json::from_value(serde_json::Value::Object(record)).ok()?;
        (!note.id.is_empty()).then_some(note)
    }
}

/// Clients generate note ids with `Date.now()`, so accept numbers too.
fn deserialize_note_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Ok(String::new()),
    }
}

// =============================================================================
// BOARD STATE
// =============================================================================

/// Live state of the single shared board.
#[derive(Default)]
pub struct BoardState {
    /// Authoritative drawing and sticky-note cache.
    pub document: SharedDocument,
    /// Connected clients and their display attributes.
    pub presence: PresenceRegistry,
    /// Single-writer lock for appending strokes.
    pub turn: TurnArbiter,
    /// Outbound queues: `connection_id` -> sender for frames.
    pub clients: HashMap<ConnectionId, mpsc::Sender<Frame>>,
}

impl BoardState {
    #[must_use]
    pub fn new(document: SharedDocument) -> Self {
        Self { document, ..Self::default() }
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub board: Arc<RwLock<BoardState>>,
    pub store: Arc<dyn DocumentStore>,
    pub scheduler: Scheduler,
    /// Orders drawing writes between debounced and immediate saves.
    pub drawing_saves: DrawingSaveGate,
    pub config: SyncConfig,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, document: SharedDocument, config: SyncConfig) -> Self {
        Self {
            board: Arc::new(RwLock::new(BoardState::new(document))),
            store,
            scheduler: Scheduler::new(),
            drawing_saves: DrawingSaveGate::default(),
            config,
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
