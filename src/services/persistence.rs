//! Persistence service — coalesced writes to the document store.
//!
//! DESIGN
//! ======
//! The gateway never writes to the store on the hot path. Each mutation
//! snapshots the record it wants saved and hands it to the scheduler under a
//! per-record key; rapid edits to the same record collapse into one write
//! carrying the last snapshot. Clearing the canvas is the one immediate
//! write, and it cancels any pending drawing save first so stale strokes
//! cannot land after the clear.
//!
//! Drawing writes are serialized by a `DrawingSaveGate`. An immediate save
//! bumps the gate's generation before it queues for the write lock, and a
//! debounced save that already fired checks that generation once it holds
//! the lock. A save in flight when the canvas is cleared either finishes
//! before the clear's write or is skipped.
//!
//! ERROR HANDLING
//! ==============
//! Deferred writes log failures inside the scheduler. The immediate clear
//! returns its error to the caller, which logs it; nothing is surfaced to
//! clients.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::db::{DRAWINGS, DocumentStore, Record, STICKY_NOTES, StoreError};
use crate::frame::now_ms;
use crate::state::{AppState, Drawing, MAIN_DRAWING_ID, StickyNote};

/// Debounce key for main drawing saves.
pub const DRAWING_SAVE_KEY: &str = MAIN_DRAWING_ID;

/// Fields written when an existing drawing record is updated.
const DRAWING_UPDATE_FIELDS: [&str; 4] = ["paths", "operation", "source", "lastUpdated"];

/// Optional drawing fields cleared in the store when the snapshot omits them.
const DRAWING_NULLABLE_FIELDS: [&str; 2] = ["operation", "source"];

/// Fields written when an existing note record is updated.
const NOTE_UPDATE_FIELDS: [&str; 4] = ["text", "color", "position", "lastUpdated"];

#[must_use]
pub fn note_insert_key(id: &str) -> String {
    format!("note_{id}")
}

#[must_use]
pub fn note_update_key(id: &str) -> String {
    format!("update_note_{id}")
}

#[must_use]
pub fn note_delete_key(id: &str) -> String {
    format!("delete_note_{id}")
}

// =============================================================================
// DRAWING SAVE GATE
// =============================================================================

/// Write lock plus generation counter shared by every drawing save.
#[derive(Debug, Clone, Default)]
pub struct DrawingSaveGate {
    generation: Arc<AtomicU64>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl DrawingSaveGate {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate every debounced save scheduled before now.
    fn supersede(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

// =============================================================================
// SCHEDULING
// =============================================================================

/// Debounce a save of the given drawing snapshot.
pub fn schedule_drawing_save(state: &AppState, drawing: Drawing) {
    let store = state.store.clone();
    let gate = state.drawing_saves.clone();
    let generation = gate.generation();
    state
        .scheduler
        .schedule_debounced(DRAWING_SAVE_KEY, state.config.save_debounce, async move {
            let _write = gate.lock.lock().await;
            if gate.generation() != generation {
                debug!(generation, "drawing save superseded by an immediate save");
                return Ok(());
            }
            save_drawing(store.as_ref(), &drawing).await
        });
}

/// Save the drawing now, discarding any pending debounced drawing save.
///
/// The cancel and generation bump happen when this is called; the returned
/// future performs the write once earlier drawing writes have finished. The
/// gateway calls this under the board lock and awaits the write after
/// releasing it.
///
/// # Errors
///
/// The future returns the store error if the read or write fails.
pub fn save_drawing_now(
    state: &AppState,
    drawing: Drawing,
) -> impl Future<Output = Result<(), StoreError>> + Send + use<> {
    if state.scheduler.cancel(DRAWING_SAVE_KEY) {
        debug!("cancelled pending drawing save in favor of immediate save");
    }
    let gate = state.drawing_saves.clone();
    let generation = gate.supersede();
    let store = state.store.clone();
    async move {
        let _write = gate.lock.lock().await;
        debug!(generation, "writing drawing immediately");
        save_drawing(store.as_ref(), &drawing).await
    }
}

pub fn schedule_note_insert(state: &AppState, note: StickyNote) {
    let store = state.store.clone();
    state
        .scheduler
        .schedule_debounced(note_insert_key(&note.id), state.config.save_debounce, async move {
            insert_note(store.as_ref(), &note).await
        });
}

/// Debounce a note update. If the note's insert has not fired yet, the
/// insert is rescheduled with the updated note instead.
pub fn schedule_note_update(state: &AppState, note: StickyNote) {
    if state.scheduler.is_pending(&note_insert_key(&note.id)) {
        schedule_note_insert(state, note);
        return;
    }

    let store = state.store.clone();
    state
        .scheduler
        .schedule_debounced(note_update_key(&note.id), state.config.save_debounce, async move {
            update_note(store.as_ref(), &note).await
        });
}

/// Debounce a note delete. Pending insert and update saves for the note are
/// dropped; they would only resurrect or touch a record that is going away.
pub fn schedule_note_delete(state: &AppState, id: String) {
    state.scheduler.cancel(&note_update_key(&id));
    let insert_pending = state.scheduler.cancel(&note_insert_key(&id));
    if insert_pending {
        // Never reached the store; nothing to delete.
        debug!(note_id = %id, "note deleted before its insert was persisted");
        return;
    }

    let store = state.store.clone();
    state
        .scheduler
        .schedule_debounced(note_delete_key(&id), state.config.save_debounce, async move {
            delete_note(store.as_ref(), &id).await
        });
}

// =============================================================================
// STORE WRITES
// =============================================================================

/// Upsert the drawing: update the named fields when a record with the same
/// id exists, otherwise insert the whole record. Stamps `lastUpdated`.
///
/// # Errors
///
/// Returns the store error if the read or write fails.
pub async fn save_drawing(store: &dyn DocumentStore, drawing: &Drawing) -> Result<(), StoreError> {
    let mut record = drawing.to_record();
    record.insert("lastUpdated".into(), serde_json::json!(now_ms()));

    let mut filter = Record::new();
    filter.insert("id".into(), serde_json::json!(drawing.id));
    let existing = store.read(DRAWINGS, &filter).await?;

    if existing.is_empty() {
        store.write(DRAWINGS, &record).await?;
        info!(id = %drawing.id, paths = drawing.paths.len(), "created drawing record");
    } else {
        let mut fields = pick_fields(&record, &DRAWING_UPDATE_FIELDS);
        // A cleared drawing has no operation or source; the stored ones go too.
        for field in DRAWING_NULLABLE_FIELDS {
            fields.entry(field).or_insert(serde_json::Value::Null);
        }
        store.update(DRAWINGS, &drawing.id, &fields).await?;
        info!(id = %drawing.id, paths = drawing.paths.len(), "updated drawing record");
    }
    Ok(())
}

/// # Errors
///
/// Returns the store error if the write fails.
pub async fn insert_note(store: &dyn DocumentStore, note: &StickyNote) -> Result<(), StoreError> {
    store.write(STICKY_NOTES, &note.to_record()).await?;
    info!(note_id = %note.id, "persisted new sticky note");
    Ok(())
}

/// # Errors
///
/// Returns the store error if the update fails.
pub async fn update_note(store: &dyn DocumentStore, note: &StickyNote) -> Result<(), StoreError> {
    let fields = pick_fields(&note.to_record(), &NOTE_UPDATE_FIELDS);
    let matched = store.update(STICKY_NOTES, &note.id, &fields).await?;
    if matched == 0 {
        debug!(note_id = %note.id, "note update matched no stored record");
    }
    Ok(())
}

/// # Errors
///
/// Returns the store error if the delete fails.
pub async fn delete_note(store: &dyn DocumentStore, id: &str) -> Result<(), StoreError> {
    let removed = store.delete(STICKY_NOTES, id).await?;
    info!(note_id = %id, removed, "deleted sticky note record");
    Ok(())
}

fn pick_fields(record: &Record, names: &[&str]) -> Record {
    names
        .iter()
        .filter_map(|name| {
            record
                .get(*name)
                .map(|value| ((*name).to_owned(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
