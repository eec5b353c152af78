//! Shared document — authoritative in-memory drawing and note cache.
//!
//! DESIGN
//! ======
//! The process owns one `Drawing` (fixed id) and one sticky-note cache keyed
//! by note id. Operations here are pure in-memory mutations; none of them
//! touch the document store. The gateway decides when (and whether) a change
//! is persisted.
//!
//! ERROR HANDLING
//! ==============
//! `load_initial` never fails: an unreachable store or a malformed record
//! falls back to an empty drawing and an empty cache, with the failure
//! logged.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::db::{DRAWINGS, DocumentStore, Record, STICKY_NOTES};
use crate::state::{Drawing, MAIN_DRAWING_ID, StickyNote};

#[derive(Debug, Default)]
pub struct SharedDocument {
    drawing: Drawing,
    notes: HashMap<String, StickyNote>,
}

impl SharedDocument {
    #[must_use]
    pub fn new(drawing: Drawing, notes: Vec<StickyNote>) -> Self {
        let mut document = Self { drawing, notes: HashMap::new() };
        document.replace_note_cache(notes);
        document
    }

    // =========================================================================
    // LOAD
    // =========================================================================

    /// Build the startup document from the store, defaulting on any failure.
    pub async fn load_initial(store: &dyn DocumentStore) -> Self {
        let drawing = match store.read(DRAWINGS, &Record::new()).await {
            Ok(records) => select_main_drawing(&records),
            Err(e) => {
                warn!(error = %e, "initial drawing load failed; starting with empty canvas");
                Drawing::empty()
            }
        };

        let notes = match store.read(STICKY_NOTES, &Record::new()).await {
            Ok(records) => notes_from_records(records),
            Err(e) => {
                warn!(error = %e, "initial sticky-note load failed; starting with empty cache");
                Vec::new()
            }
        };

        info!(paths = drawing.paths.len(), notes = notes.len(), "initialized shared document");
        Self::new(drawing, notes)
    }

    // =========================================================================
    // DRAWING
    // =========================================================================

    #[must_use]
    pub fn drawing(&self) -> &Drawing {
        &self.drawing
    }

    /// Append one stroke. Returns the new path count.
    pub fn append_stroke(&mut self, path: serde_json::Value) -> usize {
        self.drawing.paths.push(path);
        self.drawing.paths.len()
    }

    /// Replace the whole path list, keeping the fixed id.
    pub fn replace_drawing(&mut self, paths: Vec<serde_json::Value>) {
        self.drawing.id = MAIN_DRAWING_ID.to_owned();
        self.drawing.paths = paths;
    }

    pub fn clear_drawing(&mut self) {
        self.drawing = Drawing::empty();
    }

    // =========================================================================
    // NOTES
    // =========================================================================

    #[cfg(test)]
    #[must_use]
    pub fn note(&self, id: &str) -> Option<&StickyNote> {
        self.notes.get(id)
    }

    #[must_use]
    pub fn notes(&self) -> Vec<StickyNote> {
        self.notes.values().cloned().collect()
    }

    #[cfg(test)]
    #[must_use]
    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    /// Insert or replace a note by id.
    pub fn upsert_note(&mut self, note: StickyNote) {
        self.notes.insert(note.id.clone(), note);
    }

    /// Overlay a partial note onto the cached one. Returns the merged note,
    /// or `None` when the id is unknown.
    pub fn merge_note_update(&mut self, patch: StickyNote) -> Option<StickyNote> {
        let existing = self.notes.get_mut(&patch.id)?;
        existing.merge(patch);
        Some(existing.clone())
    }

    pub fn remove_note(&mut self, id: &str) -> Option<StickyNote> {
        self.notes.remove(id)
    }

    /// Replace the cache wholesale. Local edits not yet persisted are lost.
    pub fn replace_note_cache(&mut self, notes: Vec<StickyNote>) {
        self.notes = notes
            .into_iter()
            .map(|note| (note.id.clone(), note))
            .collect();
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn select_main_drawing(records: &[Record]) -> Drawing {
    records
        .iter()
        .find(|r| r.get("id").and_then(serde_json::Value::as_str) == Some(MAIN_DRAWING_ID))
        .map_or_else(Drawing::empty, Drawing::from_record)
}

/// Convert stored records to notes, skipping any without a usable id.
pub(crate) fn notes_from_records(records: Vec<Record>) -> Vec<StickyNote> {
    let total = records.len();
    let notes: Vec<StickyNote> = records
        .into_iter()
        .filter_map(StickyNote::from_record)
        .collect();
    if notes.len() < total {
        warn!(skipped = total - notes.len(), "ignored malformed sticky-note records");
    }
    notes
}

#[cfg(test)]
#[path = "document_test.rs"]
mod tests;
