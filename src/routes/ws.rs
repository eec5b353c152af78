//! WebSocket handler — the synchronization gateway.
//!
//! DESIGN
//! ======
//! On upgrade, generates a connection id, registers it on the board, and
//! enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by event name
//! - Fan-out frames from peers → forward to client
//!
//! Handler functions are business logic only: they validate the payload,
//! mutate the locked board, snapshot what must go out, and return an
//! `Outcome`. The dispatch layer owns all outbound concerns: replies to the
//! sender, broadcasts to peers, and scheduling persistence. It takes the
//! board write lock once per frame and applies the outcome before releasing
//! it, so each event is fully fanned out before the next one is handled.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → self: `connected`, `load-drawing`, `load-sticky-notes`;
//!    all: `users-update`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome under the lock (emits, then persistence)
//! 4. Close → release turn, drop presence → all: `users-update`
//!
//! ERROR HANDLING
//! ==============
//! Malformed input never mutates state. It is logged at warn and answered
//! with a self-only `error` frame. Store failures are logged and never reach
//! clients.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{Record, STICKY_NOTES, StoreError};
use crate::frame::{ErrorCode, Frame, now_ms};
use crate::services;
use crate::services::board::{fan_out, presence_frame};
use crate::services::presence::ClientInfoPatch;
use crate::services::turn::TurnDecision;
use crate::state::{AppState, BoardState, ConnectionId, DrawOperation, DrawSource, Drawing, StickyNote};

/// Outbound queue depth per connection.
const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Characters for the random suffix of temporary storage ids.
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

// =============================================================================
// EVENTS
// =============================================================================

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_LOAD_DRAWING: &str = "load-drawing";
pub const EVENT_LOAD_DRAW: &str = "load-draw";
pub const EVENT_LOAD_STICKY_NOTES: &str = "load-sticky-notes";
pub const EVENT_UPDATE_USER_INFO: &str = "update-user-info";
pub const EVENT_ADD_NOTE: &str = "add-note";
pub const EVENT_NOTE_ADDED: &str = "note-added";
pub const EVENT_DELETE_STICKY_NOTE: &str = "delete-sticky-note";
pub const EVENT_NOTE_DELETED: &str = "note-deleted";
pub const EVENT_UPDATE_NOTE: &str = "updateNote";
pub const EVENT_DRAW: &str = "draw";
pub const EVENT_DRAWING_NOT_ALLOWED: &str = "drawing-not-allowed";
pub const EVENT_STOP_DRAW: &str = "stop-draw";
pub const EVENT_UPDATE_DRAWING: &str = "update-drawing";
pub const EVENT_CLEAR_CANVAS: &str = "clear-canvas";
pub const EVENT_FORCE_CLEAR_DRAWING_STATE: &str = "force-clear-drawing-state";
pub const EVENT_ENSURE_DRAWING_STOPPED: &str = "ensure-drawing-stopped";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("note id required")]
    MissingNoteId,
    #[error("draw path required")]
    MissingPath,
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

impl ErrorCode for GatewayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "E_INVALID_PAYLOAD",
            Self::MissingNoteId => "E_MISSING_NOTE_ID",
            Self::MissingPath => "E_MISSING_PATH",
            Self::UnknownEvent(_) => "E_UNKNOWN_EVENT",
        }
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Who receives an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience {
    /// The sender only.
    Sender,
    /// Every connection except the sender.
    Others,
    /// Every connection including the sender.
    All,
}

/// Deferred or immediate store write requested by a handler. Each variant
/// carries the snapshot taken while the board lock was held.
#[derive(Debug)]
enum Persist {
    DrawingDebounced(Drawing),
    DrawingNow(Drawing),
    NoteInsert(StickyNote),
    NoteUpdate(StickyNote),
    NoteDelete(String),
}

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what; handlers never send frames directly.
#[derive(Debug, Default)]
struct Outcome {
    /// Emitted in order.
    emits: Vec<(Audience, Frame)>,
    persist: Option<Persist>,
}

impl Outcome {
    fn done() -> Self {
        Self::default()
    }

    fn reply(frame: Frame) -> Self {
        Self::done().then(Audience::Sender, frame)
    }

    fn then(mut self, audience: Audience, frame: Frame) -> Self {
        self.emits.push((audience, frame));
        self
    }

    fn then_if(self, condition: bool, audience: Audience, frame: impl FnOnce() -> Frame) -> Self {
        if condition { self.then(audience, frame()) } else { self }
    }

    fn persist(mut self, persist: Persist) -> Self {
        self.persist = Some(persist);
        self
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();

    // Per-connection channel for receiving fan-out frames from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(CLIENT_QUEUE_CAPACITY);

    let handshake = handle_connect(&state, connection_id, client_tx).await;
    if send_all(&mut socket, &handshake).await.is_err() {
        handle_disconnect(&state, connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, connection_id, text.as_str()).await;
                        if send_all(&mut socket, &replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    handle_disconnect(&state, connection_id).await;
}

/// Register the connection and return the handshake frames for the sender.
/// Peers (and the sender's queue) receive the new presence roster.
async fn handle_connect(state: &AppState, connection_id: ConnectionId, client_tx: mpsc::Sender<Frame>) -> Vec<Frame> {
    let snapshot = services::board::connect(state, connection_id, client_tx).await;

    vec![
        Frame::event(
            EVENT_CONNECTED,
            json!({
                "connectionId": connection_id,
                "color": snapshot.client.color,
                "initial": snapshot.client.initial,
            }),
        ),
        Frame::event(EVENT_LOAD_DRAWING, to_json(&snapshot.drawing)),
        Frame::event(EVENT_LOAD_STICKY_NOTES, to_json(&snapshot.notes)),
    ]
}

async fn handle_disconnect(state: &AppState, connection_id: ConnectionId) {
    services::board::disconnect(state, connection_id).await;
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// The board write lock is held from the handler through fan-out and
/// persistence scheduling, so peers observe events in the order they were
/// applied. Only the immediate drawing save is awaited after the lock is
/// released.
async fn process_inbound_text(state: &AppState, connection_id: ConnectionId, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%connection_id, error = %e, "ws: invalid inbound frame");
            return vec![Frame::error(format!("invalid json: {e}"))];
        }
    };

    // Stamp the connection as `from`.
    req.from = Some(connection_id.to_string());

    if is_high_frequency(&req.event) {
        debug!(%connection_id, id = %req.id, event = %req.event, "ws: recv frame");
    } else {
        info!(%connection_id, id = %req.id, event = %req.event, "ws: recv frame");
    }

    // Store reads happen before the lock is taken.
    let refreshed_notes = if req.event == EVENT_LOAD_STICKY_NOTES {
        Some(state.store.read(STICKY_NOTES, &Record::new()).await)
    } else {
        None
    };

    let mut board = state.board.write().await;
    let result = match refreshed_notes {
        Some(refreshed) => Ok(handle_load_sticky_notes(&mut board, refreshed)),
        None => dispatch(state, &mut board, connection_id, &req),
    };
    let (replies, immediate_save) = match result {
        Ok(outcome) => apply_outcome(state, &board, connection_id, outcome),
        Err(e) => {
            warn!(%connection_id, event = %req.event, code = e.error_code(), error = %e, "ws: rejected frame");
            (vec![Frame::error_from(&req.event, &e)], None)
        }
    };
    drop(board);

    if let Some(save) = immediate_save {
        if let Err(e) = save.await {
            warn!(error = %e, code = e.error_code(), "immediate drawing save failed");
        }
    }
    replies
}

/// Route a frame to its handler. Runs with the board write lock held.
fn dispatch(
    state: &AppState,
    board: &mut BoardState,
    connection_id: ConnectionId,
    req: &Frame,
) -> Result<Outcome, GatewayError> {
    match req.event.as_str() {
        EVENT_UPDATE_USER_INFO => handle_update_user_info(board, connection_id, req),
        EVENT_ADD_NOTE => handle_add_note(board, req),
        EVENT_DELETE_STICKY_NOTE => handle_delete_note(state, board, req),
        EVENT_UPDATE_NOTE => handle_update_note(state, board, connection_id, req),
        EVENT_LOAD_DRAW => Ok(handle_load_draw(board)),
        EVENT_DRAW => handle_draw(board, connection_id, req),
        EVENT_STOP_DRAW => Ok(handle_stop_draw(board, connection_id, req)),
        EVENT_UPDATE_DRAWING => Ok(handle_update_drawing(board, req)),
        EVENT_CLEAR_CANVAS => Ok(handle_clear_canvas(board, connection_id)),
        EVENT_FORCE_CLEAR_DRAWING_STATE => Ok(handle_force_clear(board, connection_id)),
        EVENT_ENSURE_DRAWING_STOPPED => Ok(handle_ensure_stopped(board, connection_id)),
        other => Err(GatewayError::UnknownEvent(other.to_owned())),
    }
}

/// Apply an outcome against the locked board: emit frames in order, then
/// schedule persistence. Returns the frames addressed to the sender alone
/// and the immediate drawing save, if any, to await once the lock is gone.
fn apply_outcome(
    state: &AppState,
    board: &BoardState,
    connection_id: ConnectionId,
    outcome: Outcome,
) -> (Vec<Frame>, Option<impl Future<Output = Result<(), StoreError>> + Send + use<>>) {
    let mut replies = Vec::new();
    let from = connection_id.to_string();

    for (audience, frame) in outcome.emits {
        match audience {
            Audience::Sender => replies.push(frame),
            Audience::Others => fan_out(board, &frame.with_from(from.clone()), Some(connection_id)),
            Audience::All => fan_out(board, &frame.with_from(from.clone()), None),
        }
    }

    let mut immediate_save = None;
    match outcome.persist {
        None => {}
        Some(Persist::DrawingDebounced(drawing)) => services::persistence::schedule_drawing_save(state, drawing),
        Some(Persist::DrawingNow(drawing)) => {
            immediate_save = Some(services::persistence::save_drawing_now(state, drawing));
        }
        Some(Persist::NoteInsert(note)) => services::persistence::schedule_note_insert(state, note),
        Some(Persist::NoteUpdate(note)) => services::persistence::schedule_note_update(state, note),
        Some(Persist::NoteDelete(id)) => services::persistence::schedule_note_delete(state, id),
    }

    (replies, immediate_save)
}

// =============================================================================
// PRESENCE HANDLERS
// =============================================================================

fn handle_update_user_info(
    board: &mut BoardState,
    connection_id: ConnectionId,
    req: &Frame,
) -> Result<Outcome, GatewayError> {
    let patch: ClientInfoPatch = serde_json::from_value(req.data.clone())?;

    if !board.presence.update_client(connection_id, patch) {
        debug!(%connection_id, "user info update for unknown connection");
    }
    Ok(Outcome::done().then(Audience::All, presence_frame(board)))
}

// =============================================================================
// NOTE HANDLERS
// =============================================================================

/// Adopt the freshly read note list and push it to everyone. On a store
/// failure the sender gets the cached list instead.
fn handle_load_sticky_notes(board: &mut BoardState, refreshed: Result<Vec<Record>, StoreError>) -> Outcome {
    match refreshed {
        Ok(records) => {
            board
                .document
                .replace_note_cache(services::document::notes_from_records(records));
            let frame = Frame::event(EVENT_LOAD_STICKY_NOTES, to_json(&board.document.notes()));
            Outcome::done().then(Audience::All, frame)
        }
        Err(e) => {
            warn!(error = %e, "sticky note refresh failed; replying with cache");
            Outcome::reply(Frame::event(EVENT_LOAD_STICKY_NOTES, to_json(&board.document.notes())))
        }
    }
}

fn handle_add_note(board: &mut BoardState, req: &Frame) -> Result<Outcome, GatewayError> {
    let mut note: StickyNote = serde_json::from_value(req.data.clone())?;
    let now = now_ms();
    if note.id.is_empty() {
        note.id = format!("note_{now}");
    }
    if note.storage_id.is_none() {
        note.storage_id = Some(temp_storage_id(now));
    }
    note.last_updated = Some(now);

    board.document.upsert_note(note.clone());

    let frame = Frame::event(EVENT_NOTE_ADDED, to_json(&note));
    Ok(Outcome::done()
        .then(Audience::Others, frame)
        .persist(Persist::NoteInsert(note)))
}

#[derive(Debug, Deserialize)]
struct NoteRef {
    #[serde(default)]
    id: serde_json::Value,
}

fn handle_delete_note(state: &AppState, board: &mut BoardState, req: &Frame) -> Result<Outcome, GatewayError> {
    let note_ref: NoteRef = serde_json::from_value(req.data.clone())?;
    let id = match note_ref.id {
        serde_json::Value::String(s) if !s.is_empty() => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => return Err(GatewayError::MissingNoteId),
    };

    if board.document.remove_note(&id).is_none() {
        debug!(note_id = %id, "delete for note not in cache");
    }
    state.scheduler.reset_throttle(&position_throttle_key(&id));

    let frame = Frame::event(EVENT_NOTE_DELETED, json!({ "id": id }));
    Ok(Outcome::done()
        .then(Audience::Others, frame)
        .persist(Persist::NoteDelete(id)))
}

/// How an `updateNote` patch is fanned out and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoteUpdateKind {
    /// Last edit of a drag or text session: everyone, persisted.
    Final,
    /// Intermediate text edit: peers only, not persisted.
    ContentDraft,
    /// Intermediate drag: throttled, peers only, not persisted.
    PositionDraft,
    /// Anything else: everyone, persisted.
    Plain,
}

fn classify_note_update(patch: &StickyNote) -> NoteUpdateKind {
    if patch.is_final_content || patch.is_final_position {
        NoteUpdateKind::Final
    } else if patch.is_content_update {
        NoteUpdateKind::ContentDraft
    } else if patch.position.is_some() {
        NoteUpdateKind::PositionDraft
    } else {
        NoteUpdateKind::Plain
    }
}

fn handle_update_note(
    state: &AppState,
    board: &mut BoardState,
    connection_id: ConnectionId,
    req: &Frame,
) -> Result<Outcome, GatewayError> {
    let mut patch: StickyNote = serde_json::from_value(req.data.clone())?;
    if patch.id.is_empty() {
        return Err(GatewayError::MissingNoteId);
    }

    let kind = classify_note_update(&patch);
    if kind == NoteUpdateKind::PositionDraft
        && !state
            .scheduler
            .throttle(&position_throttle_key(&patch.id), state.config.position_throttle)
    {
        return Ok(Outcome::done());
    }

    patch.last_updated = Some(now_ms());
    let note_id = patch.id.clone();
    let Some(merged) = board.document.merge_note_update(patch) else {
        debug!(%connection_id, note_id = %note_id, "update for note not in cache");
        return Ok(Outcome::done());
    };

    let frame = Frame::event(EVENT_UPDATE_NOTE, to_json(&merged));
    Ok(match kind {
        NoteUpdateKind::Final | NoteUpdateKind::Plain => Outcome::done()
            .then(Audience::All, frame)
            .persist(Persist::NoteUpdate(merged)),
        NoteUpdateKind::ContentDraft | NoteUpdateKind::PositionDraft => Outcome::done().then(Audience::Others, frame),
    })
}

// =============================================================================
// DRAWING HANDLERS
// =============================================================================

fn handle_load_draw(board: &BoardState) -> Outcome {
    Outcome::reply(Frame::event(EVENT_LOAD_DRAWING, to_json(board.document.drawing())))
}

fn handle_draw(board: &mut BoardState, connection_id: ConnectionId, req: &Frame) -> Result<Outcome, GatewayError> {
    if req.data.is_null() {
        return Err(GatewayError::MissingPath);
    }

    let acquired = match board.turn.request_draw(connection_id) {
        TurnDecision::Denied { holder } => {
            debug!(%connection_id, %holder, "draw denied; turn held by another connection");
            return Ok(Outcome::reply(Frame::event(EVENT_DRAWING_NOT_ALLOWED, json!({ "holder": holder }))));
        }
        TurnDecision::Granted { acquired } => acquired,
    };
    if acquired {
        board.presence.mark_status_change(connection_id);
    }

    board.document.append_stroke(req.data.clone());
    let snapshot = board.document.drawing().clone();

    Ok(Outcome::done()
        .then_if(acquired, Audience::All, || presence_frame(board))
        .then(Audience::Others, Frame::event(EVENT_DRAW, req.data.clone()))
        .persist(Persist::DrawingDebounced(snapshot)))
}

/// End of a stroke: optionally adopt the client's full path list, push the
/// full drawing to everyone, and hand the turn back.
fn handle_stop_draw(board: &mut BoardState, connection_id: ConnectionId, req: &Frame) -> Outcome {
    if let Some(serde_json::Value::Array(paths)) = req.data.get("paths") {
        board.document.replace_drawing(paths.clone());
    }
    let released = board.turn.release(connection_id);
    if released {
        board.presence.mark_status_change(connection_id);
    }
    let snapshot = board.document.drawing().clone();

    Outcome::done()
        .then(Audience::All, Frame::event(EVENT_UPDATE_DRAWING, to_json(&snapshot)))
        .then_if(released, Audience::All, || presence_frame(board))
        .persist(Persist::DrawingDebounced(snapshot))
}

fn handle_update_drawing(board: &mut BoardState, req: &Frame) -> Outcome {
    let operation = req
        .data
        .get("operation")
        .and_then(|v| serde_json::from_value::<DrawOperation>(v.clone()).ok());

    if operation == Some(DrawOperation::Clear) {
        board.document.clear_drawing();
        return cleared_outcome();
    }

    let paths = match req.data.get("paths") {
        Some(serde_json::Value::Array(paths)) => paths.clone(),
        _ => {
            warn!("update-drawing without a paths array; treating as empty");
            Vec::new()
        }
    };

    board.document.replace_drawing(paths);
    let snapshot = Drawing {
        operation: Some(operation.unwrap_or(DrawOperation::Update)),
        source: Some(DrawSource::Server),
        ..board.document.drawing().clone()
    };

    Outcome::done()
        .then(Audience::Others, Frame::event(EVENT_UPDATE_DRAWING, to_json(&snapshot)))
        .persist(Persist::DrawingDebounced(snapshot))
}

fn handle_clear_canvas(board: &mut BoardState, connection_id: ConnectionId) -> Outcome {
    board.document.clear_drawing();
    let released = board.turn.release(connection_id);
    if released {
        board.presence.mark_status_change(connection_id);
    }

    cleared_outcome().then_if(released, Audience::All, || presence_frame(board))
}

/// Frames and immediate save shared by every way of clearing the canvas.
fn cleared_outcome() -> Outcome {
    let cleared = Drawing { operation: Some(DrawOperation::Clear), source: Some(DrawSource::Server), ..Drawing::empty() };
    Outcome::done()
        .then(Audience::All, Frame::event(EVENT_UPDATE_DRAWING, to_json(&cleared)))
        .then(Audience::All, Frame::event(EVENT_CLEAR_CANVAS, serde_json::Value::Null))
        .persist(Persist::DrawingNow(Drawing::empty()))
}

fn handle_force_clear(board: &mut BoardState, connection_id: ConnectionId) -> Outcome {
    let changed = board.turn.force_clear(Some(connection_id));
    if changed {
        board.presence.mark_status_change(connection_id);
    }
    Outcome::done().then_if(changed, Audience::All, || presence_frame(board))
}

fn handle_ensure_stopped(board: &mut BoardState, connection_id: ConnectionId) -> Outcome {
    if board.turn.release(connection_id) {
        board.presence.mark_status_change(connection_id);
    }
    Outcome::done().then(Audience::All, presence_frame(board))
}

// =============================================================================
// HELPERS
// =============================================================================

/// Send frames in order, stopping at the first that fails.
async fn send_all(socket: &mut WebSocket, frames: &[Frame]) -> Result<(), ()> {
    for frame in frames {
        send_frame(socket, frame).await?;
    }
    Ok(())
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.event == crate::frame::EVENT_ERROR {
        let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, code, message, "ws: send error frame");
    } else if is_high_frequency(&frame.event) {
        debug!(id = %frame.id, event = %frame.event, "ws: send frame");
    } else {
        info!(id = %frame.id, event = %frame.event, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

/// Stroke and note-drag traffic is logged at debug to keep info readable.
fn is_high_frequency(event: &str) -> bool {
    matches!(event, EVENT_DRAW | EVENT_UPDATE_NOTE | services::board::EVENT_USERS_UPDATE)
}

fn position_throttle_key(note_id: &str) -> String {
    format!("position_{note_id}")
}

/// `temp_<epoch-ms>_<7 base36 chars>`, the storage id a note carries until
/// the store assigns one.
fn temp_storage_id(now: i64) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..7)
        .map(|_| char::from(BASE36[rng.random_range(0..BASE36.len())]))
        .collect();
    format!("temp_{now}_{suffix}")
}

fn to_json(value: &impl serde::Serialize) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
