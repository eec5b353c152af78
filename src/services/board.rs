//! Board service — connect/disconnect and fan-out to connections.
//!
//! DESIGN
//! ======
//! There is exactly one board per process. Connecting registers the
//! connection's outbound queue and presence record in one step under the
//! board lock, pushes the new presence roster to everyone, and returns a
//! snapshot of what the new client must be sent. Disconnecting releases the
//! drawing turn (if held), drops both, and pushes the roster again.
//!
//! Fan-out works on a borrowed `BoardState` so callers deliver frames while
//! still holding the lock that produced them. It is best effort and never
//! waits: each connection has a bounded queue and a full queue drops the
//! frame for that connection only.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::frame::Frame;
use crate::services::presence::ClientRecord;
use crate::state::{AppState, BoardState, ConnectionId, Drawing, StickyNote};

/// Outbound event carrying the presence roster.
pub const EVENT_USERS_UPDATE: &str = "users-update";

/// What a freshly connected client needs to render the board.
#[derive(Debug, Clone)]
pub struct ConnectSnapshot {
    pub client: ClientRecord,
    pub drawing: Drawing,
    pub notes: Vec<StickyNote>,
}

// =============================================================================
// CONNECT / DISCONNECT
// =============================================================================

/// Register a connection, announce the new roster, and return the state the
/// connection must be sent.
pub async fn connect(state: &AppState, connection_id: ConnectionId, tx: mpsc::Sender<Frame>) -> ConnectSnapshot {
    let mut board = state.board.write().await;
    board.clients.insert(connection_id, tx);
    let client = board.presence.add_client(connection_id);

    info!(%connection_id, clients = board.clients.len(), "client connected");
    fan_out(&board, &presence_frame(&board), None);
    ConnectSnapshot { client, drawing: board.document.drawing().clone(), notes: board.document.notes() }
}

/// Drop a connection, releasing its drawing turn. Returns whether the turn
/// was released.
pub async fn disconnect(state: &AppState, connection_id: ConnectionId) -> bool {
    let mut board = state.board.write().await;
    let released = board.turn.release(connection_id);
    board.presence.remove_client(connection_id);
    board.clients.remove(&connection_id);

    info!(%connection_id, released_turn = released, remaining = board.clients.len(), "client disconnected");
    fan_out(&board, &presence_frame(&board), None);
    released
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Deliver a frame to every connection on the board, optionally excluding one.
pub fn fan_out(board: &BoardState, frame: &Frame, exclude: Option<ConnectionId>) {
    for (connection_id, tx) in &board.clients {
        if exclude == Some(*connection_id) {
            continue;
        }
        try_deliver(*connection_id, tx, frame.clone());
    }
}

/// Build the presence roster frame from the current board.
#[must_use]
pub fn presence_frame(board: &BoardState) -> Frame {
    let snapshot = board.presence.snapshot(board.turn.holder());
    Frame::event(EVENT_USERS_UPDATE, serde_json::to_value(snapshot).unwrap_or_default())
}

fn try_deliver(connection_id: ConnectionId, tx: &mpsc::Sender<Frame>, frame: Frame) {
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            warn!(%connection_id, event = %frame.event, "outbound queue full; dropping frame");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
#[path = "board_test.rs"]
mod tests;
