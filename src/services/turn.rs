//! Drawing-turn arbiter — single-writer lock for the shared canvas.
//!
//! DESIGN
//! ======
//! Two states: `Idle` and `Held { holder, last_activity }`. Freehand strokes
//! from two writers would interleave into one path list with no way to
//! untangle them, so at most one connection may append strokes at a time.
//! Every granted stroke refreshes the holder's activity; a background sweep
//! releases a holder that has gone quiet past the idle timeout.
//!
//! Callers are told whether a call changed state so they can broadcast a
//! presence snapshot; the arbiter itself never talks to clients.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use crate::services::board::{fan_out, presence_frame};
use crate::state::{AppState, ConnectionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Held { holder: ConnectionId, last_activity: Instant },
}

/// Outcome of a draw request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDecision {
    /// `acquired` is true when the turn moved from Idle to this connection.
    Granted { acquired: bool },
    Denied { holder: ConnectionId },
}

#[derive(Debug)]
pub struct TurnArbiter {
    state: TurnState,
}

impl Default for TurnArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnArbiter {
    #[must_use]
    pub fn new() -> Self {
        Self { state: TurnState::Idle }
    }

    #[cfg(test)]
    #[must_use]
    pub fn state(&self) -> TurnState {
        self.state
    }

    #[must_use]
    pub fn holder(&self) -> Option<ConnectionId> {
        match self.state {
            TurnState::Idle => None,
            TurnState::Held { holder, .. } => Some(holder),
        }
    }

    pub fn request_draw(&mut self, connection_id: ConnectionId) -> TurnDecision {
        self.request_draw_at(connection_id, Instant::now())
    }

    pub(crate) fn request_draw_at(&mut self, connection_id: ConnectionId, now: Instant) -> TurnDecision {
        match self.state {
            TurnState::Idle => {
                self.state = TurnState::Held { holder: connection_id, last_activity: now };
                TurnDecision::Granted { acquired: true }
            }
            TurnState::Held { holder, .. } if holder == connection_id => {
                self.state = TurnState::Held { holder, last_activity: now };
                TurnDecision::Granted { acquired: false }
            }
            TurnState::Held { holder, .. } => TurnDecision::Denied { holder },
        }
    }

    /// Release the turn if `connection_id` holds it. Returns whether it did.
    pub fn release(&mut self, connection_id: ConnectionId) -> bool {
        if self.holder() != Some(connection_id) {
            return false;
        }
        self.state = TurnState::Idle;
        true
    }

    /// With a connection, clear only if it is the holder; without one, clear
    /// whoever holds the turn. Returns whether state changed.
    pub fn force_clear(&mut self, connection_id: Option<ConnectionId>) -> bool {
        match (self.state, connection_id) {
            (TurnState::Idle, _) => false,
            (TurnState::Held { .. }, None) => {
                self.state = TurnState::Idle;
                true
            }
            (TurnState::Held { .. }, Some(id)) => self.release(id),
        }
    }

    /// Release a holder idle for longer than `timeout`, returning it.
    pub fn expire_idle_at(&mut self, now: Instant, timeout: Duration) -> Option<ConnectionId> {
        let TurnState::Held { holder, last_activity } = self.state else {
            return None;
        };
        if now.saturating_duration_since(last_activity) <= timeout {
            return None;
        }
        self.state = TurnState::Idle;
        Some(holder)
    }
}

// =============================================================================
// SWEEPER
// =============================================================================

/// Spawn the idle-turn sweeper. Returns a handle for shutdown.
pub fn spawn_turn_sweeper(state: AppState) -> JoinHandle<()> {
    let interval = state.config.turn_sweep_interval;
    let timeout = state.config.turn_idle_timeout;
    info!(
        sweep_interval = ?interval,
        idle_timeout = ?timeout,
        "drawing turn sweeper configured"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_idle_turn(&state, Instant::now()).await;
        }
    })
}

/// Release an idle turn and broadcast presence if anything changed.
pub(crate) async fn sweep_idle_turn(state: &AppState, now: Instant) -> Option<ConnectionId> {
    let mut board = state.board.write().await;
    let released = board
        .turn
        .expire_idle_at(now, state.config.turn_idle_timeout)?;
    board.presence.mark_status_change(released);
    info!(connection_id = %released, "drawing turn released after inactivity");
    fan_out(&board, &presence_frame(&board), None);
    Some(released)
}

#[cfg(test)]
#[path = "turn_test.rs"]
mod tests;
