//! Domain services for the shared board.
//!
//! Each module owns one piece of the sync core; the websocket gateway in
//! `routes::ws` composes them per inbound event.

pub mod board;
pub mod document;
pub mod persistence;
pub mod presence;
pub mod scheduler;
pub mod turn;
