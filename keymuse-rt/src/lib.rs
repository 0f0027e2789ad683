//! KeyMuse realtime pipeline
//!
//! Ingests per-keystroke timing events over persistent WebSocket
//! connections, buffers them per session, batch-analyzes dirty sessions
//! on a worker pool, and derives a smoothed emotion vector that is fanned
//! back out to the session's connections and handed to the downstream
//! collaborators.

pub mod analysis;
pub mod api;
pub mod collab;
pub mod error;
pub mod gateway;
pub mod qos;
pub mod scheduler;
pub mod session;

pub use error::{Error, Result};
