//! # KeyMuse Common Library
//!
//! Shared code for the KeyMuse realtime pipeline:
//! - Keystroke event and typing statistics types
//! - Emotion vector type
//! - WebSocket wire protocol (inbound/outbound message enums)
//! - QoS and analysis configuration loading

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;

pub use error::{Error, Result};
