//! WebRTC reader - resilient WHEP stream consumer
//!
//! This crate negotiates receive-only WebRTC sessions with a WHEP endpoint,
//! publishes received tracks and readiness on an event bus, and restarts
//! failed sessions automatically.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod webrtc;

pub use error::{AppError, Result};
