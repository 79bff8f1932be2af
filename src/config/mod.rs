//! Reader configuration

mod schema;

pub use schema::{ReaderConfig, DYNAMIC_PAYLOAD_TYPES, PROBE_PAYLOAD_TYPE, RETRY_PAUSE_MS};
