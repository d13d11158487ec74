//!
//! Utility module for the sync engine.
//!
//! Re-exports id and clock helpers used throughout the codebase.
/// Identifier and timestamp helpers
pub mod index;

pub use index::{generate_id, now_millis};
