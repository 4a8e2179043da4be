//! Foundational low-level utilities shared across Polar crates.
//!
//! Provides time helpers used for audit stamps and trace identifiers, plus
//! identifier-list normalization used by permission and allowlist handling.

pub mod id_sets;
pub mod time_utils;

pub use id_sets::{dedupe_preserving_order, normalize_id_set};
pub use time_utils::{current_rfc3339_timestamp, current_unix_timestamp, current_unix_timestamp_ms};
