//! Startup wiring for the Polar governance engine.
//!
//! Loads [`GovernanceConfig`], composes the contract registry, middleware
//! pipeline, extension gateway, skill registry and installer into a
//! [`GovernanceRuntime`], and installs the tracing subscriber.

mod bootstrap_helpers;
mod config;
mod inspect;
mod runtime;

pub use bootstrap_helpers::*;
pub use config::*;
pub use inspect::*;
pub use runtime::*;
