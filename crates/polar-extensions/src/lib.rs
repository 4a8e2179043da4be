//! Extension gateway for Polar governance.
//!
//! Owns per-extension lifecycle state, applies the lifecycle transition table,
//! and authorizes capability execution before dispatching to a registered
//! adapter. Both entrypoints run through the contract-validated pipeline.

mod adapter;
mod gateway;
mod lifecycle;
mod policy;

pub use adapter::*;
pub use gateway::*;
pub use lifecycle::*;
pub use policy::*;
