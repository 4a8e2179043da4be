//! Session capability scoping for delegated agent runs.
//!
//! Projects installed extension states onto session and delegation skill
//! allowlists to produce the least-privilege capability scope handed to the
//! extension gateway, and clamps delegation skill forwards and model overrides
//! to server-side allowlists.

mod capability_scope;
mod delegation;

pub use capability_scope::*;
pub use delegation::*;
