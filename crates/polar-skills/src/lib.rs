//! Extension admission for Polar: the skill/extension registry, source
//! provenance checks, manifest parsers for skills, MCP catalogs and plugin
//! descriptors, and the installer that gates each install on provenance,
//! permission approval, and capability risk metadata.

mod installer;
mod provenance;
mod registry;
mod sources;

pub use installer::*;
pub use provenance::*;
pub use registry::*;
pub use sources::*;
