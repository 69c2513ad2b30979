//! # Build Context Fabrication and Storage
//!
//! [`fabricator`] turns fetched source into a deterministic, content-hashed
//! archive; [`store`] persists it in a size-appropriate backend.

pub mod fabricator;
pub mod store;

pub use fabricator::{ContextFabricator, FabricatedContext};
pub use store::{ContextStore, ContextStoreSet, MAX_CONFIGMAP_CONTEXT_BYTES};
