//! Block registry and content hashing.
//!
//! This module provides:
//! - The `CodeBlock` record and its lifecycle states
//! - Content hashing over position, source and arguments
//! - The ordered registry with hash-based tail invalidation

mod registry;
mod types;

pub use registry::BlockRegistry;
pub use types::{BlockState, CodeBlock, content_hash, echo_enabled};
