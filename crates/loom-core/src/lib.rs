//! Loom Core - incremental evaluation of code blocks in rendered documents.
//!
//! This crate provides the core functionality for Loom, including:
//! - Fenced block discovery in Markdown
//! - A block registry with hash-based tail invalidation
//! - Sequential, cancellable evaluation against one long-lived session
//! - Placeholder rendering and in-place patching of output regions
//! - Pass coordination for an open document

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod block;
pub mod config;
pub mod discover;
pub mod document;
pub mod error;
pub mod eval;
pub mod render;
pub mod session;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_support;

pub use block::{BlockRegistry, BlockState, CodeBlock};
pub use config::{HostConfig, LoomConfig, StartupOptions};
pub use discover::{FencedBlock, Segment, discover_blocks, split_document};
pub use document::{DocumentBuilder, EvalDocument, Pass};
pub use error::{Error, Result};
pub use eval::{EvalOutcome, EvalSummary, EvaluationCallback};
pub use render::{BlockMarkup, HtmlOutput, OutputSink, RenderPatcher};
pub use session::{ExecutionSession, HostCallback, SessionFactory, SessionProvider};
pub use settings::Settings;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
