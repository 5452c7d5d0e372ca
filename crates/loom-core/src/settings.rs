//! Runtime settings shared between a document and its host application.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Live settings read at pass start and while emitting placeholders.
///
/// Clones share state, so the host application can flip automatic
/// re-evaluation while a document is open.
#[derive(Debug, Clone)]
pub struct Settings {
    auto_evaluate: Arc<AtomicBool>,
}

impl Settings {
    /// Create settings with the given automatic re-evaluation flag.
    pub fn new(auto_evaluate: bool) -> Self {
        Self {
            auto_evaluate: Arc::new(AtomicBool::new(auto_evaluate)),
        }
    }

    /// Whether blocks are evaluated automatically after each pass.
    pub fn auto_evaluate(&self) -> bool {
        self.auto_evaluate.load(Ordering::Relaxed)
    }

    /// Turn automatic re-evaluation on or off.
    pub fn set_auto_evaluate(&self, enabled: bool) {
        self.auto_evaluate.store(enabled, Ordering::Relaxed);
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(true)
    }
}
