//! Types for the block registry.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Lifecycle state of a code block.
///
/// Blocks move forward only: `Created -> Evaluating -> Evaluated -> Rendered`.
/// A cancelled evaluation puts the block back to `Created` so the next pass
/// picks it up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockState {
    /// Discovered, not yet evaluated.
    #[default]
    Created,
    /// Evaluation request is in flight.
    Evaluating,
    /// A result (or inline error) is stored but not yet patched into output.
    Evaluated,
    /// The result has been written into its output region.
    Rendered,
}

impl BlockState {
    /// Whether a block in this state carries a usable result.
    pub fn has_result(self) -> bool {
        matches!(self, BlockState::Evaluated | BlockState::Rendered)
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockState::Created => "created",
            BlockState::Evaluating => "evaluating",
            BlockState::Evaluated => "evaluated",
            BlockState::Rendered => "rendered",
        };
        f.write_str(name)
    }
}

/// One fenced code fragment, in document order.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    /// Zero-based position among the discovered blocks.
    pub index: usize,
    /// Trimmed literal text of the fragment.
    pub source: String,
    /// Free-form arguments from the fence info string.
    pub arguments: String,
    /// Hash over `index`, `source` and `arguments`.
    pub hash: u64,
    /// Current lifecycle state.
    pub state: BlockState,
    /// Output markup; `None` until evaluated.
    pub result: Option<String>,
    /// Identifier of the output region this block patches.
    pub slot_id: String,
    /// Whether the literal source is emitted next to the output.
    pub echo: bool,
}

impl CodeBlock {
    /// Create a fresh block in the `Created` state.
    pub fn new(index: usize, source: &str, arguments: &str, slot_prefix: &str) -> Self {
        let source = source.trim().to_string();
        let hash = content_hash(index, &source, arguments);
        Self {
            index,
            hash,
            echo: echo_enabled(arguments),
            slot_id: format!("{}{}", slot_prefix, index),
            arguments: arguments.to_string(),
            source,
            state: BlockState::Created,
            result: None,
        }
    }

    /// Store an evaluation outcome and move to `Evaluated`.
    pub fn set_result(&mut self, markup: String) {
        self.result = Some(markup);
        self.state = BlockState::Evaluated;
    }
}

/// Compute the identity hash of a block.
///
/// The position is part of the hash, so moving a block changes its identity
/// just like editing it does. `source` is expected to be trimmed already.
pub fn content_hash(index: usize, source: &str, arguments: &str) -> u64 {
    let mut hasher = FxHasher::default();
    index.hash(&mut hasher);
    source.hash(&mut hasher);
    arguments.trim().hash(&mut hasher);
    hasher.finish()
}

/// Read the echo option from a block's arguments.
///
/// Accepts `echo=FALSE`, `echo = F`, `echo=false` and `echo=0` (any case,
/// optionally quoted); anything else leaves echo on.
pub fn echo_enabled(arguments: &str) -> bool {
    // Glue `key = value` into `key=value` before tokenizing.
    let normalized = arguments
        .split('=')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("=");

    for token in normalized.split(|c: char| c == ',' || c.is_whitespace()) {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        if !key.eq_ignore_ascii_case("echo") {
            continue;
        }
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        return !(value.eq_ignore_ascii_case("false")
            || value.eq_ignore_ascii_case("f")
            || value == "0");
    }

    true
}
