//! Sequential, cancellable evaluation of registered blocks.
//!
//! Blocks run one at a time in ascending index order against the document's
//! session. A failing block records its error inline and the batch moves on;
//! cancellation stops the batch and leaves the interrupted block `Created`
//! so the next pass evaluates it again.

use std::ops::Range;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::block::{BlockRegistry, BlockState};
use crate::error::Error;
use crate::lock_unpoisoned;
use crate::render::{error_markup, result_markup};
use crate::session::{ExecutionSession, SharedSession};

/// Result of evaluating one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalOutcome {
    /// Textual output of a successful evaluation.
    Success(String),
    /// Error message of a failed evaluation.
    Failure(String),
    /// The evaluation was cancelled before it produced a result.
    Cancelled,
}

impl EvalOutcome {
    /// Markup stored as the block's result, or `None` when cancelled.
    pub fn into_markup(self) -> Option<String> {
        match self {
            EvalOutcome::Success(text) => Some(result_markup(&text)),
            EvalOutcome::Failure(message) => Some(error_markup(&message)),
            EvalOutcome::Cancelled => None,
        }
    }
}

/// Progress notifications for a batch.
pub trait EvaluationCallback: Send + Sync {
    /// Called when a block starts evaluating.
    fn on_block_started(&self, _index: usize) {}

    /// Called when a block evaluated successfully.
    fn on_block_completed(&self, _index: usize) {}

    /// Called when a block's evaluation failed. The error is already stored
    /// as the block's result.
    fn on_block_failed(&self, _index: usize, _message: &str) {}

    /// Called when a batch stops because it was cancelled.
    fn on_batch_cancelled(&self, _index: usize) {}

    /// Called when a background batch could not obtain a session.
    fn on_session_failed(&self, _error: &Error) {}
}

/// Callback that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

impl EvaluationCallback for NoopCallback {}

/// Counts for a finished or stopped batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalSummary {
    /// Blocks that evaluated successfully.
    pub evaluated: usize,
    /// Blocks whose evaluation failed.
    pub failed: usize,
    /// Whether the batch stopped early on cancellation.
    pub cancelled: bool,
}

/// Evaluate `source` in `session`.
///
/// Waits for the session to be free first; a cancelled wait yields
/// `EvalOutcome::Cancelled`.
pub async fn evaluate_one<S: ExecutionSession>(
    session: &SharedSession<S>,
    source: &str,
    cancel: &CancellationToken,
) -> EvalOutcome {
    let mut session = tokio::select! {
        biased;
        _ = cancel.cancelled() => return EvalOutcome::Cancelled,
        guard = session.lock() => guard,
    };

    match session.evaluate(source, cancel).await {
        Ok(_) if cancel.is_cancelled() => EvalOutcome::Cancelled,
        Ok(text) => EvalOutcome::Success(text),
        Err(Error::Cancelled) => EvalOutcome::Cancelled,
        Err(Error::Evaluation(message)) => EvalOutcome::Failure(message),
        Err(e) => EvalOutcome::Failure(e.to_string()),
    }
}

/// Evaluate every `Created` block in ascending index order.
pub async fn evaluate_pending<S: ExecutionSession>(
    registry: &Mutex<BlockRegistry>,
    session: &SharedSession<S>,
    cancel: &CancellationToken,
    callback: &dyn EvaluationCallback,
) -> EvalSummary {
    let mut summary = EvalSummary::default();
    let mut next = 0;

    loop {
        let index = {
            let registry = lock_unpoisoned(registry);
            registry
                .iter()
                .skip(next)
                .find(|b| b.state == BlockState::Created)
                .map(|b| b.index)
        };
        let Some(index) = index else { break };

        if !run_block(registry, session, index, cancel, callback, &mut summary).await {
            break;
        }
        next = index + 1;
    }

    summary
}

/// Evaluate the blocks in `range` that still need it, calling `on_ready`
/// after each block so its output can be patched before the next one runs.
pub async fn evaluate_range<S: ExecutionSession>(
    registry: &Mutex<BlockRegistry>,
    session: &SharedSession<S>,
    range: Range<usize>,
    cancel: &CancellationToken,
    callback: &dyn EvaluationCallback,
    mut on_ready: impl FnMut(usize) + Send,
) -> EvalSummary {
    let mut summary = EvalSummary::default();

    for index in range {
        if !run_block(registry, session, index, cancel, callback, &mut summary).await {
            break;
        }
        on_ready(index);
    }

    summary
}

/// Marks a block `Evaluating` and puts it back to `Created` unless the
/// result was stored.
struct Claim<'a> {
    registry: &'a Mutex<BlockRegistry>,
    index: usize,
    hash: u64,
    armed: bool,
}

impl<'a> Claim<'a> {
    fn take(registry: &'a Mutex<BlockRegistry>, index: usize) -> Option<(Self, String)> {
        let mut blocks = lock_unpoisoned(registry);
        let block = blocks.get_mut(index)?;
        if block.state != BlockState::Created {
            return None;
        }
        block.state = BlockState::Evaluating;
        let claim = Claim {
            registry,
            index,
            hash: block.hash,
            armed: true,
        };
        Some((claim, block.source.clone()))
    }

    /// Store `markup` if the block is still the one that was claimed and the
    /// batch has not been cancelled.
    fn complete(mut self, markup: String, cancel: &CancellationToken) -> bool {
        let mut blocks = lock_unpoisoned(self.registry);
        if cancel.is_cancelled() {
            return false;
        }
        match blocks.get_mut(self.index) {
            Some(block) if block.hash == self.hash && block.state == BlockState::Evaluating => {
                block.set_result(markup);
                self.armed = false;
                true
            }
            _ => false,
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut blocks = lock_unpoisoned(self.registry);
        if let Some(block) = blocks.get_mut(self.index)
            && block.hash == self.hash
            && block.state == BlockState::Evaluating
        {
            block.state = BlockState::Created;
        }
    }
}

/// Run one block. Returns `false` when the batch must stop.
async fn run_block<S: ExecutionSession>(
    registry: &Mutex<BlockRegistry>,
    session: &SharedSession<S>,
    index: usize,
    cancel: &CancellationToken,
    callback: &dyn EvaluationCallback,
    summary: &mut EvalSummary,
) -> bool {
    if cancel.is_cancelled() {
        summary.cancelled = true;
        callback.on_batch_cancelled(index);
        return false;
    }

    // Already evaluated, or not registered.
    let Some((claim, source)) = Claim::take(registry, index) else {
        return true;
    };

    tracing::debug!("Evaluating block {}", index);
    callback.on_block_started(index);

    let outcome = evaluate_one(session, &source, cancel).await;
    let failure = match &outcome {
        EvalOutcome::Failure(message) => Some(message.clone()),
        _ => None,
    };

    let stored = match outcome.into_markup() {
        Some(markup) => claim.complete(markup, cancel),
        None => false,
    };
    if !stored {
        tracing::debug!("Evaluation of block {} cancelled", index);
        summary.cancelled = true;
        callback.on_batch_cancelled(index);
        return false;
    }

    match failure {
        Some(message) => {
            tracing::debug!("Block {} failed: {}", index, message);
            summary.failed += 1;
            callback.on_block_failed(index, &message);
        }
        None => {
            summary.evaluated += 1;
            callback.on_block_completed(index);
        }
    }
    true
}
