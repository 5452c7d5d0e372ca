//! Pass coordination for one open document.
//!
//! Each render of the document is a *pass*. A pass walks the discovered
//! blocks in order, emitting cached output or a placeholder for each, then
//! schedules background evaluation. Starting a new pass cancels whatever the
//! previous one still had in flight.
//!
//! # Lifecycle
//!
//! ```text
//! EvalDocument::builder(factory, sink).build()
//!     │
//!     ├── start_pass() ── render_block() × N ── finish()
//!     │                                            │
//!     │                       (auto) spawn: ensure_session → evaluate_pending → patch
//!     │
//!     ├── render_existing()      await in-flight batch, patch evaluated blocks
//!     ├── render_range(..)       evaluate + patch a window of blocks
//!     └── dispose()              cancel, join, release session
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockRegistry, BlockState, CodeBlock};
use crate::config::LoomConfig;
use crate::discover::FencedBlock;
use crate::error::{Error, Result};
use crate::eval::{self, EvaluationCallback, NoopCallback};
use crate::lock_unpoisoned;
use crate::render::{BlockMarkup, OutputSink, RenderPatcher, final_markup, placeholder};
use crate::session::{HostCallback, SessionFactory, SessionProvider};
use crate::settings::Settings;

type InFlight = Shared<BoxFuture<'static, ()>>;

const DEFAULT_DOCUMENT_ID: &str = "document";

/// Builder for [`EvalDocument`].
pub struct DocumentBuilder<F: SessionFactory, O: OutputSink> {
    factory: F,
    sink: O,
    config: LoomConfig,
    settings: Option<Settings>,
    callback: Arc<dyn EvaluationCallback>,
    host_callback: Option<Arc<dyn HostCallback>>,
}

impl<F: SessionFactory, O: OutputSink> DocumentBuilder<F, O> {
    /// Use `config` for prefixes, startup options and defaults.
    pub fn config(mut self, config: LoomConfig) -> Self {
        self.config = config;
        self
    }

    /// Share `settings` with the host application. Defaults to
    /// `config.auto_evaluate`.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Receive batch progress notifications.
    pub fn callback(mut self, callback: Arc<dyn EvaluationCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Receive host startup output.
    pub fn host_callback(mut self, callback: Arc<dyn HostCallback>) -> Self {
        self.host_callback = Some(callback);
        self
    }

    /// Create the document, warming up its session in the background when
    /// `prestart_session` is set and a tokio runtime is available.
    pub fn build(self) -> EvalDocument<F, O> {
        let config = self.config;
        let document_id = config
            .document_id
            .clone()
            .unwrap_or_else(|| DEFAULT_DOCUMENT_ID.to_string());

        let mut provider = SessionProvider::new(
            self.factory,
            document_id,
            config.host.options.clone(),
            config.host.startup_timeout(),
        );
        if let Some(callback) = self.host_callback {
            provider = provider.with_callback(callback);
        }

        let lifetime = CancellationToken::new();
        let inner = Arc::new(Inner {
            settings: self
                .settings
                .unwrap_or_else(|| Settings::new(config.auto_evaluate)),
            slot_prefix: config.slot_prefix.clone(),
            registry: Mutex::new(BlockRegistry::new()),
            provider,
            patcher: RenderPatcher::new(self.sink),
            callback: self.callback,
            passes: AtomicU64::new(0),
            eval_scope: Mutex::new(lifetime.child_token()),
            lifetime,
            in_flight: Mutex::new(None),
            warmup: Mutex::new(None),
            eval_gate: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        });

        let doc = EvalDocument { inner };
        if config.prestart_session {
            doc.warm_up();
        }
        doc
    }
}

/// Evaluation state of one open document.
///
/// Owns the block registry, the session provider and the output patcher.
/// Dropping the document cancels its background work; call
/// [`dispose`](Self::dispose) to also wait for it and shut the host down.
pub struct EvalDocument<F: SessionFactory, O: OutputSink> {
    inner: Arc<Inner<F, O>>,
}

struct Inner<F: SessionFactory, O: OutputSink> {
    settings: Settings,
    slot_prefix: String,
    registry: Mutex<BlockRegistry>,
    provider: SessionProvider<F>,
    patcher: RenderPatcher<O>,
    callback: Arc<dyn EvaluationCallback>,
    passes: AtomicU64,
    /// Cancelled by disposal; parent of every pass scope.
    lifetime: CancellationToken,
    /// Scope of the current pass.
    eval_scope: Mutex<CancellationToken>,
    in_flight: Mutex<Option<InFlight>>,
    warmup: Mutex<Option<JoinHandle<()>>>,
    /// Held by a batch for its whole run so batches never interleave.
    eval_gate: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl<F: SessionFactory, O: OutputSink> EvalDocument<F, O> {
    /// Start building a document that evaluates through `factory` and
    /// patches into `sink`.
    pub fn builder(factory: F, sink: O) -> DocumentBuilder<F, O> {
        DocumentBuilder {
            factory,
            sink,
            config: LoomConfig::default(),
            settings: None,
            callback: Arc::new(NoopCallback),
            host_callback: None,
        }
    }

    /// The output sink results are patched into.
    pub fn sink(&self) -> &O {
        self.inner.patcher.sink()
    }

    /// Shared runtime settings.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Number of passes started so far.
    pub fn pass_count(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Snapshot of the block records, in index order.
    pub fn blocks(&self) -> Vec<CodeBlock> {
        lock_unpoisoned(&self.inner.registry).iter().cloned().collect()
    }

    /// Begin a new pass, cancelling the previous pass's evaluation.
    pub fn start_pass(&self) -> Result<Pass<'_, F, O>> {
        self.ensure_open()?;
        let number = self.inner.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.inner.lifetime.child_token();
        let previous = std::mem::replace(&mut *lock_unpoisoned(&self.inner.eval_scope), token.clone());
        previous.cancel();

        tracing::debug!("Starting pass {}", number);
        Ok(Pass {
            doc: self,
            token,
            number,
            next_index: 0,
            dynamic: self.inner.settings.auto_evaluate(),
        })
    }

    /// Schedule evaluation of every pending block under the current pass.
    ///
    /// Used when automatic re-evaluation is off and evaluation was deferred.
    pub fn evaluate_pending(&self) -> Result<()> {
        self.ensure_open()?;
        let token = lock_unpoisoned(&self.inner.eval_scope).clone();
        self.schedule(token)
    }

    /// Wait for the most recently scheduled evaluation, then patch every
    /// evaluated block into the output.
    pub async fn render_existing(&self) -> Result<()> {
        self.ensure_open()?;
        let in_flight = lock_unpoisoned(&self.inner.in_flight).clone();
        if let Some(batch) = in_flight {
            batch.await;
        }
        self.inner.patch_evaluated(None);
        Ok(())
    }

    /// Evaluate and patch blocks `start..start + count`, one at a time.
    ///
    /// Returns `Ok(())` without surfacing anything if `cancel` fires, a new
    /// pass starts or the document is disposed meanwhile. Session startup
    /// failures are returned.
    pub async fn render_range(
        &self,
        start: usize,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;
        let token = lock_unpoisoned(&self.inner.eval_scope).child_token();

        // The run itself is never dropped mid-call; caller cancellation is
        // forwarded into the document-owned scope instead.
        let forward = async {
            tokio::select! {
                _ = cancel.cancelled() => token.cancel(),
                _ = token.cancelled() => {}
            }
        };
        let run = async {
            let _done = token.clone().drop_guard();
            self.inner.run_range(start, count, &token).await
        };

        let (result, ()) = tokio::join!(run, forward);
        result
    }

    /// Cancel all work, wait for background tasks and release the session.
    ///
    /// Calling it again is a no-op.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Disposing document");

        lock_unpoisoned(&self.inner.eval_scope).cancel();
        self.inner.lifetime.cancel();

        let warmup = lock_unpoisoned(&self.inner.warmup).take();
        if let Some(handle) = warmup
            && let Err(e) = handle.await
        {
            tracing::warn!("Session warm-up task failed: {}", e);
        }

        let in_flight = lock_unpoisoned(&self.inner.in_flight).take();
        if let Some(batch) = in_flight {
            batch.await;
        }

        self.inner.provider.release().await;
        lock_unpoisoned(&self.inner.registry).clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn schedule(&self, token: CancellationToken) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::InvalidOperation("evaluation requires a tokio runtime".to_string()))?;

        let inner = self.inner.clone();
        let handle = runtime.spawn(async move { inner.run_background(token).await });
        let batch = async move {
            if let Err(e) = handle.await {
                tracing::warn!("Background evaluation task failed: {}", e);
            }
        }
        .boxed()
        .shared();

        *lock_unpoisoned(&self.inner.in_flight) = Some(batch);
        Ok(())
    }

    fn warm_up(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime available, session starts on first evaluation");
            return;
        };

        let inner = self.inner.clone();
        let handle = runtime.spawn(async move {
            match inner.provider.ensure_session(&inner.lifetime).await {
                Ok(_) => tracing::debug!("Session warmed up"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::warn!("Session warm-up failed: {}", e),
            }
        });
        *lock_unpoisoned(&self.inner.warmup) = Some(handle);
    }
}

impl<F: SessionFactory, O: OutputSink> Drop for EvalDocument<F, O> {
    fn drop(&mut self) {
        lock_unpoisoned(&self.inner.eval_scope).cancel();
        self.inner.lifetime.cancel();
    }
}

impl<F: SessionFactory, O: OutputSink> Inner<F, O> {
    async fn run_background(&self, token: CancellationToken) {
        let _gate = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            gate = self.eval_gate.lock() => gate,
        };

        let session = match self.provider.ensure_session(&token).await {
            Ok(session) => session,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                tracing::warn!("Cannot evaluate blocks: {}", e);
                self.callback.on_session_failed(&e);
                return;
            }
        };

        let summary =
            eval::evaluate_pending(&self.registry, &session, &token, self.callback.as_ref()).await;
        tracing::debug!(
            "Batch finished: {} evaluated, {} failed, cancelled: {}",
            summary.evaluated,
            summary.failed,
            summary.cancelled
        );

        self.patch_evaluated(Some(&token));
    }

    async fn run_range(&self, start: usize, count: usize, token: &CancellationToken) -> Result<()> {
        let _gate = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            gate = self.eval_gate.lock() => gate,
        };

        let session = match self.provider.ensure_session(token).await {
            Ok(session) => session,
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        };

        let end = {
            let registry = lock_unpoisoned(&self.registry);
            start.saturating_add(count).min(registry.len())
        };

        eval::evaluate_range(
            &self.registry,
            &session,
            start..end,
            token,
            self.callback.as_ref(),
            |index| {
                if !token.is_cancelled() {
                    self.patch_block(index);
                }
            },
        )
        .await;
        Ok(())
    }

    /// Patch every `Evaluated` block in index order, stopping early if
    /// `token` is cancelled.
    fn patch_evaluated(&self, token: Option<&CancellationToken>) {
        let indices = lock_unpoisoned(&self.registry).unpatched();
        for index in indices {
            if token.is_some_and(CancellationToken::is_cancelled) {
                break;
            }
            self.patch_block(index);
        }
    }

    /// Patch one block's result into its region, marking it `Rendered` if
    /// the region exists.
    fn patch_block(&self, index: usize) -> bool {
        let mut registry = lock_unpoisoned(&self.registry);
        let Some(block) = registry.get_mut(index) else {
            return false;
        };
        if block.state != BlockState::Evaluated {
            return false;
        }

        let content = block.result.as_deref().unwrap_or_default();
        if self.patcher.patch(&block.slot_id, content) {
            block.state = BlockState::Rendered;
            true
        } else {
            false
        }
    }
}

/// One render of the document.
///
/// Feed it every discovered block in order with
/// [`render_block`](Self::render_block), then call [`finish`](Self::finish).
pub struct Pass<'a, F: SessionFactory, O: OutputSink> {
    doc: &'a EvalDocument<F, O>,
    token: CancellationToken,
    number: u64,
    next_index: usize,
    dynamic: bool,
}

impl<F: SessionFactory, O: OutputSink> Pass<'_, F, O> {
    /// Pass number, starting at 1.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Whether a newer pass or disposal has superseded this one.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Emit markup for the next discovered block.
    ///
    /// A cached result is emitted in final form; anything else registers a
    /// fresh block and emits a placeholder.
    pub fn render_block(&mut self, fenced: &FencedBlock) -> Result<BlockMarkup> {
        let index = self.next_index;
        self.next_index += 1;

        let inner = &self.doc.inner;
        let block = CodeBlock::new(index, &fenced.source(), &fenced.arguments, &inner.slot_prefix);
        let mut registry = lock_unpoisoned(&inner.registry);

        if registry.cached_result(index, block.hash).is_some()
            && let Some(cached) = registry.get_mut(index)
        {
            tracing::debug!("Block {} served from cache", index);
            cached.state = BlockState::Rendered;
            return Ok(final_markup(cached));
        }

        let markup = placeholder(&block, self.dynamic);
        registry.append(block)?;
        Ok(markup)
    }

    /// Complete the pass: drop blocks the document no longer has, then
    /// schedule evaluation if automatic re-evaluation is on.
    pub fn finish(self) -> Result<()> {
        let inner = &self.doc.inner;
        let removed = lock_unpoisoned(&inner.registry).truncate_from(self.next_index);
        if removed > 0 {
            tracing::debug!("Pass {} dropped {} trailing block(s)", self.number, removed);
        }

        if self.token.is_cancelled() {
            tracing::debug!("Pass {} superseded before evaluation", self.number);
            return Ok(());
        }
        if !self.dynamic {
            tracing::debug!("Automatic evaluation off, pass {} deferred", self.number);
            return Ok(());
        }
        self.doc.schedule(self.token.clone())
    }
}
