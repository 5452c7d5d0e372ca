//! Execution sessions and the lazy session provider.
//!
//! A document owns exactly one session. The provider creates it on first
//! need, starts its host under a bounded timeout, and hands out a shared
//! handle whose mutex guarantees at most one call in flight.
//!
//! # Architecture
//!
//! ```text
//! SessionProvider
//!     │
//!     ├── SessionFactory::create(name)        (once, lazily)
//!     │
//!     └── SharedSession = Arc<Mutex<Session>>
//!             │
//!             ├── ensure_started(options)     (timeout-bounded, retryable)
//!             └── evaluate(text)              (one at a time)
//! ```

pub mod process;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::StartupOptions;
use crate::error::{Error, Result};

pub use process::{ProcessSession, ProcessSessionFactory};

/// A session handle shared between passes.
pub type SharedSession<S> = Arc<Mutex<S>>;

/// Sink for messages the host prints while it starts.
pub trait HostCallback: Send + Sync {
    /// Called with each chunk of informational host output.
    fn on_host_output(&self, session: &str, text: &str);
}

/// Host callback that forwards output to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHostCallback;

impl HostCallback for LogHostCallback {
    fn on_host_output(&self, session: &str, text: &str) {
        tracing::info!("[{}] {}", session, text);
    }
}

/// A long-lived, stateful execution context.
///
/// Later blocks read state produced by earlier ones, so implementations may
/// assume calls never overlap.
pub trait ExecutionSession: Send + 'static {
    /// Session name.
    fn name(&self) -> &str;

    /// Whether the execution host is currently up.
    fn is_host_running(&mut self) -> bool;

    /// Start the host if needed, applying `options`.
    fn ensure_started(
        &mut self,
        options: &StartupOptions,
        callback: &dyn HostCallback,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Evaluate `text` and return its textual output.
    ///
    /// Returns `Error::Cancelled` if `cancel` fires first and
    /// `Error::Evaluation` if the code itself failed.
    fn evaluate(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Shut the host down and release its resources.
    fn dispose(&mut self) -> impl Future<Output = ()> + Send;
}

/// Creates sessions for a document.
pub trait SessionFactory: Send + Sync + 'static {
    /// The session type produced.
    type Session: ExecutionSession;

    /// Create a session with the given unique name. The host is not started.
    fn create(&self, name: &str) -> Result<Self::Session>;
}

/// Lazily creates, starts and hands out the document's single session.
pub struct SessionProvider<F: SessionFactory> {
    factory: F,
    document_id: String,
    options: StartupOptions,
    startup_timeout: Duration,
    callback: Arc<dyn HostCallback>,
    session: Mutex<Option<SharedSession<F::Session>>>,
}

impl<F: SessionFactory> SessionProvider<F> {
    /// Create a provider for the document `document_id`.
    pub fn new(
        factory: F,
        document_id: impl Into<String>,
        options: StartupOptions,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            document_id: document_id.into(),
            options,
            startup_timeout,
            callback: Arc::new(LogHostCallback),
            session: Mutex::new(None),
        }
    }

    /// Replace the host output callback.
    pub fn with_callback(mut self, callback: Arc<dyn HostCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Startup timeout applied to the host.
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Whether a session object has been created.
    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Return the session, creating it and starting its host if needed.
    ///
    /// Startup failures are reported as `HostStartTimeout` or
    /// `HostStartError`; the session object is kept so a later call retries.
    pub async fn ensure_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SharedSession<F::Session>> {
        let shared = {
            let mut slot = self.session.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let name = format!("{}-{}", self.document_id, uuid::Uuid::new_v4().simple());
                    tracing::debug!("Creating session {}", name);
                    let created = Arc::new(Mutex::new(self.factory.create(&name)?));
                    *slot = Some(created.clone());
                    created
                }
            }
        };

        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = shared.lock() => guard,
        };

        if !session.is_host_running() {
            tracing::info!("Starting execution host for session {}", session.name());
            let start = session.ensure_started(&self.options, self.callback.as_ref(), cancel);
            match tokio::time::timeout(self.startup_timeout, start).await {
                Ok(Ok(())) => {}
                Ok(Err(Error::Cancelled)) => return Err(Error::Cancelled),
                Ok(Err(e @ Error::HostStartError(_))) => return Err(e),
                Ok(Err(e)) => return Err(Error::HostStartError(e.to_string())),
                Err(_) => {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    return Err(Error::HostStartTimeout {
                        timeout_ms: u64::try_from(self.startup_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    });
                }
            }
        }

        drop(session);
        Ok(shared)
    }

    /// Dispose the session, if any. The next `ensure_session` creates a new one.
    pub async fn release(&self) {
        let taken = self.session.lock().await.take();
        if let Some(shared) = taken {
            let mut session = shared.lock().await;
            tracing::debug!("Releasing session {}", session.name());
            session.dispose().await;
        }
    }
}
