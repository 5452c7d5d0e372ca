//! In-memory session used by unit tests.
//!
//! Understands a tiny language: `name <- expr` assigns, `a + b` adds integers
//! or variables, `fail:<msg>` fails, `wait` blocks until cancelled and
//! `sleep:<ms>` pauses before returning nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::StartupOptions;
use crate::error::{Error, Result};
use crate::session::{ExecutionSession, HostCallback, SessionFactory};

/// How the mock host behaves on startup.
#[derive(Debug, Clone, Default)]
pub enum MockStart {
    #[default]
    Ok,
    Hang,
    Fail(String),
}

#[derive(Debug, Default)]
struct LogInner {
    created: Vec<String>,
    evaluated: Vec<String>,
    events: Vec<String>,
    starts: usize,
    disposes: usize,
}

/// Shared record of everything the mock sessions did.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    inner: Arc<Mutex<LogInner>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockLog {
    fn with<R>(&self, f: impl FnOnce(&mut LogInner) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn created_names(&self) -> Vec<String> {
        self.with(|l| l.created.clone())
    }

    /// Sources passed to `evaluate`, in call order.
    pub fn evaluated(&self) -> Vec<String> {
        self.with(|l| l.evaluated.clone())
    }

    /// `start:<src>` / `end:<src>` events, in order.
    pub fn events(&self) -> Vec<String> {
        self.with(|l| l.events.clone())
    }

    pub fn start_count(&self) -> usize {
        self.with(|l| l.starts)
    }

    pub fn dispose_count(&self) -> usize {
        self.with(|l| l.disposes)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn clear_evaluations(&self) {
        self.with(|l| {
            l.evaluated.clear();
            l.events.clear();
        });
    }
}

/// Factory producing [`MockSession`]s that share one [`MockLog`].
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    pub log: MockLog,
    pub start: MockStart,
}

impl MockFactory {
    pub fn with_start(start: MockStart) -> Self {
        Self {
            log: MockLog::default(),
            start,
        }
    }
}

impl SessionFactory for MockFactory {
    type Session = MockSession;

    fn create(&self, name: &str) -> Result<MockSession> {
        self.log.with(|l| l.created.push(name.to_string()));
        Ok(MockSession {
            name: name.to_string(),
            running: false,
            start: self.start.clone(),
            vars: HashMap::new(),
            log: self.log.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MockSession {
    name: String,
    running: bool,
    start: MockStart,
    vars: HashMap<String, i64>,
    log: MockLog,
}

impl MockSession {
    fn value(&self, term: &str) -> Result<i64> {
        let term = term.trim();
        if let Ok(n) = term.parse() {
            return Ok(n);
        }
        self.vars
            .get(term)
            .copied()
            .ok_or_else(|| Error::Evaluation(format!("object '{}' not found", term)))
    }

    fn run(&mut self, text: &str) -> Result<String> {
        if let Some(message) = text.strip_prefix("fail:") {
            return Err(Error::Evaluation(message.to_string()));
        }
        if let Some((name, expr)) = text.split_once("<-") {
            let value = self.run(expr.trim())?;
            let value = value.parse().unwrap_or_default();
            self.vars.insert(name.trim().to_string(), value);
            return Ok(String::new());
        }
        let mut total = 0;
        for term in text.split('+') {
            total += self.value(term)?;
        }
        Ok(total.to_string())
    }
}

impl ExecutionSession for MockSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_host_running(&mut self) -> bool {
        self.running
    }

    async fn ensure_started(
        &mut self,
        _options: &StartupOptions,
        _callback: &dyn HostCallback,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.log.with(|l| l.starts += 1);
        match self.start.clone() {
            MockStart::Ok => {
                self.running = true;
                Ok(())
            }
            MockStart::Hang => {
                cancel.cancelled().await;
                Err(Error::Cancelled)
            }
            MockStart::Fail(message) => Err(Error::HostStartError(message)),
        }
    }

    async fn evaluate(&mut self, text: &str, cancel: &CancellationToken) -> Result<String> {
        let now = self.log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.log.with(|l| {
            l.evaluated.push(text.to_string());
            l.events.push(format!("start:{}", text));
        });

        let result = if text == "wait" {
            cancel.cancelled().await;
            Err(Error::Cancelled)
        } else if let Some(ms) = text.strip_prefix("sleep:") {
            let ms = ms.parse().unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(String::new())
        } else {
            tokio::task::yield_now().await;
            self.run(text)
        };

        self.log.with(|l| l.events.push(format!("end:{}", text)));
        self.log.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn dispose(&mut self) {
        self.running = false;
        self.log.with(|l| l.disposes += 1);
    }
}
