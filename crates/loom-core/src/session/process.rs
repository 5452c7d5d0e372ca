//! Process-backed execution session.
//!
//! Keeps one interpreter process alive for the whole document and talks to it
//! over stdin/stdout/stderr. After each block the interpreter is asked to print
//! a unique marker on both output streams; everything before the marker is the
//! block's output.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use crate::config::{HostConfig, MARKER_PLACEHOLDER, StartupOptions};
use crate::error::{Error, Result};

use super::{ExecutionSession, HostCallback, SessionFactory};

/// Creates [`ProcessSession`]s from a host configuration.
#[derive(Debug, Clone)]
pub struct ProcessSessionFactory {
    config: HostConfig,
}

impl ProcessSessionFactory {
    /// Create a factory for the given host configuration.
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for ProcessSessionFactory {
    type Session = ProcessSession;

    fn create(&self, name: &str) -> Result<ProcessSession> {
        Ok(ProcessSession::new(name, self.config.clone()))
    }
}

/// Pipes of a running interpreter.
struct HostProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
}

/// Output of one round trip to the interpreter.
struct RoundTrip {
    stdout: String,
    stderr: String,
}

/// Progress of reading one round trip's output.
#[derive(Debug, Clone)]
struct Pending {
    marker: String,
    stdout_done: bool,
    stderr_done: bool,
}

impl Pending {
    fn new(marker: String) -> Self {
        Self {
            marker,
            stdout_done: false,
            stderr_done: false,
        }
    }

    fn is_complete(&self) -> bool {
        self.stdout_done && self.stderr_done
    }
}

enum Step {
    Cancelled,
    Stdout(std::io::Result<Option<String>>),
    Stderr(std::io::Result<Option<String>>),
}

/// A session backed by a long-lived interpreter process.
pub struct ProcessSession {
    name: String,
    config: HostConfig,
    host: Option<HostProcess>,
    /// Set once the handshake and every init command have succeeded.
    ready: bool,
    nonce: String,
    sequence: u64,
    /// Round trip abandoned by cancellation; its remaining output must be
    /// drained before the next request.
    stale: Option<Pending>,
}

impl ProcessSession {
    /// Create a session; the interpreter starts on `ensure_started`.
    pub fn new(name: &str, config: HostConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            host: None,
            ready: false,
            nonce: uuid::Uuid::new_v4().simple().to_string(),
            sequence: 0,
            stale: None,
        }
    }

    fn spawn(&self, options: &StartupOptions) -> Result<HostProcess> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::HostStartError(format!(
                    "failed to spawn '{}': {}",
                    self.config.program, e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::HostStartError("failed to get host stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::HostStartError("failed to get host stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::HostStartError("failed to get host stderr".to_string()))?;

        Ok(HostProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr: BufReader::new(stderr).lines(),
        })
    }

    /// Kill a host that never finished starting, or has already died.
    fn discard_host(&mut self) {
        self.ready = false;
        self.stale = None;
        if let Some(mut host) = self.host.take() {
            if let Err(e) = host.child.start_kill() {
                tracing::debug!("Execution host for {} already stopped: {}", self.name, e);
            }
        }
    }

    /// Handshake with a freshly spawned host and run the init commands.
    async fn initialize(
        &mut self,
        options: &StartupOptions,
        callback: &dyn HostCallback,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // An empty round trip proves the marker protocol works.
        self.round_trip("", cancel).await?;

        for command in &options.init {
            let trip = self.round_trip(command, cancel).await?;
            for text in [&trip.stdout, &trip.stderr] {
                if !text.is_empty() {
                    callback.on_host_output(&self.name, text);
                }
            }
        }
        Ok(())
    }

    fn next_marker(&mut self) -> String {
        self.sequence += 1;
        format!("--loom-{}-{}--", self.nonce, self.sequence)
    }

    /// Send `text` followed by the marker command and collect both streams.
    async fn round_trip(&mut self, text: &str, cancel: &CancellationToken) -> Result<RoundTrip> {
        if let Some(stale) = self.stale.take() {
            tracing::debug!("Draining output of a cancelled request in {}", self.name);
            self.collect(stale, cancel).await?;
        }

        let marker = self.next_marker();
        let request = format!(
            "{}\n{}\n",
            text,
            self.config.marker_command.replace(MARKER_PLACEHOLDER, &marker)
        );

        let host = self
            .host
            .as_mut()
            .ok_or_else(|| Error::Evaluation("execution host is not running".to_string()))?;
        if let Err(e) = write_request(&mut host.stdin, &request).await {
            self.ready = false;
            self.host = None;
            return Err(Error::Evaluation(format!("execution host is gone: {}", e)));
        }

        self.collect(Pending::new(marker), cancel).await
    }

    /// Read stdout and stderr up to the pending marker.
    ///
    /// On cancellation the progress is kept in `self.stale` so the next
    /// request can skip the rest of this output.
    async fn collect(&mut self, mut pending: Pending, cancel: &CancellationToken) -> Result<RoundTrip> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while !pending.is_complete() {
            let step = {
                let host = self.host.as_mut().ok_or_else(|| {
                    Error::Evaluation("execution host is not running".to_string())
                })?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    line = host.stdout.next_line(), if !pending.stdout_done => Step::Stdout(line),
                    line = host.stderr.next_line(), if !pending.stderr_done => Step::Stderr(line),
                }
            };

            let (line, done, sink) = match step {
                Step::Cancelled => {
                    self.stale = Some(pending);
                    return Err(Error::Cancelled);
                }
                Step::Stdout(line) => (line, &mut pending.stdout_done, &mut stdout),
                Step::Stderr(line) => (line, &mut pending.stderr_done, &mut stderr),
            };

            match line {
                Ok(Some(line)) if line.trim_end() == pending.marker => *done = true,
                Ok(Some(line)) => sink.push(line),
                Ok(None) => {
                    self.ready = false;
                    self.host = None;
                    return Err(Error::Evaluation("execution host exited".to_string()));
                }
                Err(e) => {
                    self.ready = false;
                    self.host = None;
                    return Err(Error::Evaluation(format!(
                        "lost connection to execution host: {}",
                        e
                    )));
                }
            }
        }

        Ok(RoundTrip {
            stdout: join_output(stdout),
            stderr: join_output(stderr),
        })
    }
}

impl ExecutionSession for ProcessSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_host_running(&mut self) -> bool {
        if !self.ready {
            return false;
        }
        match self.host.as_mut().map(|h| h.child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                tracing::warn!("Execution host for {} exited with {}", self.name, status);
                self.discard_host();
                false
            }
            Some(Err(e)) => {
                tracing::warn!("Failed to query execution host for {}: {}", self.name, e);
                self.discard_host();
                false
            }
            None => false,
        }
    }

    async fn ensure_started(
        &mut self,
        options: &StartupOptions,
        callback: &dyn HostCallback,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.is_host_running() {
            return Ok(());
        }

        // A previous attempt may have been dropped halfway through init.
        self.discard_host();
        self.host = Some(self.spawn(options)?);

        match self.initialize(options, callback, cancel).await {
            Ok(()) => {
                self.ready = true;
                tracing::debug!("Execution host for {} is up", self.name);
                Ok(())
            }
            Err(e) => {
                self.discard_host();
                match e {
                    Error::Cancelled => Err(Error::Cancelled),
                    other => Err(Error::HostStartError(other.to_string())),
                }
            }
        }
    }

    async fn evaluate(&mut self, text: &str, cancel: &CancellationToken) -> Result<String> {
        if !self.ready {
            return Err(Error::Evaluation(
                "execution host is not running".to_string(),
            ));
        }
        let trip = self.round_trip(text, cancel).await?;
        if trip.stderr.is_empty() {
            return Ok(trip.stdout);
        }

        let message = if trip.stdout.is_empty() {
            trip.stderr
        } else {
            format!("{}\n{}", trip.stdout, trip.stderr)
        };
        Err(Error::Evaluation(message))
    }

    async fn dispose(&mut self) {
        self.ready = false;
        self.stale = None;
        if let Some(mut host) = self.host.take() {
            drop(host.stdin);
            if let Err(e) = host.child.kill().await {
                tracing::debug!("Execution host for {} already stopped: {}", self.name, e);
            }
        }
    }
}

async fn write_request(stdin: &mut ChildStdin, request: &str) -> std::io::Result<()> {
    stdin.write_all(request.as_bytes()).await?;
    stdin.flush().await
}

/// Join collected lines, dropping the blank lines the marker command adds.
fn join_output(mut lines: Vec<String>) -> String {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::LogHostCallback;

    fn sh_session() -> ProcessSession {
        ProcessSession::new("test-session", HostConfig::default())
    }

    #[tokio::test]
    async fn test_state_persists_between_calls() {
        let mut session = sh_session();
        let cancel = CancellationToken::new();
        session
            .ensure_started(&StartupOptions::default(), &LogHostCallback, &cancel)
            .await
            .unwrap();
        assert!(session.is_host_running());

        assert_eq!(session.evaluate("X=41", &cancel).await.unwrap(), "");
        assert_eq!(
            session.evaluate("echo $((X + 1))", &cancel).await.unwrap(),
            "42"
        );

        session.dispose().await;
        assert!(!session.is_host_running());
    }

    #[tokio::test]
    async fn test_stderr_is_a_failure() {
        let mut session = sh_session();
        let cancel = CancellationToken::new();
        session
            .ensure_started(&StartupOptions::default(), &LogHostCallback, &cancel)
            .await
            .unwrap();

        let err = session.evaluate("echo partial; echo broken >&2", &cancel).await.unwrap_err();
        match err {
            Error::Evaluation(message) => {
                assert!(message.contains("partial"));
                assert!(message.contains("broken"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // The session keeps working after a failure.
        assert_eq!(session.evaluate("echo ok", &cancel).await.unwrap(), "ok");
        session.dispose().await;
    }

    #[tokio::test]
    async fn test_startup_options_applied() {
        let mut session = sh_session();
        let cancel = CancellationToken::new();
        let mut options = StartupOptions::default();
        options.env.insert("LOOM_GREETING".to_string(), "hi".to_string());
        options.init.push("GREETING_SUFFIX=there".to_string());

        session
            .ensure_started(&options, &LogHostCallback, &cancel)
            .await
            .unwrap();
        assert_eq!(
            session
                .evaluate("echo \"$LOOM_GREETING $GREETING_SUFFIX\"", &cancel)
                .await
                .unwrap(),
            "hi there"
        );
        session.dispose().await;
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let config = HostConfig {
            program: "/definitely/not/a/real/interpreter".to_string(),
            ..HostConfig::default()
        };
        let mut session = ProcessSession::new("missing", config);
        let cancel = CancellationToken::new();

        let err = session
            .ensure_started(&StartupOptions::default(), &LogHostCallback, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HostStartError(_)));
    }

    #[tokio::test]
    async fn test_cancelled_request_does_not_leak_output() {
        let mut session = sh_session();
        let cancel = CancellationToken::new();
        session
            .ensure_started(&StartupOptions::default(), &LogHostCallback, &cancel)
            .await
            .unwrap();

        let early = CancellationToken::new();
        let canceller = early.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = session
            .evaluate("sleep 0.3; echo late", &early)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        // The next request must not see the abandoned output.
        assert_eq!(session.evaluate("echo fresh", &cancel).await.unwrap(), "fresh");
        session.dispose().await;
    }

    #[tokio::test]
    async fn test_interrupted_startup_is_redone() {
        let mut session = sh_session();
        let cancel = CancellationToken::new();
        let mut options = StartupOptions::default();
        options.init.push("sleep 0.5; INIT_DONE=yes".to_string());

        let first = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            session.ensure_started(&options, &LogHostCallback, &cancel),
        )
        .await;
        assert!(first.is_err());
        assert!(!session.is_host_running());
        assert!(session.evaluate("echo early", &cancel).await.is_err());

        session
            .ensure_started(&options, &LogHostCallback, &cancel)
            .await
            .unwrap();
        assert!(session.is_host_running());
        assert_eq!(
            session.evaluate("echo \"init=$INIT_DONE\"", &cancel).await.unwrap(),
            "init=yes"
        );
        session.dispose().await;
    }
}
