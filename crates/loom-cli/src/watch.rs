//! Watch command implementation for Loom CLI.
//!
//! Keeps one document open and re-renders it whenever the file changes, so
//! unchanged blocks come from cache and only edited tails re-run. An edit
//! arriving while blocks evaluate starts a new pass right away.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_mini::{DebounceEventResult, new_debouncer, notify::RecursiveMode};
use tokio::sync::mpsc;

use crate::style::{Tone, paint};
use crate::render::Renderer;

/// File change event.
#[derive(Debug, Clone)]
enum FileEvent {
    Modified(PathBuf),
    Removed(PathBuf),
}

/// Debounced watcher for a single file.
struct FileWatcher {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    fn new(file: &Path) -> anyhow::Result<Self> {
        let target = file.to_path_buf();
        let dir = file.parent().unwrap_or(Path::new(".")).to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: DebounceEventResult| {
                let Ok(events) = result else { return };
                for event in events {
                    if event.path != target {
                        continue;
                    }
                    let file_event = if event.path.exists() {
                        FileEvent::Modified(event.path)
                    } else {
                        FileEvent::Removed(event.path)
                    };
                    let _ = tx.send(file_event);
                }
            },
        )
        .map_err(|e| anyhow::anyhow!("Failed to create file watcher: {}", e))?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| anyhow::anyhow!("Failed to watch {}: {}", dir.display(), e))?;

        Ok(Self {
            _debouncer: debouncer,
            rx,
        })
    }

    async fn recv(&mut self) -> Option<FileEvent> {
        self.rx.recv().await
    }
}

/// Execute the watch command.
pub async fn execute(
    document: &Path,
    output: Option<&Path>,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    if !document.exists() {
        anyhow::bail!("Document not found: {}", document.display());
    }
    let abs_path = document.canonicalize()?;
    let renderer = Renderer::open(&abs_path, output, config, false)?;

    println!(
        "\n{} - {}",
        paint(Tone::Heading, "Loom Watch"),
        paint(Tone::Path, document.display())
    );
    println!("{}", "─".repeat(50));

    let mut pending = start_render(&renderer, &abs_path);
    let mut watcher = FileWatcher::new(&abs_path)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            result = renderer.complete(), if pending.is_some() => {
                let blocks = pending.take().unwrap_or_default();
                report(&renderer, blocks, result);
            }
            event = watcher.recv() => match event {
                Some(FileEvent::Modified(_)) => {
                    println!("\n{}", paint(Tone::Warning, "File changed, re-rendering..."));
                    pending = start_render(&renderer, &abs_path);
                }
                Some(FileEvent::Removed(path)) => {
                    eprintln!(
                        "\n{} Document removed: {}",
                        paint(Tone::Warning, "Warning:"),
                        path.display()
                    );
                }
                None => break,
            },
        }
    }

    renderer.close().await;
    Ok(())
}

/// Start a pass over the current file contents.
///
/// Returns the block count when evaluation is now in flight.
fn start_render(renderer: &Renderer, path: &Path) -> Option<usize> {
    let result = std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|markdown| renderer.start(&markdown));

    match result {
        Ok(blocks) => Some(blocks),
        Err(e) => {
            report(renderer, 0, Err(e));
            None
        }
    }
}

fn report(renderer: &Renderer, blocks: usize, result: anyhow::Result<()>) {
    match result {
        Ok(()) => println!(
            "{} {} ({} block(s))",
            paint(Tone::Success, "Wrote"),
            renderer.output().display(),
            blocks
        ),
        Err(e) => eprintln!("{} {}", paint(Tone::Failure, "Error:"), e),
    }
    println!("{}", paint(Tone::Muted, "Watching for changes... (Ctrl+C to stop)"));
}
