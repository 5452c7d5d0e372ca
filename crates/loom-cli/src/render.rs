//! Render command implementation for Loom CLI.
//!
//! Runs one pass over a Markdown document, writes the page with placeholders
//! straight away and rewrites it once the blocks have evaluated.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use loom_core::discover::{Segment, split_document};
use loom_core::session::ProcessSessionFactory;
use loom_core::{EvalDocument, EvaluationCallback, HtmlOutput, LoomConfig};

use crate::style::{self, Tone, paint};

/// Name of the configuration file looked up next to the document.
pub const CONFIG_FILE: &str = "loom.toml";

type Document = EvalDocument<ProcessSessionFactory, Arc<HtmlOutput>>;

/// Prints per-block progress and remembers a session failure.
#[derive(Default)]
struct ProgressPrinter {
    session_error: Mutex<Option<String>>,
}

impl ProgressPrinter {
    fn take_session_error(&self) -> Option<String> {
        self.session_error.lock().ok().and_then(|mut e| e.take())
    }
}

impl EvaluationCallback for ProgressPrinter {
    fn on_block_started(&self, index: usize) {
        print!("  Evaluating block {}... ", index);
        style::flush_stdout();
    }

    fn on_block_completed(&self, _index: usize) {
        println!("{}", paint(Tone::Success, "✓"));
    }

    fn on_block_failed(&self, _index: usize, message: &str) {
        println!("{}", paint(Tone::Failure, "✗"));
        eprintln!("    {} {}", paint(Tone::Failure, "Error:"), message);
    }

    fn on_batch_cancelled(&self, index: usize) {
        println!("{}", paint(Tone::Muted, format!("cancelled at block {}", index)));
    }

    fn on_session_failed(&self, error: &loom_core::Error) {
        if let Ok(mut slot) = self.session_error.lock() {
            *slot = Some(error.with_hint());
        }
    }
}

/// An open document bound to its output file.
pub struct Renderer {
    doc: Document,
    progress: Arc<ProgressPrinter>,
    block_prefix: String,
    title: String,
    output: PathBuf,
}

impl Renderer {
    /// Open `document` with its configuration.
    pub fn open(
        document: &Path,
        output: Option<&Path>,
        config_path: Option<&Path>,
        no_auto: bool,
    ) -> anyhow::Result<Self> {
        let mut config = load_config(document, config_path)?;
        if no_auto {
            config.auto_evaluate = false;
            config.prestart_session = false;
        }
        if config.document_id.is_none() {
            config.document_id = Some(document_stem(document));
        }

        let progress = Arc::new(ProgressPrinter::default());
        let block_prefix = config.block_prefix.clone();
        let factory = ProcessSessionFactory::new(config.host.clone());
        let doc = EvalDocument::builder(factory, Arc::new(HtmlOutput::new()))
            .config(config)
            .callback(progress.clone())
            .build();

        Ok(Self {
            doc,
            progress,
            block_prefix,
            title: document_stem(document),
            output: output
                .map(Path::to_path_buf)
                .unwrap_or_else(|| document.with_extension("html")),
        })
    }

    /// Output file the page is written to.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Run one pass over `markdown` and write the page as it stands.
    ///
    /// Blocks that still need evaluation show up as placeholders. Returns the
    /// number of blocks in the document.
    pub fn start(&self, markdown: &str) -> anyhow::Result<usize> {
        let out = self.doc.sink();
        out.clear();

        let mut pass = self.doc.start_pass()?;
        let mut blocks = 0;
        for segment in split_document(markdown, &self.block_prefix) {
            match segment {
                Segment::Html(html) => out.push_static(html),
                Segment::Block(block) => {
                    out.push_block(pass.render_block(&block)?);
                    blocks += 1;
                }
            }
        }
        pass.finish()?;

        self.write_page()?;
        Ok(blocks)
    }

    /// Wait for the latest pass to evaluate, then rewrite the patched page.
    ///
    /// Dropping the future early leaves the placeholder page in place.
    pub async fn complete(&self) -> anyhow::Result<()> {
        self.doc.render_existing().await?;
        self.write_page()?;

        if let Some(message) = self.progress.take_session_error() {
            anyhow::bail!("{}", message);
        }
        Ok(())
    }

    /// [`start`](Self::start) followed by [`complete`](Self::complete).
    pub async fn render(&self, markdown: &str) -> anyhow::Result<usize> {
        let blocks = self.start(markdown)?;
        self.complete().await?;
        Ok(blocks)
    }

    fn write_page(&self) -> anyhow::Result<()> {
        std::fs::write(&self.output, self.doc.sink().to_page(&self.title))?;
        Ok(())
    }

    /// Shut the document's session down.
    pub async fn close(&self) {
        self.doc.dispose().await;
    }
}

/// Load configuration from `config_path`, or from `loom.toml` next to the
/// document if it exists.
pub fn load_config(document: &Path, config_path: Option<&Path>) -> anyhow::Result<LoomConfig> {
    let config = match config_path {
        Some(path) => LoomConfig::load(path)?,
        None => {
            let dir = document.parent().unwrap_or(Path::new("."));
            LoomConfig::load_or_default(dir.join(CONFIG_FILE))?
        }
    };
    Ok(config)
}

fn document_stem(document: &Path) -> String {
    document
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

/// Execute the render command.
pub async fn execute(
    document: &Path,
    output: Option<&Path>,
    config: Option<&Path>,
    no_auto: bool,
) -> anyhow::Result<()> {
    if !document.exists() {
        anyhow::bail!("Document not found: {}", document.display());
    }

    let start = Instant::now();
    let markdown = std::fs::read_to_string(document)?;
    let renderer = Renderer::open(document, output, config, no_auto)?;

    println!(
        "\n{} {}",
        paint(Tone::Heading, "Rendering"),
        paint(Tone::Path, document.display())
    );

    let result = renderer.render(&markdown).await;
    renderer.close().await;
    let blocks = result?;

    println!(
        "{} {} ({} block(s) in {:.2}s)",
        paint(Tone::Success, "Wrote"),
        renderer.output().display(),
        blocks,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
