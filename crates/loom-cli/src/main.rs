//! Loom CLI - incremental evaluation of code blocks in Markdown documents.

mod render;
mod style;
mod watch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "loom")]
#[command(about = "Render Markdown documents with incrementally evaluated code blocks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a document once and write the HTML page
    Render {
        /// Path to the document (.md file)
        document: PathBuf,

        /// Output path for the HTML file (default: next to the document)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration file (default: loom.toml next to the document)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Emit placeholders only, without evaluating blocks
        #[arg(long)]
        no_auto: bool,
    },

    /// Watch a document and re-render it on changes
    Watch {
        /// Path to the document (.md file)
        document: PathBuf,

        /// Output path for the HTML file (default: next to the document)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration file (default: loom.toml next to the document)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format loom-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(loom_err) = err.downcast_ref::<loom_core::Error>() {
            anyhow::anyhow!("{}", loom_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Render {
            document,
            output,
            config,
            no_auto,
        } => {
            render::execute(&document, output.as_deref(), config.as_deref(), no_auto)
                .await
                .map_err(format_error)?;
        }

        Commands::Watch {
            document,
            output,
            config,
        } => {
            watch::execute(&document, output.as_deref(), config.as_deref())
                .await
                .map_err(format_error)?;
        }
    }

    Ok(())
}
