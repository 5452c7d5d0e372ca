//! Placeholder generation and in-place patching of rendered output.
//!
//! A pass writes each block's markup immediately: the cached result when
//! there is one, a placeholder otherwise. Once a block is evaluated the
//! patcher finds its region by id and swaps the content in place.

pub mod html;

use std::sync::{Arc, LazyLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::block::CodeBlock;

pub use html::HtmlOutput;

/// Rendered output that can be patched by region id.
pub trait OutputSink: Send + Sync + 'static {
    /// Replace the content of region `id`.
    ///
    /// Returns `false` if no such region has been emitted yet.
    fn replace_region(&self, id: &str, markup: &str) -> bool;
}

impl<T: OutputSink> OutputSink for Arc<T> {
    fn replace_region(&self, id: &str, markup: &str) -> bool {
        (**self).replace_region(id, markup)
    }
}

const SPINNER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="24" height="24" viewBox="0 0 24 24"><circle cx="12" cy="12" r="9" fill="none" stroke="#9aa0a6" stroke-width="3" stroke-dasharray="42 14" stroke-linecap="round"><animateTransform attributeName="transform" type="rotate" from="0 12 12" to="360 12 12" dur="0.9s" repeatCount="indefinite"/></circle></svg>"##;

static INDICATOR_URI: LazyLock<String> = LazyLock::new(|| {
    format!("data:image/svg+xml;base64,{}", STANDARD.encode(SPINNER_SVG))
});

/// Data URI of the animated "evaluating" indicator, built once per process.
pub fn indicator_uri() -> &'static str {
    INDICATOR_URI.as_str()
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Echoed block source.
pub fn echo_markup(source: &str) -> String {
    format!(
        "<pre class=\"loom-source\"><code>{}</code></pre>",
        escape_html(source)
    )
}

/// Markup for a successful evaluation. Empty output renders as nothing.
pub fn result_markup(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    format!(
        "<pre class=\"loom-result\"><code>{}</code></pre>",
        escape_html(text.trim_end())
    )
}

/// Markup for a failed evaluation, shown inline in place of the output.
pub fn error_markup(message: &str) -> String {
    format!(
        "<pre class=\"loom-error\"><code>{}</code></pre>",
        escape_html(message.trim_end())
    )
}

/// Wrap `content` in the addressable output region `slot_id`.
pub fn region(slot_id: &str, content: &str) -> String {
    format!(
        "<div class=\"loom-output\" id=\"{}\">{}</div>",
        escape_html(slot_id),
        content
    )
}

/// Markup written for one block during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMarkup {
    /// Echoed source, if the block echoes.
    pub echo: Option<String>,
    /// Region id.
    pub slot_id: String,
    /// Current region content (placeholder or result).
    pub content: String,
}

impl BlockMarkup {
    /// Full HTML for the block: echo (if any) followed by the region.
    pub fn to_html(&self) -> String {
        let mut html = self.echo.clone().unwrap_or_default();
        html.push_str(&region(&self.slot_id, &self.content));
        html
    }
}

/// Placeholder content for a block that has not been evaluated yet.
///
/// With automatic evaluation on (`dynamic`), the region shows the animated
/// indicator; otherwise it shows the block's source as inert text.
pub fn placeholder(block: &CodeBlock, dynamic: bool) -> BlockMarkup {
    let content = if dynamic {
        format!(
            "<img class=\"loom-pending\" alt=\"evaluating\" data-slot=\"{}\" src=\"{}\"/>",
            escape_html(&block.slot_id),
            indicator_uri()
        )
    } else {
        format!(
            "<pre class=\"loom-pending\"><code>{}</code></pre>",
            escape_html(&block.source)
        )
    };

    BlockMarkup {
        echo: block.echo.then(|| echo_markup(&block.source)),
        slot_id: block.slot_id.clone(),
        content,
    }
}

/// Final markup for a block that already has a result.
pub fn final_markup(block: &CodeBlock) -> BlockMarkup {
    BlockMarkup {
        echo: block.echo.then(|| echo_markup(&block.source)),
        slot_id: block.slot_id.clone(),
        content: block.result.clone().unwrap_or_default(),
    }
}

/// Applies finished results to previously emitted output.
pub struct RenderPatcher<O: OutputSink> {
    sink: O,
}

impl<O: OutputSink> RenderPatcher<O> {
    /// Create a patcher writing into `sink`.
    pub fn new(sink: O) -> Self {
        Self { sink }
    }

    /// The output sink.
    pub fn sink(&self) -> &O {
        &self.sink
    }

    /// Replace the content of `slot_id`. Best-effort: a missing region is
    /// skipped and reported as `false`.
    pub fn patch(&self, slot_id: &str, content: &str) -> bool {
        let found = self.sink.replace_region(slot_id, content);
        if !found {
            tracing::debug!("Output region {} not materialized yet, skipping patch", slot_id);
        }
        found
    }
}
