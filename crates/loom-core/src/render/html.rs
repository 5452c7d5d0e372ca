//! In-memory HTML output with addressable regions.

use std::sync::Mutex;

use super::{BlockMarkup, OutputSink, escape_html, region};
use crate::lock_unpoisoned;

#[derive(Debug, Clone)]
enum Piece {
    Static(String),
    Region { id: String, content: String },
}

/// Rendered document kept as a sequence of static HTML and patchable regions.
#[derive(Debug, Default)]
pub struct HtmlOutput {
    pieces: Mutex<Vec<Piece>>,
}

impl HtmlOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append literal HTML.
    pub fn push_static(&self, html: impl Into<String>) {
        lock_unpoisoned(&self.pieces).push(Piece::Static(html.into()));
    }

    /// Append an output region with initial content.
    pub fn push_region(&self, id: impl Into<String>, content: impl Into<String>) {
        lock_unpoisoned(&self.pieces).push(Piece::Region {
            id: id.into(),
            content: content.into(),
        });
    }

    /// Append a block's echo and output region.
    pub fn push_block(&self, markup: BlockMarkup) {
        let mut pieces = lock_unpoisoned(&self.pieces);
        if let Some(echo) = markup.echo {
            pieces.push(Piece::Static(echo));
        }
        pieces.push(Piece::Region {
            id: markup.slot_id,
            content: markup.content,
        });
    }

    /// Current content of region `id`.
    pub fn region_content(&self, id: &str) -> Option<String> {
        lock_unpoisoned(&self.pieces).iter().find_map(|piece| match piece {
            Piece::Region { id: rid, content } if rid == id => Some(content.clone()),
            _ => None,
        })
    }

    /// Drop everything emitted so far.
    pub fn clear(&self) {
        lock_unpoisoned(&self.pieces).clear();
    }

    /// Render the body fragment.
    pub fn to_html(&self) -> String {
        let pieces = lock_unpoisoned(&self.pieces);
        let mut html = String::new();
        for piece in pieces.iter() {
            match piece {
                Piece::Static(text) => html.push_str(text),
                Piece::Region { id, content } => html.push_str(&region(id, content)),
            }
        }
        html
    }

    /// Render a standalone page.
    pub fn to_page(&self, title: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
            escape_html(title),
            self.to_html()
        )
    }
}

impl OutputSink for HtmlOutput {
    fn replace_region(&self, id: &str, markup: &str) -> bool {
        let mut pieces = lock_unpoisoned(&self.pieces);
        for piece in pieces.iter_mut() {
            if let Piece::Region { id: rid, content } = piece
                && rid == id
            {
                *content = markup.to_string();
                return true;
            }
        }
        false
    }
}
