//! Fenced block discovery in Markdown documents.
//!
//! Splits a document into already-rendered HTML and evaluable fenced blocks.
//! A fence is evaluable when its info string starts with the configured
//! designator prefix (case-insensitive), e.g. `{r echo=FALSE}` for the
//! default prefix `{r`.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};

/// A fenced code block as written in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// The raw fence info string, e.g. `{r echo=FALSE}`.
    pub designator: String,
    /// Literal text lines of the block.
    pub lines: Vec<String>,
    /// Arguments following the language name, e.g. `echo=FALSE`.
    pub arguments: String,
}

impl FencedBlock {
    /// Build a block from a fence info string and its body text.
    pub fn new(info: &str, body: &str) -> Self {
        Self {
            designator: info.trim().to_string(),
            lines: body.lines().map(str::to_string).collect(),
            arguments: parse_arguments(info),
        }
    }

    /// The block's source text, lines joined with `\n`.
    pub fn source(&self) -> String {
        self.lines.join("\n")
    }

    /// Whether the designator carries the evaluable prefix.
    ///
    /// The prefix must be followed by the end of the designator or a
    /// separator, so `{r` matches `{r}` and `{r, echo=F}` but not `{rust}`.
    pub fn is_evaluable(&self, prefix: &str) -> bool {
        let designator = self.designator.as_bytes();
        let prefix = prefix.as_bytes();
        if designator.len() < prefix.len()
            || !designator[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            return false;
        }
        match designator.get(prefix.len()) {
            None => true,
            Some(&c) => c == b'}' || c == b',' || c.is_ascii_whitespace(),
        }
    }
}

/// Extract the arguments part of a fence info string.
///
/// `{r, echo=FALSE}` and `r echo=FALSE` both yield `echo=FALSE`.
pub fn parse_arguments(info: &str) -> String {
    let inner = info.trim();
    let inner = inner.strip_prefix('{').unwrap_or(inner);
    let inner = inner.strip_suffix('}').unwrap_or(inner);

    match inner.find(|c: char| c == ',' || c.is_whitespace()) {
        Some(pos) => inner[pos..]
            .trim_start_matches(|c: char| c == ',' || c.is_whitespace())
            .trim()
            .to_string(),
        None => String::new(),
    }
}

/// A piece of a split document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Rendered HTML for everything between evaluable blocks.
    Html(String),
    /// An evaluable fenced block.
    Block(FencedBlock),
}

/// Split a Markdown document into rendered HTML and evaluable blocks.
///
/// Fenced blocks that do not match `prefix` are rendered as ordinary code.
pub fn split_document(markdown: &str, prefix: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut pending: Vec<Event<'_>> = Vec::new();
    let options = Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_FOOTNOTES;
    let mut events = Parser::new_ext(markdown, options);

    while let Some(event) = events.next() {
        let info = match fence_info(&event) {
            Some(info) => info,
            None => {
                pending.push(event);
                continue;
            }
        };

        let mut body = String::new();
        let mut inner = Vec::new();
        for inner_event in events.by_ref() {
            match inner_event {
                Event::End(TagEnd::CodeBlock) => break,
                Event::Text(text) => {
                    body.push_str(&text);
                    inner.push(Event::Text(text));
                }
                other => inner.push(other),
            }
        }

        let block = FencedBlock::new(&info, &body);
        if block.is_evaluable(prefix) {
            flush_html(&mut pending, &mut segments);
            segments.push(Segment::Block(block));
        } else {
            pending.push(event);
            pending.extend(inner);
            pending.push(Event::End(TagEnd::CodeBlock));
        }
    }

    flush_html(&mut pending, &mut segments);
    segments
}

/// Only the evaluable blocks of a document, in order.
pub fn discover_blocks(markdown: &str, prefix: &str) -> Vec<FencedBlock> {
    split_document(markdown, prefix)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Block(block) => Some(block),
            Segment::Html(_) => None,
        })
        .collect()
}

fn fence_info(event: &Event<'_>) -> Option<String> {
    match event {
        Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => Some(info.to_string()),
        _ => None,
    }
}

fn flush_html(pending: &mut Vec<Event<'_>>, segments: &mut Vec<Segment>) {
    if pending.is_empty() {
        return;
    }
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, pending.drain(..));
    segments.push(Segment::Html(html));
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Title\n\nSome text.\n\n```{r}\nx <- 1\n```\n\n```python\nprint(1)\n```\n\n```{r, echo=FALSE}\nx + 1\n```\n";

    #[test]
    fn test_discovers_only_evaluable_blocks() {
        let blocks = discover_blocks(DOC, "{r");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].source(), "x <- 1");
        assert_eq!(blocks[0].arguments, "");
        assert_eq!(blocks[1].source(), "x + 1");
        assert_eq!(blocks[1].arguments, "echo=FALSE");
    }

    #[test]
    fn test_prefix_is_case_insensitive() {
        let block = FencedBlock::new("{R echo=TRUE}", "1");
        assert!(block.is_evaluable("{r"));
        assert!(!FencedBlock::new("{rust}", "1").is_evaluable("{r"));
        assert!(!FencedBlock::new("r", "1").is_evaluable("{r"));
        assert!(FencedBlock::new("r", "1").is_evaluable("r"));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments("{r}"), "");
        assert_eq!(parse_arguments("{r, echo=FALSE}"), "echo=FALSE");
        assert_eq!(parse_arguments("{r setup, include=FALSE}"), "setup, include=FALSE");
        assert_eq!(parse_arguments("r echo=F"), "echo=F");
    }

    #[test]
    fn test_split_keeps_other_content_as_html() {
        let segments = split_document(DOC, "{r");
        assert_eq!(segments.len(), 4);
        match &segments[0] {
            Segment::Html(html) => assert!(html.contains("<h1>Title</h1>")),
            other => panic!("expected html, got {:?}", other),
        }
        match &segments[2] {
            Segment::Html(html) => {
                assert!(html.contains("language-python"));
                assert!(html.contains("print(1)"));
            }
            other => panic!("expected html, got {:?}", other),
        }
        assert!(matches!(segments[3], Segment::Block(_)));
    }

    #[test]
    fn test_document_without_blocks() {
        let segments = split_document("plain *text*", "{r");
        assert_eq!(segments.len(), 1);
        assert!(discover_blocks("plain *text*", "{r").is_empty());
    }
}
