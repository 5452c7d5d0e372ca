//! End-to-end passes over Markdown documents with a scripted session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use loom_core::config::StartupOptions;
use loom_core::discover::{Segment, split_document};
use loom_core::session::HostCallback;
use loom_core::{
    BlockState, Error, EvalDocument, ExecutionSession, HtmlOutput, LoomConfig, Result,
    SessionFactory,
};
use tokio_util::sync::CancellationToken;

/// Session that answers each source text from a fixed script and keeps a
/// running counter so later answers can depend on earlier calls.
#[derive(Clone, Default)]
struct ScriptFactory {
    script: Arc<HashMap<String, String>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptFactory {
    fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            script: Arc::new(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            calls: Arc::default(),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }
}

struct ScriptSession {
    name: String,
    started: bool,
    factory: ScriptFactory,
}

impl SessionFactory for ScriptFactory {
    type Session = ScriptSession;

    fn create(&self, name: &str) -> Result<ScriptSession> {
        Ok(ScriptSession {
            name: name.to_string(),
            started: false,
            factory: self.clone(),
        })
    }
}

impl ExecutionSession for ScriptSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_host_running(&mut self) -> bool {
        self.started
    }

    async fn ensure_started(
        &mut self,
        _options: &StartupOptions,
        _callback: &dyn HostCallback,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.started = true;
        Ok(())
    }

    async fn evaluate(&mut self, text: &str, _cancel: &CancellationToken) -> Result<String> {
        self.factory.calls.lock().unwrap().push(text.to_string());
        match self.factory.script.get(text) {
            Some(answer) if answer.starts_with("error:") => {
                Err(Error::Evaluation(answer["error:".len()..].to_string()))
            }
            Some(answer) => Ok(answer.clone()),
            None => Ok(String::new()),
        }
    }

    async fn dispose(&mut self) {
        self.started = false;
    }
}

type Doc = EvalDocument<ScriptFactory, Arc<HtmlOutput>>;

fn open(factory: ScriptFactory) -> Doc {
    let config = LoomConfig {
        document_id: Some("report".to_string()),
        prestart_session: false,
        ..LoomConfig::default()
    };
    EvalDocument::builder(factory, Arc::new(HtmlOutput::new()))
        .config(config)
        .build()
}

/// Render `markdown` into the document's sink the way the CLI does.
fn render(doc: &Doc, markdown: &str) {
    let out = doc.sink();
    out.clear();
    let mut pass = doc.start_pass().unwrap();
    for segment in split_document(markdown, "{r") {
        match segment {
            Segment::Html(html) => out.push_static(html),
            Segment::Block(block) => out.push_block(pass.render_block(&block).unwrap()),
        }
    }
    pass.finish().unwrap();
}

const REPORT: &str = "\
# Report

```{r}
load()
```

Some prose.

```{r echo=FALSE}
summary()
```

```{r}
plot()
```
";

fn factory() -> ScriptFactory {
    ScriptFactory::new(&[
        ("load()", "loaded 10 rows"),
        ("summary()", "mean: 4.2"),
        ("plot()", "error:no device"),
        ("plot(dev)", "<plot>"),
    ])
}

#[tokio::test]
async fn test_full_render_patches_every_region() {
    let factory = factory();
    let doc = open(factory.clone());

    render(&doc, REPORT);
    assert_eq!(doc.sink().to_html().matches("loom-pending").count(), 3);

    doc.render_existing().await.unwrap();
    let html = doc.sink().to_html();

    assert_eq!(factory.calls(), vec!["load()", "summary()", "plot()"]);
    assert!(!html.contains("loom-pending"));
    assert!(html.contains("<h1>Report</h1>"));
    assert!(html.contains("loaded 10 rows"));
    assert!(html.contains("mean: 4.2"));
    assert!(html.contains("<pre class=\"loom-error\"><code>no device</code></pre>"));
    // Only two blocks echo their source.
    assert_eq!(html.matches("loom-source").count(), 2);
    assert!(!html.contains("summary()"));
    assert!(
        doc.blocks()
            .iter()
            .all(|b| b.state == BlockState::Rendered)
    );

    doc.dispose().await;
}

#[tokio::test]
async fn test_prose_edit_keeps_cache() {
    let factory = factory();
    let doc = open(factory.clone());
    render(&doc, REPORT);
    doc.render_existing().await.unwrap();
    factory.reset();

    render(&doc, &REPORT.replace("Some prose.", "Different prose."));
    doc.render_existing().await.unwrap();

    assert!(factory.calls().is_empty());
    assert!(doc.sink().to_html().contains("Different prose."));
    assert!(doc.sink().to_html().contains("loaded 10 rows"));
}

#[tokio::test]
async fn test_block_edit_recomputes_tail_only() {
    let factory = factory();
    let doc = open(factory.clone());
    render(&doc, REPORT);
    doc.render_existing().await.unwrap();
    factory.reset();

    render(&doc, &REPORT.replace("plot()", "plot(dev)"));
    doc.render_existing().await.unwrap();

    assert_eq!(factory.calls(), vec!["plot(dev)"]);
    let html = doc.sink().to_html();
    assert!(html.contains("&lt;plot&gt;"));
    assert!(!html.contains("no device"));
}

#[tokio::test]
async fn test_inserted_block_invalidates_following_blocks() {
    let factory = factory();
    let doc = open(factory.clone());
    render(&doc, REPORT);
    doc.render_existing().await.unwrap();
    factory.reset();

    let edited = REPORT.replace("Some prose.", "```{r}\nextra()\n```");
    render(&doc, &edited);
    doc.render_existing().await.unwrap();

    assert_eq!(factory.calls(), vec!["extra()", "summary()", "plot()"]);
    assert_eq!(doc.blocks().len(), 4);
}
