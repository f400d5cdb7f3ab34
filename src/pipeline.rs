use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::extract::Extractor;
use crate::fetch::PageSource;
use crate::output::{self, Envelope, OutputTarget};
use crate::schema;

/// One harvest: a page, the shape to pull out of it, and where to put it.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub schema: String,
    pub definitions: PathBuf,
    pub output: Option<OutputTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Schema could not be resolved; carries the serialized failure envelope.
    SchemaUnavailable(String),
    /// The page produced no text. Nothing was written.
    NoContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Serialized result, already persisted to the output target if one was given.
    Done(String),
    Aborted(AbortReason),
}

/// Resolve schema → fetch page → extract → write.
///
/// Schema problems and empty pages end the run early with an [`Outcome::Aborted`];
/// fetch, model and I/O failures are returned as errors.
pub async fn run(
    req: &Request,
    source: &dyn PageSource,
    extractor: &dyn Extractor,
) -> Result<Outcome> {
    let schema = match schema::resolve(&req.definitions, &req.schema) {
        Ok(s) => s,
        Err(e) => {
            warn!(schema = %req.schema, error = %e, "Schema unavailable");
            let envelope = Envelope::Failed {
                error: e.to_string(),
            };
            let json = output::write(&envelope, req.output.as_ref())?;
            return Ok(Outcome::Aborted(AbortReason::SchemaUnavailable(json)));
        }
    };
    info!(schema = %schema.name, fields = schema.fields.len(), "Schema resolved");

    let pb = spinner(format!("Fetching {}", req.url));
    let text = source.fetch(&req.url).await;
    pb.finish_and_clear();
    let Some(text) = text? else {
        warn!(url = %req.url, "Page yielded no text");
        return Ok(Outcome::Aborted(AbortReason::NoContent));
    };
    info!(chars = text.chars().count(), "Content fetched");

    let pb = spinner(format!("Extracting {}", schema.name));
    let record = extractor.extract(&text, &schema).await;
    pb.finish_and_clear();
    let record = record?;

    let json = output::write(&Envelope::Extracted(record), req.output.as_ref())?;
    Ok(Outcome::Done(json))
}

fn spinner(msg: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}") {
        pb.set_style(style);
    }
    pb.set_message(msg);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;
    use async_trait::async_trait;

    use crate::extract::{conform, Record};
    use crate::schema::{SchemaDefinition, DEFAULT_DEFINITIONS};

    struct FakeSource {
        text: Option<&'static str>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn with(text: Option<&'static str>) -> Self {
            FakeSource {
                text,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for FakeSource {
        async fn fetch(&self, _url: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("browser failed to launch");
            }
            Ok(self.text.map(str::to_string))
        }
    }

    /// Answers with a canned model reply, run through the real adapter.
    struct FakeModel {
        reply: &'static str,
        calls: AtomicUsize,
    }

    impl FakeModel {
        fn replying(reply: &'static str) -> Self {
            FakeModel {
                reply,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Extractor for FakeModel {
        async fn extract(&self, _text: &str, schema: &SchemaDefinition) -> Result<Record> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(conform(self.reply, schema)?)
        }
    }

    fn request(schema: &str, output: Option<&Path>) -> Request {
        Request {
            url: "https://example.com/apples".into(),
            schema: schema.into(),
            definitions: PathBuf::from(DEFAULT_DEFINITIONS),
            output: output.map(OutputTarget::from_path),
        }
    }

    const PAGE: Option<&str> = Some("Fresh Apples\nPrice: $3.49 per kg");
    const PRODUCT_REPLY: &str = r#"{"name": "Fresh Apples", "unit": "kg", "price": 3.49}"#;

    #[tokio::test]
    async fn website_to_console() {
        let source = FakeSource::with(PAGE);
        let model = FakeModel::replying(r#"{"summary": "An orchard shop.", "page_name": "Orchard Market"}"#);

        let outcome = run(&request("Website", None), &source, &model).await.unwrap();
        let Outcome::Done(json) = outcome else {
            panic!("expected Done, got {:?}", outcome);
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["page_name", "summary"]);
    }

    #[tokio::test]
    async fn unknown_schema_envelope() {
        let source = FakeSource::with(PAGE);
        let model = FakeModel::replying(PRODUCT_REPLY);

        let outcome = run(&request("DoesNotExist", None), &source, &model).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Aborted(AbortReason::SchemaUnavailable(
                r#"{"Success":false,"error":"Schema class 'DoesNotExist' not found in schema.toml"}"#
                    .into()
            ))
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_schema_written_to_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let source = FakeSource::with(PAGE);
        let model = FakeModel::replying(PRODUCT_REPLY);

        run(&request("DoesNotExist", Some(path.as_path())), &source, &model)
            .await
            .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with(r#"{"Success":false,"error":"Schema class 'DoesNotExist'"#));
    }

    #[tokio::test]
    async fn unknown_schema_written_to_csv_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let source = FakeSource::with(PAGE);
        let model = FakeModel::replying(PRODUCT_REPLY);

        run(&request("DoesNotExist", Some(path.as_path())), &source, &model)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            r#"{"Success":false,"error":"Schema class 'DoesNotExist' not found in schema.toml"}"#
        );
    }

    #[tokio::test]
    async fn empty_page_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("fresh.csv");
        let existing = dir.path().join("existing.json");
        std::fs::write(&existing, "{\"kept\":true}").unwrap();

        for path in [&fresh, &existing] {
            let source = FakeSource::with(None);
            let model = FakeModel::replying(PRODUCT_REPLY);
            let outcome = run(&request("Product", Some(path.as_path())), &source, &model)
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::Aborted(AbortReason::NoContent));
            assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        }

        assert!(!fresh.exists());
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "{\"kept\":true}");
    }

    #[tokio::test]
    async fn product_csv_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        for _ in 0..2 {
            let source = FakeSource::with(PAGE);
            let model = FakeModel::replying(PRODUCT_REPLY);
            let outcome = run(&request("Product", Some(path.as_path())), &source, &model)
                .await
                .unwrap();
            assert!(matches!(outcome, Outcome::Done(_)));
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(
            reader.headers().unwrap().iter().collect::<Vec<_>>(),
            ["timestamp", "name", "unit", "price"]
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_ne!(&rows[0][0], &rows[1][0]);
        for row in &rows {
            assert_eq!(&row[1], "Fresh Apples");
            assert_eq!(&row[2], "kg");
            assert_eq!(&row[3], "3.49");
        }
    }

    #[tokio::test]
    async fn model_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let source = FakeSource::with(PAGE);
        let model = FakeModel::replying(r#"{"name": "Fresh Apples"}"#);

        let err = run(&request("Product", Some(path.as_path())), &source, &model)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing required field 'unit'"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal() {
        let source = FakeSource {
            fail: true,
            ..FakeSource::with(PAGE)
        };
        let model = FakeModel::replying(PRODUCT_REPLY);

        let err = run(&request("Product", None), &source, &model).await.unwrap_err();
        assert!(err.to_string().contains("browser failed to launch"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }
}
