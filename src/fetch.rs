use std::sync::LazyLock;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use spider_client::shapes::request::{RequestType, ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, info};

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static EMPTY_LINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\]\([^)]*\)").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static BODY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

/// Subtrees dropped entirely: page chrome and anything that renders no text.
const SKIPPED_TAGS: &[&str] = &[
    "head", "header", "footer", "nav", "script", "style", "noscript", "template", "svg", "img",
    "picture", "iframe", "canvas",
];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "figure", "form", "h1", "h2", "h3", "h4", "h5", "h6", "hr", "li", "main", "ol", "p", "pre",
    "section", "table", "td", "th", "tr", "ul",
];

/// Something that can turn a URL into readable page text.
/// `Ok(None)` means the page was reached but yielded no text.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Option<String>>;
}

/// Renders pages in a headless browser through spider.cloud.
pub struct SpiderSource {
    api_key: Option<String>,
}

impl SpiderSource {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[async_trait]
impl PageSource for SpiderSource {
    async fn fetch(&self, url: &str) -> Result<Option<String>> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("SPIDER_API_KEY environment variable must be set"))?;

        // One client per fetch; dropped on every return path.
        let spider = Spider::new(Some(api_key))
            .map_err(|e| anyhow!("Failed to create Spider client: {}", e))?;

        let params = RequestParams {
            request: Some(RequestType::Chrome),
            cache: Some(false),
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let start = Instant::now();
        let response = spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| anyhow!("Spider scrape failed: {}", e))?;
        info!(url, latency_ms = start.elapsed().as_millis() as u64, "Page rendered");

        let Some(html) = content_from_response(response)? else {
            return Ok(None);
        };
        let text = page_text(&html);
        if let Some(ref t) = text {
            debug!(chars = t.chars().count(), "Page text:\n{}", t);
        }
        Ok(text)
    }
}

/// Pull the first page's `content` out of a scrape response.
/// A reported error with no content is a failed fetch.
fn content_from_response(response: serde_json::Value) -> Result<Option<String>> {
    let parsed: serde_json::Value = match response.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
        None => response,
    };

    let first = parsed.as_array().and_then(|arr| arr.first()).unwrap_or(&parsed);

    let content = first
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string);

    if content.is_none() {
        if let Some(err) = first
            .get("error")
            .and_then(|e| e.as_str())
            .filter(|e| !e.is_empty())
        {
            let status = first.get("status").and_then(|s| s.as_i64());
            bail!("Spider scrape failed (status {:?}): {}", status, err);
        }
    }

    Ok(content)
}

/// Reduce rendered HTML to plain text, one block per line.
/// Returns `None` when nothing readable is left.
pub fn page_text(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let root = doc
        .select(&BODY_SEL)
        .next()
        .unwrap_or_else(|| doc.root_element());

    let mut raw = String::new();
    collect_text(root, &mut raw);

    let lines: Vec<String> = strip_images(&raw)
        .lines()
        .map(|l| SPACES_RE.replace_all(l, " ").trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    let tag = el.value().name();
    if SKIPPED_TAGS.contains(&tag) {
        return;
    }
    let block = BLOCK_TAGS.contains(&tag);
    if block {
        out.push('\n');
    }

    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            collect_text(child_el, out);
        } else if let Node::Text(text) = child.value() {
            out.push_str(&SPACES_RE.replace_all(text, " "));
        }
    }

    if block {
        out.push('\n');
    }
}

/// Remove markdown image syntax: ![alt](url) and [![alt](url)](link)
fn strip_images(md: &str) -> String {
    let cleaned = IMAGE_RE.replace_all(md, "");
    let cleaned = EMPTY_LINK_RE.replace_all(&cleaned, "");
    BLANKS_RE.replace_all(&cleaned, "\n\n").to_string()
}

// ── Tests ──
