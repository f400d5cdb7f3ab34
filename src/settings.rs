use anyhow::{Context, Result};
use config::{Config, Environment, Map};
use serde::Deserialize;

pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// The only variables read; the rest of the environment is never scanned.
const KNOWN_VARS: [&str; 4] = ["LLM_MODEL", "SPIDER_API_KEY", "OPENAI_API_KEY", "OPENAI_BASE_URL"];

/// Runtime settings, read from the process environment (and `.env`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// `LLM_MODEL`
    #[serde(default)]
    pub llm_model: Option<String>,
    /// `SPIDER_API_KEY`
    #[serde(default)]
    pub spider_api_key: Option<String>,
    /// `OPENAI_API_KEY`; when unset the OpenAI client falls back to its own lookup.
    #[serde(default)]
    pub openai_api_key: Option<String>,
    /// `OPENAI_BASE_URL`
    #[serde(default)]
    pub openai_base_url: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(known_vars(|key| std::env::var(key).ok()))
    }

    fn from_vars(vars: Map<String, String>) -> Result<Self> {
        Config::builder()
            .add_source(Environment::default().try_parsing(false).source(Some(vars)))
            .build()
            .and_then(Config::try_deserialize)
            .context("Failed to read settings from environment")
    }

    /// Model identifier; an unset or blank `LLM_MODEL` means the default.
    pub fn model(&self) -> &str {
        self.llm_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MODEL)
    }
}

/// Values of the known variables that `lookup` finds. A variable that is
/// unset or not valid UTF-8 is skipped.
fn known_vars(lookup: impl Fn(&str) -> Option<String>) -> Map<String, String> {
    KNOWN_VARS
        .iter()
        .filter_map(|key| lookup(key).map(|value| (key.to_string(), value)))
        .collect()
}

// ── Tests ──
