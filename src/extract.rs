use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::settings::Settings;
use crate::schema::{FieldType, SchemaDefinition};

/// Longest name the chat API accepts for a response format.
const FORMAT_NAME_MAX: usize = 64;

static THOUSANDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d{1,3}(,\d{3})+(\.\d+)?$").unwrap());

const SYSTEM_PROMPT: &str = "You are an advanced website structured data/information extraction tool. You will accurately extract data from the following text:";

/// A populated schema instance: exactly the declared fields, in declared order.
pub type Record = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ConformanceError {
    #[error("model returned no content")]
    Empty,
    #[error("model refused to answer: {0}")]
    Refused(String),
    #[error("model output is not a JSON object: {0}")]
    NotAnObject(String),
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("field '{field}' expected {expected}, got {got}")]
    Mismatch {
        field: String,
        expected: &'static str,
        got: Value,
    },
}

/// Turns page text into a record shaped like `schema`.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str, schema: &SchemaDefinition) -> Result<Record>;
}

pub struct OpenAiExtractor {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiExtractor {
    pub fn new(settings: &Settings) -> Self {
        let mut config = OpenAIConfig::new();
        if let Some(ref key) = settings.openai_api_key {
            config = config.with_api_key(key);
        }
        if let Some(ref base) = settings.openai_base_url {
            config = config.with_api_base(base);
        }
        OpenAiExtractor {
            client: Client::with_config(config),
            model: settings.model().to_string(),
        }
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(&self, text: &str, schema: &SchemaDefinition) -> Result<Record> {
        let request = build_request(&self.model, text, schema)?;
        info!(model = %self.model, schema = %schema.name, "Requesting structured extraction");

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .context("Chat completion request failed")?;
        debug!(usage = ?response.usage, "Completion received");

        let content = reply_content(&response)?;
        Ok(conform(content, schema)?)
    }
}

/// Text of the first choice. A refusal wins over any content.
fn reply_content(response: &CreateChatCompletionResponse) -> Result<&str, ConformanceError> {
    let message = &response
        .choices
        .first()
        .ok_or(ConformanceError::Empty)?
        .message;
    if let Some(ref refusal) = message.refusal {
        return Err(ConformanceError::Refused(refusal.clone()));
    }
    message.content.as_deref().ok_or(ConformanceError::Empty)
}

fn build_request(
    model: &str,
    text: &str,
    schema: &SchemaDefinition,
) -> Result<CreateChatCompletionRequest> {
    let response_format = ResponseFormat::JsonSchema {
        json_schema: ResponseFormatJsonSchema {
            description: None,
            name: format_name(&schema.name),
            schema: Some(schema.json_schema()),
            strict: Some(true),
        },
    };

    let request = CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages([
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_PROMPT)
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(text)
                .build()?
                .into(),
        ])
        .response_format(response_format)
        .build()?;
    Ok(request)
}

/// Response format names allow only `[a-zA-Z0-9_-]`, at most 64 of them.
fn format_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(FORMAT_NAME_MAX)
        .collect()
}

/// Validate raw model output against `schema` and coerce it into a record.
/// Undeclared keys are dropped; missing optional fields become `null`.
pub fn conform(raw: &str, schema: &SchemaDefinition) -> Result<Record, ConformanceError> {
    let body = unfence(raw);
    if body.is_empty() {
        return Err(ConformanceError::Empty);
    }
    let mut object = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => return Err(ConformanceError::NotAnObject(truncate(body, 120))),
    };

    let mut record = Record::new();
    for field in &schema.fields {
        let value = match object.remove(&field.name) {
            None | Some(Value::Null) if field.required => {
                return Err(ConformanceError::MissingField(field.name.clone()))
            }
            None | Some(Value::Null) => Value::Null,
            Some(v) => coerce(&v, &field.ty).ok_or_else(|| ConformanceError::Mismatch {
                field: field.name.clone(),
                expected: type_label(&field.ty),
                got: v,
            })?,
        };
        record.insert(field.name.clone(), value);
    }
    Ok(record)
}

fn coerce(value: &Value, ty: &FieldType) -> Option<Value> {
    match (ty, value) {
        (FieldType::String, Value::String(_)) => Some(value.clone()),
        (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),

        (FieldType::Integer, Value::Number(n)) => as_integer(n.as_f64()?, n.as_i64()),
        (FieldType::Integer, Value::String(s)) => {
            let s = numeric(s);
            match s.parse::<i64>() {
                Ok(i) => Some(Value::from(i)),
                Err(_) => as_integer(s.parse::<f64>().ok()?, None),
            }
        }

        (FieldType::Number, Value::Number(n)) => Number::from_f64(n.as_f64()?).map(Value::Number),
        (FieldType::Number, Value::String(s)) => {
            Number::from_f64(numeric(s).parse::<f64>().ok()?).map(Value::Number)
        }

        (FieldType::Boolean, Value::Bool(_)) => Some(value.clone()),
        (FieldType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(Value::Bool(true)),
            "false" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldType::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => None,
        },

        (FieldType::List(item), Value::Array(items)) => items
            .iter()
            .map(|v| coerce(v, item))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),

        _ => None,
    }
}

fn as_integer(f: f64, exact: Option<i64>) -> Option<Value> {
    if let Some(i) = exact {
        return Some(Value::from(i));
    }
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

/// Numeric strings may carry thousands separators ("1,234"). Commas
/// anywhere else ("3,49") are left in so the parse fails.
fn numeric(s: &str) -> String {
    let s = s.trim();
    if THOUSANDS_RE.is_match(s) {
        s.replace(',', "")
    } else {
        s.to_string()
    }
}

fn type_label(ty: &FieldType) -> &'static str {
    match ty {
        FieldType::String => "a string",
        FieldType::Integer => "an integer",
        FieldType::Number => "a number",
        FieldType::Boolean => "a boolean",
        FieldType::List(_) => "a list",
    }
}

fn unfence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

// ── Tests ──
