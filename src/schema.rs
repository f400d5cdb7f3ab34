use std::path::Path;

use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_DEFINITIONS: &str = "schema.toml";

#[derive(Debug, Error)]
pub enum DefinitionsError {
    #[error("Could not load {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("Schema class '{name}' not found in {file}")]
    SchemaNotFound { name: String, file: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    List(Box<FieldType>),
}

impl FieldType {
    /// Parse a type name as written in the definitions file.
    /// Lists only nest one level: `list[list[int]]` is rejected.
    pub fn parse(decl: &str) -> Option<FieldType> {
        let decl = decl.trim().to_ascii_lowercase();
        if let Some(inner) = decl.strip_prefix("list[").and_then(|s| s.strip_suffix(']')) {
            return match FieldType::parse(inner)? {
                FieldType::List(_) => None,
                scalar => Some(FieldType::List(Box::new(scalar))),
            };
        }
        match decl.as_str() {
            "str" | "string" => Some(FieldType::String),
            "int" | "integer" => Some(FieldType::Integer),
            "float" | "number" => Some(FieldType::Number),
            "bool" | "boolean" => Some(FieldType::Boolean),
            _ => None,
        }
    }

    fn json_type(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::List(_) => "array",
        }
    }

    fn json_schema(&self, nullable: bool) -> Value {
        let ty = if nullable {
            json!([self.json_type(), "null"])
        } else {
            json!(self.json_type())
        };
        match self {
            FieldType::List(item) => json!({ "type": ty, "items": item.json_schema(false) }),
            _ => json!({ "type": ty }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    pub required: bool,
    pub description: Option<String>,
}

/// A named output shape: the fields the model must populate, in declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDefinition {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl SchemaDefinition {
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Strict JSON Schema for structured output. Strict mode wants every
    /// property listed as required, so optional fields become nullable.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let mut prop = field.ty.json_schema(!field.required);
            if let (Some(desc), Some(obj)) = (&field.description, prop.as_object_mut()) {
                obj.insert("description".into(), Value::String(desc.clone()));
            }
            properties.insert(field.name.clone(), prop);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": self.field_names().collect::<Vec<_>>(),
            "additionalProperties": false,
        })
    }
}

/// Load the definitions file and return the schema called `name`.
/// The file is re-read on every call.
pub fn resolve(path: &Path, name: &str) -> Result<SchemaDefinition, DefinitionsError> {
    let schemas = load(path)?;
    schemas
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| DefinitionsError::SchemaNotFound {
            name: name.to_string(),
            file: file_label(path),
        })
}

/// Names of every schema in the definitions file, in declared order.
pub fn list_schemas(path: &Path) -> Result<Vec<String>, DefinitionsError> {
    Ok(load(path)?.into_iter().map(|s| s.name).collect())
}

fn load(path: &Path) -> Result<Vec<SchemaDefinition>, DefinitionsError> {
    let load_err = |reason: String| DefinitionsError::Load {
        path: path.display().to_string(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
    parse_definitions(&text).map_err(load_err)
}

fn parse_definitions(text: &str) -> Result<Vec<SchemaDefinition>, String> {
    let table: toml::Table = text.parse().map_err(|e: toml::de::Error| e.to_string())?;

    table
        .iter()
        .map(|(name, body)| {
            let fields = body
                .as_table()
                .ok_or_else(|| format!("schema '{}' must be a table of fields", name))?;
            if fields.is_empty() {
                return Err(format!("schema '{}' declares no fields", name));
            }
            let fields = fields
                .iter()
                .map(|(field, decl)| parse_field(name, field, decl))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SchemaDefinition {
                name: name.clone(),
                fields,
            })
        })
        .collect()
}

fn parse_field(schema: &str, field: &str, decl: &toml::Value) -> Result<FieldDef, String> {
    let (ty, required, description) = match decl {
        toml::Value::String(ty) => (ty.as_str(), true, None),
        toml::Value::Table(t) => {
            let ty = t
                .get("type")
                .and_then(toml::Value::as_str)
                .ok_or_else(|| format!("{}.{}: missing 'type'", schema, field))?;
            let required = match t.get("required") {
                None => true,
                Some(v) => v
                    .as_bool()
                    .ok_or_else(|| format!("{}.{}: 'required' must be a boolean", schema, field))?,
            };
            let description = t
                .get("description")
                .and_then(toml::Value::as_str)
                .map(str::to_string);
            (ty, required, description)
        }
        _ => {
            return Err(format!(
                "{}.{}: expected a type name or an inline table",
                schema, field
            ))
        }
    };

    let ty = FieldType::parse(ty)
        .ok_or_else(|| format!("{}.{}: unknown type '{}'", schema, field, ty))?;

    Ok(FieldDef {
        name: field.to_string(),
        ty,
        required,
        description,
    })
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ── Tests ──
