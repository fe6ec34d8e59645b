//! Schema (model) definitions and bundle resolution.
//!
//! # Responsibility
//! - Describe record types and their attributes.
//! - Resolve a schema by model name from inline registrations or from
//!   `<modelName>.schema.json` resources on disk.
//!
//! # Invariants
//! - Entity names are non-empty and unique within one model.
//! - Attribute names are unique within one entity.
//! - Attribute defaults always fit the declared attribute kind.

use crate::model::value::{AttributeKind, AttributeValue};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// File suffix used for schema resources inside a bundle directory.
pub const SCHEMA_FILE_SUFFIX: &str = "schema.json";

/// Declared shape of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeKind,
    #[serde(default = "default_optional")]
    pub optional: bool,
    /// JSON literal applied on insert; must fit `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

fn default_optional() -> bool {
    true
}

impl AttributeDescription {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Returns the typed default value, `Null` when none is declared.
    pub fn default_value(&self) -> AttributeValue {
        self.default
            .as_ref()
            .and_then(|value| AttributeValue::from_json(self.kind, value))
            .unwrap_or(AttributeValue::Null)
    }
}

/// Declared shape of one record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescription>,
}

impl EntityDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeDescription) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.iter().find(|attribute| attribute.name == name)
    }
}

/// A complete model: the set of entities a store enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub entities: Vec<EntityDescription>,
}

fn default_version() -> u32 {
    1
}

impl ModelSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            entities: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_entity(mut self, entity: EntityDescription) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.iter().find(|entity| entity.name == name)
    }

    /// Parses and validates a schema from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, SchemaResolutionError> {
        let schema: Self = serde_json::from_str(text).map_err(|err| {
            SchemaResolutionError::Malformed {
                message: err.to_string(),
            }
        })?;
        schema.validate()?;
        Ok(schema)
    }

    /// Serializes this schema to canonical JSON text.
    pub fn to_json_string(&self) -> String {
        // Serialization of plain data with string keys cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Validates declaration-level invariants.
    pub fn validate(&self) -> Result<(), SchemaResolutionError> {
        if self.name.trim().is_empty() {
            return Err(SchemaResolutionError::Invalid(
                "model name cannot be empty".to_string(),
            ));
        }

        let mut entity_names = BTreeSet::new();
        for entity in &self.entities {
            if entity.name.trim().is_empty() {
                return Err(SchemaResolutionError::Invalid(format!(
                    "model `{}` declares an entity with an empty name",
                    self.name
                )));
            }
            if !entity_names.insert(entity.name.as_str()) {
                return Err(SchemaResolutionError::Invalid(format!(
                    "duplicate entity `{}`",
                    entity.name
                )));
            }

            let mut attribute_names = BTreeSet::new();
            for attribute in &entity.attributes {
                if attribute.name.trim().is_empty() {
                    return Err(SchemaResolutionError::Invalid(format!(
                        "entity `{}` declares an attribute with an empty name",
                        entity.name
                    )));
                }
                if !attribute_names.insert(attribute.name.as_str()) {
                    return Err(SchemaResolutionError::Invalid(format!(
                        "duplicate attribute `{}.{}`",
                        entity.name, attribute.name
                    )));
                }
                if let Some(default) = &attribute.default {
                    if AttributeValue::from_json(attribute.kind, default).is_none() {
                        return Err(SchemaResolutionError::Invalid(format!(
                            "default for `{}.{}` does not fit type {}",
                            entity.name, attribute.name, attribute.kind
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Schema lookup failures raised while constructing a store manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaResolutionError {
    /// No inline model and no resource file for the requested name.
    ResourceMissing { model_name: String, path: Option<PathBuf> },
    /// Resource exists but could not be read.
    Unreadable { path: PathBuf, message: String },
    /// Resource is not valid schema JSON.
    Malformed { message: String },
    /// Schema parsed but violates declaration invariants.
    Invalid(String),
    /// Resource declares a different model name than requested.
    NameMismatch { requested: String, declared: String },
}

impl Display for SchemaResolutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceMissing {
                model_name,
                path: Some(path),
            } => write!(
                f,
                "schema resource for model `{model_name}` not found at `{}`",
                path.display()
            ),
            Self::ResourceMissing {
                model_name,
                path: None,
            } => write!(f, "schema resource for model `{model_name}` not found"),
            Self::Unreadable { path, message } => {
                write!(f, "failed to read schema `{}`: {message}", path.display())
            }
            Self::Malformed { message } => write!(f, "malformed schema: {message}"),
            Self::Invalid(message) => write!(f, "invalid schema: {message}"),
            Self::NameMismatch {
                requested,
                declared,
            } => write!(
                f,
                "schema declares model `{declared}` but `{requested}` was requested"
            ),
        }
    }
}

impl Error for SchemaResolutionError {}

/// Collection of schema resources resolvable by model name.
#[derive(Debug, Clone, Default)]
pub struct SchemaBundle {
    resource_dir: Option<PathBuf>,
    inline: BTreeMap<String, ModelSchema>,
}

impl SchemaBundle {
    /// Creates an empty bundle with no resource directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bundle that reads `<name>.schema.json` files from `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            resource_dir: Some(dir.as_ref().to_path_buf()),
            inline: BTreeMap::new(),
        }
    }

    /// Registers an in-process schema; it wins over resource files.
    pub fn with_model(mut self, schema: ModelSchema) -> Self {
        self.inline.insert(schema.name.clone(), schema);
        self
    }

    /// Returns the on-disk resource path for `model_name`, if a directory is set.
    pub fn resource_path(&self, model_name: &str) -> Option<PathBuf> {
        self.resource_dir
            .as_ref()
            .map(|dir| dir.join(format!("{model_name}.{SCHEMA_FILE_SUFFIX}")))
    }

    /// Resolves and validates the schema for `model_name`.
    pub fn resolve(&self, model_name: &str) -> Result<ModelSchema, SchemaResolutionError> {
        let result = self.resolve_inner(model_name);
        match &result {
            Ok(schema) => info!(
                "event=schema_resolve module=schema status=ok model={} version={} entities={}",
                schema.name,
                schema.version,
                schema.entities.len()
            ),
            Err(err) => error!(
                "event=schema_resolve module=schema status=error model={} error={}",
                model_name, err
            ),
        }
        result
    }

    fn resolve_inner(&self, model_name: &str) -> Result<ModelSchema, SchemaResolutionError> {
        if let Some(schema) = self.inline.get(model_name) {
            schema.validate()?;
            return Ok(schema.clone());
        }

        let Some(path) = self.resource_path(model_name) else {
            return Err(SchemaResolutionError::ResourceMissing {
                model_name: model_name.to_string(),
                path: None,
            });
        };
        if !path.is_file() {
            return Err(SchemaResolutionError::ResourceMissing {
                model_name: model_name.to_string(),
                path: Some(path),
            });
        }

        let text =
            std::fs::read_to_string(&path).map_err(|err| SchemaResolutionError::Unreadable {
                path: path.clone(),
                message: err.to_string(),
            })?;
        let schema = ModelSchema::from_json_str(&text)?;
        if schema.name != model_name {
            return Err(SchemaResolutionError::NameMismatch {
                requested: model_name.to_string(),
                declared: schema.name,
            });
        }
        Ok(schema)
    }
}
