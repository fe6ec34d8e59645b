//! Managed record model.
//!
//! # Responsibility
//! - Define the record shape shared by every staging area and store.
//! - Validate record values against their entity description.
//!
//! # Invariants
//! - `id` is stable for the record lifetime and never reused.
//! - A record belongs to exactly one entity.

use crate::model::schema::{EntityDescription, ModelSchema};
use crate::model::value::{AttributeKind, AttributeValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier for every managed record.
pub type RecordId = Uuid;

static NULL_VALUE: AttributeValue = AttributeValue::Null;

/// One entity instance.
///
/// Callers always hold detached copies; staging a copy back into a context
/// goes through `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedRecord {
    pub id: RecordId,
    pub entity: String,
    pub values: BTreeMap<String, AttributeValue>,
}

impl ManagedRecord {
    /// Creates an empty record of `entity` with a generated id.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity: entity.into(),
            values: BTreeMap::new(),
        }
    }

    /// Creates a record of `description` populated with attribute defaults.
    pub fn with_defaults(description: &EntityDescription) -> Self {
        let mut record = Self::new(description.name.clone());
        for attribute in &description.attributes {
            record
                .values
                .insert(attribute.name.clone(), attribute.default_value());
        }
        record
    }

    /// Returns the value for `key`; missing keys read as `Null`.
    pub fn get(&self, key: &str) -> &AttributeValue {
        self.values.get(key).unwrap_or(&NULL_VALUE)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).as_text()
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        self.get(key).as_integer()
    }

    /// Validates values against the record's entity in `schema`.
    pub fn validate(&self, schema: &ModelSchema) -> Result<(), RecordValidationError> {
        let Some(description) = schema.entity(&self.entity) else {
            return Err(RecordValidationError::UnknownEntity(self.entity.clone()));
        };

        for (key, value) in &self.values {
            let Some(attribute) = description.attribute(key) else {
                return Err(RecordValidationError::UnknownAttribute {
                    entity: self.entity.clone(),
                    attribute: key.clone(),
                });
            };
            if !value.fits(attribute.kind) {
                return Err(RecordValidationError::TypeMismatch {
                    entity: self.entity.clone(),
                    attribute: key.clone(),
                    expected: attribute.kind,
                });
            }
        }

        for attribute in &description.attributes {
            if !attribute.optional && self.get(&attribute.name).is_null() {
                return Err(RecordValidationError::MissingValue {
                    entity: self.entity.clone(),
                    attribute: attribute.name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Record-level validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    UnknownEntity(String),
    UnknownAttribute { entity: String, attribute: String },
    TypeMismatch {
        entity: String,
        attribute: String,
        expected: AttributeKind,
    },
    MissingValue { entity: String, attribute: String },
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity(entity) => write!(f, "unknown entity `{entity}`"),
            Self::UnknownAttribute { entity, attribute } => {
                write!(f, "unknown attribute `{entity}.{attribute}`")
            }
            Self::TypeMismatch {
                entity,
                attribute,
                expected,
            } => write!(f, "`{entity}.{attribute}` expects a {expected} value"),
            Self::MissingValue { entity, attribute } => {
                write!(f, "`{entity}.{attribute}` is required")
            }
        }
    }
}

impl Error for RecordValidationError {}
