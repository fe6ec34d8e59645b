//! Inferred record mapping between two versions of a model.
//!
//! # Responsibility
//! - Decide whether a stored model can be carried forward to the current one.
//! - Rewrite stored records to the current model.
//!
//! # Invariants
//! - Entities missing from the destination model are dropped.
//! - Attributes missing from the destination entity are dropped.
//! - Added attributes take their declared default, or `Null` when optional.
//! - A required added attribute without default cannot be inferred.
//! - A stored null stays null when the attribute is still optional.

use crate::config::StoreOptions;
use crate::db::StoreOpenError;
use crate::model::record::ManagedRecord;
use crate::model::schema::{EntityDescription, ModelSchema};
use crate::model::value::AttributeValue;
use std::collections::BTreeMap;

/// Outcome of comparing the stored model with the current one.
#[derive(Debug)]
pub enum Reconciliation<'m> {
    /// Store carries no model yet.
    Fresh,
    Unchanged,
    Migrate(MappingModel<'m>),
}

/// Compares models and applies the migration policy from `options`.
pub fn reconcile<'m>(
    stored: Option<&'m ModelSchema>,
    current: &'m ModelSchema,
    options: &StoreOptions,
) -> Result<Reconciliation<'m>, StoreOpenError> {
    let Some(stored) = stored else {
        return Ok(Reconciliation::Fresh);
    };
    if stored == current {
        return Ok(Reconciliation::Unchanged);
    }
    if !options.auto_migrate {
        return Err(StoreOpenError::IncompatibleModel {
            stored_version: stored.version,
            current_version: current.version,
        });
    }
    if !options.infer_mapping {
        return Err(StoreOpenError::MappingUnavailable {
            stored_version: stored.version,
            current_version: current.version,
        });
    }
    infer_mapping(stored, current).map(Reconciliation::Migrate)
}

/// Record rewrite plan from `source` to `destination`.
#[derive(Debug)]
pub struct MappingModel<'m> {
    source: &'m ModelSchema,
    destination: &'m ModelSchema,
}

/// Builds a mapping, failing when some destination attribute has no source.
pub fn infer_mapping<'m>(
    source: &'m ModelSchema,
    destination: &'m ModelSchema,
) -> Result<MappingModel<'m>, StoreOpenError> {
    for entity in &destination.entities {
        let Some(source_entity) = source.entity(&entity.name) else {
            continue;
        };
        for attribute in &entity.attributes {
            if source_entity.attribute(&attribute.name).is_none()
                && !attribute.optional
                && attribute.default.is_none()
            {
                return Err(StoreOpenError::MappingInference {
                    entity: entity.name.clone(),
                    attribute: attribute.name.clone(),
                });
            }
        }
    }
    Ok(MappingModel {
        source,
        destination,
    })
}

impl MappingModel<'_> {
    pub fn source_version(&self) -> u32 {
        self.source.version
    }

    pub fn destination_version(&self) -> u32 {
        self.destination.version
    }

    /// Rewrites one stored record; `None` when its entity no longer exists.
    pub fn migrate(&self, record: ManagedRecord) -> Result<Option<ManagedRecord>, StoreOpenError> {
        let Some(entity) = self.destination.entity(&record.entity) else {
            return Ok(None);
        };
        let values = migrate_values(entity, record.values)?;
        Ok(Some(ManagedRecord {
            id: record.id,
            entity: record.entity,
            values,
        }))
    }
}

fn migrate_values(
    entity: &EntityDescription,
    mut values: BTreeMap<String, AttributeValue>,
) -> Result<BTreeMap<String, AttributeValue>, StoreOpenError> {
    let mut migrated = BTreeMap::new();
    for attribute in &entity.attributes {
        let carried = match values.remove(&attribute.name) {
            Some(value) if value.is_null() => attribute.optional.then_some(value),
            Some(value) => value.coerce_to(attribute.kind),
            None => None,
        };
        let value = match carried {
            Some(value) => value,
            None => {
                let fallback = attribute.default_value();
                if fallback.is_null() && !attribute.optional {
                    return Err(StoreOpenError::MappingInference {
                        entity: entity.name.clone(),
                        attribute: attribute.name.clone(),
                    });
                }
                fallback
            }
        };
        migrated.insert(attribute.name.clone(), value);
    }
    Ok(migrated)
}
