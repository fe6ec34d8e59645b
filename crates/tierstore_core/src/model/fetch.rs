//! Fetch request shape and in-memory evaluation.

use crate::model::predicate::{Predicate, PredicateError};
use crate::model::record::ManagedRecord;
use std::cmp::Ordering;

/// Sort key for fetch results. Nulls sort first in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }
}

/// Query options for fetching records of one entity.
///
/// Without sort descriptors, results come back in record-id order, which is
/// stable for one store but carries no meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sort: Vec<SortDescriptor>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            sort: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn sorted_by(mut self, descriptor: SortDescriptor) -> Self {
        self.sort.push(descriptor);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Filters, sorts and pages `candidates`, which must already be
    /// restricted to `self.entity`.
    pub fn apply(&self, candidates: Vec<ManagedRecord>) -> Result<Vec<ManagedRecord>, PredicateError> {
        let mut matched = match &self.predicate {
            Some(predicate) => {
                let compiled = predicate.compile()?;
                candidates
                    .into_iter()
                    .filter(|record| compiled.evaluate(record))
                    .collect::<Vec<_>>()
            }
            None => candidates,
        };

        if !self.sort.is_empty() {
            matched.sort_by(|left, right| self.order(left, right));
        }

        let paged = matched.into_iter().skip(self.offset);
        Ok(match self.limit {
            Some(limit) => paged.take(limit).collect(),
            None => paged.collect(),
        })
    }

    fn order(&self, left: &ManagedRecord, right: &ManagedRecord) -> Ordering {
        for descriptor in &self.sort {
            let ordering = left
                .get(&descriptor.key)
                .compare(right.get(&descriptor.key))
                .unwrap_or(Ordering::Equal);
            let ordering = if descriptor.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        left.id.cmp(&right.id)
    }
}
