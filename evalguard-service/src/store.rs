//! Document-store boundary.
//!
//! The pipeline needs three primitives from storage: an atomic insert, a
//! filtered scan, and a guarded find-and-update. [`MemoryStore`] backs the
//! CLI demo and the tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;

pub const EVALUATIONS: &str = "evaluations";
pub const ENROLLMENTS: &str = "enrollments";
pub const ACCOUNTS: &str = "accounts";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("documents must be JSON objects")]
    InvalidDocument,
    #[error("full-scan lookups are not allowed on `{collection}`")]
    ForbiddenScan { collection: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone, Debug, PartialEq)]
enum Condition {
    Eq(Value),
    Ne(Value),
}

/// Conjunction of per-field conditions. A missing field counts as `null`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), Condition::Eq(value.into())));
        self
    }

    pub fn ne(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), Condition::Ne(value.into())));
        self
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.conditions.iter().all(|(field, condition)| {
            let actual = document.get(field).unwrap_or(&Value::Null);
            match condition {
                Condition::Eq(expected) => actual == expected,
                Condition::Ne(excluded) => actual != excluded,
            }
        })
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_one(&self, collection: &str, document: Value) -> StoreResult<()>;

    async fn find(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Value>>;

    /// Applies `set` to the first document matching `filter` and returns the
    /// updated document, or `None` when nothing matched. Matching and
    /// updating are one atomic step.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        set: Map<String, Value>,
    ) -> StoreResult<Option<Value>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, Vec<Value>>,
    fail_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following insert fail, to exercise rollback paths.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(&self, collection: &str, document: Value) -> StoreResult<()> {
        if !document.is_object() {
            return Err(StoreError::InvalidDocument);
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("insert rejected".into()));
        }
        self.collections
            .entry(collection.to_owned())
            .or_default()
            .push(document);
        Ok(())
    }

    async fn find(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Value>> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| docs.iter().filter(|doc| filter.matches(doc)).cloned().collect())
            .unwrap_or_default())
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        set: Map<String, Value>,
    ) -> StoreResult<Option<Value>> {
        let Some(mut docs) = self.collections.get_mut(collection) else {
            return Ok(None);
        };
        let Some(doc) = docs.iter_mut().find(|doc| filter.matches(doc)) else {
            return Ok(None);
        };
        let fields = doc.as_object_mut().ok_or(StoreError::InvalidDocument)?;
        fields.extend(set);
        Ok(Some(doc.clone()))
    }
}
