//! Keyed document collections with idempotent bulk upserts.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ctsync_core::{CrawlStateEntry, TrialDocument};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("document (de)serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A document type addressed by one unique string field.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for TrialDocument {
    fn key(&self) -> &str {
        &self.record.nct_id
    }
}

impl Keyed for CrawlStateEntry {
    fn key(&self) -> &str {
        &self.nct_id
    }
}

pub trait Document: Keyed + Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Document for T where T: Keyed + Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A document plus the stamps the store manages for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<D> {
    #[serde(flatten)]
    pub doc: D,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Predicate over a top-level document field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Equals { field: String, value: String },
    ContainsIgnoreCase { field: String, needle: String },
}

/// Conjunction of field conditions; the empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push(Condition::Equals {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn contains_ignore_case(mut self, field: impl Into<String>, needle: impl Into<String>) -> Self {
        self.conditions.push(Condition::ContainsIgnoreCase {
            field: field.into(),
            needle: needle.into(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, doc: &JsonValue) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Equals { field, value } => {
                field_text(doc, field).is_some_and(|text| text == *value)
            }
            Condition::ContainsIgnoreCase { field, needle } => field_text(doc, field)
                .is_some_and(|text| text.to_lowercase().contains(&needle.to_lowercase())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Descending,
        }
    }
}

/// Text view of a top-level field, matching Postgres `doc->>'field'`.
fn field_text(doc: &JsonValue, field: &str) -> Option<String> {
    match doc.get(field)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Missing values sort last in either direction.
fn compare_for_sort(a: Option<&String>, b: Option<&String>, order: SortOrder) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match order {
            SortOrder::Ascending => a.cmp(b),
            SortOrder::Descending => b.cmp(a),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Generic persistence interface shared by the record store and the crawl index.
#[async_trait]
pub trait Collection<D: Document>: Send + Sync {
    /// Insert or replace every document by key in one operation. `created_at`
    /// is set on first insert only; `updated_at` on every write.
    async fn upsert_many(&self, docs: &[D]) -> Result<UpsertSummary, StoreError>;

    async fn find_by_key(&self, key: &str) -> Result<Option<Stored<D>>, StoreError>;

    async fn find_by_filter(
        &self,
        filter: &Filter,
        sort: Option<&SortSpec>,
        limit: usize,
    ) -> Result<Vec<Stored<D>>, StoreError>;

    async fn get_all(&self, filter: &Filter) -> Result<HashMap<String, Stored<D>>, StoreError>;
}

/// Process-local collection, used by tests and dry runs.
#[derive(Debug)]
pub struct MemoryCollection<D> {
    rows: Mutex<BTreeMap<String, Stored<D>>>,
}

impl<D> Default for MemoryCollection<D> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<D: Document> MemoryCollection<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl<D: Document> Collection<D> for MemoryCollection<D> {
    async fn upsert_many(&self, docs: &[D]) -> Result<UpsertSummary, StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let mut summary = UpsertSummary::default();
        for doc in docs {
            match rows.get_mut(doc.key()) {
                Some(existing) => {
                    existing.doc = doc.clone();
                    existing.updated_at = now;
                    summary.updated += 1;
                }
                None => {
                    rows.insert(
                        doc.key().to_string(),
                        Stored {
                            doc: doc.clone(),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Stored<D>>, StoreError> {
        Ok(self.rows.lock().await.get(key).cloned())
    }

    async fn find_by_filter(
        &self,
        filter: &Filter,
        sort: Option<&SortSpec>,
        limit: usize,
    ) -> Result<Vec<Stored<D>>, StoreError> {
        let rows = self.rows.lock().await;
        let mut matched = Vec::new();
        for stored in rows.values() {
            let value = serde_json::to_value(&stored.doc)?;
            if filter.matches(&value) {
                let sort_key = sort.and_then(|s| field_text(&value, &s.field));
                matched.push((sort_key, stored.clone()));
            }
        }
        if let Some(sort) = sort {
            matched.sort_by(|(a, _), (b, _)| compare_for_sort(a.as_ref(), b.as_ref(), sort.order));
        }
        Ok(matched.into_iter().take(limit).map(|(_, stored)| stored).collect())
    }

    async fn get_all(&self, filter: &Filter) -> Result<HashMap<String, Stored<D>>, StoreError> {
        let rows = self.rows.lock().await;
        let mut out = HashMap::with_capacity(rows.len());
        for (key, stored) in rows.iter() {
            if filter.matches(&serde_json::to_value(&stored.doc)?) {
                out.insert(key.clone(), stored.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctsync_core::Fingerprint;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        topic: String,
        stamp: Option<String>,
    }

    impl Keyed for Note {
        fn key(&self) -> &str {
            &self.id
        }
    }

    fn note(id: &str, topic: &str, stamp: Option<&str>) -> Note {
        Note {
            id: id.into(),
            topic: topic.into(),
            stamp: stamp.map(Into::into),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_preserves_created_at() {
        let store = MemoryCollection::<Note>::new();
        let first = store.upsert_many(&[note("a", "Breast Cancer", None)]).await.unwrap();
        assert_eq!(first, UpsertSummary { inserted: 1, updated: 0 });
        let created = store.find_by_key("a").await.unwrap().unwrap().created_at;

        let second = store.upsert_many(&[note("a", "Lung Cancer", None)]).await.unwrap();
        assert_eq!(second, UpsertSummary { inserted: 0, updated: 1 });

        let stored = store.find_by_key("a").await.unwrap().unwrap();
        assert_eq!(stored.doc.topic, "Lung Cancer");
        assert_eq!(stored.created_at, created);
        assert!(stored.updated_at >= created);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn filter_sort_and_limit() {
        let store = MemoryCollection::<Note>::new();
        store
            .upsert_many(&[
                note("a", "breast_cancer", Some("2024-01-01")),
                note("b", "breast_cancer", Some("2025-06-01")),
                note("c", "lung_cancer", Some("2025-01-01")),
                note("d", "breast_cancer", None),
            ])
            .await
            .unwrap();

        let filter = Filter::all().contains_ignore_case("topic", "BREAST");
        let sorted = store
            .find_by_filter(&filter, Some(&SortSpec::descending("stamp")), 10)
            .await
            .unwrap();
        let ids: Vec<_> = sorted.iter().map(|s| s.doc.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "d"]);

        let limited = store
            .find_by_filter(&filter, Some(&SortSpec::descending("stamp")), 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let exact = store
            .get_all(&Filter::all().eq("topic", "lung_cancer"))
            .await
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert!(exact.contains_key("c"));
    }

    #[tokio::test]
    async fn crawl_state_entries_key_by_nct_id() {
        let store = MemoryCollection::<CrawlStateEntry>::new();
        store
            .upsert_many(&[CrawlStateEntry {
                nct_id: "NCT01".into(),
                source_hash: Fingerprint::new("h1"),
                last_seen_at: Utc::now(),
            }])
            .await
            .unwrap();
        let all = store.get_all(&Filter::all()).await.unwrap();
        assert_eq!(all["NCT01"].doc.source_hash.as_str(), "h1");
        assert_eq!(all["NCT01"].doc.key(), "NCT01");
    }
}
