//! PostgreSQL-backed collections: one table per collection, JSONB bodies.

use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;

use crate::store::{
    Collection, Condition, Document, Filter, Keyed, SortOrder, SortSpec, StoreError, Stored,
    UpsertSummary,
};

pub const TRIALS_TABLE: &str = "trials";
pub const CRAWL_INDEX_TABLE: &str = "crawl_index";

pub async fn connect_pool(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgCollection<D> {
    pool: PgPool,
    table: &'static str,
    _doc: PhantomData<fn() -> D>,
}

impl<D: Document> PgCollection<D> {
    /// `table` must be one of the tables created by the bundled migrations.
    pub fn new(pool: PgPool, table: &'static str) -> Self {
        Self {
            pool,
            table,
            _doc: PhantomData,
        }
    }

    fn select_prefix(&self) -> String {
        format!("SELECT doc, created_at, updated_at FROM {} WHERE TRUE", self.table)
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
        for condition in filter.conditions() {
            match condition {
                Condition::Equals { field, value } => {
                    builder.push(" AND doc->>");
                    builder.push_bind(field.clone());
                    builder.push(" = ");
                    builder.push_bind(value.clone());
                }
                Condition::ContainsIgnoreCase { field, needle } => {
                    builder.push(" AND doc->>");
                    builder.push_bind(field.clone());
                    builder.push(" ILIKE ");
                    builder.push_bind(format!("%{}%", escape_like(needle)));
                }
            }
        }
    }

    fn decode_row(row: &PgRow) -> Result<Stored<D>, StoreError> {
        let doc: JsonValue = row.try_get("doc")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
        Ok(Stored {
            doc: serde_json::from_value(doc)?,
            created_at,
            updated_at,
        })
    }
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl<D: Document> Collection<D> for PgCollection<D> {
    async fn upsert_many(&self, docs: &[D]) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();
        if docs.is_empty() {
            return Ok(summary);
        }

        let sql = format!(
            r#"
            INSERT INTO {table} (key, doc, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (key) DO UPDATE
               SET doc = EXCLUDED.doc,
                   updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
            table = self.table
        );

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            let body = serde_json::to_value(doc)?;
            let row = sqlx::query(&sql)
                .bind(doc.key())
                .bind(body)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
            if row.try_get::<bool, _>("inserted")? {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }
        tx.commit().await?;
        Ok(summary)
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Stored<D>>, StoreError> {
        let sql = format!("{} AND key = $1", self.select_prefix());
        let row = sqlx::query(&sql).bind(key).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn find_by_filter(
        &self,
        filter: &Filter,
        sort: Option<&SortSpec>,
        limit: usize,
    ) -> Result<Vec<Stored<D>>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(self.select_prefix());
        Self::push_filter(&mut builder, filter);
        if let Some(sort) = sort {
            builder.push(" ORDER BY doc->>");
            builder.push_bind(sort.field.clone());
            builder.push(match sort.order {
                SortOrder::Ascending => " ASC NULLS LAST",
                SortOrder::Descending => " DESC NULLS LAST",
            });
        }
        builder.push(" LIMIT ");
        builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::decode_row).collect()
    }

    async fn get_all(&self, filter: &Filter) -> Result<HashMap<String, Stored<D>>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(self.select_prefix());
        Self::push_filter(&mut builder, filter);
        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let stored = Self::decode_row(row)?;
            out.insert(stored.doc.key().to_string(), stored);
        }
        Ok(out)
    }
}
