use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;

use super::RecordSink;
use crate::error::PipelineError;
use crate::model::GtfsRecord;

/// Builds the process-wide pool. Called once at startup; the pool is then
/// cloned into every component that needs it.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, PipelineError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(PipelineError::Database)?;
    info!(max_connections, "Database pool ready");
    Ok(pool)
}

/// Applies the bundled schema migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordSink for PgSink {
    async fn write_batch<T: GtfsRecord>(&self, batch: &[T]) -> Result<u64, PipelineError> {
        let rows = dedupe_by_key(batch);
        if rows.is_empty() {
            return Ok(0);
        }
        let result = upsert_statement::<T>(&rows)
            .build()
            .execute(&self.pool)
            .await
            .map_err(|source| PipelineError::Persistence {
                table: T::TABLE,
                source,
            })?;
        Ok(result.rows_affected())
    }

    async fn existing_trip_ids(&self, trip_ids: &[String]) -> Result<HashSet<String>, PipelineError> {
        let found: Vec<String> =
            sqlx::query_scalar("SELECT trip_id FROM trips WHERE trip_id = ANY($1)")
                .bind(trip_ids)
                .fetch_all(&self.pool)
                .await
                .map_err(|source| PipelineError::Persistence {
                    table: "trips",
                    source,
                })?;
        Ok(found.into_iter().collect())
    }
}

/// `INSERT ... ON CONFLICT (key) DO UPDATE SET col = EXCLUDED.col` for
/// every non-key column of `T`.
pub fn upsert_statement<T: GtfsRecord>(rows: &[&T]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        T::TABLE,
        T::COLUMNS.join(", ")
    ));
    qb.push_values(rows.iter(), |mut row, record| record.bind_row(&mut row));

    let updates: Vec<String> = T::COLUMNS
        .iter()
        .filter(|column| !T::KEY_COLUMNS.contains(column))
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect();

    qb.push(format!(" ON CONFLICT ({}) DO ", T::KEY_COLUMNS.join(", ")));
    if updates.is_empty() {
        qb.push("NOTHING");
    } else {
        qb.push("UPDATE SET ");
        qb.push(updates.join(", "));
    }
    qb
}

/// Collapses rows sharing a natural key, keeping the last one in its first
/// position. Postgres rejects a statement that updates one row twice.
pub fn dedupe_by_key<T: GtfsRecord>(batch: &[T]) -> Vec<&T> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(batch.len());
    let mut out: Vec<&T> = Vec::with_capacity(batch.len());
    for record in batch {
        match index.entry(record.natural_key()) {
            Entry::Occupied(slot) => out[*slot.get()] = record,
            Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(record);
            }
        }
    }
    out
}
