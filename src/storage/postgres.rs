//! PostgreSQL backend.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, instrument, warn};

use super::{BackendKind, Operation, Storage, Transaction, UnitOfWork};
use crate::error::{StorageError, StorageResult};
use crate::model::{Metric, MetricFilter, MetricId, MetricKind, MetricMap};
use crate::retry::RetryPolicy;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS metrics (\
    id VARCHAR(255) NOT NULL, \
    type VARCHAR(255) NOT NULL, \
    delta BIGINT, \
    value DOUBLE PRECISION, \
    PRIMARY KEY (id, type))";

const UPSERT: &str = "INSERT INTO metrics (id, type, delta, value) VALUES ($1, $2, $3, $4) \
    ON CONFLICT (id, type) DO UPDATE SET delta = EXCLUDED.delta, value = EXCLUDED.value";

const SELECT: &str = "SELECT id, type, delta, value FROM metrics";

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// QUERY HELPERS
// ============================================================================

/// Build the lookup statement and its bind list. Each filter id contributes
/// one `(id = $n AND type = $n+1)` disjunct; ids are sorted so the statement
/// text is stable.
pub(crate) fn build_find_query(filter: &MetricFilter, for_update: bool) -> (String, Vec<(String, &'static str)>) {
    let mut sql = String::from(SELECT);
    let mut binds = Vec::with_capacity(filter.len());

    if !filter.is_all() {
        let mut ids: Vec<&MetricId> = filter.ids().collect();
        ids.sort();

        let clauses: Vec<String> = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("(id = ${} AND type = ${})", 2 * i + 1, 2 * i + 2))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" OR "));
        binds.extend(ids.into_iter().map(|id| (id.name.to_string(), id.kind.as_str())));
    }
    if for_update {
        sql.push_str(" FOR UPDATE");
    }
    (sql, binds)
}

async fn find_rows(conn: &mut PgConnection, filter: &MetricFilter, for_update: bool) -> StorageResult<MetricMap> {
    let (sql, binds) = build_find_query(filter, for_update);
    let mut query = sqlx::query(&sql);
    for (name, kind) in &binds {
        query = query.bind(name.as_str()).bind(*kind);
    }

    let rows = query.fetch_all(&mut *conn).await?;
    let mut metrics = MetricMap::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("id")?;
        let kind: String = row.try_get("type")?;
        let kind: MetricKind = kind
            .parse()
            .map_err(|_| StorageError::Corrupt { message: format!("unknown type '{kind}' for '{name}'") })?;
        let metric = Metric {
            id: MetricId::new(name, kind),
            delta: row.try_get("delta")?,
            value: row.try_get("value")?,
        };
        metrics.insert(metric.id.clone(), metric);
    }
    Ok(metrics)
}

async fn save_rows(conn: &mut PgConnection, metrics: &[Metric]) -> StorageResult<()> {
    for metric in metrics {
        sqlx::query(UPSERT)
            .bind(metric.name())
            .bind(metric.kind().as_str())
            .bind(metric.delta)
            .bind(metric.value)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

// ============================================================================
// POSTGRES STORAGE
// ============================================================================

#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect and make sure the metrics table exists.
    #[instrument(skip_all, target = "relay::storage")]
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(dsn)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        debug!(target: "relay::storage", "Metrics table ready");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn save(&self, metrics: &[Metric]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        save_rows(&mut *tx, metrics).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, filter: &MetricFilter) -> StorageResult<MetricMap> {
        let mut conn = self.pool.acquire().await?;
        find_rows(&mut *conn, filter, false).await
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }
}

// ============================================================================
// TRANSACTIONAL UNIT OF WORK
// ============================================================================

/// Transaction handle; reads lock the selected rows until commit.
struct PgTransaction<'c> {
    conn: &'c mut PgConnection,
}

#[async_trait]
impl Transaction for PgTransaction<'_> {
    async fn find(&mut self, filter: &MetricFilter) -> StorageResult<MetricMap> {
        find_rows(&mut *self.conn, filter, true).await
    }

    async fn save(&mut self, metrics: &[Metric]) -> StorageResult<()> {
        save_rows(&mut *self.conn, metrics).await
    }
}

/// BEGIN, run the operation, COMMIT; roll back on any error. The whole
/// sequence is retried when the failure is a transient connection problem.
#[derive(Debug, Clone)]
pub struct PgUnitOfWork {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgUnitOfWork {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, retry: RetryPolicy::default() }
    }

    async fn run_once(&self, op: &dyn Operation) -> StorageResult<Vec<Metric>> {
        let mut tx = self.pool.begin().await?;
        let result = {
            let mut handle = PgTransaction { conn: &mut *tx };
            op.apply(&mut handle).await
        };

        match result {
            Ok(metrics) => {
                tx.commit().await?;
                Ok(metrics)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(target: "relay::storage", error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn execute(&self, _keys: &[MetricId], op: &dyn Operation) -> StorageResult<Vec<Metric>> {
        self.retry
            .run("pg_unit_of_work", move |_| async move { self.run_once(op).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_find_all_has_no_where_clause() {
        let (sql, binds) = build_find_query(&MetricFilter::all(), false);
        assert_eq!(sql, "SELECT id, type, delta, value FROM metrics");
        assert!(binds.is_empty());
    }

    #[test]
    fn test_find_query_ors_id_pairs() {
        let filter: MetricFilter = [MetricId::gauge("b"), MetricId::counter("a")].into_iter().collect();
        let (sql, binds) = build_find_query(&filter, true);
        assert_eq!(
            sql,
            "SELECT id, type, delta, value FROM metrics \
             WHERE (id = $1 AND type = $2) OR (id = $3 AND type = $4) FOR UPDATE"
        );
        assert_eq!(binds, vec![("a".to_string(), "counter"), ("b".to_string(), "gauge")]);
    }
}
