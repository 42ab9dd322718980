use crate::config::RunConfig;
use crate::errors::AppError;
use crate::models::{RunRecord, RunStatus};
use crate::store::{ArtifactKey, ArtifactStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use uuid::Uuid;

pub type Db = Pool<Sqlite>;

pub async fn connect(db_url: &str) -> Result<Db, AppError> {
    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(db)
}

/// Single-connection in-memory database; the schema lives as long as the pool.
pub async fn connect_in_memory() -> Result<Db, AppError> {
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    Ok(db)
}

pub async fn init_schema(db: &Db) -> Result<(), AppError> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  num_customers INTEGER NOT NULL,
  customer_batch INTEGER NOT NULL,
  num_intervals INTEGER NOT NULL,
  interval_batch INTEGER NOT NULL,
  period_start INTEGER NOT NULL,
  seed INTEGER NOT NULL,
  status TEXT NOT NULL,
  tree_root_hex TEXT,
  total_emissions TEXT,
  error TEXT
);

CREATE TABLE IF NOT EXISTS artifacts (
  run_id TEXT NOT NULL,
  stage TEXT NOT NULL,
  level INTEGER NOT NULL,
  idx INTEGER NOT NULL,
  body BLOB NOT NULL,
  written_at TEXT NOT NULL,
  PRIMARY KEY(run_id, stage, level, idx)
);
"#,
    )
    .execute(db)
    .await?;

    Ok(())
}

pub async fn insert_run(db: &Db, run_id: Uuid, config: &RunConfig) -> Result<(), AppError> {
    let created_at = Utc::now().to_rfc3339();

    sqlx::query(
        r#"INSERT INTO runs
           (id, created_at, num_customers, customer_batch, num_intervals, interval_batch, period_start, seed, status)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(run_id.to_string())
    .bind(created_at)
    .bind(config.customers as i64)
    .bind(config.customer_batch as i64)
    .bind(config.intervals as i64)
    .bind(config.interval_batch as i64)
    .bind(config.period_start as i64)
    .bind(config.seed as i64)
    .bind(RunStatus::Generating.as_str())
    .execute(db)
    .await?;

    Ok(())
}

pub async fn set_run_ready(
    db: &Db,
    run_id: Uuid,
    tree_root_hex: &str,
    total_emissions: u128,
) -> Result<(), AppError> {
    sqlx::query(
        r#"UPDATE runs SET status = ?, tree_root_hex = ?, total_emissions = ?, error = NULL WHERE id = ?"#,
    )
    .bind(RunStatus::Ready.as_str())
    .bind(tree_root_hex)
    .bind(total_emissions.to_string())
    .bind(run_id.to_string())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_run_failed(db: &Db, run_id: Uuid, error: &str) -> Result<(), AppError> {
    sqlx::query(r#"UPDATE runs SET status = ?, error = ? WHERE id = ?"#)
        .bind(RunStatus::Failed.as_str())
        .bind(error)
        .bind(run_id.to_string())
        .execute(db)
        .await?;
    Ok(())
}

pub async fn get_run(db: &Db, run_id: Uuid) -> Result<Option<RunRecord>, AppError> {
    let row = sqlx::query(
        r#"SELECT created_at, num_customers, customer_batch, num_intervals, interval_batch,
                  period_start, seed, status, tree_root_hex, total_emissions, error
           FROM runs WHERE id = ?"#,
    )
    .bind(run_id.to_string())
    .fetch_optional(db)
    .await?;

    let Some(row) = row else { return Ok(None); };

    let created_at: String = row.get(0);
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| AppError::Config(format!("bad created_at for run {run_id}: {e}")))?
        .with_timezone(&Utc);

    let status: String = row.get(7);
    let total_emissions: Option<String> = row.get(9);
    let total_emissions = total_emissions
        .map(|t| t.parse::<u128>())
        .transpose()
        .map_err(|e| AppError::Config(format!("bad total_emissions for run {run_id}: {e}")))?;

    let config = RunConfig {
        customers: row.get::<i64, _>(1) as usize,
        customer_batch: row.get::<i64, _>(2) as usize,
        intervals: row.get::<i64, _>(3) as usize,
        interval_batch: row.get::<i64, _>(4) as usize,
        period_start: row.get::<i64, _>(5) as u64,
        seed: row.get::<i64, _>(6) as u64,
        claims: 0,
        parallelism: 1,
    };

    Ok(Some(RunRecord {
        run_id,
        created_at,
        config,
        status: RunStatus::parse(&status),
        tree_root_hex: row.get(8),
        total_emissions,
        error: row.get(10),
    }))
}

/// Artifact store backed by the `artifacts` table, scoped to one run.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    db: Db,
    run_id: Uuid,
}

impl SqliteStore {
    pub fn new(db: Db, run_id: Uuid) -> Self {
        Self { db, run_id }
    }
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn put(&self, key: &ArtifactKey, bytes: Vec<u8>) -> Result<(), AppError> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO artifacts (run_id, stage, level, idx, body, written_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(self.run_id.to_string())
        .bind(key.stage.as_str())
        .bind(key.level as i64)
        .bind(key.index as i64)
        .bind(bytes)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>, AppError> {
        let row = sqlx::query(
            r#"SELECT body FROM artifacts WHERE run_id = ? AND stage = ? AND level = ? AND idx = ?"#,
        )
        .bind(self.run_id.to_string())
        .bind(key.stage.as_str())
        .bind(key.level as i64)
        .bind(key.index as i64)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }
}
