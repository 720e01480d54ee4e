//! Durable, append-only step log.
//!
//! One row per substep transition in a single-file SQLite table:
//! `steps(uid, name, cfg, time, status, data)`. `cfg` carries the full
//! configuration snapshot, including the runtime sub-tree that restarted
//! runs merge back.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use chromoplex_common::{Error, Result};
use chromoplex_config::{Config, RuntimeState};

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub uid: String,
    pub name: String,
    pub cfg: serde_json::Value,
    pub time: i64,
    pub status: String,
    pub data: Option<serde_json::Value>,
}

impl StepRecord {
    /// The runtime sub-tree stored with this record, if parseable.
    pub fn runtime(&self) -> Option<RuntimeState> {
        let runtime = self.cfg.get("runtime")?;
        serde_json::from_value(runtime.clone()).ok()
    }
}

#[derive(Clone)]
pub struct StepLog {
    pool: SqlitePool,
}

impl StepLog {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::StepLog(format!("cannot open step db: {}", e)))?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS steps (
                uid TEXT, name TEXT, cfg TEXT, time INT, status TEXT, data TEXT
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| Error::StepLog(format!("cannot create steps table: {}", e)))?;
        Ok(Self { pool })
    }

    /// Append one substep transition. The log is append-only; rows are
    /// never updated or deleted.
    pub async fn record(
        &self,
        uid: &str,
        name: &str,
        cfg: &Config,
        status: &str,
        data: Option<&serde_json::Value>,
    ) -> Result<()> {
        let cfg_json = serde_json::to_string(cfg)?;
        let data_json = match data {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        sqlx::query("INSERT INTO steps (uid, name, cfg, time, status, data) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(uid)
            .bind(name)
            .bind(cfg_json)
            .bind(chrono::Utc::now().timestamp())
            .bind(status)
            .bind(data_json)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StepLog(format!("cannot record step transition: {}", e)))?;
        Ok(())
    }

    /// All records for one step uid, oldest first.
    pub async fn history(&self, uid: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query("SELECT uid, name, cfg, time, status, data FROM steps WHERE uid = ? ORDER BY time, rowid")
            .bind(uid)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StepLog(format!("cannot read step history: {}", e)))?;
        rows.into_iter().map(unpack).collect()
    }

    /// Every record in the log, oldest first.
    pub async fn full_history(&self) -> Result<Vec<StepRecord>> {
        let rows =
            sqlx::query("SELECT uid, name, cfg, time, status, data FROM steps ORDER BY time, rowid")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::StepLog(format!("cannot read step history: {}", e)))?;
        rows.into_iter().map(unpack).collect()
    }
}

fn unpack(row: sqlx::sqlite::SqliteRow) -> Result<StepRecord> {
    let cfg_text: String = row.get("cfg");
    let data_text: Option<String> = row.get("data");
    Ok(StepRecord {
        uid: row.get("uid"),
        name: row.get("name"),
        cfg: serde_json::from_str(&cfg_text)?,
        time: row.get("time"),
        status: row.get("status"),
        data: match data_text {
            Some(t) => Some(serde_json::from_str(&t)?),
            None => None,
        },
    })
}
