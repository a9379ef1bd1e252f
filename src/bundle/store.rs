//! SQLite persistence for bundle rows.
//!
//! Schema is applied inline via `include_str!` on open. Timestamps are
//! RFC 3339 strings; capabilities and requirements are JSON text. A partial
//! unique index on `status = 'loaded'` backs the single-loaded invariant at
//! the storage layer as well.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{Bundle, BundleError};
use crate::types::BundleStatus;

const BUNDLE_COLUMNS: &str = "id, name, version, model_type, model_size, artifact_path, \
     manifest_path, artifact_digest, manifest_digest, signer, capabilities, requirements, \
     status, discovered_at, last_validated, last_loaded, load_count, quarantine_reason, \
     quarantined_at";

/// Result of an atomic load promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// Target is now loaded; `demoted` names the bundle that was loaded before.
    Promoted {
        /// Previously loaded bundle, now validated again.
        demoted: Option<String>,
    },
    /// Target was not in `validated` status when the transaction ran.
    NotValidated,
}

/// Bundle table accessor.
///
/// Writes go through one in-process gate so that read-then-write
/// transactions never race another writer into `SQLITE_BUSY`.
#[derive(Debug, Clone)]
pub struct BundleStore {
    pool: SqlitePool,
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl BundleStore {
    /// Open (or create) the state database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create state db directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open state db at {}", path.display()))?;

        let migration_sql = include_str!("../../migrations/001_sovereign_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply sovereign schema migration")?;

        Ok(Self {
            pool,
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Insert a newly discovered bundle. Returns `false` if the id already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn insert_if_absent(&self, bundle: &Bundle) -> Result<bool, BundleError> {
        let _write = self.write_gate.lock().await;
        let capabilities = serde_json::to_string(&bundle.capabilities)
            .map_err(|e| BundleError::Storage(format!("encode capabilities: {e}")))?;
        let requirements = serde_json::to_string(&bundle.requirements)
            .map_err(|e| BundleError::Storage(format!("encode requirements: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO bundles (id, name, version, model_type, model_size, artifact_path,
                manifest_path, artifact_digest, manifest_digest, signer, capabilities,
                requirements, status, discovered_at, last_validated, last_loaded, load_count,
                quarantine_reason, quarantined_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&bundle.id)
        .bind(&bundle.name)
        .bind(&bundle.version)
        .bind(&bundle.model_type)
        .bind(&bundle.model_size)
        .bind(bundle.artifact_path.to_string_lossy().into_owned())
        .bind(bundle.manifest_path.to_string_lossy().into_owned())
        .bind(&bundle.artifact_digest)
        .bind(&bundle.manifest_digest)
        .bind(&bundle.signer)
        .bind(capabilities)
        .bind(requirements)
        .bind(bundle.status.as_str())
        .bind(bundle.discovered_at.to_rfc3339())
        .bind(bundle.last_validated.map(|t| t.to_rfc3339()))
        .bind(bundle.last_loaded.map(|t| t.to_rfc3339()))
        .bind(i64::try_from(bundle.load_count).unwrap_or(i64::MAX))
        .bind(&bundle.quarantine_reason)
        .bind(bundle.quarantined_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch one bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the row is malformed.
    pub async fn get(&self, id: &str) -> Result<Option<Bundle>, BundleError> {
        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bundle_from_row).transpose()
    }

    /// List bundles, optionally filtered by status, oldest discovery first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a row is malformed.
    pub async fn list(&self, status: Option<BundleStatus>) -> Result<Vec<Bundle>, BundleError> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {BUNDLE_COLUMNS} FROM bundles WHERE status = ?1
                     ORDER BY discovered_at ASC, id ASC"
                );
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {BUNDLE_COLUMNS} FROM bundles ORDER BY discovered_at ASC, id ASC"
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(bundle_from_row).collect()
    }

    /// All known bundle ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn ids(&self) -> Result<HashSet<String>, BundleError> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM bundles")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// The bundle currently holding `loaded`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the row is malformed.
    pub async fn loaded(&self) -> Result<Option<Bundle>, BundleError> {
        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE status = 'loaded'");
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(bundle_from_row).transpose()
    }

    /// Row counts per status. Every status is present, zero if unused.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn count_by_status(&self) -> Result<BTreeMap<BundleStatus, u64>, BundleError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM bundles GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts: BTreeMap<BundleStatus, u64> =
            BundleStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for (status, count) in rows {
            let status: BundleStatus = status
                .parse()
                .map_err(|e| BundleError::Storage(format!("corrupt status column: {e}")))?;
            counts.insert(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    /// Persist lifecycle columns (status, timestamps, quarantine metadata).
    ///
    /// Never used to set `loaded`; promotion goes through [`Self::promote`].
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the bundle row is gone.
    pub async fn update_lifecycle(&self, bundle: &Bundle) -> Result<(), BundleError> {
        let _write = self.write_gate.lock().await;
        let result = sqlx::query(
            "UPDATE bundles
             SET status = ?2, last_validated = ?3, quarantine_reason = ?4, quarantined_at = ?5
             WHERE id = ?1",
        )
        .bind(&bundle.id)
        .bind(bundle.status.as_str())
        .bind(bundle.last_validated.map(|t| t.to_rfc3339()))
        .bind(&bundle.quarantine_reason)
        .bind(bundle.quarantined_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BundleError::NotFound(bundle.id.clone()));
        }
        Ok(())
    }

    /// Persist lifecycle columns only while the row still has status
    /// `expected`. Returns `false` when the status moved in between.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn update_lifecycle_from(
        &self,
        bundle: &Bundle,
        expected: BundleStatus,
    ) -> Result<bool, BundleError> {
        let _write = self.write_gate.lock().await;
        let result = sqlx::query(
            "UPDATE bundles
             SET status = ?2, last_validated = ?3, quarantine_reason = ?4, quarantined_at = ?5
             WHERE id = ?1 AND status = ?6",
        )
        .bind(&bundle.id)
        .bind(bundle.status.as_str())
        .bind(bundle.last_validated.map(|t| t.to_rfc3339()))
        .bind(&bundle.quarantine_reason)
        .bind(bundle.quarantined_at.map(|t| t.to_rfc3339()))
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Demote any other loaded bundle and promote `id`, in one transaction.
    ///
    /// The promotion only applies while `id` is still `validated`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is applied then.
    pub async fn promote(&self, id: &str, at: DateTime<Utc>) -> Result<Promotion, BundleError> {
        let _write = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;

        let target: Option<(String,)> = sqlx::query_as("SELECT status FROM bundles WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        match target {
            Some((status,)) if status == BundleStatus::Validated.as_str() => {}
            Some(_) => {
                tx.rollback().await?;
                return Ok(Promotion::NotValidated);
            }
            None => {
                tx.rollback().await?;
                return Err(BundleError::NotFound(id.to_owned()));
            }
        }

        let demoted: Option<(String,)> =
            sqlx::query_as("SELECT id FROM bundles WHERE status = 'loaded' AND id != ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query("UPDATE bundles SET status = 'validated' WHERE status = 'loaded' AND id != ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE bundles
             SET status = 'loaded', last_loaded = ?2, load_count = load_count + 1
             WHERE id = ?1 AND status = 'validated'",
        )
        .bind(id)
        .bind(at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Promotion::Promoted {
            demoted: demoted.map(|(id,)| id),
        })
    }

    /// Demote `id` from `loaded` to `validated`. Returns whether a row changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn demote(&self, id: &str) -> Result<bool, BundleError> {
        let _write = self.write_gate.lock().await;
        let result = sqlx::query(
            "UPDATE bundles SET status = 'validated' WHERE id = ?1 AND status = 'loaded'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Put back a previous loaded assignment after a rolled-back transition.
    ///
    /// Demotes `current` (if loaded) and re-marks `previous` (if validated) as
    /// loaded, without touching load counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn reinstate(
        &self,
        previous: Option<&str>,
        current: Option<&str>,
    ) -> Result<(), BundleError> {
        let _write = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        if let Some(current) = current {
            sqlx::query(
                "UPDATE bundles SET status = 'validated' WHERE id = ?1 AND status = 'loaded'",
            )
            .bind(current)
            .execute(&mut *tx)
            .await?;
        }
        if let Some(previous) = previous {
            sqlx::query(
                "UPDATE bundles SET status = 'loaded' WHERE id = ?1 AND status = 'validated'",
            )
            .bind(previous)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn bundle_from_row(row: &SqliteRow) -> Result<Bundle, BundleError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<BundleStatus>()
        .map_err(|e| BundleError::Storage(format!("corrupt status column: {e}")))?;
    let capabilities: String = row.try_get("capabilities")?;
    let requirements: String = row.try_get("requirements")?;
    let artifact_path: String = row.try_get("artifact_path")?;
    let manifest_path: String = row.try_get("manifest_path")?;
    let load_count: i64 = row.try_get("load_count")?;

    Ok(Bundle {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        model_type: row.try_get("model_type")?,
        model_size: row.try_get("model_size")?,
        artifact_path: PathBuf::from(artifact_path),
        manifest_path: PathBuf::from(manifest_path),
        artifact_digest: row.try_get("artifact_digest")?,
        manifest_digest: row.try_get("manifest_digest")?,
        signer: row.try_get("signer")?,
        capabilities: serde_json::from_str(&capabilities)
            .map_err(|e| BundleError::Storage(format!("corrupt capabilities column: {e}")))?,
        requirements: serde_json::from_str(&requirements)
            .map_err(|e| BundleError::Storage(format!("corrupt requirements column: {e}")))?,
        status,
        discovered_at: parse_timestamp(row.try_get("discovered_at")?)?,
        last_validated: parse_optional_timestamp(row.try_get("last_validated")?)?,
        last_loaded: parse_optional_timestamp(row.try_get("last_loaded")?)?,
        load_count: u64::try_from(load_count).unwrap_or(0),
        quarantine_reason: row.try_get("quarantine_reason")?,
        quarantined_at: parse_optional_timestamp(row.try_get("quarantined_at")?)?,
    })
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>, BundleError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BundleError::Storage(format!("corrupt timestamp {raw}: {e}")))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>, BundleError> {
    raw.map(parse_timestamp).transpose()
}
