//! Imported cast vote record files and scanner batches

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

/// Test or official designation of imported results. The first committed
/// file locks the election's mode; it unlocks only when all files are
/// cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileMode {
    Test,
    Official,
}

impl std::fmt::Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileMode::Test => write!(f, "test"),
            FileMode::Official => write!(f, "official"),
        }
    }
}

/// Metadata for one imported file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CvrFileRecord {
    pub id: String,
    pub filename: String,
    pub file_mode: FileMode,
    pub exported_at: DateTime<Utc>,
    pub cvr_count: u64,
    pub precinct_ids: Vec<String>,
    pub scanner_ids: Vec<String>,
}

/// A scanning batch declared by a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerBatch {
    pub id: String,
    pub label: String,
    pub scanner_id: String,
}

/// The election's current file mode: the mode of any imported file, or
/// `None` when no files have been imported (unlocked).
pub async fn get_current_file_mode(
    db: &SqlitePool,
    election_id: &str,
) -> Result<Option<FileMode>> {
    let row = sqlx::query("SELECT is_test_mode FROM cvr_files WHERE election_id = ? LIMIT 1")
        .bind(election_id)
        .fetch_optional(db)
        .await?;

    Ok(row.map(|row| {
        if row.get::<i64, _>("is_test_mode") != 0 {
            FileMode::Test
        } else {
            FileMode::Official
        }
    }))
}

/// Look up a previously imported file by content hash. Returns the file id
/// and its record count when the identical file was already imported.
pub async fn get_file_by_hash(
    db: &SqlitePool,
    election_id: &str,
    sha256_hash: &str,
) -> Result<Option<(String, u64)>> {
    let row = sqlx::query(
        "SELECT id, cvr_count FROM cvr_files WHERE election_id = ? AND sha256_hash = ?",
    )
    .bind(election_id)
    .bind(sha256_hash)
    .fetch_optional(db)
    .await?;

    Ok(row.map(|row| {
        (
            row.get::<String, _>("id"),
            row.get::<i64, _>("cvr_count") as u64,
        )
    }))
}

/// Insert the initial file row; counts and id sets are filled in by
/// [`update_file_record`] once the record stream has been walked.
#[allow(clippy::too_many_arguments)]
pub async fn add_file_record(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    election_id: &str,
    filename: &str,
    sha256_hash: &str,
    file_mode: FileMode,
    exported_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cvr_files
            (id, election_id, filename, sha256_hash, is_test_mode, exported_at)
        VALUES
            (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(election_id)
    .bind(filename)
    .bind(sha256_hash)
    .bind(file_mode == FileMode::Test)
    .bind(exported_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Record the counts and id sets observed while walking the record stream.
pub async fn update_file_record(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    cvr_count: u64,
    precinct_ids: &[String],
    scanner_ids: &[String],
) -> Result<()> {
    sqlx::query(
        "UPDATE cvr_files SET cvr_count = ?, precinct_ids = ?, scanner_ids = ? WHERE id = ?",
    )
    .bind(cvr_count as i64)
    .bind(serde_json::to_string(precinct_ids)?)
    .bind(serde_json::to_string(scanner_ids)?)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Upsert a scanner batch declared in report metadata. Batches may recur
/// across files from the same scanner.
pub async fn add_scanner_batch(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
    batch: &ScannerBatch,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO scanner_batches (id, election_id, label, scanner_id)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (election_id, id) DO NOTHING
        "#,
    )
    .bind(&batch.id)
    .bind(election_id)
    .bind(&batch.label)
    .bind(&batch.scanner_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Delete batches no longer referenced by any cast vote record.
pub async fn delete_empty_scanner_batches(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM scanner_batches
        WHERE election_id = ?
          AND NOT EXISTS (
            SELECT 1 FROM cvrs
            WHERE cvrs.election_id = scanner_batches.election_id
              AND cvrs.batch_id = scanner_batches.id
          )
        "#,
    )
    .bind(election_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// All imported files for the election, most recently exported first.
pub async fn list_files(db: &SqlitePool, election_id: &str) -> Result<Vec<CvrFileRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, filename, is_test_mode, exported_at, cvr_count, precinct_ids, scanner_ids
        FROM cvr_files
        WHERE election_id = ?
        ORDER BY exported_at DESC, filename ASC
        "#,
    )
    .bind(election_id)
    .fetch_all(db)
    .await?;

    let mut files = Vec::with_capacity(rows.len());
    for row in rows {
        let exported_at: String = row.get("exported_at");
        files.push(CvrFileRecord {
            id: row.get("id"),
            filename: row.get("filename"),
            file_mode: if row.get::<i64, _>("is_test_mode") != 0 {
                FileMode::Test
            } else {
                FileMode::Official
            },
            exported_at: DateTime::parse_from_rfc3339(&exported_at)
                .map_err(|e| {
                    crate::error::Error::Common(tally_common::Error::InvalidInput(format!(
                        "stored exported_at timestamp: {e}"
                    )))
                })?
                .with_timezone(&Utc),
            cvr_count: row.get::<i64, _>("cvr_count") as u64,
            precinct_ids: serde_json::from_str(&row.get::<String, _>("precinct_ids"))?,
            scanner_ids: serde_json::from_str(&row.get::<String, _>("scanner_ids"))?,
        });
    }
    Ok(files)
}
