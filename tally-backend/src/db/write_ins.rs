//! Write-in mark storage and the write-in candidate table
//!
//! One row per write-in mark found at import time. Adjudication mutates the
//! row's resolution columns, never the CVR. The `sequence_id` autoincrement
//! column fixes the adjudication queue order for good: appending files never
//! reorders marks a reviewer has already walked past.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

/// The resolved state of an adjudicated write-in mark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "adjudication_type", rename_all = "kebab-case")]
pub enum WriteInAdjudicationKind {
    /// The mark is not a valid vote
    Invalid,
    /// The mark names a candidate already on the ballot
    OfficialCandidate { candidate_id: String },
    /// The mark names an ad-hoc write-in candidate
    WriteInCandidate { candidate_id: String },
}

/// One write-in mark instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteInRecord {
    pub id: String,
    pub cvr_id: String,
    pub contest_id: String,
    pub option_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    /// `None` while pending
    pub adjudication: Option<WriteInAdjudicationKind>,
}

impl WriteInRecord {
    pub fn is_pending(&self) -> bool {
        self.adjudication.is_none()
    }
}

/// An ad-hoc candidate created through adjudication or manual entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteInCandidateRecord {
    pub id: String,
    pub contest_id: String,
    pub name: String,
}

/// Total and pending counts per contest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjudicationQueueMetadata {
    pub contest_id: String,
    pub total: u64,
    pub pending: u64,
}

/// How a write-in mark contributes to tallies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteInResolution {
    Pending,
    Invalid,
    Official { candidate_id: String },
    Candidate { candidate_id: String, name: String },
}

/// One mark's resolution, keyed for per-CVR lookup during tabulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWriteIn {
    pub cvr_id: String,
    pub contest_id: String,
    pub option_id: String,
    pub resolution: WriteInResolution,
}

/// Insert a pending write-in mark discovered during import.
pub async fn add_write_in(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
    cvr_id: &str,
    contest_id: &str,
    option_id: &str,
    side: Option<&str>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO write_ins (id, election_id, cvr_id, contest_id, option_id, side)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(election_id)
    .bind(cvr_id)
    .bind(contest_id)
    .bind(option_id)
    .bind(side)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

fn row_to_write_in(row: &sqlx::sqlite::SqliteRow) -> WriteInRecord {
    let official_candidate_id: Option<String> = row.get("official_candidate_id");
    let write_in_candidate_id: Option<String> = row.get("write_in_candidate_id");
    let is_invalid: i64 = row.get("is_invalid");

    let adjudication = if let Some(candidate_id) = official_candidate_id {
        Some(WriteInAdjudicationKind::OfficialCandidate { candidate_id })
    } else if let Some(candidate_id) = write_in_candidate_id {
        Some(WriteInAdjudicationKind::WriteInCandidate { candidate_id })
    } else if is_invalid != 0 {
        Some(WriteInAdjudicationKind::Invalid)
    } else {
        None
    };

    WriteInRecord {
        id: row.get("id"),
        cvr_id: row.get("cvr_id"),
        contest_id: row.get("contest_id"),
        option_id: row.get("option_id"),
        side: row.get("side"),
        adjudication,
    }
}

const WRITE_IN_COLUMNS: &str =
    "id, cvr_id, contest_id, option_id, side, is_invalid, official_candidate_id, write_in_candidate_id";

/// Fetch one write-in record inside a transaction.
pub async fn get_write_in(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
    write_in_id: &str,
) -> Result<Option<WriteInRecord>> {
    let sql = format!("SELECT {WRITE_IN_COLUMNS} FROM write_ins WHERE election_id = ? AND id = ?");
    let row = sqlx::query(&sql)
        .bind(election_id)
        .bind(write_in_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.as_ref().map(row_to_write_in))
}

/// Fetch one write-in record outside a transaction.
pub async fn get_write_in_record(
    db: &SqlitePool,
    election_id: &str,
    write_in_id: &str,
) -> Result<Option<WriteInRecord>> {
    let sql = format!("SELECT {WRITE_IN_COLUMNS} FROM write_ins WHERE election_id = ? AND id = ?");
    let row = sqlx::query(&sql)
        .bind(election_id)
        .bind(write_in_id)
        .fetch_optional(db)
        .await?;
    Ok(row.as_ref().map(row_to_write_in))
}

pub async fn set_official_candidate(
    tx: &mut Transaction<'_, Sqlite>,
    write_in_id: &str,
    candidate_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE write_ins
        SET is_invalid = 0,
            official_candidate_id = ?,
            write_in_candidate_id = NULL,
            adjudicated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(candidate_id)
    .bind(write_in_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn set_write_in_candidate(
    tx: &mut Transaction<'_, Sqlite>,
    write_in_id: &str,
    candidate_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE write_ins
        SET is_invalid = 0,
            official_candidate_id = NULL,
            write_in_candidate_id = ?,
            adjudicated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(candidate_id)
    .bind(write_in_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn set_invalid(tx: &mut Transaction<'_, Sqlite>, write_in_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE write_ins
        SET is_invalid = 1,
            official_candidate_id = NULL,
            write_in_candidate_id = NULL,
            adjudicated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(write_in_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Ids of pending write-ins in adjudication queue order.
pub async fn pending_queue(
    db: &SqlitePool,
    election_id: &str,
    contest_id: Option<&str>,
) -> Result<Vec<String>> {
    let mut sql = String::from(
        r#"
        SELECT id FROM write_ins
        WHERE election_id = ?
          AND is_invalid = 0
          AND official_candidate_id IS NULL
          AND write_in_candidate_id IS NULL
        "#,
    );
    if contest_id.is_some() {
        sql.push_str(" AND contest_id = ?");
    }
    sql.push_str(" ORDER BY sequence_id");

    let mut query = sqlx::query(&sql).bind(election_id);
    if let Some(contest_id) = contest_id {
        query = query.bind(contest_id);
    }
    let rows = query.fetch_all(db).await?;
    Ok(rows.iter().map(|row| row.get("id")).collect())
}

/// First pending write-in in queue order, if any.
pub async fn first_pending(
    db: &SqlitePool,
    election_id: &str,
    contest_id: &str,
) -> Result<Option<String>> {
    let row = sqlx::query(
        r#"
        SELECT id FROM write_ins
        WHERE election_id = ?
          AND contest_id = ?
          AND is_invalid = 0
          AND official_candidate_id IS NULL
          AND write_in_candidate_id IS NULL
        ORDER BY sequence_id
        LIMIT 1
        "#,
    )
    .bind(election_id)
    .bind(contest_id)
    .fetch_optional(db)
    .await?;
    Ok(row.map(|row| row.get("id")))
}

/// Total and pending counts, grouped by contest.
pub async fn queue_metadata(
    db: &SqlitePool,
    election_id: &str,
    contest_id: Option<&str>,
) -> Result<Vec<AdjudicationQueueMetadata>> {
    let mut sql = String::from(
        r#"
        SELECT contest_id,
               COUNT(id) AS total,
               SUM(
                   is_invalid = 0
                   AND official_candidate_id IS NULL
                   AND write_in_candidate_id IS NULL
               ) AS pending
        FROM write_ins
        WHERE election_id = ?
        "#,
    );
    if contest_id.is_some() {
        sql.push_str(" AND contest_id = ?");
    }
    sql.push_str(" GROUP BY contest_id ORDER BY contest_id");

    let mut query = sqlx::query(&sql).bind(election_id);
    if let Some(contest_id) = contest_id {
        query = query.bind(contest_id);
    }
    let rows = query.fetch_all(db).await?;
    Ok(rows
        .iter()
        .map(|row| AdjudicationQueueMetadata {
            contest_id: row.get("contest_id"),
            total: row.get::<i64, _>("total") as u64,
            pending: row.get::<i64, _>("pending") as u64,
        })
        .collect())
}

/// Every mark's tally contribution, joined with candidate names, for the
/// aggregation engine.
pub async fn resolutions_for_tabulation(
    db: &SqlitePool,
    election_id: &str,
) -> Result<Vec<ResolvedWriteIn>> {
    let rows = sqlx::query(
        r#"
        SELECT write_ins.cvr_id AS cvr_id,
               write_ins.contest_id AS contest_id,
               write_ins.option_id AS option_id,
               write_ins.is_invalid AS is_invalid,
               write_ins.official_candidate_id AS official_candidate_id,
               write_ins.write_in_candidate_id AS write_in_candidate_id,
               write_in_candidates.name AS write_in_candidate_name
        FROM write_ins
        LEFT JOIN write_in_candidates
            ON write_in_candidates.id = write_ins.write_in_candidate_id
        WHERE write_ins.election_id = ?
        "#,
    )
    .bind(election_id)
    .fetch_all(db)
    .await?;

    rows.iter()
        .map(|row| {
            let resolution = if let Some(candidate_id) =
                row.get::<Option<String>, _>("official_candidate_id")
            {
                WriteInResolution::Official { candidate_id }
            } else if let Some(candidate_id) =
                row.get::<Option<String>, _>("write_in_candidate_id")
            {
                let name: Option<String> = row.get("write_in_candidate_name");
                WriteInResolution::Candidate {
                    candidate_id,
                    name: name.ok_or_else(|| {
                        crate::error::Error::Common(tally_common::Error::NotFound(
                            "write-in candidate row for adjudicated mark".to_string(),
                        ))
                    })?,
                }
            } else if row.get::<i64, _>("is_invalid") != 0 {
                WriteInResolution::Invalid
            } else {
                WriteInResolution::Pending
            };
            Ok(ResolvedWriteIn {
                cvr_id: row.get("cvr_id"),
                contest_id: row.get("contest_id"),
                option_id: row.get("option_id"),
                resolution,
            })
        })
        .collect()
}

/// Write-in candidates for the election, optionally restricted to a contest.
pub async fn list_candidates(
    db: &SqlitePool,
    election_id: &str,
    contest_id: Option<&str>,
) -> Result<Vec<WriteInCandidateRecord>> {
    let mut sql =
        String::from("SELECT id, contest_id, name FROM write_in_candidates WHERE election_id = ?");
    if contest_id.is_some() {
        sql.push_str(" AND contest_id = ?");
    }
    sql.push_str(" ORDER BY contest_id, name");

    let mut query = sqlx::query(&sql).bind(election_id);
    if let Some(contest_id) = contest_id {
        query = query.bind(contest_id);
    }
    let rows = query.fetch_all(db).await?;
    Ok(rows
        .iter()
        .map(|row| WriteInCandidateRecord {
            id: row.get("id"),
            contest_id: row.get("contest_id"),
            name: row.get("name"),
        })
        .collect())
}

/// Fetch a write-in candidate by id inside a transaction.
pub async fn get_candidate(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
    candidate_id: &str,
) -> Result<Option<WriteInCandidateRecord>> {
    let row = sqlx::query(
        "SELECT id, contest_id, name FROM write_in_candidates WHERE election_id = ? AND id = ?",
    )
    .bind(election_id)
    .bind(candidate_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|row| WriteInCandidateRecord {
        id: row.get("id"),
        contest_id: row.get("contest_id"),
        name: row.get("name"),
    }))
}

/// Find or create the candidate for (contest, name). Candidate identity is
/// not preserved across garbage collection; re-creation mints a fresh id.
pub async fn get_or_create_candidate(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
    contest_id: &str,
    name: &str,
) -> Result<WriteInCandidateRecord> {
    let existing = sqlx::query(
        r#"
        SELECT id, contest_id, name FROM write_in_candidates
        WHERE election_id = ? AND contest_id = ? AND name = ?
        "#,
    )
    .bind(election_id)
    .bind(contest_id)
    .bind(name)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(row) = existing {
        return Ok(WriteInCandidateRecord {
            id: row.get("id"),
            contest_id: row.get("contest_id"),
            name: row.get("name"),
        });
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO write_in_candidates (id, election_id, contest_id, name) VALUES (?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(election_id)
    .bind(contest_id)
    .bind(name)
    .execute(&mut **tx)
    .await?;

    Ok(WriteInCandidateRecord {
        id,
        contest_id: contest_id.to_string(),
        name: name.to_string(),
    })
}

/// Delete a candidate once nothing references it: no adjudicated write-in
/// and no manual results entry.
pub async fn delete_candidate_if_unreferenced(
    tx: &mut Transaction<'_, Sqlite>,
    candidate_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM write_in_candidates
        WHERE id = ?
          AND NOT EXISTS (
            SELECT 1 FROM write_ins WHERE write_in_candidate_id = write_in_candidates.id
          )
          AND NOT EXISTS (
            SELECT 1 FROM manual_results_write_in_candidates
            WHERE write_in_candidate_id = write_in_candidates.id
          )
        "#,
    )
    .bind(candidate_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Sweep every unreferenced candidate for the election.
pub async fn delete_all_unreferenced_candidates(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM write_in_candidates
        WHERE election_id = ?
          AND id NOT IN (
            SELECT write_in_candidate_id FROM write_ins
            WHERE write_in_candidate_id IS NOT NULL
          )
          AND id NOT IN (
            SELECT write_in_candidate_id FROM manual_results_write_in_candidates
          )
        "#,
    )
    .bind(election_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Delete every write-in mark for the election (file clearing).
pub async fn delete_all_write_ins(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM write_ins WHERE election_id = ?")
        .bind(election_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
