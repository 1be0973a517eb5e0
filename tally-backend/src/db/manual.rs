//! Manual results storage
//!
//! One row per (precinct, ballot style group, voting method); `set`
//! replaces. The reference join table keeps write-in candidate reference
//! counting transactional with the entry itself.

use crate::error::Result;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tally_common::election::VotingMethod;
use tally_common::manual::{ManualResultsKey, ManualResultsRecord};
use tally_common::tabulation::ContestResults;
use uuid::Uuid;

/// Insert or replace the entry for a key, returning its row id.
pub async fn upsert_entry(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
    key: &ManualResultsKey,
    ballot_count: u64,
    contest_results: &[ContestResults],
) -> Result<String> {
    let row = sqlx::query(
        r#"
        INSERT INTO manual_results
            (id, election_id, precinct_id, ballot_style_group_id, voting_method,
             ballot_count, contest_results)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (election_id, precinct_id, ballot_style_group_id, voting_method)
        DO UPDATE SET
            ballot_count = excluded.ballot_count,
            contest_results = excluded.contest_results
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(election_id)
    .bind(&key.precinct_id)
    .bind(&key.ballot_style_group_id)
    .bind(key.voting_method.as_str())
    .bind(ballot_count as i64)
    .bind(serde_json::to_string(contest_results)?)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get("id"))
}

/// Replace the write-in candidate references for an entry.
pub async fn replace_candidate_references(
    tx: &mut Transaction<'_, Sqlite>,
    manual_result_id: &str,
    candidate_ids: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM manual_results_write_in_candidates WHERE manual_result_id = ?")
        .bind(manual_result_id)
        .execute(&mut **tx)
        .await?;

    for candidate_id in candidate_ids {
        sqlx::query(
            r#"
            INSERT INTO manual_results_write_in_candidates
                (manual_result_id, write_in_candidate_id)
            VALUES (?, ?)
            ON CONFLICT (manual_result_id, write_in_candidate_id) DO NOTHING
            "#,
        )
        .bind(manual_result_id)
        .bind(candidate_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Delete one entry. Returns whether a row existed.
pub async fn delete_entry(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
    key: &ManualResultsKey,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        DELETE FROM manual_results
        WHERE election_id = ?
          AND precinct_id = ?
          AND ballot_style_group_id = ?
          AND voting_method = ?
        "#,
    )
    .bind(election_id)
    .bind(&key.precinct_id)
    .bind(&key.ballot_style_group_id)
    .bind(key.voting_method.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete every entry for the election.
pub async fn delete_all(tx: &mut Transaction<'_, Sqlite>, election_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM manual_results WHERE election_id = ?")
        .bind(election_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ManualResultsRecord> {
    let voting_method: String = row.get("voting_method");
    Ok(ManualResultsRecord {
        key: ManualResultsKey {
            precinct_id: row.get("precinct_id"),
            ballot_style_group_id: row.get("ballot_style_group_id"),
            voting_method: VotingMethod::parse(&voting_method).ok_or_else(|| {
                crate::error::Error::Common(tally_common::Error::InvalidInput(format!(
                    "stored voting method: {voting_method}"
                )))
            })?,
        },
        ballot_count: row.get::<i64, _>("ballot_count") as u64,
        contest_results: serde_json::from_str(&row.get::<String, _>("contest_results"))?,
    })
}

/// All entries for the election, in stable key order.
pub async fn list_entries(db: &SqlitePool, election_id: &str) -> Result<Vec<ManualResultsRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT precinct_id, ballot_style_group_id, voting_method, ballot_count, contest_results
        FROM manual_results
        WHERE election_id = ?
        ORDER BY precinct_id, ballot_style_group_id, voting_method
        "#,
    )
    .bind(election_id)
    .fetch_all(db)
    .await?;

    rows.iter().map(row_to_record).collect()
}

/// One entry by key.
pub async fn get_entry(
    db: &SqlitePool,
    election_id: &str,
    key: &ManualResultsKey,
) -> Result<Option<ManualResultsRecord>> {
    let row = sqlx::query(
        r#"
        SELECT precinct_id, ballot_style_group_id, voting_method, ballot_count, contest_results
        FROM manual_results
        WHERE election_id = ?
          AND precinct_id = ?
          AND ballot_style_group_id = ?
          AND voting_method = ?
        "#,
    )
    .bind(election_id)
    .bind(&key.precinct_id)
    .bind(&key.ballot_style_group_id)
    .bind(key.voting_method.as_str())
    .fetch_optional(db)
    .await?;

    row.as_ref().map(row_to_record).transpose()
}
