//! Cast vote record storage
//!
//! CVR rows are immutable once stored; adjudication state lives in the
//! write_ins table. The `cvr_file_entries` join table links each CVR to
//! every file that contained it, so identical re-imports gain a link
//! without duplicating the record.

use crate::error::Result;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use tally_common::election::VotingMethod;
use tally_common::tabulation::{Card, CastVoteRecord, Filter};
use uuid::Uuid;

/// A cast vote record as parsed from a report, ready for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCastVoteRecord {
    pub ballot_id: String,
    pub ballot_style_id: String,
    pub ballot_style_group_id: String,
    pub party_id: Option<String>,
    pub precinct_id: String,
    pub voting_method: VotingMethod,
    pub batch_id: String,
    pub scanner_id: String,
    pub sheet_number: Option<u32>,
    pub votes: BTreeMap<String, Vec<String>>,
}

/// Outcome of attempting to add one record during import
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddCvrOutcome {
    /// Inserted as a new record
    New { cvr_id: String },
    /// A record with this ballot id and identical content already exists
    AlreadyPresent { cvr_id: String },
    /// A record with this ballot id exists with different content
    Conflict,
}

/// Insert a record, deduplicating by ballot id. Identical content is a
/// no-op returning the existing row id; divergent content is a conflict
/// the caller must treat as fatal for the whole file.
pub async fn add_cvr_entry(
    tx: &mut Transaction<'_, Sqlite>,
    election_id: &str,
    record: &NewCastVoteRecord,
) -> Result<AddCvrOutcome> {
    let votes_json = serde_json::to_string(&record.votes)?;

    let existing = sqlx::query(
        r#"
        SELECT id, ballot_style_id, precinct_id, voting_method, batch_id,
               scanner_id, sheet_number, votes
        FROM cvrs
        WHERE election_id = ? AND ballot_id = ?
        "#,
    )
    .bind(election_id)
    .bind(&record.ballot_id)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(row) = existing {
        let same = row.get::<String, _>("ballot_style_id") == record.ballot_style_id
            && row.get::<String, _>("precinct_id") == record.precinct_id
            && VotingMethod::parse(&row.get::<String, _>("voting_method"))
                == Some(record.voting_method)
            && row.get::<String, _>("batch_id") == record.batch_id
            && row.get::<String, _>("scanner_id") == record.scanner_id
            && row.get::<Option<i64>, _>("sheet_number")
                == record.sheet_number.map(|n| n as i64)
            && row.get::<String, _>("votes") == votes_json;

        return Ok(if same {
            AddCvrOutcome::AlreadyPresent {
                cvr_id: row.get("id"),
            }
        } else {
            AddCvrOutcome::Conflict
        });
    }

    let cvr_id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO cvrs
            (id, election_id, ballot_id, ballot_style_id, ballot_style_group_id,
             party_id, precinct_id, voting_method, batch_id, scanner_id,
             sheet_number, votes)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&cvr_id)
    .bind(election_id)
    .bind(&record.ballot_id)
    .bind(&record.ballot_style_id)
    .bind(&record.ballot_style_group_id)
    .bind(&record.party_id)
    .bind(&record.precinct_id)
    .bind(record.voting_method.as_str())
    .bind(&record.batch_id)
    .bind(&record.scanner_id)
    .bind(record.sheet_number.map(|n| n as i64))
    .bind(&votes_json)
    .execute(&mut **tx)
    .await?;

    Ok(AddCvrOutcome::New { cvr_id })
}

/// Link a CVR to the file that contained it.
pub async fn add_file_link(
    tx: &mut Transaction<'_, Sqlite>,
    cvr_file_id: &str,
    cvr_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cvr_file_entries (cvr_file_id, cvr_id)
        VALUES (?, ?)
        ON CONFLICT (cvr_file_id, cvr_id) DO NOTHING
        "#,
    )
    .bind(cvr_file_id)
    .bind(cvr_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn filter_where_clause(filter: &Filter) -> (String, Vec<String>) {
    fn placeholders(count: usize) -> String {
        let marks = vec!["?"; count];
        format!("({})", marks.join(", "))
    }

    let mut parts = vec!["election_id = ?".to_string()];
    let mut params: Vec<String> = Vec::new();

    if let Some(ids) = &filter.precinct_ids {
        parts.push(format!("precinct_id IN {}", placeholders(ids.len())));
        params.extend(ids.iter().cloned());
    }
    if let Some(ids) = &filter.ballot_style_group_ids {
        parts.push(format!(
            "ballot_style_group_id IN {}",
            placeholders(ids.len())
        ));
        params.extend(ids.iter().cloned());
    }
    if let Some(ids) = &filter.party_ids {
        parts.push(format!("party_id IN {}", placeholders(ids.len())));
        params.extend(ids.iter().cloned());
    }
    if let Some(methods) = &filter.voting_methods {
        parts.push(format!("voting_method IN {}", placeholders(methods.len())));
        params.extend(methods.iter().map(|m| m.as_str().to_string()));
    }
    if let Some(ids) = &filter.scanner_ids {
        parts.push(format!("scanner_id IN {}", placeholders(ids.len())));
        params.extend(ids.iter().cloned());
    }
    if let Some(ids) = &filter.batch_ids {
        parts.push(format!("batch_id IN {}", placeholders(ids.len())));
        params.extend(ids.iter().cloned());
    }

    (parts.join(" AND "), params)
}

fn row_to_cast_vote_record(row: &sqlx::sqlite::SqliteRow) -> Result<CastVoteRecord> {
    let voting_method: String = row.get("voting_method");
    let votes: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&row.get::<String, _>("votes"))?;
    Ok(CastVoteRecord {
        id: row.get("id"),
        ballot_style_group_id: row.get("ballot_style_group_id"),
        party_id: row.get("party_id"),
        precinct_id: row.get("precinct_id"),
        voting_method: VotingMethod::parse(&voting_method).ok_or_else(|| {
            crate::error::Error::Common(tally_common::Error::InvalidInput(format!(
                "stored voting method: {voting_method}"
            )))
        })?,
        batch_id: row.get("batch_id"),
        scanner_id: row.get("scanner_id"),
        card: match row.get::<Option<i64>, _>("sheet_number") {
            Some(sheet_number) => Card::Hmpb {
                sheet_number: sheet_number as u32,
            },
            None => Card::Bmd,
        },
        votes,
    })
}

/// Cast vote records matching the filter, in stable (ballot id) order, in
/// their tabulation form.
pub async fn list_for_tabulation(
    db: &SqlitePool,
    election_id: &str,
    filter: &Filter,
) -> Result<Vec<CastVoteRecord>> {
    let (where_clause, params) = filter_where_clause(filter);
    let sql = format!(
        r#"
        SELECT id, ballot_style_group_id, party_id, precinct_id, voting_method,
               batch_id, scanner_id, sheet_number, votes
        FROM cvrs
        WHERE {where_clause}
        ORDER BY ballot_id
        "#
    );

    let mut query = sqlx::query(&sql).bind(election_id);
    for param in &params {
        query = query.bind(param);
    }
    let rows = query.fetch_all(db).await?;

    rows.iter().map(row_to_cast_vote_record).collect()
}

/// Targeted single-CVR lookup (adjudication review screens). Bypasses the
/// tabulation cache and does not consult the version counter.
pub async fn get_cast_vote_record(
    db: &SqlitePool,
    election_id: &str,
    cvr_id: &str,
) -> Result<Option<CastVoteRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, ballot_style_group_id, party_id, precinct_id, voting_method,
               batch_id, scanner_id, sheet_number, votes
        FROM cvrs
        WHERE election_id = ? AND id = ?
        "#,
    )
    .bind(election_id)
    .bind(cvr_id)
    .fetch_optional(db)
    .await?;

    row.as_ref().map(row_to_cast_vote_record).transpose()
}

/// Count of stored cast vote records for the election.
pub async fn count(db: &SqlitePool, election_id: &str) -> Result<u64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM cvrs WHERE election_id = ?")
        .bind(election_id)
        .fetch_one(db)
        .await?;
    Ok(row.get::<i64, _>("n") as u64)
}

/// Delete all cast vote records, file links, and file rows for the election.
pub async fn delete_all(tx: &mut Transaction<'_, Sqlite>, election_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM cvr_file_entries
        WHERE cvr_file_id IN (SELECT id FROM cvr_files WHERE election_id = ?)
        "#,
    )
    .bind(election_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM cvr_files WHERE election_id = ?")
        .bind(election_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM cvrs WHERE election_id = ?")
        .bind(election_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
