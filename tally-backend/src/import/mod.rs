//! Cast vote record import
//!
//! Validation happens in phases that each abort before anything is written:
//! bundle structure, report metadata, file-mode consistency, then the
//! per-record pass. The per-record pass runs inside one transaction, so a
//! file is either wholly present or wholly absent; tabulation correctness
//! depends on that.

pub mod report;

use crate::db::cvrs::{AddCvrOutcome, NewCastVoteRecord};
use crate::db::files::{CvrFileRecord, FileMode};
use crate::db::{cvrs, elections, files, write_ins};
use crate::error::{ImportError, RecordValidationError, Result};
use crate::AppState;
use chrono::{DateTime, Utc};
use report::{ReportBundle, ReportMetadata, ReportRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tally_common::election::{Election, WRITE_IN_OPTION_PREFIX};
use tally_common::tabulation::CastVoteRecord;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of a successful report import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub id: String,
    pub filename: String,
    pub file_mode: FileMode,
    pub exported_at: DateTime<Utc>,
    pub newly_added: u64,
    pub already_present: u64,
    pub scanner_ids: Vec<String>,
    pub was_existing_file: bool,
}

fn validate_record(
    election: &Election,
    metadata: &ReportMetadata,
    record: &ReportRecord,
) -> std::result::Result<(), RecordValidationError> {
    let ballot_style = election
        .ballot_style(&record.ballot_style_id)
        .ok_or(RecordValidationError::InvalidBallotStyle)?;

    if election.precinct(&record.precinct_id).is_none() {
        return Err(RecordValidationError::InvalidPrecinct);
    }

    if metadata.batch(&record.batch_id).is_none() {
        return Err(RecordValidationError::InvalidBatch);
    }

    if record.sheet_number == Some(0) {
        return Err(RecordValidationError::InvalidSheetNumber);
    }

    let style_contests = election.contests_for_ballot_style_group(&ballot_style.group_id);
    for (contest_id, option_ids) in &record.votes {
        let contest = style_contests
            .iter()
            .find(|c| c.id() == contest_id)
            .ok_or(RecordValidationError::InvalidContest)?;
        for option_id in option_ids {
            if !contest.is_valid_option(option_id) {
                return Err(RecordValidationError::InvalidContestOption);
            }
        }
    }

    // A write-in mark reference must correspond to a write-in vote present
    // in the record.
    for mark in &record.write_ins {
        let matches_vote = record
            .votes
            .get(&mark.contest_id)
            .map(|options| options.iter().any(|o| o == &mark.option_id))
            .unwrap_or(false);
        if !matches_vote || !mark.option_id.starts_with(WRITE_IN_OPTION_PREFIX) {
            return Err(RecordValidationError::InvalidWriteInReference);
        }
    }

    Ok(())
}

fn record_to_new_cvr(election: &Election, record: &ReportRecord, scanner_id: &str) -> NewCastVoteRecord {
    // Validated above, so the style lookup cannot fail here.
    let ballot_style = election.ballot_style(&record.ballot_style_id);
    let (group_id, party_id) = match ballot_style {
        Some(style) => (style.group_id.clone(), style.party_id.clone()),
        None => (record.ballot_style_id.clone(), None),
    };
    NewCastVoteRecord {
        ballot_id: record.ballot_id.clone(),
        ballot_style_id: record.ballot_style_id.clone(),
        ballot_style_group_id: group_id,
        party_id,
        precinct_id: record.precinct_id.clone(),
        voting_method: record.voting_method,
        batch_id: record.batch_id.clone(),
        scanner_id: scanner_id.to_string(),
        sheet_number: record.sheet_number,
        votes: record.votes.clone(),
    }
}

/// Import a cast vote record report bundle.
pub async fn import_cast_vote_record_report(
    app: &AppState,
    path: &Path,
) -> std::result::Result<ImportSummary, ImportError> {
    let _guard = app.election_lock().write().await;

    let election_record = elections::require_current_election(&app.db)
        .await
        .map_err(ImportError::from)?;
    let election = &election_record.election;
    let election_id = &election_record.id;

    // Phase 1: bundle structure and metadata, no record read yet
    let bundle: ReportBundle = report::open_report_bundle(path)?;
    if bundle.metadata.election_id != election.id {
        warn!(
            report_election = %bundle.metadata.election_id,
            "Rejected report for another election"
        );
        return Err(ImportError::WrongElection);
    }

    // Phase 2: file-mode consistency against previously committed files
    let report_mode = bundle.metadata.report_type.file_mode();
    let current_mode = files::get_current_file_mode(&app.db, election_id)
        .await
        .map_err(ImportError::from)?;
    if let Some(current_mode) = current_mode {
        if current_mode != report_mode {
            warn!(%current_mode, %report_mode, "Rejected report with conflicting file mode");
            return Err(ImportError::InvalidReportFileMode { current_mode });
        }
    }

    // Phase 3: byte-identical re-import is a successful no-op
    let sha256_hash = bundle.records_sha256()?;
    if let Some((existing_file_id, cvr_count)) =
        files::get_file_by_hash(&app.db, election_id, &sha256_hash)
            .await
            .map_err(ImportError::from)?
    {
        info!(file = %bundle.filename(), "Report already imported; nothing to do");
        return Ok(ImportSummary {
            id: existing_file_id,
            filename: bundle.filename(),
            file_mode: report_mode,
            exported_at: bundle.metadata.generated_at,
            newly_added: 0,
            already_present: cvr_count,
            scanner_ids: bundle.metadata.scanner_ids(),
            was_existing_file: true,
        });
    }

    // Phase 4: walk the record stream inside one transaction
    let mut tx = app.db.begin().await.map_err(ImportError::Store)?;

    let file_id = Uuid::new_v4().to_string();
    files::add_file_record(
        &mut tx,
        &file_id,
        election_id,
        &bundle.filename(),
        &sha256_hash,
        report_mode,
        bundle.metadata.generated_at,
    )
    .await
    .map_err(ImportError::from)?;

    for batch in &bundle.metadata.batches {
        files::add_scanner_batch(&mut tx, election_id, batch)
            .await
            .map_err(ImportError::from)?;
    }

    let mut newly_added: u64 = 0;
    let mut already_present: u64 = 0;
    let mut precinct_ids: BTreeSet<String> = BTreeSet::new();
    let mut scanner_ids: BTreeSet<String> = BTreeSet::new();

    for item in bundle.records()? {
        let (line, record) = item?;

        if let Err(reason) = validate_record(election, &bundle.metadata, &record) {
            return Err(ImportError::InvalidRecord { line, reason });
        }

        // Validated above, so the batch lookup cannot fail here.
        let scanner_id = bundle
            .metadata
            .batch(&record.batch_id)
            .map(|batch| batch.scanner_id.clone())
            .unwrap_or_default();

        let new_cvr = record_to_new_cvr(election, &record, &scanner_id);
        let outcome = cvrs::add_cvr_entry(&mut tx, election_id, &new_cvr)
            .await
            .map_err(ImportError::from)?;

        let cvr_id = match outcome {
            AddCvrOutcome::Conflict => {
                return Err(ImportError::DuplicateIdConflict {
                    line,
                    ballot_id: record.ballot_id.clone(),
                });
            }
            AddCvrOutcome::New { cvr_id } => {
                newly_added += 1;

                // One pending write-in row per write-in vote, in ballot
                // position order; this fixes the adjudication queue order.
                for (contest_id, option_ids) in &record.votes {
                    for option_id in option_ids {
                        if !option_id.starts_with(WRITE_IN_OPTION_PREFIX) {
                            continue;
                        }
                        let side = record
                            .write_ins
                            .iter()
                            .find(|m| &m.contest_id == contest_id && &m.option_id == option_id)
                            .and_then(|m| m.side.as_deref());
                        write_ins::add_write_in(
                            &mut tx,
                            election_id,
                            &cvr_id,
                            contest_id,
                            option_id,
                            side,
                        )
                        .await
                        .map_err(ImportError::from)?;
                    }
                }
                cvr_id
            }
            AddCvrOutcome::AlreadyPresent { cvr_id } => {
                already_present += 1;
                cvr_id
            }
        };

        cvrs::add_file_link(&mut tx, &file_id, &cvr_id)
            .await
            .map_err(ImportError::from)?;
        precinct_ids.insert(record.precinct_id.clone());
        scanner_ids.insert(scanner_id);
    }

    let precinct_ids: Vec<String> = precinct_ids.into_iter().collect();
    let scanner_ids: Vec<String> = scanner_ids.into_iter().collect();
    files::update_file_record(
        &mut tx,
        &file_id,
        newly_added + already_present,
        &precinct_ids,
        &scanner_ids,
    )
    .await
    .map_err(ImportError::from)?;

    tx.commit().await.map_err(ImportError::Store)?;
    app.cache().bump_version(election_id);

    info!(
        file = %bundle.filename(),
        newly_added,
        already_present,
        mode = %report_mode,
        "Imported cast vote record report"
    );

    Ok(ImportSummary {
        id: file_id,
        filename: bundle.filename(),
        file_mode: report_mode,
        exported_at: bundle.metadata.generated_at,
        newly_added,
        already_present,
        scanner_ids,
        was_existing_file: false,
    })
}

/// Delete all imported files and everything derived from them: CVRs,
/// write-in records, now-orphaned write-in candidates, and empty batches.
/// Resets the file mode to unlocked.
pub async fn clear_cast_vote_record_files(app: &AppState) -> Result<()> {
    let _guard = app.election_lock().write().await;
    let election_record = elections::require_current_election(&app.db).await?;
    let election_id = &election_record.id;

    let mut tx = app.db.begin().await?;
    write_ins::delete_all_write_ins(&mut tx, election_id).await?;
    cvrs::delete_all(&mut tx, election_id).await?;
    files::delete_empty_scanner_batches(&mut tx, election_id).await?;
    write_ins::delete_all_unreferenced_candidates(&mut tx, election_id).await?;
    tx.commit().await?;

    app.cache().bump_version(election_id);
    info!("Cleared all cast vote record files");
    Ok(())
}

/// Metadata for every imported file, most recently exported first.
pub async fn get_cast_vote_record_files(app: &AppState) -> Result<Vec<CvrFileRecord>> {
    let election_record = elections::require_current_election(&app.db).await?;
    files::list_files(&app.db, &election_record.id).await
}

/// The election's current file mode; `None` until a first file commits.
pub async fn get_cast_vote_record_file_mode(app: &AppState) -> Result<Option<FileMode>> {
    let election_record = elections::require_current_election(&app.db).await?;
    files::get_current_file_mode(&app.db, &election_record.id).await
}

/// Count of stored cast vote records.
pub async fn get_cast_vote_record_count(app: &AppState) -> Result<u64> {
    let election_record = elections::require_current_election(&app.db).await?;
    cvrs::count(&app.db, &election_record.id).await
}

/// Targeted single-CVR lookup; bypasses the tabulation cache.
pub async fn get_cast_vote_record(app: &AppState, cvr_id: &str) -> Result<Option<CastVoteRecord>> {
    let election_record = elections::require_current_election(&app.db).await?;
    cvrs::get_cast_vote_record(&app.db, &election_record.id, cvr_id).await
}
