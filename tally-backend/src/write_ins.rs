//! Write-in adjudication
//!
//! Each write-in mark moves `pending -> adjudicated(kind)` and may be
//! re-adjudicated to any other kind at any time. Candidate records created
//! for adjudication are reference counted: the transaction that removes the
//! last reference also deletes the candidate, so a sweep never races with
//! tabulation.

use crate::db::write_ins::{
    AdjudicationQueueMetadata, WriteInAdjudicationKind, WriteInCandidateRecord, WriteInRecord,
};
use crate::db::{elections, write_ins as db};
use crate::error::{Error, Result};
use crate::AppState;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Target candidate of a `write-in-candidate` adjudication: an existing
/// candidate record, or a name that gets-or-creates one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteInCandidateRef {
    Existing(String),
    Name(String),
}

/// The reviewer's decision for one write-in mark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WriteInAdjudication {
    /// The mark is not a valid vote; it becomes an undervote
    Invalid,
    /// The mark names a candidate already on the ballot
    OfficialCandidate { candidate_id: String },
    /// The mark names an ad-hoc write-in candidate
    WriteInCandidate { candidate: WriteInCandidateRef },
}

/// Apply an adjudication to a write-in mark. Re-adjudication is always
/// allowed; adjudicating to the current kind is a no-op and does not
/// invalidate cached tallies.
pub async fn adjudicate_write_in(
    app: &AppState,
    write_in_id: &str,
    adjudication: WriteInAdjudication,
) -> Result<WriteInRecord> {
    let _guard = app.election_lock().write().await;
    let election_record = elections::require_current_election(&app.db).await?;
    let election = &election_record.election;
    let election_id = &election_record.id;

    let mut tx = app.db.begin().await?;

    let existing = db::get_write_in(&mut tx, election_id, write_in_id)
        .await?
        .ok_or_else(|| Error::UnknownWriteIn(write_in_id.to_string()))?;

    let contest = election
        .candidate_contest(&existing.contest_id)
        .ok_or_else(|| Error::UnknownContest(existing.contest_id.clone()))?;

    let target = match adjudication {
        WriteInAdjudication::Invalid => WriteInAdjudicationKind::Invalid,
        WriteInAdjudication::OfficialCandidate { candidate_id } => {
            if !contest.candidates.iter().any(|c| c.id == candidate_id) {
                return Err(Error::UnknownCandidate(candidate_id));
            }
            WriteInAdjudicationKind::OfficialCandidate { candidate_id }
        }
        WriteInAdjudication::WriteInCandidate { candidate } => {
            let candidate_id = match candidate {
                WriteInCandidateRef::Existing(candidate_id) => {
                    let record = db::get_candidate(&mut tx, election_id, &candidate_id)
                        .await?
                        .ok_or_else(|| Error::UnknownCandidate(candidate_id.clone()))?;
                    if record.contest_id != existing.contest_id {
                        return Err(Error::UnknownCandidate(candidate_id));
                    }
                    record.id
                }
                WriteInCandidateRef::Name(name) => {
                    let name = name.trim().to_string();
                    if name.is_empty() {
                        return Err(Error::Common(tally_common::Error::InvalidInput(
                            "write-in candidate name must not be empty".to_string(),
                        )));
                    }
                    db::get_or_create_candidate(&mut tx, election_id, &existing.contest_id, &name)
                        .await?
                        .id
                }
            };
            WriteInAdjudicationKind::WriteInCandidate { candidate_id }
        }
    };

    // Same-kind re-adjudication changes nothing and bumps nothing.
    if existing.adjudication.as_ref() == Some(&target) {
        tx.rollback().await?;
        return Ok(existing);
    }

    match &target {
        WriteInAdjudicationKind::Invalid => db::set_invalid(&mut tx, write_in_id).await?,
        WriteInAdjudicationKind::OfficialCandidate { candidate_id } => {
            db::set_official_candidate(&mut tx, write_in_id, candidate_id).await?;
        }
        WriteInAdjudicationKind::WriteInCandidate { candidate_id } => {
            db::set_write_in_candidate(&mut tx, write_in_id, candidate_id).await?;
        }
    }

    // The previous adjudication may have held the last reference to a
    // write-in candidate.
    if let Some(WriteInAdjudicationKind::WriteInCandidate {
        candidate_id: previous_candidate_id,
    }) = &existing.adjudication
    {
        db::delete_candidate_if_unreferenced(&mut tx, previous_candidate_id).await?;
    }

    let updated = db::get_write_in(&mut tx, election_id, write_in_id)
        .await?
        .ok_or_else(|| Error::UnknownWriteIn(write_in_id.to_string()))?;
    tx.commit().await?;

    app.cache().bump_version(election_id);
    info!(write_in_id, contest_id = %updated.contest_id, "Adjudicated write-in");
    Ok(updated)
}

/// Create (or return) the write-in candidate for a contest and name.
pub async fn add_write_in_candidate(
    app: &AppState,
    contest_id: &str,
    name: &str,
) -> Result<WriteInCandidateRecord> {
    let _guard = app.election_lock().write().await;
    let election_record = elections::require_current_election(&app.db).await?;

    let contest = election_record
        .election
        .candidate_contest(contest_id)
        .ok_or_else(|| Error::UnknownContest(contest_id.to_string()))?;
    if !contest.allow_write_ins {
        return Err(Error::Common(tally_common::Error::InvalidInput(format!(
            "contest {contest_id} does not allow write-ins"
        ))));
    }
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Common(tally_common::Error::InvalidInput(
            "write-in candidate name must not be empty".to_string(),
        )));
    }

    let mut tx = app.db.begin().await?;
    let candidate = db::get_or_create_candidate(&mut tx, &election_record.id, contest_id, name).await?;
    tx.commit().await?;
    Ok(candidate)
}

/// Write-in candidates, optionally restricted to a contest. Candidates with
/// zero references never appear here: they are deleted in the same
/// transaction that drops their last reference.
pub async fn list_write_in_candidates(
    app: &AppState,
    contest_id: Option<&str>,
) -> Result<Vec<WriteInCandidateRecord>> {
    let election_record = elections::require_current_election(&app.db).await?;
    db::list_candidates(&app.db, &election_record.id, contest_id).await
}

/// Ids of pending write-ins in stable review order. Appending new files
/// extends the tail; adjudicating other marks never reorders the rest.
pub async fn get_write_in_adjudication_queue(
    app: &AppState,
    contest_id: Option<&str>,
) -> Result<Vec<String>> {
    let election_record = elections::require_current_election(&app.db).await?;
    db::pending_queue(&app.db, &election_record.id, contest_id).await
}

/// Total and pending counts per contest.
pub async fn get_write_in_adjudication_queue_metadata(
    app: &AppState,
    contest_id: Option<&str>,
) -> Result<Vec<AdjudicationQueueMetadata>> {
    let election_record = elections::require_current_election(&app.db).await?;
    db::queue_metadata(&app.db, &election_record.id, contest_id).await
}

/// Head of the pending queue for a contest, if any.
pub async fn get_first_pending_write_in_id(
    app: &AppState,
    contest_id: &str,
) -> Result<Option<String>> {
    let election_record = elections::require_current_election(&app.db).await?;
    db::first_pending(&app.db, &election_record.id, contest_id).await
}

/// One write-in record by id.
pub async fn get_write_in_record(app: &AppState, write_in_id: &str) -> Result<WriteInRecord> {
    let election_record = elections::require_current_election(&app.db).await?;
    db::get_write_in_record(&app.db, &election_record.id, write_in_id)
        .await?
        .ok_or_else(|| Error::UnknownWriteIn(write_in_id.to_string()))
}
