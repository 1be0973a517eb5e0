//! Manual results entry
//!
//! Tester-entered tallies for ballots that never went through a scanner.
//! Entries are validated against the election definition, stored in the
//! shared tabulation shape, and folded into aggregates by the engine.

use crate::db::{elections, manual as db, write_ins as write_ins_db};
use crate::error::{Error, Result};
use crate::AppState;
use serde::{Deserialize, Serialize};
use tally_common::election::{Contest, Election};
use tally_common::manual::{
    ManualContestInput, ManualResultsInput, ManualResultsKey, ManualResultsRecord,
};
use tally_common::tabulation::{
    CandidateContestResults, CandidateTally, ContestResults, Filter, YesNoContestResults,
};
use tracing::info;

/// Ballot count summary for one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualResultsMetadata {
    pub key: ManualResultsKey,
    pub ballot_count: u64,
}

fn validate_key(election: &Election, key: &ManualResultsKey) -> Result<()> {
    if election.precinct(&key.precinct_id).is_none() {
        return Err(Error::InvalidManualResults(format!(
            "unknown precinct {}",
            key.precinct_id
        )));
    }
    let group_precincts = election.precincts_for_ballot_style_group(&key.ballot_style_group_id);
    if group_precincts.is_empty() {
        return Err(Error::InvalidManualResults(format!(
            "unknown ballot style group {}",
            key.ballot_style_group_id
        )));
    }
    if !group_precincts.contains(&key.precinct_id) {
        return Err(Error::InvalidManualResults(format!(
            "ballot style group {} is not used in precinct {}",
            key.ballot_style_group_id, key.precinct_id
        )));
    }
    Ok(())
}

/// Store or replace the manual results entry for a key.
pub async fn set_manual_results(
    app: &AppState,
    key: &ManualResultsKey,
    input: &ManualResultsInput,
) -> Result<()> {
    let _guard = app.election_lock().write().await;
    let election_record = elections::require_current_election(&app.db).await?;
    let election = &election_record.election;
    let election_id = &election_record.id;

    validate_key(election, key)?;

    let scoped_contests = election.contests_for_ballot_style_group(&key.ballot_style_group_id);

    let mut tx = app.db.begin().await?;
    let mut contest_results: Vec<ContestResults> = Vec::new();
    let mut referenced_candidate_ids: Vec<String> = Vec::new();

    // Emit stored results in ballot order so reads are deterministic.
    for contest in &scoped_contests {
        let Some(entry) = input.contest_results.get(contest.id()) else {
            continue;
        };
        match (contest, entry) {
            (Contest::Candidate(contest), ManualContestInput::Candidate(entry)) => {
                let mut tallies: Vec<CandidateTally> = Vec::new();
                for candidate in &contest.candidates {
                    if let Some(tally) = entry.official_tallies.get(&candidate.id) {
                        tallies.push(CandidateTally {
                            id: candidate.id.clone(),
                            name: candidate.name.clone(),
                            is_write_in: false,
                            tally: *tally,
                        });
                    }
                }
                for candidate_id in entry.official_tallies.keys() {
                    if !contest.candidates.iter().any(|c| &c.id == candidate_id) {
                        return Err(Error::UnknownCandidate(candidate_id.clone()));
                    }
                }

                // Zero write-in tallies are dropped: no candidate record, no
                // reference.
                for (name, tally) in &entry.write_in_tallies {
                    if *tally == 0 {
                        continue;
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(Error::InvalidManualResults(
                            "write-in candidate name must not be empty".to_string(),
                        ));
                    }
                    if !contest.allow_write_ins {
                        return Err(Error::InvalidManualResults(format!(
                            "contest {} does not allow write-ins",
                            contest.id
                        )));
                    }
                    let candidate = write_ins_db::get_or_create_candidate(
                        &mut tx,
                        election_id,
                        &contest.id,
                        name,
                    )
                    .await?;
                    referenced_candidate_ids.push(candidate.id.clone());
                    tallies.push(CandidateTally {
                        id: candidate.id,
                        name: name.to_string(),
                        is_write_in: true,
                        tally: *tally,
                    });
                }

                contest_results.push(ContestResults::Candidate(CandidateContestResults {
                    contest_id: contest.id.clone(),
                    votes_allowed: contest.seats,
                    ballots: entry.ballots,
                    overvotes: entry.overvotes,
                    undervotes: entry.undervotes,
                    tallies,
                }));
            }
            (Contest::YesNo(contest), ManualContestInput::YesNo(entry)) => {
                contest_results.push(ContestResults::YesNo(YesNoContestResults {
                    contest_id: contest.id.clone(),
                    yes_option_id: contest.yes_option_id.clone(),
                    no_option_id: contest.no_option_id.clone(),
                    ballots: entry.ballots,
                    overvotes: entry.overvotes,
                    undervotes: entry.undervotes,
                    yes_tally: entry.yes_tally,
                    no_tally: entry.no_tally,
                }));
            }
            _ => {
                return Err(Error::InvalidManualResults(format!(
                    "contest {} tallies do not match the contest type",
                    contest.id()
                )));
            }
        }
    }

    // Any input contest absent from the ballot style group's scope is an
    // error rather than silently ignored.
    for contest_id in input.contest_results.keys() {
        if !scoped_contests.iter().any(|c| c.id() == contest_id) {
            return Err(Error::UnknownContest(contest_id.clone()));
        }
    }

    let manual_result_id =
        db::upsert_entry(&mut tx, election_id, key, input.ballot_count, &contest_results).await?;
    db::replace_candidate_references(&mut tx, &manual_result_id, &referenced_candidate_ids).await?;

    // The replaced entry may have held the only references to candidates.
    write_ins_db::delete_all_unreferenced_candidates(&mut tx, election_id).await?;
    tx.commit().await?;

    app.cache().bump_version(election_id);
    info!(
        precinct_id = %key.precinct_id,
        ballot_style_group_id = %key.ballot_style_group_id,
        voting_method = %key.voting_method.as_str(),
        ballot_count = input.ballot_count,
        "Stored manual results"
    );
    Ok(())
}

/// Remove the entry for a key, if present.
pub async fn delete_manual_results(app: &AppState, key: &ManualResultsKey) -> Result<()> {
    let _guard = app.election_lock().write().await;
    let election_record = elections::require_current_election(&app.db).await?;
    let election_id = &election_record.id;

    let mut tx = app.db.begin().await?;
    let deleted = db::delete_entry(&mut tx, election_id, key).await?;
    write_ins_db::delete_all_unreferenced_candidates(&mut tx, election_id).await?;
    tx.commit().await?;

    if deleted {
        app.cache().bump_version(election_id);
        info!(
            precinct_id = %key.precinct_id,
            ballot_style_group_id = %key.ballot_style_group_id,
            voting_method = %key.voting_method.as_str(),
            "Deleted manual results"
        );
    }
    Ok(())
}

/// Remove every manual results entry for the election.
pub async fn delete_all_manual_results(app: &AppState) -> Result<()> {
    let _guard = app.election_lock().write().await;
    let election_record = elections::require_current_election(&app.db).await?;
    let election_id = &election_record.id;

    let mut tx = app.db.begin().await?;
    db::delete_all(&mut tx, election_id).await?;
    write_ins_db::delete_all_unreferenced_candidates(&mut tx, election_id).await?;
    tx.commit().await?;

    app.cache().bump_version(election_id);
    info!("Deleted all manual results");
    Ok(())
}

/// Whether a manual entry is in scope for a filter. Manual entries carry no
/// batch or scanner, so a batch/scanner filter excludes them unless it
/// names the reserved manual identifier.
pub(crate) fn entry_passes_filter(
    election: &Election,
    key: &ManualResultsKey,
    filter: &Filter,
) -> bool {
    if let Some(precinct_ids) = &filter.precinct_ids {
        if !precinct_ids.contains(&key.precinct_id) {
            return false;
        }
    }
    if let Some(group_ids) = &filter.ballot_style_group_ids {
        if !group_ids.contains(&key.ballot_style_group_id) {
            return false;
        }
    }
    if let Some(methods) = &filter.voting_methods {
        if !methods.contains(&key.voting_method) {
            return false;
        }
    }
    if let Some(party_ids) = &filter.party_ids {
        match election.party_for_ballot_style_group(&key.ballot_style_group_id) {
            Some(party_id) if party_ids.contains(party_id) => {}
            _ => return false,
        }
    }
    if let Some(batch_ids) = &filter.batch_ids {
        if !batch_ids.iter().any(|id| id == tally_common::tabulation::MANUAL_BATCH_ID) {
            return false;
        }
    }
    if let Some(scanner_ids) = &filter.scanner_ids {
        if !scanner_ids.iter().any(|id| id == tally_common::tabulation::MANUAL_SCANNER_ID) {
            return false;
        }
    }
    true
}

/// Manual results entries in scope for a filter.
pub async fn get_manual_results(
    app: &AppState,
    filter: &Filter,
) -> Result<Vec<ManualResultsRecord>> {
    let election_record = elections::require_current_election(&app.db).await?;
    let entries = db::list_entries(&app.db, &election_record.id).await?;
    Ok(entries
        .into_iter()
        .filter(|entry| entry_passes_filter(&election_record.election, &entry.key, filter))
        .collect())
}

/// One entry by key.
pub async fn get_manual_results_entry(
    app: &AppState,
    key: &ManualResultsKey,
) -> Result<Option<ManualResultsRecord>> {
    let election_record = elections::require_current_election(&app.db).await?;
    db::get_entry(&app.db, &election_record.id, key).await
}

/// Ballot count summaries for every entry.
pub async fn get_manual_results_metadata(app: &AppState) -> Result<Vec<ManualResultsMetadata>> {
    let election_record = elections::require_current_election(&app.db).await?;
    let entries = db::list_entries(&app.db, &election_record.id).await?;
    Ok(entries
        .into_iter()
        .map(|entry| ManualResultsMetadata {
            key: entry.key,
            ballot_count: entry.ballot_count,
        })
        .collect())
}
