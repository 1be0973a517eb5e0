//! Aggregation engine
//!
//! A pure function of the corpus (cast vote records + write-in adjudications
//! + manual entries) and the query: partitions in-scope records by the
//! active group-by axes and produces card counts and per-contest tallies
//! per group. Output ordering is fully deterministic: groups iterate in
//! specifier order, contests in election-definition order, candidates in
//! contest order with write-in candidates sorted by name.
//!
//! The public read API (`get_card_counts`, `get_aggregate_results`) goes
//! through the tabulation cache; the engine itself never caches.

use crate::cache::CacheKey;
use crate::db::write_ins::{ResolvedWriteIn, WriteInResolution};
use crate::db::{cvrs, elections, manual, write_ins};
use crate::error::Result;
use crate::manual_results::entry_passes_filter;
use crate::AppState;
use std::collections::{BTreeMap, HashMap};
use tally_common::election::{Contest, Election, WRITE_IN_OPTION_PREFIX};
use tally_common::manual::ManualResultsRecord;
use tally_common::tabulation::{
    empty_candidate_contest_results, empty_yes_no_contest_results, expected_group_specifiers,
    AggregateResult, CandidateTally, CardCounts, CastVoteRecord, ContestResults, Filter, GroupBy,
    GroupSpecifier, GroupedCardCounts, MANUAL_BATCH_ID, MANUAL_SCANNER_ID, PENDING_WRITE_IN_ID,
    PENDING_WRITE_IN_NAME,
};
use tracing::debug;

/// Per-contest accumulator while walking the corpus
enum ContestAccumulator {
    Candidate {
        ballots: u64,
        overvotes: u64,
        undervotes: u64,
        /// official candidate id -> tally (direct votes + adjudications)
        official: BTreeMap<String, u64>,
        /// write-in candidate id -> (name, tally)
        write_in: BTreeMap<String, (String, u64)>,
        pending: u64,
    },
    YesNo {
        ballots: u64,
        overvotes: u64,
        undervotes: u64,
        yes: u64,
        no: u64,
    },
}

impl ContestAccumulator {
    fn for_contest(contest: &Contest) -> Self {
        match contest {
            Contest::Candidate(_) => ContestAccumulator::Candidate {
                ballots: 0,
                overvotes: 0,
                undervotes: 0,
                official: BTreeMap::new(),
                write_in: BTreeMap::new(),
                pending: 0,
            },
            Contest::YesNo(_) => ContestAccumulator::YesNo {
                ballots: 0,
                overvotes: 0,
                undervotes: 0,
                yes: 0,
                no: 0,
            },
        }
    }
}

/// Accumulator for one group
#[derive(Default)]
struct GroupAccumulator {
    card_counts: CardCounts,
    card_counts_by_party: BTreeMap<String, CardCounts>,
    contests: BTreeMap<String, ContestAccumulator>,
}

/// How one vote option on one ballot resolves after adjudication
enum ResolvedVote {
    Official(String),
    Pending,
    WriteInCandidate { candidate_id: String, name: String },
    /// Invalidated write-in mark; contributes an undervote
    Discarded,
}

fn project_cvr(cvr: &CastVoteRecord, group_by: GroupBy) -> GroupSpecifier {
    GroupSpecifier {
        ballot_style_group_id: group_by
            .by_ballot_style
            .then(|| cvr.ballot_style_group_id.clone()),
        batch_id: group_by.by_batch.then(|| cvr.batch_id.clone()),
        party_id: group_by.by_party.then(|| cvr.party_id.clone()).flatten(),
        precinct_id: group_by.by_precinct.then(|| cvr.precinct_id.clone()),
        scanner_id: group_by.by_scanner.then(|| cvr.scanner_id.clone()),
        voting_method: group_by.by_voting_method.then_some(cvr.voting_method),
    }
}

/// The group a manual entry lands in. Manual entries have no batch or
/// scanner; under those axes they form their own synthetic group tagged
/// with the reserved manual identifier.
fn project_manual_entry(
    election: &Election,
    entry: &ManualResultsRecord,
    group_by: GroupBy,
) -> GroupSpecifier {
    GroupSpecifier {
        ballot_style_group_id: group_by
            .by_ballot_style
            .then(|| entry.key.ballot_style_group_id.clone()),
        batch_id: group_by.by_batch.then(|| MANUAL_BATCH_ID.to_string()),
        party_id: group_by
            .by_party
            .then(|| {
                election
                    .party_for_ballot_style_group(&entry.key.ballot_style_group_id)
                    .cloned()
            })
            .flatten(),
        precinct_id: group_by.by_precinct.then(|| entry.key.precinct_id.clone()),
        scanner_id: group_by.by_scanner.then(|| MANUAL_SCANNER_ID.to_string()),
        voting_method: group_by.by_voting_method.then_some(entry.key.voting_method),
    }
}

/// Whether a pre-seeded group specifier survives the filter.
fn specifier_passes_filter(
    election: &Election,
    specifier: &GroupSpecifier,
    filter: &Filter,
) -> bool {
    fn passes(value: &Option<String>, allowed: &Option<Vec<String>>) -> bool {
        match (value, allowed) {
            (Some(value), Some(allowed)) => allowed.contains(value),
            _ => true,
        }
    }

    if !passes(&specifier.precinct_id, &filter.precinct_ids)
        || !passes(&specifier.ballot_style_group_id, &filter.ballot_style_group_ids)
        || !passes(&specifier.party_id, &filter.party_ids)
        || !passes(&specifier.batch_id, &filter.batch_ids)
        || !passes(&specifier.scanner_id, &filter.scanner_ids)
    {
        return false;
    }
    if let (Some(method), Some(methods)) = (specifier.voting_method, &filter.voting_methods) {
        if !methods.contains(&method) {
            return false;
        }
    }
    // A party filter also excludes ballot style groups of other parties.
    if let (Some(group_id), Some(party_ids)) =
        (&specifier.ballot_style_group_id, &filter.party_ids)
    {
        match election.party_for_ballot_style_group(group_id) {
            Some(party_id) if party_ids.contains(party_id) => {}
            _ => return false,
        }
    }
    true
}

fn tally_candidate_contest(
    accumulator: &mut ContestAccumulator,
    seats: u32,
    resolved_votes: Vec<ResolvedVote>,
) {
    let ContestAccumulator::Candidate {
        ballots,
        overvotes,
        undervotes,
        official,
        write_in,
        pending,
    } = accumulator
    else {
        return;
    };

    *ballots += 1;

    // Invalidated write-in marks are discarded before over/undervote
    // accounting, so adjudicating a mark invalid converts it to an
    // undervote.
    let effective: Vec<ResolvedVote> = resolved_votes
        .into_iter()
        .filter(|vote| !matches!(vote, ResolvedVote::Discarded))
        .collect();

    if effective.len() as u32 > seats {
        // An overvoted contest contributes one overvote per seat and no
        // candidate tallies.
        *overvotes += seats as u64;
        return;
    }

    *undervotes += (seats as u64) - (effective.len() as u64);
    for vote in effective {
        match vote {
            ResolvedVote::Official(candidate_id) => {
                *official.entry(candidate_id).or_insert(0) += 1;
            }
            ResolvedVote::Pending => *pending += 1,
            ResolvedVote::WriteInCandidate { candidate_id, name } => {
                let entry = write_in.entry(candidate_id).or_insert((name, 0));
                entry.1 += 1;
            }
            ResolvedVote::Discarded => unreachable!("discarded votes were filtered"),
        }
    }
}

fn tally_yes_no_contest(
    accumulator: &mut ContestAccumulator,
    yes_option_id: &str,
    no_option_id: &str,
    options: &[String],
) {
    let ContestAccumulator::YesNo {
        ballots,
        overvotes,
        undervotes,
        yes,
        no,
    } = accumulator
    else {
        return;
    };

    *ballots += 1;
    if options.len() >= 2 {
        *overvotes += 1;
    } else if options.is_empty() {
        *undervotes += 1;
    } else if options[0] == yes_option_id {
        *yes += 1;
    } else if options[0] == no_option_id {
        *no += 1;
    }
}

fn add_cvr_to_group(
    group: &mut GroupAccumulator,
    election: &Election,
    cvr: &CastVoteRecord,
    write_in_resolutions: &HashMap<(String, String, String), WriteInResolution>,
    track_party_splits: bool,
) {
    group.card_counts.add_card(cvr.card);
    if track_party_splits {
        if let Some(party_id) = &cvr.party_id {
            group
                .card_counts_by_party
                .entry(party_id.clone())
                .or_default()
                .add_card(cvr.card);
        }
    }

    for (contest_id, options) in &cvr.votes {
        let Some(contest) = election.contest(contest_id) else {
            continue;
        };
        let accumulator = group
            .contests
            .entry(contest_id.clone())
            .or_insert_with(|| ContestAccumulator::for_contest(contest));

        match contest {
            Contest::Candidate(contest) => {
                let resolved = options
                    .iter()
                    .map(|option_id| {
                        if !option_id.starts_with(WRITE_IN_OPTION_PREFIX) {
                            return ResolvedVote::Official(option_id.clone());
                        }
                        let key =
                            (cvr.id.clone(), contest_id.clone(), option_id.clone());
                        match write_in_resolutions.get(&key) {
                            None | Some(WriteInResolution::Pending) => ResolvedVote::Pending,
                            Some(WriteInResolution::Invalid) => ResolvedVote::Discarded,
                            Some(WriteInResolution::Official { candidate_id }) => {
                                ResolvedVote::Official(candidate_id.clone())
                            }
                            Some(WriteInResolution::Candidate { candidate_id, name }) => {
                                ResolvedVote::WriteInCandidate {
                                    candidate_id: candidate_id.clone(),
                                    name: name.clone(),
                                }
                            }
                        }
                    })
                    .collect();
                tally_candidate_contest(accumulator, contest.seats, resolved);
            }
            Contest::YesNo(contest) => {
                tally_yes_no_contest(
                    accumulator,
                    &contest.yes_option_id,
                    &contest.no_option_id,
                    options,
                );
            }
        }
    }
}

fn add_manual_entry_to_group(
    group: &mut GroupAccumulator,
    election: &Election,
    entry: &ManualResultsRecord,
    track_party_splits: bool,
) {
    group.card_counts.manual += entry.ballot_count;
    if track_party_splits {
        if let Some(party_id) =
            election.party_for_ballot_style_group(&entry.key.ballot_style_group_id)
        {
            group
                .card_counts_by_party
                .entry(party_id.clone())
                .or_default()
                .manual += entry.ballot_count;
        }
    }

    for results in &entry.contest_results {
        let Some(contest) = election.contest(results.contest_id()) else {
            continue;
        };
        let accumulator = group
            .contests
            .entry(results.contest_id().to_string())
            .or_insert_with(|| ContestAccumulator::for_contest(contest));

        match (results, accumulator) {
            (
                ContestResults::Candidate(results),
                ContestAccumulator::Candidate {
                    ballots,
                    overvotes,
                    undervotes,
                    official,
                    write_in,
                    ..
                },
            ) => {
                *ballots += results.ballots;
                *overvotes += results.overvotes;
                *undervotes += results.undervotes;
                for tally in &results.tallies {
                    if tally.is_write_in {
                        let entry = write_in
                            .entry(tally.id.clone())
                            .or_insert((tally.name.clone(), 0));
                        entry.1 += tally.tally;
                    } else {
                        *official.entry(tally.id.clone()).or_insert(0) += tally.tally;
                    }
                }
            }
            (
                ContestResults::YesNo(results),
                ContestAccumulator::YesNo {
                    ballots,
                    overvotes,
                    undervotes,
                    yes,
                    no,
                },
            ) => {
                *ballots += results.ballots;
                *overvotes += results.overvotes;
                *undervotes += results.undervotes;
                *yes += results.yes_tally;
                *no += results.no_tally;
            }
            _ => {}
        }
    }
}

/// Contests in scope for a group: a ballot-style group restricts to its
/// contests, otherwise every contest in the election.
fn scoped_contests<'a>(election: &'a Election, specifier: &GroupSpecifier) -> Vec<&'a Contest> {
    match &specifier.ballot_style_group_id {
        Some(group_id) => election.contests_for_ballot_style_group(group_id),
        None => election.contests.iter().collect(),
    }
}

fn finalize_group(
    election: &Election,
    specifier: GroupSpecifier,
    accumulator: GroupAccumulator,
    has_party_splits: bool,
) -> AggregateResult {
    let mut contest_results = Vec::new();
    for contest in scoped_contests(election, &specifier) {
        let results = match (contest, accumulator.contests.get(contest.id())) {
            (Contest::Candidate(contest), accumulated) => {
                let mut results = empty_candidate_contest_results(contest);
                if let Some(ContestAccumulator::Candidate {
                    ballots,
                    overvotes,
                    undervotes,
                    official,
                    write_in,
                    pending,
                }) = accumulated
                {
                    results.ballots = *ballots;
                    results.overvotes = *overvotes;
                    results.undervotes = *undervotes;
                    for tally in &mut results.tallies {
                        tally.tally = official.get(&tally.id).copied().unwrap_or(0);
                    }

                    let mut write_in_tallies: Vec<CandidateTally> = write_in
                        .iter()
                        .map(|(candidate_id, (name, tally))| CandidateTally {
                            id: candidate_id.clone(),
                            name: name.clone(),
                            is_write_in: true,
                            tally: *tally,
                        })
                        .collect();
                    write_in_tallies.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
                    results.tallies.extend(write_in_tallies);

                    if *pending > 0 {
                        results.tallies.push(CandidateTally {
                            id: PENDING_WRITE_IN_ID.to_string(),
                            name: PENDING_WRITE_IN_NAME.to_string(),
                            is_write_in: true,
                            tally: *pending,
                        });
                    }
                }
                ContestResults::Candidate(results)
            }
            (Contest::YesNo(contest), accumulated) => {
                let mut results = empty_yes_no_contest_results(contest);
                if let Some(ContestAccumulator::YesNo {
                    ballots,
                    overvotes,
                    undervotes,
                    yes,
                    no,
                }) = accumulated
                {
                    results.ballots = *ballots;
                    results.overvotes = *overvotes;
                    results.undervotes = *undervotes;
                    results.yes_tally = *yes;
                    results.no_tally = *no;
                }
                ContestResults::YesNo(results)
            }
        };
        contest_results.push(results);
    }

    AggregateResult {
        group: specifier,
        card_counts: accumulator.card_counts,
        has_party_splits,
        card_counts_by_party: accumulator.card_counts_by_party,
        contest_results,
    }
}

/// Aggregate the corpus for one query. Deterministic for a fixed corpus.
pub(crate) async fn aggregate(
    db: &sqlx::SqlitePool,
    election_id: &str,
    election: &Election,
    filter: &Filter,
    group_by: GroupBy,
) -> Result<Vec<AggregateResult>> {
    debug!(?filter, ?group_by, "Aggregating corpus");
    let has_party_splits = election.has_party_splits();

    let mut groups: BTreeMap<GroupSpecifier, GroupAccumulator> = BTreeMap::new();

    // Pre-seed groups that can be enumerated from the election definition
    // so empty partitions still appear (e.g. grouping by precinct yields an
    // entry per precinct even with zero records). With no grouping at all,
    // the single root group always exists.
    if group_by.is_empty() {
        groups.insert(GroupSpecifier::default(), GroupAccumulator::default());
    } else if group_by.is_enumerable() {
        for specifier in expected_group_specifiers(election, &group_by) {
            if specifier_passes_filter(election, &specifier, filter) {
                groups.entry(specifier).or_default();
            }
        }
    }

    // Write-in resolutions, keyed for per-mark lookup while walking CVRs.
    let resolutions: Vec<ResolvedWriteIn> =
        write_ins::resolutions_for_tabulation(db, election_id).await?;
    let write_in_resolutions: HashMap<(String, String, String), WriteInResolution> = resolutions
        .into_iter()
        .map(|r| ((r.cvr_id, r.contest_id, r.option_id), r.resolution))
        .collect();

    // Scanned records
    let records = cvrs::list_for_tabulation(db, election_id, filter).await?;
    for cvr in &records {
        let specifier = project_cvr(cvr, group_by);
        let group = groups.entry(specifier).or_default();
        add_cvr_to_group(group, election, cvr, &write_in_resolutions, has_party_splits);
    }

    // Manual entries
    let manual_entries = manual::list_entries(db, election_id).await?;
    for entry in &manual_entries {
        if !entry_passes_filter(election, &entry.key, filter) {
            continue;
        }
        let specifier = project_manual_entry(election, entry, group_by);
        let group = groups.entry(specifier).or_default();
        add_manual_entry_to_group(group, election, entry, has_party_splits);
    }

    debug!(
        groups = groups.len(),
        records = records.len(),
        "Aggregation complete"
    );
    Ok(groups
        .into_iter()
        .map(|(specifier, accumulator)| {
            finalize_group(election, specifier, accumulator, has_party_splits)
        })
        .collect())
}

async fn cached_aggregate(
    app: &AppState,
    filter: &Filter,
    group_by: GroupBy,
) -> Result<Vec<AggregateResult>> {
    // Readers hold the read side of the election lock while snapshotting
    // the version and scanning, so a concurrent mutation cannot commit a
    // version bump mid-computation.
    let _guard = app.election_lock().read().await;
    let election_record = elections::require_current_election(&app.db).await?;
    let version = app.cache().version(&election_record.id);
    let normalized = filter.normalized();
    let key = CacheKey::new(&election_record.id, version, &normalized, group_by);

    let results = app
        .cache()
        .get_or_compute(key, || {
            aggregate(
                &app.db,
                &election_record.id,
                &election_record.election,
                &normalized,
                group_by,
            )
        })
        .await?;
    Ok(results.as_ref().clone())
}

/// Full tally-report data: card counts plus per-contest tallies per group.
pub async fn get_aggregate_results(
    app: &AppState,
    filter: &Filter,
    group_by: GroupBy,
) -> Result<Vec<AggregateResult>> {
    cached_aggregate(app, filter, group_by).await
}

/// Ballot-level card counts per group.
pub async fn get_card_counts(
    app: &AppState,
    filter: &Filter,
    group_by: GroupBy,
) -> Result<Vec<GroupedCardCounts>> {
    let results = cached_aggregate(app, filter, group_by).await?;
    Ok(results
        .into_iter()
        .map(|result| GroupedCardCounts {
            group: result.group,
            card_counts: result.card_counts,
            card_counts_by_party: result.card_counts_by_party,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_common::tabulation::Card;

    fn cvr(precinct_id: &str, voting_method: tally_common::election::VotingMethod) -> CastVoteRecord {
        CastVoteRecord {
            id: "cvr-1".to_string(),
            ballot_style_group_id: "1".to_string(),
            party_id: None,
            precinct_id: precinct_id.to_string(),
            voting_method,
            batch_id: "batch-1".to_string(),
            scanner_id: "scanner-1".to_string(),
            card: Card::Bmd,
            votes: Default::default(),
        }
    }

    #[test]
    fn projection_only_fills_active_axes() {
        use tally_common::election::VotingMethod;

        let record = cvr("precinct-1", VotingMethod::Absentee);
        let specifier = project_cvr(
            &record,
            GroupBy {
                by_precinct: true,
                by_voting_method: true,
                ..GroupBy::default()
            },
        );
        assert_eq!(specifier.precinct_id.as_deref(), Some("precinct-1"));
        assert_eq!(specifier.voting_method, Some(VotingMethod::Absentee));
        assert_eq!(specifier.ballot_style_group_id, None);
        assert_eq!(specifier.batch_id, None);
    }

    #[test]
    fn overvoted_contest_contributes_no_candidate_tallies() {
        let mut accumulator = ContestAccumulator::Candidate {
            ballots: 0,
            overvotes: 0,
            undervotes: 0,
            official: BTreeMap::new(),
            write_in: BTreeMap::new(),
            pending: 0,
        };
        tally_candidate_contest(
            &mut accumulator,
            1,
            vec![
                ResolvedVote::Official("alice".to_string()),
                ResolvedVote::Pending,
            ],
        );

        let ContestAccumulator::Candidate {
            ballots,
            overvotes,
            official,
            pending,
            ..
        } = accumulator
        else {
            panic!("candidate accumulator expected");
        };
        assert_eq!(ballots, 1);
        assert_eq!(overvotes, 1);
        assert!(official.is_empty());
        assert_eq!(pending, 0);
    }

    #[test]
    fn discarded_write_in_becomes_an_undervote() {
        let mut accumulator = ContestAccumulator::Candidate {
            ballots: 0,
            overvotes: 0,
            undervotes: 0,
            official: BTreeMap::new(),
            write_in: BTreeMap::new(),
            pending: 0,
        };
        tally_candidate_contest(&mut accumulator, 1, vec![ResolvedVote::Discarded]);

        let ContestAccumulator::Candidate {
            undervotes,
            overvotes,
            ..
        } = accumulator
        else {
            panic!("candidate accumulator expected");
        };
        assert_eq!(undervotes, 1);
        assert_eq!(overvotes, 0);
    }
}
