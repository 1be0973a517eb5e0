//! Tabulation types
//!
//! Data shapes shared by the aggregation engine, the tabulation cache, and
//! report consumers: the tabulation view of a cast vote record, filters,
//! grouping specifications, card counts, and per-contest results.

use crate::election::{
    BallotStyleGroupId, BatchId, CandidateContest, ContestId, Election, PartyId, PrecinctId,
    ScannerId, VotingMethod, YesNoContest,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Candidate id under which unadjudicated write-in marks are tallied.
pub const PENDING_WRITE_IN_ID: &str = "write-in-pending";

/// Display name for the pending write-in tally row.
pub const PENDING_WRITE_IN_NAME: &str = "Unadjudicated Write-In";

/// Reserved batch id tagging the synthetic group that carries manual results
/// when grouping by batch.
pub const MANUAL_BATCH_ID: &str = "batch-manual";

/// Reserved scanner id tagging the synthetic group that carries manual
/// results when grouping by scanner.
pub const MANUAL_SCANNER_ID: &str = "scanner-manual";

/// The physical card a cast vote record was scanned from: a digitally marked
/// ballot summary card, or one sheet of a hand-marked paper ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Card {
    Bmd,
    Hmpb { sheet_number: u32 },
}

/// A cast vote record in its tabulation form: the ballot attributes used for
/// filtering and grouping, plus the interpreted votes per contest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastVoteRecord {
    pub id: String,
    pub ballot_style_group_id: BallotStyleGroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    pub precinct_id: PrecinctId,
    pub voting_method: VotingMethod,
    pub batch_id: BatchId,
    pub scanner_id: ScannerId,
    pub card: Card,
    /// contest id -> vote option ids
    pub votes: BTreeMap<ContestId, Vec<String>>,
}

/// A predicate over cast vote records and manual entries. Absent fields mean
/// "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precinct_ids: Option<Vec<PrecinctId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ballot_style_group_ids: Option<Vec<BallotStyleGroupId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_ids: Option<Vec<PartyId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voting_methods: Option<Vec<VotingMethod>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_ids: Option<Vec<ScannerId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_ids: Option<Vec<BatchId>>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.precinct_ids.is_none()
            && self.ballot_style_group_ids.is_none()
            && self.party_ids.is_none()
            && self.voting_methods.is_none()
            && self.scanner_ids.is_none()
            && self.batch_ids.is_none()
    }

    /// Canonical form used for cache keying: each id set sorted and
    /// deduplicated so equivalent filters compare equal.
    pub fn normalized(&self) -> Filter {
        fn normalize<T: Ord + Clone>(values: &Option<Vec<T>>) -> Option<Vec<T>> {
            values.as_ref().map(|values| {
                let mut values = values.clone();
                values.sort();
                values.dedup();
                values
            })
        }

        Filter {
            precinct_ids: normalize(&self.precinct_ids),
            ballot_style_group_ids: normalize(&self.ballot_style_group_ids),
            party_ids: normalize(&self.party_ids),
            voting_methods: normalize(&self.voting_methods),
            scanner_ids: normalize(&self.scanner_ids),
            batch_ids: normalize(&self.batch_ids),
        }
    }
}

/// Independent boolean axes determining how results are partitioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupBy {
    #[serde(default)]
    pub by_ballot_style: bool,
    #[serde(default)]
    pub by_batch: bool,
    #[serde(default)]
    pub by_party: bool,
    #[serde(default)]
    pub by_precinct: bool,
    #[serde(default)]
    pub by_scanner: bool,
    #[serde(default)]
    pub by_voting_method: bool,
}

impl GroupBy {
    pub fn is_empty(&self) -> bool {
        !(self.by_ballot_style
            || self.by_batch
            || self.by_party
            || self.by_precinct
            || self.by_scanner
            || self.by_voting_method)
    }

    /// Whether every active axis can be enumerated from the election
    /// definition ahead of tabulation. Batches and scanners are only known
    /// from imported files, so their groups cannot be pre-seeded.
    pub fn is_enumerable(&self) -> bool {
        !(self.by_batch || self.by_scanner)
    }
}

/// The partition values identifying one group of results. Only the fields
/// matching active [`GroupBy`] axes are populated. Ordering is derived so
/// group maps keyed by specifier iterate deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupSpecifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ballot_style_group_id: Option<BallotStyleGroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precinct_id: Option<PrecinctId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_id: Option<ScannerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voting_method: Option<VotingMethod>,
}

/// Ballot-level counts for one group, independent of contest tallies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardCounts {
    /// Digitally marked (ballot-measure device) cards
    pub bmd: u64,
    /// Hand-marked paper ballot cards, indexed by sheet position (index 0 =
    /// sheet 1). A ballot style may span multiple sheets.
    pub hmpb: Vec<u64>,
    /// Manually entered ballots
    pub manual: u64,
}

impl CardCounts {
    pub fn add_card(&mut self, card: Card) {
        match card {
            Card::Bmd => self.bmd += 1,
            Card::Hmpb { sheet_number } => {
                let index = sheet_number.saturating_sub(1) as usize;
                if self.hmpb.len() <= index {
                    self.hmpb.resize(index + 1, 0);
                }
                self.hmpb[index] += 1;
            }
        }
    }

    /// Total ballots: digital plus first-sheet hand-marked plus manual.
    /// Subsequent sheets belong to a ballot already counted via sheet one.
    pub fn total(&self) -> u64 {
        self.bmd + self.hmpb.first().copied().unwrap_or(0) + self.manual
    }

    pub fn combine(&mut self, other: &CardCounts) {
        self.bmd += other.bmd;
        self.manual += other.manual;
        if self.hmpb.len() < other.hmpb.len() {
            self.hmpb.resize(other.hmpb.len(), 0);
        }
        for (index, count) in other.hmpb.iter().enumerate() {
            self.hmpb[index] += count;
        }
    }
}

/// One tally line in a candidate contest: an official candidate, a named
/// write-in candidate, or the pending write-in placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTally {
    pub id: String,
    pub name: String,
    pub is_write_in: bool,
    pub tally: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateContestResults {
    pub contest_id: ContestId,
    pub votes_allowed: u32,
    pub ballots: u64,
    pub overvotes: u64,
    pub undervotes: u64,
    /// Official candidates in contest order, then write-in candidates and
    /// the pending placeholder appended by the aggregation engine.
    pub tallies: Vec<CandidateTally>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YesNoContestResults {
    pub contest_id: ContestId,
    pub yes_option_id: String,
    pub no_option_id: String,
    pub ballots: u64,
    pub overvotes: u64,
    pub undervotes: u64,
    pub yes_tally: u64,
    pub no_tally: u64,
}

/// Per-contest results for one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "contest_type", rename_all = "kebab-case")]
pub enum ContestResults {
    Candidate(CandidateContestResults),
    YesNo(YesNoContestResults),
}

impl ContestResults {
    pub fn contest_id(&self) -> &str {
        match self {
            ContestResults::Candidate(results) => &results.contest_id,
            ContestResults::YesNo(results) => &results.contest_id,
        }
    }

    pub fn ballots(&self) -> u64 {
        match self {
            ContestResults::Candidate(results) => results.ballots,
            ContestResults::YesNo(results) => results.ballots,
        }
    }

    pub fn overvotes(&self) -> u64 {
        match self {
            ContestResults::Candidate(results) => results.overvotes,
            ContestResults::YesNo(results) => results.overvotes,
        }
    }

    pub fn undervotes(&self) -> u64 {
        match self {
            ContestResults::Candidate(results) => results.undervotes,
            ContestResults::YesNo(results) => results.undervotes,
        }
    }
}

/// Empty results for a candidate contest: zero tallies for every official
/// candidate, no write-in rows yet.
pub fn empty_candidate_contest_results(contest: &CandidateContest) -> CandidateContestResults {
    CandidateContestResults {
        contest_id: contest.id.clone(),
        votes_allowed: contest.seats,
        ballots: 0,
        overvotes: 0,
        undervotes: 0,
        tallies: contest
            .candidates
            .iter()
            .map(|candidate| CandidateTally {
                id: candidate.id.clone(),
                name: candidate.name.clone(),
                is_write_in: false,
                tally: 0,
            })
            .collect(),
    }
}

pub fn empty_yes_no_contest_results(contest: &YesNoContest) -> YesNoContestResults {
    YesNoContestResults {
        contest_id: contest.id.clone(),
        yes_option_id: contest.yes_option_id.clone(),
        no_option_id: contest.no_option_id.clone(),
        ballots: 0,
        overvotes: 0,
        undervotes: 0,
        yes_tally: 0,
        no_tally: 0,
    }
}

/// Aggregated output for one group: card counts plus per-contest tallies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub group: GroupSpecifier,
    pub card_counts: CardCounts,
    /// Set for elections with party-segmented ballot styles; the per-party
    /// card-count breakdown is populated exactly when this is true.
    pub has_party_splits: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub card_counts_by_party: BTreeMap<PartyId, CardCounts>,
    /// Contest results in election-definition order.
    pub contest_results: Vec<ContestResults>,
}

/// Card counts plus group identity, the payload of `get_card_counts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedCardCounts {
    pub group: GroupSpecifier,
    pub card_counts: CardCounts,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub card_counts_by_party: BTreeMap<PartyId, CardCounts>,
}

/// Election-definition derived context needed to seed empty groups; see
/// [`GroupBy::is_enumerable`].
pub fn expected_group_specifiers(election: &Election, group_by: &GroupBy) -> Vec<GroupSpecifier> {
    if group_by.is_empty() || !group_by.is_enumerable() {
        return Vec::new();
    }

    let mut specifiers: Vec<GroupSpecifier> = Vec::new();
    for group_id in election.ballot_style_group_ids() {
        let party_id = election.party_for_ballot_style_group(&group_id).cloned();
        for precinct_id in election.precincts_for_ballot_style_group(&group_id) {
            for voting_method in VotingMethod::all() {
                let specifier = GroupSpecifier {
                    ballot_style_group_id: group_by
                        .by_ballot_style
                        .then(|| group_id.clone()),
                    batch_id: None,
                    party_id: group_by.by_party.then(|| party_id.clone()).flatten(),
                    precinct_id: group_by.by_precinct.then(|| precinct_id.clone()),
                    scanner_id: None,
                    voting_method: group_by.by_voting_method.then_some(voting_method),
                };
                if !specifiers.contains(&specifier) {
                    specifiers.push(specifier);
                }
            }
        }
    }
    specifiers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_normalization_sorts_and_dedups() {
        let filter = Filter {
            precinct_ids: Some(vec![
                "precinct-2".to_string(),
                "precinct-1".to_string(),
                "precinct-2".to_string(),
            ]),
            ..Filter::default()
        };
        let normalized = filter.normalized();
        assert_eq!(
            normalized.precinct_ids,
            Some(vec!["precinct-1".to_string(), "precinct-2".to_string()])
        );
        assert_eq!(normalized, normalized.normalized());
    }

    #[test]
    fn card_counts_track_sheet_positions() {
        let mut counts = CardCounts::default();
        counts.add_card(Card::Bmd);
        counts.add_card(Card::Hmpb { sheet_number: 1 });
        counts.add_card(Card::Hmpb { sheet_number: 3 });
        assert_eq!(counts.bmd, 1);
        assert_eq!(counts.hmpb, vec![1, 0, 1]);
        assert_eq!(counts.total(), 2);

        let mut other = CardCounts::default();
        other.add_card(Card::Hmpb { sheet_number: 2 });
        other.manual = 5;
        counts.combine(&other);
        assert_eq!(counts.hmpb, vec![1, 1, 1]);
        assert_eq!(counts.manual, 5);
    }

    #[test]
    fn group_by_enumerability() {
        let by_precinct = GroupBy {
            by_precinct: true,
            ..GroupBy::default()
        };
        assert!(by_precinct.is_enumerable());

        let by_batch = GroupBy {
            by_batch: true,
            ..GroupBy::default()
        };
        assert!(!by_batch.is_enumerable());
    }
}
