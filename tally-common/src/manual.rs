//! Manual results types
//!
//! Manually entered tallies cover ballots that never went through a scanner
//! (e.g. hand counts of damaged ballots). Each entry is keyed by precinct,
//! ballot style group, and voting method, and replaces any previous entry
//! for that key.

use crate::election::{BallotStyleGroupId, CandidateId, ContestId, PrecinctId, VotingMethod};
use crate::tabulation::ContestResults;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The unique key of one manual results entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManualResultsKey {
    pub precinct_id: PrecinctId,
    pub ballot_style_group_id: BallotStyleGroupId,
    pub voting_method: VotingMethod,
}

/// Tester-entered tallies for one candidate contest. Write-in tallies are
/// keyed by candidate *name*; the backend resolves names to write-in
/// candidate records when the entry is stored. Zero tallies are dropped and
/// create no candidate reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualCandidateContestInput {
    pub ballots: u64,
    pub overvotes: u64,
    pub undervotes: u64,
    #[serde(default)]
    pub official_tallies: BTreeMap<CandidateId, u64>,
    #[serde(default)]
    pub write_in_tallies: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualYesNoContestInput {
    pub ballots: u64,
    pub overvotes: u64,
    pub undervotes: u64,
    pub yes_tally: u64,
    pub no_tally: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "contest_type", rename_all = "kebab-case")]
pub enum ManualContestInput {
    Candidate(ManualCandidateContestInput),
    YesNo(ManualYesNoContestInput),
}

/// One manual results entry as submitted by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualResultsInput {
    pub ballot_count: u64,
    #[serde(default)]
    pub contest_results: BTreeMap<ContestId, ManualContestInput>,
}

/// One manual results entry as stored: write-in names resolved to candidate
/// records, contest results in the shared tabulation shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualResultsRecord {
    pub key: ManualResultsKey,
    pub ballot_count: u64,
    pub contest_results: Vec<ContestResults>,
}
