//! Election definition model
//!
//! The election definition is the authoritative description of what appears
//! on the ballot: contests, candidates, ballot styles, precincts, and
//! parties. It is loaded once per election from a JSON document and consulted
//! for validation during import, adjudication, and manual entry, and for
//! result ordering during tabulation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type BallotId = String;
pub type BallotStyleId = String;
pub type BallotStyleGroupId = String;
pub type BatchId = String;
pub type CandidateId = String;
pub type ContestId = String;
pub type DistrictId = String;
pub type PartyId = String;
pub type PrecinctId = String;
pub type ScannerId = String;

/// Prefix of vote option ids that denote a write-in slot on the ballot
/// (e.g. `write-in-0`, `write-in-1`).
pub const WRITE_IN_OPTION_PREFIX: &str = "write-in-";

/// How a ballot was cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VotingMethod {
    Precinct,
    Absentee,
    Provisional,
}

impl VotingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingMethod::Precinct => "precinct",
            VotingMethod::Absentee => "absentee",
            VotingMethod::Provisional => "provisional",
        }
    }

    pub fn parse(value: &str) -> Option<VotingMethod> {
        match value {
            "precinct" => Some(VotingMethod::Precinct),
            "absentee" => Some(VotingMethod::Absentee),
            "provisional" => Some(VotingMethod::Provisional),
            _ => None,
        }
    }

    /// All voting methods, in canonical reporting order.
    pub fn all() -> [VotingMethod; 3] {
        [
            VotingMethod::Precinct,
            VotingMethod::Absentee,
            VotingMethod::Provisional,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub id: PartyId,
    pub name: String,
    pub abbrev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Precinct {
    pub id: PrecinctId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateContest {
    pub id: ContestId,
    pub district_id: DistrictId,
    pub title: String,
    pub seats: u32,
    pub allow_write_ins: bool,
    pub candidates: Vec<Candidate>,
    /// For party-specific primary contests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YesNoContest {
    pub id: ContestId,
    pub district_id: DistrictId,
    pub title: String,
    pub yes_option_id: String,
    pub no_option_id: String,
}

/// A contest on the ballot, either a candidate race or a ballot measure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Contest {
    Candidate(CandidateContest),
    YesNo(YesNoContest),
}

impl Contest {
    pub fn id(&self) -> &str {
        match self {
            Contest::Candidate(contest) => &contest.id,
            Contest::YesNo(contest) => &contest.id,
        }
    }

    pub fn district_id(&self) -> &str {
        match self {
            Contest::Candidate(contest) => &contest.district_id,
            Contest::YesNo(contest) => &contest.district_id,
        }
    }

    /// Whether `option_id` is a valid vote option for this contest. Write-in
    /// slots are valid up to the number of seats in the contest.
    pub fn is_valid_option(&self, option_id: &str) -> bool {
        match self {
            Contest::Candidate(contest) => {
                if contest.candidates.iter().any(|c| c.id == option_id) {
                    return true;
                }
                if !contest.allow_write_ins {
                    return false;
                }
                match option_id.strip_prefix(WRITE_IN_OPTION_PREFIX) {
                    Some(index) => index
                        .parse::<u32>()
                        .map(|index| index < contest.seats)
                        .unwrap_or(false),
                    None => false,
                }
            }
            Contest::YesNo(contest) => {
                option_id == contest.yes_option_id || option_id == contest.no_option_id
            }
        }
    }
}

/// A ballot style: one printed layout of contests for a set of precincts.
/// Language variants of the same layout share a `group_id`; tabulation
/// always collapses styles to their group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotStyle {
    pub id: BallotStyleId,
    pub group_id: BallotStyleGroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<PartyId>,
    pub district_ids: Vec<DistrictId>,
    pub precinct_ids: Vec<PrecinctId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// The election definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Election {
    pub id: String,
    pub title: String,
    pub parties: Vec<Party>,
    pub precincts: Vec<Precinct>,
    pub ballot_styles: Vec<BallotStyle>,
    pub contests: Vec<Contest>,
}

impl Election {
    pub fn contest(&self, contest_id: &str) -> Option<&Contest> {
        self.contests.iter().find(|c| c.id() == contest_id)
    }

    pub fn candidate_contest(&self, contest_id: &str) -> Option<&CandidateContest> {
        match self.contest(contest_id) {
            Some(Contest::Candidate(contest)) => Some(contest),
            _ => None,
        }
    }

    pub fn ballot_style(&self, ballot_style_id: &str) -> Option<&BallotStyle> {
        self.ballot_styles.iter().find(|bs| bs.id == ballot_style_id)
    }

    pub fn precinct(&self, precinct_id: &str) -> Option<&Precinct> {
        self.precincts.iter().find(|p| p.id == precinct_id)
    }

    /// Distinct ballot style group ids, in definition order.
    pub fn ballot_style_group_ids(&self) -> Vec<BallotStyleGroupId> {
        let mut seen = HashSet::new();
        self.ballot_styles
            .iter()
            .filter(|bs| seen.insert(bs.group_id.clone()))
            .map(|bs| bs.group_id.clone())
            .collect()
    }

    /// All language variants sharing the given group id, in definition order.
    pub fn ballot_styles_in_group(&self, group_id: &str) -> Vec<&BallotStyle> {
        self.ballot_styles
            .iter()
            .filter(|bs| bs.group_id == group_id)
            .collect()
    }

    /// The party of a ballot style group, if any. Variants in a group always
    /// share a party.
    pub fn party_for_ballot_style_group(&self, group_id: &str) -> Option<&PartyId> {
        self.ballot_styles_in_group(group_id)
            .first()
            .and_then(|bs| bs.party_id.as_ref())
    }

    /// Precincts served by a ballot style group: the union of the variants'
    /// precinct lists, first-variant order, deduplicated.
    pub fn precincts_for_ballot_style_group(&self, group_id: &str) -> Vec<PrecinctId> {
        let mut seen = HashSet::new();
        self.ballot_styles_in_group(group_id)
            .iter()
            .flat_map(|bs| bs.precinct_ids.iter())
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }

    /// Contests in scope for a ballot style group: the union of the contests
    /// of each language variant (duplicates removed, order preserved from the
    /// first variant), each variant contributing its district contests in
    /// election-definition order.
    pub fn contests_for_ballot_style_group(&self, group_id: &str) -> Vec<&Contest> {
        let mut seen = HashSet::new();
        let mut contests = Vec::new();
        for style in self.ballot_styles_in_group(group_id) {
            for contest in &self.contests {
                if style.district_ids.iter().any(|d| d == contest.district_id())
                    && contest_matches_party(contest, style.party_id.as_deref())
                    && seen.insert(contest.id().to_string())
                {
                    contests.push(contest);
                }
            }
        }
        contests
    }

    /// Whether the election has party-segmented ballot styles (a primary).
    pub fn has_party_splits(&self) -> bool {
        self.ballot_styles.iter().any(|bs| bs.party_id.is_some())
    }

    /// Official candidate display name lookup.
    pub fn official_candidate_name(&self, contest_id: &str, candidate_id: &str) -> Option<&str> {
        self.candidate_contest(contest_id)?
            .candidates
            .iter()
            .find(|c| c.id == candidate_id)
            .map(|c| c.name.as_str())
    }
}

fn contest_matches_party(contest: &Contest, style_party: Option<&str>) -> bool {
    match contest {
        Contest::Candidate(contest) => match (&contest.party_id, style_party) {
            (Some(contest_party), Some(style_party)) => contest_party == style_party,
            (Some(_), None) => false,
            (None, _) => true,
        },
        Contest::YesNo(_) => true,
    }
}
