//! Shared test fixtures: elections, report bundles, and app setup
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tally_backend::db::elections::{self, ElectionRecord};
use tally_backend::db::files::ScannerBatch;
use tally_backend::import::report::{
    ReportMetadata, ReportRecord, ReportType, REPORT_METADATA_FILENAME, REPORT_RECORDS_FILENAME,
};
use tally_backend::{db, AppState};
use tally_common::election::{
    BallotStyle, Candidate, CandidateContest, Contest, Election, Party, Precinct, VotingMethod,
    YesNoContest,
};

/// Fresh app state over an in-memory database
pub async fn test_app() -> AppState {
    let pool = db::init_memory_database().await.unwrap();
    AppState::new(pool)
}

/// A general election: one ballot style group with two language variants,
/// two precincts, two candidate contests and one ballot measure.
pub fn general_election() -> Election {
    Election {
        id: "election-general".to_string(),
        title: "General Election".to_string(),
        parties: vec![],
        precincts: vec![
            Precinct {
                id: "precinct-1".to_string(),
                name: "Precinct 1".to_string(),
            },
            Precinct {
                id: "precinct-2".to_string(),
                name: "Precinct 2".to_string(),
            },
        ],
        ballot_styles: vec![
            BallotStyle {
                id: "1-en".to_string(),
                group_id: "1".to_string(),
                party_id: None,
                district_ids: vec!["district-1".to_string()],
                precinct_ids: vec!["precinct-1".to_string(), "precinct-2".to_string()],
                language: Some("en".to_string()),
            },
            BallotStyle {
                id: "1-es".to_string(),
                group_id: "1".to_string(),
                party_id: None,
                district_ids: vec!["district-1".to_string()],
                precinct_ids: vec!["precinct-1".to_string(), "precinct-2".to_string()],
                language: Some("es".to_string()),
            },
        ],
        contests: vec![
            Contest::Candidate(CandidateContest {
                id: "mayor".to_string(),
                district_id: "district-1".to_string(),
                title: "Mayor".to_string(),
                seats: 1,
                allow_write_ins: true,
                candidates: vec![
                    Candidate {
                        id: "alice".to_string(),
                        name: "Alice Adams".to_string(),
                        party_id: None,
                    },
                    Candidate {
                        id: "bob".to_string(),
                        name: "Bob Brown".to_string(),
                        party_id: None,
                    },
                ],
                party_id: None,
            }),
            Contest::Candidate(CandidateContest {
                id: "council".to_string(),
                district_id: "district-1".to_string(),
                title: "City Council".to_string(),
                seats: 2,
                allow_write_ins: true,
                candidates: vec![
                    Candidate {
                        id: "carol".to_string(),
                        name: "Carol Clark".to_string(),
                        party_id: None,
                    },
                    Candidate {
                        id: "dave".to_string(),
                        name: "Dave Davis".to_string(),
                        party_id: None,
                    },
                ],
                party_id: None,
            }),
            Contest::YesNo(YesNoContest {
                id: "measure-1".to_string(),
                district_id: "district-1".to_string(),
                title: "Measure 1".to_string(),
                yes_option_id: "yes".to_string(),
                no_option_id: "no".to_string(),
            }),
        ],
    }
}

/// A two-party primary: party-segmented ballot styles in one precinct.
pub fn primary_election() -> Election {
    Election {
        id: "election-primary".to_string(),
        title: "Primary Election".to_string(),
        parties: vec![
            Party {
                id: "mammal".to_string(),
                name: "Mammal Party".to_string(),
                abbrev: "Ma".to_string(),
            },
            Party {
                id: "fish".to_string(),
                name: "Fish Party".to_string(),
                abbrev: "F".to_string(),
            },
        ],
        precincts: vec![Precinct {
            id: "precinct-1".to_string(),
            name: "Precinct 1".to_string(),
        }],
        ballot_styles: vec![
            BallotStyle {
                id: "1M".to_string(),
                group_id: "1M".to_string(),
                party_id: Some("mammal".to_string()),
                district_ids: vec!["district-1".to_string()],
                precinct_ids: vec!["precinct-1".to_string()],
                language: None,
            },
            BallotStyle {
                id: "1F".to_string(),
                group_id: "1F".to_string(),
                party_id: Some("fish".to_string()),
                district_ids: vec!["district-1".to_string()],
                precinct_ids: vec!["precinct-1".to_string()],
                language: None,
            },
        ],
        contests: vec![
            Contest::Candidate(CandidateContest {
                id: "best-animal-mammal".to_string(),
                district_id: "district-1".to_string(),
                title: "Best Animal".to_string(),
                seats: 1,
                allow_write_ins: true,
                candidates: vec![Candidate {
                    id: "otter".to_string(),
                    name: "Otter".to_string(),
                    party_id: Some("mammal".to_string()),
                }],
                party_id: Some("mammal".to_string()),
            }),
            Contest::Candidate(CandidateContest {
                id: "best-animal-fish".to_string(),
                district_id: "district-1".to_string(),
                title: "Best Animal".to_string(),
                seats: 1,
                allow_write_ins: true,
                candidates: vec![Candidate {
                    id: "salmon".to_string(),
                    name: "Salmon".to_string(),
                    party_id: Some("fish".to_string()),
                }],
                party_id: Some("fish".to_string()),
            }),
        ],
    }
}

pub async fn configure(app: &AppState, election: &Election) -> ElectionRecord {
    let election_json = serde_json::to_string(election).unwrap();
    elections::configure(app, &election_json).await.unwrap()
}

pub fn export_timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-11-05T20:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn report_metadata(election: &Election, report_type: ReportType) -> ReportMetadata {
    ReportMetadata {
        election_id: election.id.clone(),
        generated_at: export_timestamp(),
        report_type,
        batches: vec![
            ScannerBatch {
                id: "batch-1".to_string(),
                label: "Batch 1".to_string(),
                scanner_id: "scanner-1".to_string(),
            },
            ScannerBatch {
                id: "batch-2".to_string(),
                label: "Batch 2".to_string(),
                scanner_id: "scanner-2".to_string(),
            },
        ],
    }
}

/// One cast vote record document with the given votes.
pub fn report_record(
    ballot_id: &str,
    ballot_style_id: &str,
    precinct_id: &str,
    voting_method: VotingMethod,
    votes: &[(&str, &[&str])],
) -> ReportRecord {
    let votes: BTreeMap<String, Vec<String>> = votes
        .iter()
        .map(|(contest_id, option_ids)| {
            (
                contest_id.to_string(),
                option_ids.iter().map(|o| o.to_string()).collect(),
            )
        })
        .collect();
    ReportRecord {
        ballot_id: ballot_id.to_string(),
        ballot_style_id: ballot_style_id.to_string(),
        precinct_id: precinct_id.to_string(),
        voting_method,
        batch_id: "batch-1".to_string(),
        sheet_number: None,
        votes,
        write_ins: Vec::new(),
    }
}

/// Write a report bundle directory.
pub fn write_report_bundle(dir: &Path, metadata: &ReportMetadata, records: &[ReportRecord]) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join(REPORT_METADATA_FILENAME),
        serde_json::to_string_pretty(metadata).unwrap(),
    )
    .unwrap();
    let mut file = std::fs::File::create(dir.join(REPORT_RECORDS_FILENAME)).unwrap();
    for record in records {
        writeln!(file, "{}", serde_json::to_string(record).unwrap()).unwrap();
    }
}
