//! Tabulation cache integration tests
//!
//! Covers cache coherence across mutations, in-flight computation sharing,
//! and the cache-bypassing single-record lookup.

mod helpers;

use helpers::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tally_backend::import::report::ReportType;
use tally_backend::write_ins::WriteInAdjudication;
use tally_backend::{import, manual_results, tabulation, write_ins, AppState};
use tally_common::election::VotingMethod;
use tally_common::manual::{ManualResultsInput, ManualResultsKey};
use tally_common::tabulation::{Filter, GroupBy};

async fn seed(app: &AppState) {
    let election = general_election();
    configure(app, &election).await;

    let dir = tempfile::tempdir().unwrap();
    let bundle_dir = dir.path().join("report");
    let records = vec![
        report_record(
            "ballot-0",
            "1-en",
            "precinct-1",
            VotingMethod::Precinct,
            &[("mayor", &["write-in-0"])],
        ),
        report_record(
            "ballot-1",
            "1-en",
            "precinct-1",
            VotingMethod::Precinct,
            &[("mayor", &["alice"])],
        ),
    ];
    write_report_bundle(
        &bundle_dir,
        &report_metadata(&election, ReportType::Official),
        &records,
    );
    import::import_cast_vote_record_report(app, &bundle_dir)
        .await
        .unwrap();
}

#[tokio::test]
async fn repeated_reads_hit_the_cache() {
    let app = test_app().await;
    seed(&app).await;

    let filter = Filter::default();
    let group_by = GroupBy {
        by_precinct: true,
        ..GroupBy::default()
    };

    let first = tabulation::get_aggregate_results(&app, &filter, group_by)
        .await
        .unwrap();
    assert_eq!(app.full_scan_count(), 1);

    // Bit-identical result, no further corpus scan
    let second = tabulation::get_aggregate_results(&app, &filter, group_by)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(app.full_scan_count(), 1);

    // Card counts share the same cache entry as the full results
    tabulation::get_card_counts(&app, &filter, group_by)
        .await
        .unwrap();
    assert_eq!(app.full_scan_count(), 1);

    // Equivalent filters normalize to the same key: unordered, duplicated
    // id sets cost one scan between them
    let unsorted = Filter {
        precinct_ids: Some(vec![
            "precinct-2".to_string(),
            "precinct-1".to_string(),
            "precinct-2".to_string(),
        ]),
        ..Filter::default()
    };
    let sorted = Filter {
        precinct_ids: Some(vec!["precinct-1".to_string(), "precinct-2".to_string()]),
        ..Filter::default()
    };
    let from_unsorted = tabulation::get_aggregate_results(&app, &unsorted, group_by)
        .await
        .unwrap();
    assert_eq!(app.full_scan_count(), 2);
    let from_sorted = tabulation::get_aggregate_results(&app, &sorted, group_by)
        .await
        .unwrap();
    assert_eq!(app.full_scan_count(), 2);
    assert_eq!(from_unsorted, from_sorted);
}

#[tokio::test]
async fn every_mutation_kind_invalidates() {
    let app = test_app().await;
    seed(&app).await;

    let filter = Filter::default();
    let group_by = GroupBy::default();

    let read = || tabulation::get_aggregate_results(&app, &filter, group_by);

    read().await.unwrap();
    assert_eq!(app.full_scan_count(), 1);

    // Adjudication invalidates
    let queue = write_ins::get_write_in_adjudication_queue(&app, Some("mayor"))
        .await
        .unwrap();
    write_ins::adjudicate_write_in(&app, &queue[0], WriteInAdjudication::Invalid)
        .await
        .unwrap();
    read().await.unwrap();
    assert_eq!(app.full_scan_count(), 2);

    // Manual results set/delete invalidate
    let key = ManualResultsKey {
        precinct_id: "precinct-1".to_string(),
        ballot_style_group_id: "1".to_string(),
        voting_method: VotingMethod::Absentee,
    };
    manual_results::set_manual_results(
        &app,
        &key,
        &ManualResultsInput {
            ballot_count: 2,
            contest_results: BTreeMap::new(),
        },
    )
    .await
    .unwrap();
    read().await.unwrap();
    assert_eq!(app.full_scan_count(), 3);

    manual_results::delete_manual_results(&app, &key)
        .await
        .unwrap();
    read().await.unwrap();
    assert_eq!(app.full_scan_count(), 4);

    // Clearing files invalidates
    import::clear_cast_vote_record_files(&app).await.unwrap();
    read().await.unwrap();
    assert_eq!(app.full_scan_count(), 5);

    // And with no further mutation, reads stay cached
    read().await.unwrap();
    assert_eq!(app.full_scan_count(), 5);
}

#[tokio::test]
async fn reads_reflect_exactly_the_committed_mutations() {
    let app = test_app().await;
    seed(&app).await;

    let filter = Filter::default();
    let group_by = GroupBy::default();

    let before = tabulation::get_aggregate_results(&app, &filter, group_by)
        .await
        .unwrap();

    let queue = write_ins::get_write_in_adjudication_queue(&app, Some("mayor"))
        .await
        .unwrap();
    write_ins::adjudicate_write_in(
        &app,
        &queue[0],
        WriteInAdjudication::OfficialCandidate {
            candidate_id: "alice".to_string(),
        },
    )
    .await
    .unwrap();

    let after = tabulation::get_aggregate_results(&app, &filter, group_by)
        .await
        .unwrap();
    assert_ne!(before, after);

    // Re-reading without mutation returns the identical result
    let again = tabulation::get_aggregate_results(&app, &filter, group_by)
        .await
        .unwrap();
    assert_eq!(after, again);
}

#[tokio::test]
async fn concurrent_reads_of_one_key_share_a_single_computation() {
    let app = Arc::new(test_app().await);
    seed(&app).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            tabulation::get_card_counts(&app, &Filter::default(), GroupBy::default())
                .await
                .unwrap()
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    for result in &results[1..] {
        assert_eq!(result, &results[0]);
    }
    assert_eq!(app.full_scan_count(), 1);
}

#[tokio::test]
async fn single_record_lookups_bypass_the_cache() {
    let app = test_app().await;
    seed(&app).await;

    let queue = write_ins::get_write_in_adjudication_queue(&app, Some("mayor"))
        .await
        .unwrap();
    let record = write_ins::get_write_in_record(&app, &queue[0]).await.unwrap();

    let cvr = import::get_cast_vote_record(&app, &record.cvr_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cvr.votes["mayor"], vec!["write-in-0".to_string()]);

    // The targeted lookup neither consulted nor warmed the cache
    assert_eq!(app.full_scan_count(), 0);
}
