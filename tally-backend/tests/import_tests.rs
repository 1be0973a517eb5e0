//! Cast vote record import integration tests
//!
//! Covers idempotent re-import, the file-mode lock, ballot-id conflict
//! handling, all-or-nothing validation failures, and file clearing.

mod helpers;

use helpers::*;
use tally_backend::db::files::FileMode;
use tally_backend::import::report::{ReportType, REPORT_METADATA_FILENAME};
use tally_backend::{import, write_ins, ImportError};
use tally_common::election::VotingMethod;
use tally_common::tabulation::{Filter, GroupBy};

fn simple_records(count: usize) -> Vec<tally_backend::import::report::ReportRecord> {
    (0..count)
        .map(|i| {
            report_record(
                &format!("ballot-{i}"),
                "1-en",
                "precinct-1",
                VotingMethod::Precinct,
                &[("mayor", &["alice"]), ("measure-1", &["yes"])],
            )
        })
        .collect()
}

#[tokio::test]
async fn import_and_reimport_is_idempotent() {
    let app = test_app().await;
    let election = general_election();
    configure(&app, &election).await;

    let dir = tempfile::tempdir().unwrap();
    let bundle_dir = dir.path().join("report-1");
    write_report_bundle(
        &bundle_dir,
        &report_metadata(&election, ReportType::Official),
        &simple_records(30),
    );

    let first = import::import_cast_vote_record_report(&app, &bundle_dir)
        .await
        .unwrap();
    assert_eq!(first.newly_added, 30);
    assert_eq!(first.already_present, 0);
    assert!(!first.was_existing_file);
    assert_eq!(first.file_mode, FileMode::Official);
    assert_eq!(first.scanner_ids, vec!["scanner-1".to_string()]);
    assert_eq!(import::get_cast_vote_record_count(&app).await.unwrap(), 30);

    // Byte-identical re-import: no error, nothing added
    let second = import::import_cast_vote_record_report(&app, &bundle_dir)
        .await
        .unwrap();
    assert!(second.was_existing_file);
    assert_eq!(second.newly_added, 0);
    assert_eq!(second.already_present, 30);
    assert_eq!(import::get_cast_vote_record_count(&app).await.unwrap(), 30);
    assert_eq!(
        import::get_cast_vote_record_files(&app).await.unwrap().len(),
        1
    );

    // The re-import did not change any aggregate
    let before = tally_backend::tabulation::get_aggregate_results(
        &app,
        &Filter::default(),
        GroupBy::default(),
    )
    .await
    .unwrap();
    let third = import::import_cast_vote_record_report(&app, &bundle_dir)
        .await
        .unwrap();
    assert!(third.was_existing_file);
    let after = tally_backend::tabulation::get_aggregate_results(
        &app,
        &Filter::default(),
        GroupBy::default(),
    )
    .await
    .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn file_mode_locks_after_first_import() {
    let app = test_app().await;
    let election = general_election();
    configure(&app, &election).await;

    let dir = tempfile::tempdir().unwrap();
    let official_dir = dir.path().join("official");
    write_report_bundle(
        &official_dir,
        &report_metadata(&election, ReportType::Official),
        &simple_records(5),
    );
    import::import_cast_vote_record_report(&app, &official_dir)
        .await
        .unwrap();
    assert_eq!(
        import::get_cast_vote_record_file_mode(&app).await.unwrap(),
        Some(FileMode::Official)
    );

    let test_dir = dir.path().join("test");
    let mut test_records = simple_records(3);
    for (i, record) in test_records.iter_mut().enumerate() {
        record.ballot_id = format!("test-ballot-{i}");
    }
    write_report_bundle(
        &test_dir,
        &report_metadata(&election, ReportType::Test),
        &test_records,
    );

    let error = import::import_cast_vote_record_report(&app, &test_dir)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ImportError::InvalidReportFileMode {
            current_mode: FileMode::Official
        }
    ));
    // Corpus unchanged
    assert_eq!(import::get_cast_vote_record_count(&app).await.unwrap(), 5);

    // Clearing unlocks the mode; a test report then imports cleanly
    import::clear_cast_vote_record_files(&app).await.unwrap();
    assert_eq!(
        import::get_cast_vote_record_file_mode(&app).await.unwrap(),
        None
    );
    import::import_cast_vote_record_report(&app, &test_dir)
        .await
        .unwrap();
    assert_eq!(
        import::get_cast_vote_record_file_mode(&app).await.unwrap(),
        Some(FileMode::Test)
    );
}

#[tokio::test]
async fn divergent_ballot_id_rejects_the_whole_file() {
    let app = test_app().await;
    let election = general_election();
    configure(&app, &election).await;

    let dir = tempfile::tempdir().unwrap();
    let first_dir = dir.path().join("first");
    write_report_bundle(
        &first_dir,
        &report_metadata(&election, ReportType::Official),
        &simple_records(3),
    );
    import::import_cast_vote_record_report(&app, &first_dir)
        .await
        .unwrap();

    // Second file: reuses ballot-0 with different votes, plus a new ballot
    let second_dir = dir.path().join("second");
    let records = vec![
        report_record(
            "ballot-0",
            "1-en",
            "precinct-1",
            VotingMethod::Precinct,
            &[("mayor", &["bob"]), ("measure-1", &["no"])],
        ),
        report_record(
            "ballot-new",
            "1-en",
            "precinct-1",
            VotingMethod::Precinct,
            &[("mayor", &["alice"])],
        ),
    ];
    write_report_bundle(
        &second_dir,
        &report_metadata(&election, ReportType::Official),
        &records,
    );

    let error = import::import_cast_vote_record_report(&app, &second_dir)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ImportError::DuplicateIdConflict { line: 1, ref ballot_id } if ballot_id == "ballot-0"
    ));

    // Nothing from the second file landed, including the novel ballot
    assert_eq!(import::get_cast_vote_record_count(&app).await.unwrap(), 3);
    assert_eq!(
        import::get_cast_vote_record_files(&app).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn identical_record_in_second_file_counts_as_already_present() {
    let app = test_app().await;
    let election = general_election();
    configure(&app, &election).await;

    let dir = tempfile::tempdir().unwrap();
    let first_dir = dir.path().join("first");
    write_report_bundle(
        &first_dir,
        &report_metadata(&election, ReportType::Official),
        &simple_records(3),
    );
    import::import_cast_vote_record_report(&app, &first_dir)
        .await
        .unwrap();

    // Overlapping file: ballot-0 identical, one new ballot
    let second_dir = dir.path().join("second");
    let mut records = simple_records(1);
    records.push(report_record(
        "ballot-extra",
        "1-en",
        "precinct-2",
        VotingMethod::Absentee,
        &[("mayor", &["bob"])],
    ));
    write_report_bundle(
        &second_dir,
        &report_metadata(&election, ReportType::Official),
        &records,
    );

    let summary = import::import_cast_vote_record_report(&app, &second_dir)
        .await
        .unwrap();
    assert_eq!(summary.newly_added, 1);
    assert_eq!(summary.already_present, 1);
    assert!(!summary.was_existing_file);
    assert_eq!(import::get_cast_vote_record_count(&app).await.unwrap(), 4);
}

#[tokio::test]
async fn validation_failures_leave_no_partial_state() {
    let app = test_app().await;
    let election = general_election();
    configure(&app, &election).await;
    let dir = tempfile::tempdir().unwrap();

    // Missing records file: structural failure
    let broken_dir = dir.path().join("broken");
    std::fs::create_dir_all(&broken_dir).unwrap();
    std::fs::write(
        broken_dir.join(REPORT_METADATA_FILENAME),
        serde_json::to_string(&report_metadata(&election, ReportType::Official)).unwrap(),
    )
    .unwrap();
    let error = import::import_cast_vote_record_report(&app, &broken_dir)
        .await
        .unwrap_err();
    assert!(matches!(error, ImportError::InvalidReportStructure(_)));

    // Record referencing an unknown precinct: rejected mid-file, nothing kept
    let invalid_dir = dir.path().join("invalid");
    let mut records = simple_records(2);
    records.push(report_record(
        "ballot-bad",
        "1-en",
        "precinct-404",
        VotingMethod::Precinct,
        &[("mayor", &["alice"])],
    ));
    write_report_bundle(
        &invalid_dir,
        &report_metadata(&election, ReportType::Official),
        &records,
    );
    let error = import::import_cast_vote_record_report(&app, &invalid_dir)
        .await
        .unwrap_err();
    assert!(matches!(error, ImportError::InvalidRecord { line: 3, .. }));

    assert_eq!(import::get_cast_vote_record_count(&app).await.unwrap(), 0);
    assert!(import::get_cast_vote_record_files(&app)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        import::get_cast_vote_record_file_mode(&app).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn report_for_another_election_is_rejected() {
    let app = test_app().await;
    let election = general_election();
    configure(&app, &election).await;

    let mut other = general_election();
    other.id = "election-other".to_string();

    let dir = tempfile::tempdir().unwrap();
    let bundle_dir = dir.path().join("other");
    write_report_bundle(
        &bundle_dir,
        &report_metadata(&other, ReportType::Official),
        &simple_records(1),
    );

    let error = import::import_cast_vote_record_report(&app, &bundle_dir)
        .await
        .unwrap_err();
    assert!(matches!(error, ImportError::WrongElection));
    assert_eq!(import::get_cast_vote_record_count(&app).await.unwrap(), 0);
}

#[tokio::test]
async fn clearing_files_resets_everything() {
    let app = test_app().await;
    let election = general_election();
    configure(&app, &election).await;

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
    import::import_cast_vote_record_report(&app, &bundle_dir)
        .await
        .unwrap();
    assert_eq!(
        write_ins::get_write_in_adjudication_queue(&app, None)
            .await
            .unwrap()
            .len(),
        1
    );

    import::clear_cast_vote_record_files(&app).await.unwrap();

    assert_eq!(import::get_cast_vote_record_count(&app).await.unwrap(), 0);
    assert!(import::get_cast_vote_record_files(&app)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        import::get_cast_vote_record_file_mode(&app).await.unwrap(),
        None
    );
    assert!(write_ins::get_write_in_adjudication_queue(&app, None)
        .await
        .unwrap()
        .is_empty());
    assert!(write_ins::list_write_in_candidates(&app, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn adjudication_queue_order_is_stable_across_imports() {
    let app = test_app().await;
    let election = general_election();
    configure(&app, &election).await;
    let dir = tempfile::tempdir().unwrap();

    let first_dir = dir.path().join("first");
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
            &[("mayor", &["write-in-0"])],
        ),
    ];
    write_report_bundle(
        &first_dir,
        &report_metadata(&election, ReportType::Official),
        &records,
    );
    import::import_cast_vote_record_report(&app, &first_dir)
        .await
        .unwrap();
    let queue_before = write_ins::get_write_in_adjudication_queue(&app, Some("mayor"))
        .await
        .unwrap();
    assert_eq!(queue_before.len(), 2);

    // A later file appends to the tail without disturbing the head
    let second_dir = dir.path().join("second");
    let records = vec![report_record(
        "ballot-2",
        "1-en",
        "precinct-2",
        VotingMethod::Absentee,
        &[("mayor", &["write-in-0"])],
    )];
    write_report_bundle(
        &second_dir,
        &report_metadata(&election, ReportType::Official),
        &records,
    );
    import::import_cast_vote_record_report(&app, &second_dir)
        .await
        .unwrap();

    let queue_after = write_ins::get_write_in_adjudication_queue(&app, Some("mayor"))
        .await
        .unwrap();
    assert_eq!(queue_after.len(), 3);
    assert_eq!(&queue_after[..2], &queue_before[..]);
}
