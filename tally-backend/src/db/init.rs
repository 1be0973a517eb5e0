//! Database initialization
//!
//! Creates the connection pool and the schema. Schema creation is
//! idempotent (`CREATE TABLE IF NOT EXISTS`), so startup against an
//! existing database is safe.

use crate::error::Result;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Initialize database connection pool and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    configure_connection(&pool).await?;
    create_schema(&pool).await?;

    Ok(pool)
}

/// Initialize an in-memory database. Test-oriented, but usable anywhere a
/// throwaway store is wanted.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        // A single connection so every handle sees the same in-memory db
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    configure_connection(&pool).await?;
    create_schema(&pool).await?;
    Ok(pool)
}

async fn configure_connection(pool: &SqlitePool) -> Result<()> {
    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    // WAL allows concurrent readers with one writer
    sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;

    // Wait out short-lived writer contention instead of failing
    sqlx::query("PRAGMA busy_timeout = 5000").execute(pool).await?;

    Ok(())
}

/// Create all tables. Order matters for foreign key references.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_elections_table(pool).await?;
    create_cvr_files_table(pool).await?;
    create_scanner_batches_table(pool).await?;
    create_cvrs_table(pool).await?;
    create_cvr_file_entries_table(pool).await?;
    create_write_in_candidates_table(pool).await?;
    create_write_ins_table(pool).await?;
    create_manual_results_tables(pool).await?;
    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_elections_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS elections (
            id TEXT PRIMARY KEY,
            definition TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_cvr_files_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cvr_files (
            id TEXT PRIMARY KEY,
            election_id TEXT NOT NULL REFERENCES elections(id),
            filename TEXT NOT NULL,
            sha256_hash TEXT NOT NULL,
            is_test_mode INTEGER NOT NULL,
            exported_at TEXT NOT NULL,
            cvr_count INTEGER NOT NULL DEFAULT 0,
            precinct_ids TEXT NOT NULL DEFAULT '[]',
            scanner_ids TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (election_id, sha256_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_scanner_batches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scanner_batches (
            id TEXT NOT NULL,
            election_id TEXT NOT NULL REFERENCES elections(id),
            label TEXT NOT NULL,
            scanner_id TEXT NOT NULL,
            PRIMARY KEY (election_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_cvrs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cvrs (
            id TEXT PRIMARY KEY,
            election_id TEXT NOT NULL REFERENCES elections(id),
            ballot_id TEXT NOT NULL,
            ballot_style_id TEXT NOT NULL,
            ballot_style_group_id TEXT NOT NULL,
            party_id TEXT,
            precinct_id TEXT NOT NULL,
            voting_method TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            scanner_id TEXT NOT NULL,
            sheet_number INTEGER,
            votes TEXT NOT NULL,
            UNIQUE (election_id, ballot_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_cvr_file_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cvr_file_entries (
            cvr_file_id TEXT NOT NULL REFERENCES cvr_files(id) ON DELETE CASCADE,
            cvr_id TEXT NOT NULL REFERENCES cvrs(id),
            PRIMARY KEY (cvr_file_id, cvr_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_write_in_candidates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS write_in_candidates (
            id TEXT PRIMARY KEY,
            election_id TEXT NOT NULL REFERENCES elections(id),
            contest_id TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE (election_id, contest_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_write_ins_table(pool: &SqlitePool) -> Result<()> {
    // sequence_id provides the stable adjudication queue order: rows are
    // inserted in import order, ballot position order within a ballot.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS write_ins (
            sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            election_id TEXT NOT NULL REFERENCES elections(id),
            cvr_id TEXT NOT NULL REFERENCES cvrs(id),
            contest_id TEXT NOT NULL,
            option_id TEXT NOT NULL,
            side TEXT,
            is_invalid INTEGER NOT NULL DEFAULT 0,
            official_candidate_id TEXT,
            write_in_candidate_id TEXT REFERENCES write_in_candidates(id),
            adjudicated_at TEXT,
            UNIQUE (cvr_id, contest_id, option_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_manual_results_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manual_results (
            id TEXT PRIMARY KEY,
            election_id TEXT NOT NULL REFERENCES elections(id),
            precinct_id TEXT NOT NULL,
            ballot_style_group_id TEXT NOT NULL,
            voting_method TEXT NOT NULL,
            ballot_count INTEGER NOT NULL,
            contest_results TEXT NOT NULL,
            UNIQUE (election_id, precinct_id, ballot_style_group_id, voting_method)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manual_results_write_in_candidates (
            manual_result_id TEXT NOT NULL REFERENCES manual_results(id) ON DELETE CASCADE,
            write_in_candidate_id TEXT NOT NULL REFERENCES write_in_candidates(id),
            PRIMARY KEY (manual_result_id, write_in_candidate_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
