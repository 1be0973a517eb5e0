//! Election storage and the current-election setting
//!
//! The process serves one election at a time. Definitions are stored as
//! parsed-and-reserialized JSON; the `current_election_id` settings key
//! selects the active one.

use crate::error::{Error, Result};
use crate::AppState;
use sqlx::{Row, SqlitePool};
use tally_common::election::Election;
use uuid::Uuid;

const CURRENT_ELECTION_ID_KEY: &str = "current_election_id";

/// A stored election: the row id scoping all other tables, plus the parsed
/// definition.
#[derive(Debug, Clone)]
pub struct ElectionRecord {
    pub id: String,
    pub election: Election,
}

/// Parse and store an election definition and make it current.
pub async fn configure(app: &AppState, election_json: &str) -> Result<ElectionRecord> {
    let election: Election = serde_json::from_str(election_json)
        .map_err(|e| Error::Common(tally_common::Error::InvalidInput(e.to_string())))?;

    let _guard = app.election_lock().write().await;
    let id = Uuid::new_v4().to_string();
    let definition = serde_json::to_string(&election)?;

    let mut tx = app.db.begin().await?;
    sqlx::query("INSERT INTO elections (id, definition) VALUES (?, ?)")
        .bind(&id)
        .bind(&definition)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT (key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(CURRENT_ELECTION_ID_KEY)
    .bind(&id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(election_id = %id, title = %election.title, "Configured election");
    Ok(ElectionRecord { id, election })
}

/// Clear the current-election setting. Stored data is retained but no
/// longer reachable through the API.
pub async fn unconfigure(app: &AppState) -> Result<()> {
    let _guard = app.election_lock().write().await;
    sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(CURRENT_ELECTION_ID_KEY)
        .execute(&app.db)
        .await?;
    Ok(())
}

/// Load the current election, if one is configured.
pub async fn get_current_election(db: &SqlitePool) -> Result<Option<ElectionRecord>> {
    let row = sqlx::query(
        r#"
        SELECT elections.id AS id, elections.definition AS definition
        FROM elections
        JOIN settings ON settings.value = elections.id
        WHERE settings.key = ?
        "#,
    )
    .bind(CURRENT_ELECTION_ID_KEY)
    .fetch_optional(db)
    .await?;

    match row {
        Some(row) => {
            let id: String = row.get("id");
            let definition: String = row.get("definition");
            let election: Election = serde_json::from_str(&definition)?;
            Ok(Some(ElectionRecord { id, election }))
        }
        None => Ok(None),
    }
}

/// Load the current election or fail with [`Error::NoElectionConfigured`].
pub async fn require_current_election(db: &SqlitePool) -> Result<ElectionRecord> {
    get_current_election(db)
        .await?
        .ok_or(Error::NoElectionConfigured)
}
