//! Error types for the tally backend
//!
//! Import has its own error taxonomy ([`ImportError`]) because the transport
//! layer renders a distinct user-facing message per failure class, and
//! because import failures must never leave partial state behind. Everything
//! else uses the backend-wide [`Error`].

use crate::db::files::FileMode;
use thiserror::Error;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, Error>;

/// Backend error type covering adjudication, manual results, and store access
#[derive(Debug, Error)]
pub enum Error {
    /// No election has been configured yet
    #[error("No election is currently configured")]
    NoElectionConfigured,

    /// A contest id not present in the election definition
    #[error("Unknown contest: {0}")]
    UnknownContest(String),

    /// A candidate id not valid for the referenced contest
    #[error("Unknown candidate: {0}")]
    UnknownCandidate(String),

    /// A write-in record id that does not exist
    #[error("Unknown write-in: {0}")]
    UnknownWriteIn(String),

    /// Manual results entry failed semantic validation
    #[error("Invalid manual results: {0}")]
    InvalidManualResults(String),

    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    /// I/O operation error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Shared library error
    #[error("Common error: {0}")]
    Common(#[from] tally_common::Error),
}

/// Semantic validation failure for a single cast vote record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordValidationError {
    #[error("the record references a non-existent ballot style")]
    InvalidBallotStyle,
    #[error("the record references a non-existent precinct")]
    InvalidPrecinct,
    #[error("the record references a scanning batch not declared in the report")]
    InvalidBatch,
    #[error("the record references an invalid sheet number")]
    InvalidSheetNumber,
    #[error("the record references a contest which does not exist for its ballot style")]
    InvalidContest,
    #[error("the record references a contest option which does not exist for the contest")]
    InvalidContestOption,
    #[error("the record references a write-in mark with no matching vote")]
    InvalidWriteInReference,
}

/// Errors importing a cast vote record report. Every variant before
/// `Store`/`Io` leaves the record store untouched.
#[derive(Debug, Error)]
pub enum ImportError {
    /// No election has been configured yet
    #[error("No election is currently configured")]
    NoElectionConfigured,

    /// Path unreadable or not a report bundle directory
    #[error("Unable to read cast vote record report: {0}")]
    InvalidFile(String),

    /// A required file of the bundle is missing
    #[error("Cast vote record report has invalid structure: missing {0}")]
    InvalidReportStructure(String),

    /// The report metadata document failed schema validation
    #[error("Unable to parse cast vote record report metadata: {0}")]
    MalformedReportMetadata(String),

    /// The report was exported for a different election
    #[error("The report references an election other than the current election")]
    WrongElection,

    /// The report's test/official mode conflicts with the election's locked
    /// file mode
    #[error("Report mode conflicts with previously imported {current_mode} results")]
    InvalidReportFileMode { current_mode: FileMode },

    /// An individual ballot record failed to parse
    #[error("Malformed cast vote record at line {line}: {message}")]
    MalformedRecord { line: usize, message: String },

    /// A record parsed but failed semantic validation
    #[error("Invalid cast vote record at line {line}: {reason}")]
    InvalidRecord {
        line: usize,
        reason: RecordValidationError,
    },

    /// The same ballot id is already present with different content
    #[error("Cast vote record at line {line} reuses ballot id {ballot_id} with different data")]
    DuplicateIdConflict { line: usize, ballot_id: String },

    /// Database operation error
    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    /// I/O operation error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal failure surfaced through the shared store layer
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<Error> for ImportError {
    fn from(error: Error) -> Self {
        match error {
            Error::NoElectionConfigured => ImportError::NoElectionConfigured,
            Error::Store(e) => ImportError::Store(e),
            Error::Io(e) => ImportError::Io(e),
            other => ImportError::Internal(other.to_string()),
        }
    }
}
