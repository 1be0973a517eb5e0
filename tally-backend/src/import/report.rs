//! Cast vote record report bundle reading
//!
//! A report is a directory holding a metadata document plus a record stream:
//!
//! ```text
//! <report-dir>/
//!   report.json      report-level metadata (mode, batches, timestamp)
//!   records.jsonl    one cast vote record document per line
//!   images/          optional ballot images, not read by tabulation
//! ```
//!
//! Records are stream-parsed line by line so a report with tens of
//! thousands of ballots is never materialized in memory.

use crate::db::files::{FileMode, ScannerBatch};
use crate::error::ImportError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tally_common::election::VotingMethod;

/// Name of the metadata document inside a report directory
pub const REPORT_METADATA_FILENAME: &str = "report.json";

/// Name of the record stream inside a report directory
pub const REPORT_RECORDS_FILENAME: &str = "records.jsonl";

/// Report-type marker distinguishing test and official exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportType {
    Test,
    Official,
    /// Export written directly by the originating scanner; always official
    OriginatingDeviceExport,
}

impl ReportType {
    pub fn file_mode(&self) -> FileMode {
        match self {
            ReportType::Test => FileMode::Test,
            ReportType::Official | ReportType::OriginatingDeviceExport => FileMode::Official,
        }
    }
}

/// Report-level metadata document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub election_id: String,
    pub generated_at: DateTime<Utc>,
    pub report_type: ReportType,
    pub batches: Vec<ScannerBatch>,
}

impl ReportMetadata {
    pub fn scanner_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.batches.iter().map(|b| b.scanner_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn batch(&self, batch_id: &str) -> Option<&ScannerBatch> {
        self.batches.iter().find(|b| b.id == batch_id)
    }
}

/// A write-in mark reference within one record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportWriteInMark {
    pub contest_id: String,
    pub option_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
}

/// One cast vote record document from the record stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRecord {
    pub ballot_id: String,
    pub ballot_style_id: String,
    pub precinct_id: String,
    pub voting_method: VotingMethod,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_number: Option<u32>,
    /// contest id -> vote option ids
    pub votes: BTreeMap<String, Vec<String>>,
    /// Side information for write-in marks; optional, marks with no entry
    /// default to no side
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_ins: Vec<ReportWriteInMark>,
}

/// An opened report bundle: validated structure plus parsed metadata
#[derive(Debug)]
pub struct ReportBundle {
    pub directory: PathBuf,
    pub metadata: ReportMetadata,
}

impl ReportBundle {
    pub fn filename(&self) -> String {
        self.directory
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.directory.display().to_string())
    }

    fn records_path(&self) -> PathBuf {
        self.directory.join(REPORT_RECORDS_FILENAME)
    }

    /// SHA-256 of the record stream, hex encoded. Identifies byte-identical
    /// re-imports.
    pub fn records_sha256(&self) -> Result<String, ImportError> {
        let mut file = File::open(self.records_path())?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Stream the record documents, yielding each with its 1-based line
    /// number for error reporting.
    pub fn records(&self) -> Result<RecordReader, ImportError> {
        let file = File::open(self.records_path())?;
        Ok(RecordReader {
            lines: BufReader::new(file).lines(),
            line: 0,
        })
    }
}

/// Streaming reader over `records.jsonl`
pub struct RecordReader {
    lines: std::io::Lines<BufReader<File>>,
    line: usize,
}

impl Iterator for RecordReader {
    type Item = Result<(usize, ReportRecord), ImportError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line += 1;
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(ImportError::Io(e))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(match serde_json::from_str::<ReportRecord>(&line) {
                Ok(record) => Ok((self.line, record)),
                Err(e) => Err(ImportError::MalformedRecord {
                    line: self.line,
                    message: e.to_string(),
                }),
            });
        }
    }
}

/// Validate the bundle structure and parse its metadata. Nothing is written
/// anywhere; failures here always leave the store untouched.
pub fn open_report_bundle(path: &Path) -> Result<ReportBundle, ImportError> {
    let directory = path.to_path_buf();
    let dir_metadata = std::fs::metadata(&directory)
        .map_err(|e| ImportError::InvalidFile(format!("{}: {e}", directory.display())))?;
    if !dir_metadata.is_dir() {
        return Err(ImportError::InvalidFile(format!(
            "{} is not a report directory",
            directory.display()
        )));
    }

    let metadata_path = directory.join(REPORT_METADATA_FILENAME);
    if !metadata_path.is_file() {
        return Err(ImportError::InvalidReportStructure(
            REPORT_METADATA_FILENAME.to_string(),
        ));
    }
    if !directory.join(REPORT_RECORDS_FILENAME).is_file() {
        return Err(ImportError::InvalidReportStructure(
            REPORT_RECORDS_FILENAME.to_string(),
        ));
    }

    let metadata_json = std::fs::read_to_string(&metadata_path)?;
    let metadata: ReportMetadata = serde_json::from_str(&metadata_json)
        .map_err(|e| ImportError::MalformedReportMetadata(e.to_string()))?;

    Ok(ReportBundle {
        directory,
        metadata,
    })
}
