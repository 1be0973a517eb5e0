//! Database access layer
//!
//! Schema creation plus per-domain query modules for elections, imported
//! files, cast vote records, write-ins, and manual results.

pub mod cvrs;
pub mod elections;
pub mod files;
pub mod init;
pub mod manual;
pub mod write_ins;

pub use init::*;
