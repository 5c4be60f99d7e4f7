//! Purpose: Define the stable public Rust API boundary for ledgerstone.
//! Exports: Queue handle, appender surface, roll configuration, errors and validation reports.
//! Role: Public, additive-only surface; storage internals stay under `core`.
//! Invariants: Everything an application needs to append and read is reachable from here.

pub(crate) mod validation;

pub use crate::core::appender::{
    AppendOutcome, AppendState, Appender, BatchOutcome, BatchWrite, DocumentContext,
    WriteAtOutcome,
};
pub use crate::core::clock::{Clock, SetClock, SystemClock};
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::queue::{Queue, QueueMetadata, QueueOptions};
pub use crate::core::roll::{IndexEncoding, RollCycle};
pub use validation::{ValidationIssue, ValidationReport, ValidationStatus};
