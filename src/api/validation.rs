//! Purpose: Provide a stable, serializable validation report model.
//! Exports: `ValidationReport`, `ValidationStatus`, `ValidationIssue`.
//! Role: Shared contract for queue verification and diagnostics tooling.
//! Invariants: Reports are additive-only; no payload bytes are embedded.
//! Invariants: Recoverable states (uncommitted tails, lagging markers) are warnings, not issues.

use crate::core::error::Error;
use crate::core::header::HeaderState;
use crate::core::store::CycleStore;
use crate::core::validate::scan_stream;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Ok,
    Corrupt,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    pub cycle: Option<u32>,
    pub seq: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationReport {
    pub path: PathBuf,
    pub status: ValidationStatus,
    pub cycles_checked: usize,
    /// Newest cycle holding a verified record, with that record's sequence.
    pub last_good_cycle: Option<u32>,
    pub last_good_seq: Option<u64>,
    pub issues: Vec<ValidationIssue>,
    pub issue_count: usize,
    pub remediation_hints: Vec<String>,
}

impl ValidationReport {
    pub fn ok(path: PathBuf) -> Self {
        Self {
            path,
            status: ValidationStatus::Ok,
            cycles_checked: 0,
            last_good_cycle: None,
            last_good_seq: None,
            issues: Vec::new(),
            issue_count: 0,
            remediation_hints: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ValidationStatus::Ok
    }

    pub fn set_issues(mut self, issues: Vec<ValidationIssue>) -> Self {
        self.issue_count = issues.len();
        self.issues = issues;
        self.status = if self.issue_count == 0 {
            ValidationStatus::Ok
        } else {
            ValidationStatus::Corrupt
        };
        if self.status == ValidationStatus::Corrupt {
            let hint =
                "Cycle file appears corrupt. Keep a copy, then truncate after the last good sequence."
                    .to_string();
            if !self.remediation_hints.contains(&hint) {
                self.remediation_hints.push(hint);
            }
        }
        self
    }

    fn set_last_good(mut self, cycle: u32, seq: Option<u64>) -> Self {
        if seq.is_some() {
            self.last_good_cycle = Some(cycle);
            self.last_good_seq = seq;
        }
        self
    }

    /// Combines per-cycle reports (oldest first) into one queue-level report.
    pub fn merge(path: PathBuf, reports: Vec<ValidationReport>) -> Self {
        let mut merged = ValidationReport::ok(path);
        let mut issues = Vec::new();
        for report in reports {
            merged.cycles_checked += report.cycles_checked;
            if let (Some(cycle), seq @ Some(_)) = (report.last_good_cycle, report.last_good_seq) {
                merged = merged.set_last_good(cycle, seq);
            }
            issues.extend(report.issues);
            for hint in report.remediation_hints {
                if !merged.remediation_hints.contains(&hint) {
                    merged.remediation_hints.push(hint);
                }
            }
        }
        merged.set_issues(issues)
    }
}

/// Checks one cycle without taking the write lock; in-flight tails are reported as warnings.
pub(crate) fn validate_store_report(store: &CycleStore) -> ValidationReport {
    let cycle = store.cycle();
    let mut report = ValidationReport::ok(store.path().to_path_buf());
    report.cycles_checked = 1;

    let scan = match scan_stream(store) {
        Ok(scan) => scan,
        Err((scan, err)) => {
            let last_good = scan.last_sequence();
            return report
                .set_last_good(cycle, last_good)
                .set_issues(vec![issue_from_error("corrupt", &err, cycle, last_good)]);
        }
    };
    report = report.set_last_good(cycle, scan.last_sequence());
    let mut issues = Vec::new();

    if scan.end_state == Some(HeaderState::Working) {
        report.remediation_hints.push(format!(
            "warning: cycle {cycle} has a reservation in progress at offset {}; the next append recovers it",
            scan.end
        ));
    }

    match store.write_position() {
        Ok(position) if position < scan.end => report.remediation_hints.push(format!(
            "warning: cycle {cycle} write position {position} trails committed records ending at {}",
            scan.end
        )),
        Ok(position) if position > scan.end => issues.push(issue(
            "corrupt",
            &format!("write position {position} is past the last record at {}", scan.end),
            cycle,
            scan.last_sequence(),
            Some(position as u64),
        )),
        Ok(_) => {}
        Err(err) => issues.push(issue_from_error("corrupt", &err, cycle, scan.last_sequence())),
    }

    match store.next_sequence() {
        Ok(next) if next < scan.data_records => report.remediation_hints.push(format!(
            "warning: cycle {cycle} sequence marker {next} trails {} committed records",
            scan.data_records
        )),
        Ok(next) if next > scan.data_records => issues.push(issue(
            "corrupt",
            &format!(
                "sequence marker claims {next} records but only {} are committed",
                scan.data_records
            ),
            cycle,
            scan.last_sequence(),
            None,
        )),
        Ok(_) => {}
        Err(err) => issues.push(issue_from_error("corrupt", &err, cycle, scan.last_sequence())),
    }

    if let Err(err) = store.index().verify() {
        issues.push(issue_from_error("index", &err, cycle, err.seq()));
        report
            .remediation_hints
            .push("Index is inconsistent; it is rebuilt on the next append recovery.".to_string());
    }

    report.set_issues(issues)
}

fn issue(
    code: &str,
    message: &str,
    cycle: u32,
    seq: Option<u64>,
    offset: Option<u64>,
) -> ValidationIssue {
    ValidationIssue {
        code: code.to_string(),
        message: message.to_string(),
        cycle: Some(cycle),
        seq,
        offset,
    }
}

fn issue_from_error(code: &str, err: &Error, cycle: u32, seq: Option<u64>) -> ValidationIssue {
    issue(code, &err.to_string(), cycle, seq, err.offset())
}

#[cfg(test)]
mod tests {
    use super::{ValidationIssue, ValidationReport, ValidationStatus, validate_store_report};
    use crate::core::format::INDEX_ARRAY_OFFSET;
    use crate::core::header;
    use crate::core::store::{CycleStore, StoreLayout};
    use std::path::PathBuf;

    fn fresh(dir: &std::path::Path) -> CycleStore {
        let layout = StoreLayout {
            capacity: 64 * 1024,
            index_count: 8,
            index_spacing: 2,
            sequence_bits: 32,
        };
        CycleStore::open(&dir.join("c.lgs"), 3, &layout, true)
            .expect("open")
            .expect("store")
    }

    fn commit(store: &CycleStore, payload: &[u8]) {
        let position = store.write_position().expect("position");
        let reservation =
            header::reserve(store.data(), position, payload.len(), false).expect("reserve");
        store
            .data()
            .write_bytes_at(reservation.payload_offset(), payload)
            .expect("payload");
        header::commit(store.data(), &reservation, payload.len()).expect("commit");
        let sequence = store.next_sequence().expect("next");
        store.set_last_sequence(sequence).expect("last");
        store
            .set_write_position(header::next_record(position, payload.len()))
            .expect("advance");
        store.index_record(sequence, position).expect("index");
    }

    #[test]
    fn validation_report_ok_for_empty_store() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = fresh(temp.path());
        let report = validate_store_report(&store);
        assert_eq!(report.status, ValidationStatus::Ok);
        assert_eq!(report.issue_count, 0);
        assert_eq!(report.last_good_seq, None);
        assert_eq!(report.cycles_checked, 1);
        assert_eq!(report.path, store.path());
    }

    #[test]
    fn trailing_reservation_is_a_warning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = fresh(temp.path());
        commit(&store, b"first");
        commit(&store, b"second");
        let position = store.write_position().expect("position");
        header::reserve(store.data(), position, 8, false).expect("reserve");

        let report = validate_store_report(&store);
        assert!(report.is_ok());
        assert_eq!(report.last_good_cycle, Some(3));
        assert_eq!(report.last_good_seq, Some(1));
        assert!(report.remediation_hints.iter().any(|hint| hint.contains("in progress")));
    }

    #[test]
    fn broken_index_entry_is_an_issue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = fresh(temp.path());
        for payload in [b"a", b"b", b"c", b"d", b"e"] {
            commit(&store, payload);
        }
        let block = store
            .region()
            .read_volatile_u64(INDEX_ARRAY_OFFSET)
            .expect("block") as usize;
        store
            .region()
            .write_ordered_u64(block + 8, 12)
            .expect("tamper");

        let report = validate_store_report(&store);
        assert_eq!(report.status, ValidationStatus::Corrupt);
        assert_eq!(report.issues[0].code, "index");
        assert_eq!(report.issues[0].cycle, Some(3));
    }

    #[test]
    fn merge_keeps_newest_good_cycle_and_all_issues() {
        let mut older = ValidationReport::ok(PathBuf::from("a"));
        older.cycles_checked = 1;
        older.last_good_cycle = Some(1);
        older.last_good_seq = Some(9);
        let newer = ValidationReport {
            cycles_checked: 1,
            ..ValidationReport::ok(PathBuf::from("b"))
        }
        .set_issues(vec![ValidationIssue {
            code: "corrupt".to_string(),
            message: "bad".to_string(),
            cycle: Some(2),
            seq: None,
            offset: Some(64),
        }]);

        let merged = ValidationReport::merge(PathBuf::from("dir"), vec![older, newer]);
        assert_eq!(merged.status, ValidationStatus::Corrupt);
        assert_eq!(merged.cycles_checked, 2);
        assert_eq!(merged.last_good_cycle, Some(1));
        assert_eq!(merged.last_good_seq, Some(9));
        assert_eq!(merged.issue_count, 1);
        assert_eq!(merged.remediation_hints.len(), 1);
    }
}
