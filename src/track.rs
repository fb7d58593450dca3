//! Violation aggregation across a source's epoch and the plain-text report.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::Serialize;

/// Running tally for one violation class.
#[derive(Clone, Debug, Serialize)]
pub struct ViolationRecord {
    pub count: u64,
    pub first_seen: DateTime<Local>,
}

/// Per-source violation aggregation, scoped to the current epoch (source
/// registration or an explicit [`reset`](ViolationTracker::reset)).
///
/// For looping file sources the durable log is committed by the first
/// completed loop that observed any violation, and never overwritten
/// afterwards even though the running records keep counting. Later loops
/// that replay the same footage therefore do not inflate the committed log.
/// A first loop with no violations leaves the log open, so a violation-free
/// lead-in does not lock in an empty report.
pub struct ViolationTracker {
    current: BTreeMap<String, ViolationRecord>,
    committed: BTreeMap<String, ViolationRecord>,
    log_committed: bool,
}

impl ViolationTracker {
    pub fn new() -> Self {
        Self {
            current: BTreeMap::new(),
            committed: BTreeMap::new(),
            log_committed: false,
        }
    }

    /// Count one observation of `class_name` at the current time.
    pub fn record(&mut self, class_name: &str) {
        self.record_at(class_name, Local::now());
    }

    /// Count one observation of `class_name`. The first observation of a
    /// class pins its `first_seen`; later ones only bump the count.
    pub fn record_at(&mut self, class_name: &str, at: DateTime<Local>) {
        self.current
            .entry(class_name.to_string())
            .or_insert(ViolationRecord {
                count: 0,
                first_seen: at,
            })
            .count += 1;
    }

    /// Mark one full pass over the underlying footage. Commits the running
    /// records as the durable log if the log is still open and anything was
    /// recorded; otherwise a no-op.
    pub fn complete_loop(&mut self) {
        if !self.log_committed && !self.current.is_empty() {
            self.committed = self.current.clone();
            self.log_committed = true;
        }
    }

    /// Discard everything and start a fresh epoch.
    pub fn reset(&mut self) {
        self.current.clear();
        self.committed.clear();
        self.log_committed = false;
    }

    pub fn current(&self) -> &BTreeMap<String, ViolationRecord> {
        &self.current
    }

    pub fn committed(&self) -> &BTreeMap<String, ViolationRecord> {
        &self.committed
    }

    pub fn log_committed(&self) -> bool {
        self.log_committed
    }

    /// Total running observations across all classes.
    pub fn total_current(&self) -> u64 {
        self.current.values().map(|r| r.count).sum()
    }
}

impl Default for ViolationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// One source's slice of the violation report.
pub struct ReportSection {
    pub source_name: String,
    pub records: BTreeMap<String, ViolationRecord>,
}

/// Render the downloadable plain-text report from committed logs.
pub fn render_report(sections: &[ReportSection], generated_at: DateTime<Local>) -> String {
    let mut out = String::new();
    out.push_str("PPE Violation Detection Report\n");
    out.push_str(&format!(
        "Generated on: {}\n",
        generated_at.format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&"=".repeat(50));
    out.push('\n');

    for section in sections {
        out.push('\n');
        out.push_str(&format!("Source: {}\n", section.source_name));
        out.push_str(&"-".repeat(30));
        out.push('\n');
        if section.records.is_empty() {
            out.push_str("No violations recorded.\n");
            continue;
        }
        for (class_name, record) in &section.records {
            out.push_str(&format!("Violation Type: {class_name}\n"));
            out.push_str(&format!("Number of Detections: {}\n", record.count));
            out.push_str(&format!(
                "First Detected: {}\n",
                record.first_seen.format("%Y-%m-%d %H:%M:%S")
            ));
            out.push('\n');
        }
        out.push_str(&format!(
            "Total Violation Categories: {}\n",
            section.records.len()
        ));
    }

    out.push('\n');
    out.push_str("Note: violations are tracked from source start until the first complete loop.\n");
    out
}
