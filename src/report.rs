// Import Reporter - structured per-record outcome reporting
//
// Every record processed by the import driver lands here as a counter bump
// and, for anything other than a clean create/update, a structured entry
// carrying enough identifying context to diagnose the failure post hoc
// without re-running the batch. Nothing here aborts anything: the reporter
// is how partial-failure tolerance stays observable.

use serde::Serialize;

// ============================================================================
// LEVELS AND ENTRIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Informational (created/updated/skip notices).
    Notice,
    /// Duplicate re-import detected; nothing was mutated.
    Warning,
    /// The record was rejected; processing continued.
    Error,
}

/// One report line: a message plus the identifying context of the record.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub level: Level,
    pub message: String,
    pub context: serde_json::Value,
}

// ============================================================================
// REPORTER
// ============================================================================

/// Collects outcomes for one import run (or one worker's slice of it).
#[derive(Debug, Default)]
pub struct Reporter {
    entries: Vec<Entry>,
    processed: usize,
    created: usize,
    updated: usize,
    skipped: usize,
    errors: usize,
}

impl Reporter {
    pub fn new() -> Self {
        Reporter::default()
    }

    pub fn notice(&mut self, message: &str, context: serde_json::Value) {
        self.entries.push(Entry {
            level: Level::Notice,
            message: message.to_string(),
            context,
        });
    }

    pub fn warning(&mut self, message: &str, context: serde_json::Value) {
        tracing::warn!(message, %context);
        self.entries.push(Entry {
            level: Level::Warning,
            message: message.to_string(),
            context,
        });
    }

    pub fn error(&mut self, message: &str, context: serde_json::Value) {
        tracing::warn!(message, %context, "record rejected");
        self.entries.push(Entry {
            level: Level::Error,
            message: message.to_string(),
            context,
        });
    }

    /// Count one processed record against its outcome bucket.
    pub fn tally_created(&mut self) {
        self.processed += 1;
        self.created += 1;
    }

    pub fn tally_updated(&mut self) {
        self.processed += 1;
        self.updated += 1;
    }

    pub fn tally_skipped(&mut self) {
        self.processed += 1;
        self.skipped += 1;
    }

    pub fn tally_error(&mut self) {
        self.processed += 1;
        self.errors += 1;
    }

    /// Fold another reporter (one worker's slice) into this one.
    pub fn merge(&mut self, other: Reporter) {
        self.entries.extend(other.entries);
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn created(&self) -> usize {
        self.created
    }

    pub fn updated(&self) -> usize {
        self.updated
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entries_at(&self, level: Level) -> Vec<&Entry> {
        self.entries.iter().filter(|e| e.level == level).collect()
    }

    /// One-line summary for the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{} processed: {} created, {} updated, {} skipped, {} errors",
            self.processed, self.created, self.updated, self.skipped, self.errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counters_and_summary() {
        let mut reporter = Reporter::new();
        reporter.tally_created();
        reporter.tally_created();
        reporter.tally_updated();
        reporter.tally_skipped();
        reporter.error("bad record", json!({"line": 5}));
        reporter.tally_error();

        assert_eq!(reporter.processed(), 5);
        assert_eq!(reporter.created(), 2);
        assert_eq!(
            reporter.summary(),
            "5 processed: 2 created, 1 updated, 1 skipped, 1 errors"
        );
    }

    #[test]
    fn test_merge_folds_worker_slices() {
        let mut total = Reporter::new();
        total.tally_created();

        let mut worker = Reporter::new();
        worker.warning("group already imported", json!({"fantoir": "751000001"}));
        worker.tally_skipped();

        total.merge(worker);
        assert_eq!(total.processed(), 2);
        assert_eq!(total.skipped(), 1);
        assert_eq!(total.entries_at(Level::Warning).len(), 1);
    }
}
