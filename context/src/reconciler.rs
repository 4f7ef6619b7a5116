//! Merges extraction outcomes into a [`FactStore`].
//!
//! Merges are computed on a staged copy and committed with a single
//! assignment, so a store is never observed half-updated.

use tally_types::{Decimal, ExtractionResult, FactStore, canonical_decimal};

use crate::extraction::ExtractionError;
use crate::observer::MemoryObserver;

/// What one merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Names written, in extraction order. A name repeated within one
    /// extraction appears once per write.
    pub written: Vec<(String, Decimal)>,
    /// Entries dropped because their name was blank.
    pub skipped: usize,
    /// Canonical last result written by this merge, if any.
    pub last_result: Option<String>,
    /// Whether `last_result` differs from what the store held before.
    pub last_result_changed: bool,
}

impl MergeReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.written.is_empty() && self.last_result.is_none()
    }

    #[must_use]
    pub fn written_names(&self) -> Vec<&str> {
        self.written.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Apply `result` to a copy of `store`. The original is untouched.
#[must_use]
pub fn merge(store: &FactStore, result: &ExtractionResult) -> (FactStore, MergeReport) {
    let mut staged = store.clone();
    let mut report = MergeReport::default();

    for named in result.named_values.iter().flatten() {
        if staged.insert_value(named.name.clone(), named.value).is_ok() {
            report.written.push((named.name.clone(), named.value));
        } else {
            report.skipped += 1;
        }
    }

    if let Some(value) = &result.last_calculated_result {
        let canonical = canonical_decimal(value);
        report.last_result_changed = store.last_result() != Some(canonical.as_str());
        staged.set_last_result(value);
        report.last_result = Some(canonical);
    }

    (staged, report)
}

/// Commit an extraction outcome to `store`.
///
/// A failed extraction leaves the store as it was and is reported to
/// `observer`; it is never propagated.
pub fn reconcile(
    store: &mut FactStore,
    outcome: Result<ExtractionResult, ExtractionError>,
    observer: &dyn MemoryObserver,
) -> MergeReport {
    match outcome {
        Ok(result) => {
            let (staged, report) = merge(store, &result);
            *store = staged;
            observer.on_merged(&report);
            report
        }
        Err(error) => {
            observer.on_extraction_failed(&error);
            MergeReport::default()
        }
    }
}
