//! Memory lifecycle notifications.

use crate::extraction::ExtractionError;
use crate::reconciler::MergeReport;

/// Receives memory lifecycle events. Every method defaults to a no-op.
pub trait MemoryObserver: Send + Sync {
    /// Facts are about to be projected into a primary call.
    fn on_invoking(&self, _saved_values: usize) {}

    /// Extraction failed; the store was left unchanged.
    fn on_extraction_failed(&self, _error: &ExtractionError) {}

    /// An extraction result was committed to the store.
    fn on_merged(&self, _report: &MergeReport) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl MemoryObserver for TracingObserver {
    fn on_invoking(&self, saved_values: usize) {
        tracing::debug!(saved_values, "Projecting calculator memory");
    }

    fn on_extraction_failed(&self, error: &ExtractionError) {
        tracing::warn!(error = %error, "Memory extraction failed; store unchanged");
    }

    fn on_merged(&self, report: &MergeReport) {
        if report.is_noop() {
            tracing::debug!("Memory extraction found nothing to save");
            return;
        }
        for (name, value) in &report.written {
            tracing::info!(name = %name, value = %value, "Saved value");
        }
        if report.skipped > 0 {
            tracing::debug!(skipped = report.skipped, "Skipped blank value names");
        }
        if let Some(result) = &report.last_result {
            tracing::info!(last_result = %result, "Updated last result");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl MemoryObserver for NoopObserver {}
