//! Structured log lines for the events the capture engine's close/open
//! procedures and probe sources need to surface. Kept as plain functions
//! wrapping `tracing` macros rather than a dedicated event-object hierarchy,
//! since this daemon has no metrics pipeline to fan the same event out to.

use std::time::Duration;

pub fn probe_started(probe: &str) {
    tracing::info!(probe, "probe started");
}

pub fn probe_start_failed(probe: &str, error: &dyn std::error::Error) {
    tracing::error!(probe, %error, "probe failed to start, left in NoFile");
}

pub fn file_published(probe: &str, records: u64, bytes: u64, elapsed: Duration, compression_ratio: f64) {
    tracing::info!(
        probe,
        records,
        bytes,
        elapsed_secs = elapsed.as_secs_f64(),
        compression_ratio,
        "file published"
    );
}

pub fn empty_file_removed(probe: &str, elapsed: Duration) {
    tracing::info!(probe, elapsed_secs = elapsed.as_secs_f64(), "empty file removed");
}

pub fn disk_admission_rejected(probe: &str, error: &dyn std::error::Error) {
    tracing::error!(probe, %error, "disk admission rejected file open");
}

pub fn decode_error(probe: &str, error: &dyn std::error::Error) {
    tracing::debug!(probe, %error, "dropping malformed record");
}
