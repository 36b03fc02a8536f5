//! Operator-facing progress reporting.
//!
//! The orchestrator and the rewriter announce progress through a
//! [`Reporter`] handed in by the caller, so callers decide where progress
//! text goes and tests can capture it. Diagnostics for developers still go
//! through `tracing`.

use crate::error::PurgeError;
use crate::layout::DeletionUnit;
use crate::purge::PurgeSummary;
use crate::rewrite::RewriteOutcome;
use crate::Timestamp;
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// A block removed from a segment.
#[derive(Debug, Clone, Copy)]
pub struct DroppedBlock<'a> {
    /// Composite key of the block.
    pub key: &'a [u8],
    /// Minimum timestamp of the block.
    pub min_ts: Timestamp,
    /// Maximum timestamp of the block.
    pub max_ts: Timestamp,
    /// Payload size in bytes.
    pub size: usize,
}

/// Receives progress events. All methods default to doing nothing.
pub trait Reporter {
    /// A deletion unit is about to be processed.
    fn unit_started(&mut self, _unit: &DeletionUnit, _segments: usize) {}

    /// A segment is about to be rewritten.
    fn segment_started(&mut self, _path: &Path) {}

    /// A block was dropped from the segment being rewritten.
    fn block_dropped(&mut self, _path: &Path, _block: &DroppedBlock<'_>) {}

    /// A segment finished successfully.
    fn segment_finished(&mut self, _path: &Path, _outcome: &RewriteOutcome) {}

    /// A unit was abandoned after an error.
    fn unit_failed(&mut self, _unit: &DeletionUnit, _error: &PurgeError) {}

    /// The run completed.
    fn finished(&mut self, _summary: &PurgeSummary) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Renders progress as plain text lines.
///
/// Per-block lines are only written when `verbose` is set.
#[derive(Debug)]
pub struct TextReporter<W: Write> {
    out: W,
    verbose: bool,
}

impl<W: Write> TextReporter<W> {
    /// Creates a reporter writing to `out`.
    pub fn new(out: W, verbose: bool) -> Self {
        Self { out, verbose }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) {
        if let Err(err) = writeln!(self.out, "{}", args) {
            warn!("Failed to write progress output: {}", err);
        }
    }
}

impl<W: Write> Reporter for TextReporter<W> {
    fn unit_started(&mut self, unit: &DeletionUnit, _segments: usize) {
        self.line(format_args!("Processing segment files for '{}'", unit));
    }

    fn segment_started(&mut self, path: &Path) {
        self.line(format_args!(
            "Processing data for segment file '{}'",
            path.display()
        ));
    }

    fn block_dropped(&mut self, _path: &Path, block: &DroppedBlock<'_>) {
        if self.verbose {
            self.line(format_args!(
                "deleting block: {} ({}-{}) sz={}",
                String::from_utf8_lossy(block.key),
                format_timestamp(block.min_ts),
                format_timestamp(block.max_ts),
                block.size
            ));
        }
    }

    fn segment_finished(&mut self, _path: &Path, outcome: &RewriteOutcome) {
        self.line(format_args!(
            "Dropped '{}' total blocks",
            outcome.blocks_dropped
        ));
    }

    fn unit_failed(&mut self, unit: &DeletionUnit, error: &PurgeError) {
        self.line(format_args!("Failed processing '{}': {}", unit, error));
    }

    fn finished(&mut self, summary: &PurgeSummary) {
        self.line(format_args!(
            "Dropped {} of {} blocks across {} segment files in {} units",
            summary.blocks_dropped, summary.blocks_read, summary.files_processed, summary.units
        ));
        if let Err(err) = self.out.flush() {
            warn!("Failed to flush progress output: {}", err);
        }
    }
}

/// Formats nanoseconds since the Unix epoch as RFC 3339 UTC with trailing
/// zeros of the fraction trimmed, e.g. `2009-11-10T23:00:00.5Z`.
pub fn format_timestamp(timestamp: Timestamp) -> String {
    let (seconds, nanos) = div_floor(timestamp, 1_000_000_000);
    let (days, seconds_of_day) = div_floor(seconds, 86_400);
    let (year, month, day) = civil_from_days(days);

    let mut out = format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        year,
        month,
        day,
        seconds_of_day / 3600,
        (seconds_of_day % 3600) / 60,
        seconds_of_day % 60
    );
    if nanos > 0 {
        let fraction = format!("{:09}", nanos);
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out.push('Z');
    out
}

fn div_floor(value: i64, divisor: i64) -> (i64, i64) {
    let mut quotient = value / divisor;
    let mut remainder = value % divisor;
    if remainder < 0 {
        quotient -= 1;
        remainder += divisor;
    }
    (quotient, remainder)
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 {
        z / 146_097
    } else {
        (z - 146_096) / 146_097
    };
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = mp + if mp < 10 { 3 } else { -9 };
    let year = y + if month <= 2 { 1 } else { 0 };
    (year, month as u32, day as u32)
}
