//! Purge orchestration across a data directory.

use crate::error::{PurgeError, Result};
use crate::filter::SeriesFilter;
use crate::layout::{DeletionUnit, LocatedSegments, SegmentLayout, SegmentLocation, UnitFilter};
use crate::report::Reporter;
use crate::rewrite::{RewriteOptions, SegmentRewriter};
use std::path::PathBuf;
use tracing::{error, info};

/// Default root of the data directory.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/skulk/data";

/// What to do when a segment of a unit fails to rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Stop the whole run and return the error.
    #[default]
    Abort,
    /// Give up on the failing unit, record the failure and continue with
    /// the next unit.
    SkipUnit,
}

/// Configuration of a purge run.
///
/// # Examples
/// ```rust,ignore
/// use alopex_skulk_purge::purge::PurgeConfig;
///
/// let config = PurgeConfig {
///     database: Some("mydb".to_string()),
///     series_file: Some("series.txt".into()),
///     ..PurgeConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct PurgeConfig {
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Only purge this database, if set.
    pub database: Option<String>,
    /// Only purge this retention policy, if set.
    pub retention_policy: Option<String>,
    /// File listing the series keys to delete, one per line.
    pub series_file: Option<PathBuf>,
    /// Leave series keys with non-printable characters out of the filter.
    pub sanitize: bool,
    /// Failure handling across units.
    pub error_policy: ErrorPolicy,
    /// Per-segment rewrite options.
    pub rewrite: RewriteOptions,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            database: None,
            retention_policy: None,
            series_file: None,
            sanitize: false,
            error_policy: ErrorPolicy::default(),
            rewrite: RewriteOptions::default(),
        }
    }
}

/// A unit abandoned under [`ErrorPolicy::SkipUnit`].
#[derive(Debug)]
pub struct UnitFailure {
    /// The abandoned unit.
    pub unit: DeletionUnit,
    /// Segment that failed.
    pub path: PathBuf,
    /// Why it failed.
    pub error: PurgeError,
}

/// Totals of a purge run.
#[derive(Debug, Default)]
pub struct PurgeSummary {
    /// Units visited.
    pub units: usize,
    /// Segments rewritten or checked successfully.
    pub files_processed: usize,
    /// Segments actually replaced on disk.
    pub files_rewritten: usize,
    /// Blocks read across all processed segments.
    pub blocks_read: u64,
    /// Blocks dropped across all processed segments.
    pub blocks_dropped: u64,
    /// Payload bytes dropped.
    pub bytes_dropped: u64,
    /// Units abandoned after an error.
    pub failures: Vec<UnitFailure>,
}

impl PurgeSummary {
    /// Returns true if no unit failed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives a purge: load the filter, locate segments, rewrite them in order.
#[derive(Debug, Clone)]
pub struct Purger {
    config: PurgeConfig,
}

impl Purger {
    /// Creates a purger.
    pub fn new(config: PurgeConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }

    /// Runs the purge.
    ///
    /// Units are processed in database, then retention policy order and the
    /// segments of a unit in path order, so output and totals are the same
    /// on every run.
    ///
    /// # Errors
    ///
    /// Fails before touching any segment if the series file is missing or
    /// unreadable or the data directory cannot be walked. Rewrite errors
    /// are returned under [`ErrorPolicy::Abort`] and collected in
    /// [`PurgeSummary::failures`] under [`ErrorPolicy::SkipUnit`].
    pub fn run(&self, reporter: &mut dyn Reporter) -> Result<PurgeSummary> {
        let series_file = self
            .config
            .series_file
            .as_deref()
            .ok_or(PurgeError::MissingSeriesFile)?;
        let filter = SeriesFilter::load(series_file, self.config.sanitize)?;
        info!(
            "Loaded {} series keys from {}",
            filter.len(),
            series_file.display()
        );

        let layout = SegmentLayout::new(&self.config.data_dir);
        let units = layout.locate(&UnitFilter {
            database: self.config.database.clone(),
            retention_policy: self.config.retention_policy.clone(),
        })?;
        info!(
            "Found {} segment files in {} units under {}",
            units.values().map(Vec::len).sum::<usize>(),
            units.len(),
            layout.data_dir().display()
        );

        self.purge_units(&filter, &units, reporter)
    }

    /// Rewrites already located segments with an already loaded filter.
    pub fn purge_units(
        &self,
        filter: &SeriesFilter,
        units: &LocatedSegments,
        reporter: &mut dyn Reporter,
    ) -> Result<PurgeSummary> {
        let rewriter = SegmentRewriter::new(self.config.rewrite.clone());
        let mut summary = PurgeSummary::default();

        for (unit, segments) in units {
            summary.units += 1;
            reporter.unit_started(unit, segments.len());

            let Err(failure) =
                purge_unit(&rewriter, filter, unit, segments, reporter, &mut summary)
            else {
                continue;
            };

            error!(
                "Failed processing '{}' at '{}': {}",
                unit,
                failure.path.display(),
                failure.error
            );
            reporter.unit_failed(unit, &failure.error);
            match self.config.error_policy {
                ErrorPolicy::Abort => return Err(failure.error),
                ErrorPolicy::SkipUnit => summary.failures.push(failure),
            }
        }

        reporter.finished(&summary);
        Ok(summary)
    }
}

fn purge_unit(
    rewriter: &SegmentRewriter,
    filter: &SeriesFilter,
    unit: &DeletionUnit,
    segments: &[SegmentLocation],
    reporter: &mut dyn Reporter,
    summary: &mut PurgeSummary,
) -> std::result::Result<(), UnitFailure> {
    for location in segments {
        reporter.segment_started(&location.path);
        let outcome = rewriter
            .rewrite(&location.path, filter, reporter)
            .map_err(|error| UnitFailure {
                unit: unit.clone(),
                path: location.path.clone(),
                error,
            })?;

        summary.files_processed += 1;
        if outcome.replaced {
            summary.files_rewritten += 1;
        }
        summary.blocks_read += outcome.blocks_read;
        summary.blocks_dropped += outcome.blocks_dropped;
        summary.bytes_dropped += outcome.bytes_dropped;
        reporter.segment_finished(&location.path, &outcome);
    }
    Ok(())
}
