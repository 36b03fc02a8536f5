//! Skulk Purge - offline series deletion for Alopex Skulk segment files
//!
//! This crate removes every block belonging to a chosen set of series from
//! the immutable segment files of a stopped Skulk data directory.
//!
//! # Components
//!
//! - [`SegmentReader`] / [`SegmentWriter`]: segment file format I/O
//! - [`SeriesFilter`]: the series keys selected for deletion
//! - [`SegmentLayout`]: discovery of segments grouped by database and retention policy
//! - [`SegmentRewriter`]: crash-safe rewrite of a single segment
//! - [`Purger`]: runs a purge across a data directory
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_skulk_purge::{PurgeConfig, Purger, TextReporter};
//!
//! let purger = Purger::new(PurgeConfig {
//!     data_dir: "/var/lib/skulk/data".into(),
//!     database: Some("mydb".to_string()),
//!     series_file: Some("series.txt".into()),
//!     ..PurgeConfig::default()
//! });
//!
//! let mut reporter = TextReporter::new(std::io::stdout(), false);
//! let summary = purger.run(&mut reporter)?;
//! assert!(summary.is_success());
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod filter;
pub mod layout;
pub mod purge;
pub mod report;
pub mod rewrite;
pub mod segment;
pub mod series;

/// Timestamp in nanoseconds since the Unix epoch.
pub type Timestamp = i64;

pub use error::{PurgeError, Result};
pub use filter::SeriesFilter;
pub use layout::{DeletionUnit, SegmentLayout, SegmentLocation, UnitFilter};
pub use purge::{ErrorPolicy, PurgeConfig, PurgeSummary, Purger, UnitFailure};
pub use report::{NullReporter, Reporter, TextReporter};
pub use rewrite::{RewriteOptions, RewriteOutcome, SegmentRewriter};
pub use segment::{Block, SegmentReader, SegmentWriter};
pub use series::SeriesKey;
