//! Segment rewriting: drop every block of the selected series.
//!
//! A rewrite streams the blocks of one segment in file order, drops those
//! whose series key is in the [`SeriesFilter`] and writes the rest, untouched,
//! into `<segment>.rewriting.tmp`. Only a finished and verified replacement
//! is renamed over the original. Until that rename, the original is the
//! authoritative copy. On failure the temporary files are removed, and an
//! interrupted run leaves them behind to be cleared by the next rewrite of
//! the same segment.

use crate::error::{PurgeError, Result};
use crate::filter::SeriesFilter;
use crate::report::{DroppedBlock, Reporter};
use crate::segment::{SegmentReader, SegmentWriter};
use crate::series::SeriesKey;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix appended to a segment path to name its replacement while it is written.
pub const REWRITE_SUFFIX: &str = ".rewriting.tmp";

/// Options for [`SegmentRewriter`].
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// Leave a segment untouched when no block was dropped.
    pub skip_unchanged: bool,
    /// Reopen and checksum the replacement before swapping it in.
    pub verify_output: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            skip_unchanged: true,
            verify_output: true,
        }
    }
}

/// Result of rewriting one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// Blocks read from the original.
    pub blocks_read: u64,
    /// Blocks left out of the replacement.
    pub blocks_dropped: u64,
    /// Payload bytes of the dropped blocks.
    pub bytes_dropped: u64,
    /// Whether the original file was replaced.
    pub replaced: bool,
}

impl RewriteOutcome {
    /// Blocks carried over into the replacement.
    pub fn blocks_kept(&self) -> u64 {
        self.blocks_read - self.blocks_dropped
    }
}

/// Returns the temporary path a replacement for `path` is written to.
pub fn rewrite_temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(REWRITE_SUFFIX);
    PathBuf::from(name)
}

/// Rewrites segments without the blocks of filtered series.
///
/// # Examples
/// ```rust,ignore
/// use alopex_skulk_purge::filter::SeriesFilter;
/// use alopex_skulk_purge::report::NullReporter;
/// use alopex_skulk_purge::rewrite::SegmentRewriter;
///
/// let filter = SeriesFilter::from_keys(["cpu,host=a"]);
/// let outcome = SegmentRewriter::default().rewrite(path, &filter, &mut NullReporter)?;
/// println!("dropped {} blocks", outcome.blocks_dropped);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SegmentRewriter {
    options: RewriteOptions,
}

impl SegmentRewriter {
    /// Creates a rewriter.
    pub fn new(options: RewriteOptions) -> Self {
        Self { options }
    }

    /// Returns the rewriter options.
    pub fn options(&self) -> &RewriteOptions {
        &self.options
    }

    /// Rewrites the segment at `path` without the blocks whose series key is
    /// in `filter`, returning what was dropped.
    ///
    /// Retained blocks keep their order, keys, timestamps and payload bytes.
    ///
    /// # Errors
    ///
    /// - `PurgeError::Read` if the segment cannot be opened or a block cannot
    ///   be read
    /// - `PurgeError::KeyParse` if a block carries a malformed composite key
    /// - `PurgeError::Write` if the replacement cannot be written, verified
    ///   or renamed into place
    ///
    /// In every error case the original file is left as it was.
    pub fn rewrite(
        &self,
        path: &Path,
        filter: &SeriesFilter,
        reporter: &mut dyn Reporter,
    ) -> Result<RewriteOutcome> {
        let reader = SegmentReader::open(path).map_err(|e| e.reading(path))?;

        let temp_path = rewrite_temp_path(path);
        remove_stale(&temp_path).map_err(|e| e.writing(path))?;
        debug!("Creating temporary file '{}'", temp_path.display());

        let result = self.rewrite_into(&reader, &temp_path, filter, reporter);
        match &result {
            Ok(outcome) if outcome.replaced => {}
            Ok(_) => discard(&temp_path),
            Err(err) => {
                warn!("Abandoning rewrite of '{}': {}", path.display(), err);
                discard(&temp_path);
            }
        }
        result
    }

    fn rewrite_into(
        &self,
        reader: &SegmentReader,
        temp_path: &Path,
        filter: &SeriesFilter,
        reporter: &mut dyn Reporter,
    ) -> Result<RewriteOutcome> {
        let path = reader.path();
        let mut writer = SegmentWriter::create(temp_path).map_err(|e| e.writing(path))?;
        let mut outcome = RewriteOutcome::default();

        for block in reader.blocks().map_err(|e| e.reading(path))? {
            let block = block.map_err(|e| e.reading(path))?;
            outcome.blocks_read += 1;

            let series = SeriesKey::from_composite(&block.key).map_err(|reason| {
                PurgeError::KeyParse {
                    path: path.to_path_buf(),
                    key: String::from_utf8_lossy(&block.key).into_owned(),
                    reason: reason.to_string(),
                }
            })?;

            if filter.contains(&series.render()) {
                outcome.blocks_dropped += 1;
                outcome.bytes_dropped += block.payload.len() as u64;
                reporter.block_dropped(
                    path,
                    &DroppedBlock {
                        key: &block.key,
                        min_ts: block.min_ts,
                        max_ts: block.max_ts,
                        size: block.payload.len(),
                    },
                );
                continue;
            }

            writer
                .write_block(&block.key, block.min_ts, block.max_ts, &block.payload)
                .map_err(|e| e.writing(path))?;
        }

        if outcome.blocks_dropped == 0 && self.options.skip_unchanged {
            debug!("No blocks dropped from '{}', leaving it untouched", path.display());
            return Ok(outcome);
        }

        writer.write_index().map_err(|e| e.writing(path))?;
        writer.close().map_err(|e| e.writing(path))?;

        if self.options.verify_output {
            verify_replacement(temp_path, outcome.blocks_kept()).map_err(|e| e.writing(path))?;
        }

        fs::rename(temp_path, path).map_err(|e| PurgeError::from(e).writing(path))?;
        outcome.replaced = true;
        sync_parent(path);

        info!(
            "Rewrote '{}': dropped {} of {} blocks",
            path.display(),
            outcome.blocks_dropped,
            outcome.blocks_read
        );
        Ok(outcome)
    }
}

/// Reopens the replacement with full checksum validation.
fn verify_replacement(temp_path: &Path, expected_blocks: u64) -> Result<()> {
    let reader = SegmentReader::open(temp_path)?;
    if reader.block_count() != expected_blocks {
        return Err(PurgeError::Corrupted(format!(
            "replacement holds {} blocks, expected {}",
            reader.block_count(),
            expected_blocks
        )));
    }
    Ok(())
}

/// Removes leftovers of an earlier, interrupted rewrite.
fn remove_stale(temp_path: &Path) -> Result<()> {
    for stale in [
        temp_path.to_path_buf(),
        SegmentWriter::index_spool_path(temp_path),
    ] {
        let metadata = match fs::symlink_metadata(&stale) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        debug!("Removing stale temporary file '{}'", stale.display());
        if metadata.is_dir() {
            fs::remove_dir_all(&stale)?;
        } else {
            fs::remove_file(&stale)?;
        }
    }
    Ok(())
}

/// Best-effort removal of a replacement that will not be used.
fn discard(temp_path: &Path) {
    for leftover in [
        temp_path.to_path_buf(),
        SegmentWriter::index_spool_path(temp_path),
    ] {
        match fs::remove_file(&leftover) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "Failed to remove temporary file '{}': {}",
                leftover.display(),
                err
            ),
        }
    }
}

/// Makes the rename durable on filesystems that need the directory synced.
fn sync_parent(path: &Path) {
    if !cfg!(unix) {
        return;
    }
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
            warn!("Failed to sync directory '{}': {}", parent.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::NullReporter;
    use crate::segment::Block;
    use crate::series::composite_key;
    use tempfile::TempDir;

    fn write_segment(path: &Path, blocks: &[Block]) {
        let mut writer = SegmentWriter::create(path).unwrap();
        for block in blocks {
            writer
                .write_block(&block.key, block.min_ts, block.max_ts, &block.payload)
                .unwrap();
        }
        writer.write_index().unwrap();
        writer.close().unwrap();
    }

    fn read_blocks(path: &Path) -> Vec<Block> {
        let reader = SegmentReader::open(path).unwrap();
        reader.blocks().unwrap().map(|b| b.unwrap()).collect()
    }

    fn block(series: &str, field: &str, ts: i64) -> Block {
        Block::new(composite_key(series, field), ts, ts + 10, vec![ts as u8; 4])
    }

    #[test]
    fn test_rewrite_temp_path() {
        assert_eq!(
            rewrite_temp_path(Path::new("/d/a.segment")),
            PathBuf::from("/d/a.segment.rewriting.tmp")
        );
    }

    #[test]
    fn test_rewrite_drops_all_fields_of_series() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.segment");
        let blocks = vec![
            block("cpu,host=a", "idle", 1),
            block("cpu,host=b", "idle", 2),
            block("cpu,host=a", "user", 3),
            block("mem,host=a", "free", 4),
        ];
        write_segment(&path, &blocks);

        let filter = SeriesFilter::from_keys(["cpu,host=a"]);
        let outcome = SegmentRewriter::default()
            .rewrite(&path, &filter, &mut NullReporter)
            .unwrap();

        assert_eq!(outcome.blocks_read, 4);
        assert_eq!(outcome.blocks_dropped, 2);
        assert_eq!(outcome.bytes_dropped, 8);
        assert!(outcome.replaced);
        assert_eq!(read_blocks(&path), vec![blocks[1].clone(), blocks[3].clone()]);
        assert!(!rewrite_temp_path(&path).exists());
    }

    #[test]
    fn test_rewrite_unchanged_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.segment");
        write_segment(&path, &[block("cpu,host=a", "idle", 1)]);
        let before = fs::read(&path).unwrap();

        let filter = SeriesFilter::from_keys(["cpu,host=z"]);
        let outcome = SegmentRewriter::default()
            .rewrite(&path, &filter, &mut NullReporter)
            .unwrap();

        assert_eq!(outcome.blocks_dropped, 0);
        assert!(!outcome.replaced);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!rewrite_temp_path(&path).exists());
        assert!(!SegmentWriter::index_spool_path(&rewrite_temp_path(&path)).exists());
    }

    #[test]
    fn test_rewrite_unchanged_when_forced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.segment");
        let blocks = vec![block("cpu,host=a", "idle", 1), block("mem,host=a", "free", 2)];
        write_segment(&path, &blocks);
        let before = fs::read(&path).unwrap();

        let rewriter = SegmentRewriter::new(RewriteOptions {
            skip_unchanged: false,
            verify_output: true,
        });
        let outcome = rewriter
            .rewrite(&path, &SeriesFilter::default(), &mut NullReporter)
            .unwrap();

        assert!(outcome.replaced);
        assert_eq!(read_blocks(&path), blocks);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_rewrite_removes_stale_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.segment");
        write_segment(&path, &[block("cpu,host=a", "idle", 1), block("cpu,host=b", "idle", 2)]);

        let temp_path = rewrite_temp_path(&path);
        fs::write(&temp_path, b"garbage from an aborted run").unwrap();
        fs::write(SegmentWriter::index_spool_path(&temp_path), b"more garbage").unwrap();

        let filter = SeriesFilter::from_keys(["cpu,host=a"]);
        let outcome = SegmentRewriter::default()
            .rewrite(&path, &filter, &mut NullReporter)
            .unwrap();

        assert_eq!(outcome.blocks_dropped, 1);
        assert_eq!(read_blocks(&path), vec![block("cpu,host=b", "idle", 2)]);
        assert!(!temp_path.exists());
        assert!(!SegmentWriter::index_spool_path(&temp_path).exists());
    }

    #[test]
    fn test_rewrite_malformed_key_leaves_original() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.segment");
        write_segment(
            &path,
            &[
                block("cpu,host=a", "idle", 1),
                Block::new(b"no-field-separator".to_vec(), 2, 3, vec![1]),
            ],
        );
        let before = fs::read(&path).unwrap();

        let filter = SeriesFilter::from_keys(["cpu,host=a"]);
        let result = SegmentRewriter::default().rewrite(&path, &filter, &mut NullReporter);

        assert!(matches!(result, Err(PurgeError::KeyParse { .. })));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!rewrite_temp_path(&path).exists());
    }

    #[test]
    fn test_rewrite_unreadable_segment() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.segment");
        fs::write(&path, b"not a segment at all, just some bytes here........").unwrap();

        let result =
            SegmentRewriter::default().rewrite(&path, &SeriesFilter::default(), &mut NullReporter);
        match result {
            Err(PurgeError::Read { path: failed, .. }) => assert_eq!(failed, path),
            other => panic!("expected read error, got {:?}", other),
        }
        assert!(!rewrite_temp_path(&path).exists());
    }

    #[test]
    fn test_rewrite_to_empty_segment() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.segment");
        write_segment(&path, &[block("cpu,host=a", "idle", 1)]);

        let filter = SeriesFilter::from_keys(["cpu,host=a"]);
        let outcome = SegmentRewriter::default()
            .rewrite(&path, &filter, &mut NullReporter)
            .unwrap();

        assert_eq!(outcome.blocks_kept(), 0);
        assert!(read_blocks(&path).is_empty());
    }

    #[test]
    fn test_rewrite_tagless_series_ignores_trailing_comma() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.segment");
        let blocks = vec![block("uptime", "value", 1), block("uptime,host=a", "value", 2)];
        write_segment(&path, &blocks);

        let trailing = SeriesFilter::from_keys(["uptime,"]);
        let outcome = SegmentRewriter::default()
            .rewrite(&path, &trailing, &mut NullReporter)
            .unwrap();
        assert_eq!(outcome.blocks_dropped, 0);

        let bare = SeriesFilter::from_keys(["uptime"]);
        let outcome = SegmentRewriter::default()
            .rewrite(&path, &bare, &mut NullReporter)
            .unwrap();
        assert_eq!(outcome.blocks_dropped, 1);
        assert_eq!(read_blocks(&path), vec![blocks[1].clone()]);
    }

    /// Unlinks the replacement while it is still being written.
    #[cfg(unix)]
    struct ReplacementRemover;

    #[cfg(unix)]
    impl Reporter for ReplacementRemover {
        fn block_dropped(&mut self, path: &Path, _block: &DroppedBlock<'_>) {
            let _ = fs::remove_file(rewrite_temp_path(path));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_rewrite_finalize_failure_leaves_original() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.segment");
        write_segment(
            &path,
            &[block("cpu,host=a", "idle", 1), block("cpu,host=b", "idle", 2)],
        );
        let before = fs::read(&path).unwrap();

        let filter = SeriesFilter::from_keys(["cpu,host=a"]);
        let result =
            SegmentRewriter::default().rewrite(&path, &filter, &mut ReplacementRemover);

        match result {
            Err(PurgeError::Write { path: failed, source }) => {
                assert_eq!(failed, path);
                assert!(matches!(*source, PurgeError::IoError(_)));
            }
            other => panic!("expected write error, got {:?}", other),
        }
        assert_eq!(fs::read(&path).unwrap(), before);
        let temp_path = rewrite_temp_path(&path);
        assert!(!temp_path.exists());
        assert!(!SegmentWriter::index_spool_path(&temp_path).exists());
    }
}
