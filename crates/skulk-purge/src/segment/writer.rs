//! Segment writer.

use crate::error::{PurgeError, Result};
use crate::segment::file::{
    Block, BlockIndex, IndexEntry, SegmentFooter, SegmentHeader, HEADER_SIZE,
};
use crate::Timestamp;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Suffix of the sibling file that spools index entries while blocks are written.
pub const INDEX_SPOOL_SUFFIX: &str = ".idx.tmp";

/// Summary of a finished segment file.
#[derive(Debug, Clone)]
pub struct SegmentFileHandle {
    /// Path of the written file.
    pub path: PathBuf,
    /// Final header.
    pub header: SegmentHeader,
    /// Final footer.
    pub footer: SegmentFooter,
}

/// Segment file writer.
///
/// Usage follows the block codec contract:
/// 1. [`write_block`](Self::write_block) for each block, in final order
/// 2. [`write_index`](Self::write_index) once
/// 3. [`close`](Self::close)
///
/// Index entries are spooled to `<path>.idx.tmp` while blocks stream in, so
/// memory stays flat for large segments. The spool is folded into the segment
/// and removed by `write_index`.
pub struct SegmentWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    spool_path: PathBuf,
    spool: Option<BufWriter<File>>,
    position: u64,
    block_count: u64,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    finished: Option<(SegmentHeader, SegmentFooter)>,
}

impl SegmentWriter {
    /// Creates a writer for a new segment at `path`, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment or its index spool cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        SegmentHeader::default().write_to(&mut writer)?;

        let spool_path = Self::index_spool_path(path);
        let spool = BufWriter::new(File::create(&spool_path)?);

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            spool_path,
            spool: Some(spool),
            position: HEADER_SIZE as u64,
            block_count: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            finished: None,
        })
    }

    /// Returns the index spool path used for a segment written at `path`.
    pub fn index_spool_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(INDEX_SPOOL_SUFFIX);
        PathBuf::from(name)
    }

    /// Returns the path being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of blocks written so far.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Appends a block.
    ///
    /// Key, timestamps and payload are written byte-for-byte as given.
    ///
    /// # Errors
    ///
    /// Returns `PurgeError::WriterState` once the index has been written.
    pub fn write_block(
        &mut self,
        key: &[u8],
        min_ts: Timestamp,
        max_ts: Timestamp,
        payload: &[u8],
    ) -> Result<()> {
        let spool = self
            .spool
            .as_mut()
            .ok_or(PurgeError::WriterState("block written after index"))?;

        let mut block_buf = Vec::with_capacity(2 + key.len() + 24 + payload.len() + 4);
        Block::encode(&mut block_buf, key, min_ts, max_ts, payload)?;
        self.writer.write_all(&block_buf)?;

        IndexEntry {
            key: key.to_vec(),
            offset: self.position,
            size: block_buf.len() as u32,
            min_ts,
            max_ts,
        }
        .write_to(spool)?;

        self.position += block_buf.len() as u64;
        self.block_count += 1;
        self.min_timestamp = self.min_timestamp.min(min_ts);
        self.max_timestamp = self.max_timestamp.max(max_ts);
        Ok(())
    }

    /// Writes the block index, final header and footer.
    ///
    /// This method:
    /// 1. Folds the spooled index entries and a fresh Bloom filter into the file
    /// 2. Rewrites the header with the final time bounds
    /// 3. Computes the file CRC and writes the footer
    ///
    /// # Errors
    ///
    /// Returns `PurgeError::WriterState` if called twice.
    pub fn write_index(&mut self) -> Result<()> {
        let mut spool = self
            .spool
            .take()
            .ok_or(PurgeError::WriterState("index already written"))?;
        spool.flush()?;
        drop(spool);

        let data_size = self.position - HEADER_SIZE as u64;

        let mut entries = Vec::with_capacity(self.block_count.min(1 << 16) as usize);
        {
            let mut reader = BufReader::new(File::open(&self.spool_path)?);
            for _ in 0..self.block_count {
                entries.push(IndexEntry::read_from(&mut reader)?);
            }
        }
        fs::remove_file(&self.spool_path)?;

        let index_offset = self.position;
        let mut index_buf = Vec::new();
        BlockIndex::from_entries(entries).write_to(&mut index_buf)?;
        let index_size = u32::try_from(index_buf.len())
            .map_err(|_| PurgeError::Corrupted("block index exceeds 4 GiB".to_string()))?;
        self.writer.write_all(&index_buf)?;
        self.position += index_buf.len() as u64;

        let header = SegmentHeader::with_bounds(self.min_timestamp, self.max_timestamp);
        self.writer.seek(SeekFrom::Start(0))?;
        header.write_to(&mut self.writer)?;
        self.writer.flush()?;
        self.writer.seek(SeekFrom::End(0))?;

        let file_crc32 = {
            let mut file = File::open(&self.path)?;
            let mut hasher = crc32fast::Hasher::new();
            let mut buffer = [0u8; 8192];
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hasher.finalize()
        };

        let footer = SegmentFooter::new(
            index_offset,
            index_size,
            self.block_count,
            data_size,
            file_crc32,
        );
        footer.write_to(&mut self.writer)?;

        self.finished = Some((header, footer));
        Ok(())
    }

    /// Flushes and syncs the file.
    ///
    /// # Errors
    ///
    /// Returns `PurgeError::WriterState` if the index was never written.
    pub fn close(self) -> Result<SegmentFileHandle> {
        let (header, footer) = self
            .finished
            .ok_or(PurgeError::WriterState("closed before index was written"))?;

        let file = self
            .writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;

        Ok(SegmentFileHandle {
            path: self.path,
            header,
            footer,
        })
    }
}
