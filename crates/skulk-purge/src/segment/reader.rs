//! Segment reader and block iterator.

use crate::error::{PurgeError, Result};
use crate::segment::file::{
    Block, BlockIndex, SegmentFooter, SegmentHeader, FOOTER_SIZE, HEADER_SIZE,
};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Opens and validates segment files.
pub struct SegmentReader {
    path: PathBuf,
    header: SegmentHeader,
    footer: SegmentFooter,
    index: BlockIndex,
}

impl SegmentReader {
    /// Opens a segment for reading.
    ///
    /// This method:
    /// 1. Reads and validates the header
    /// 2. Reads and validates the footer
    /// 3. Verifies the file CRC
    /// 4. Loads the block index
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, is truncated, has
    /// invalid magic bytes, an unsupported version or a checksum mismatch.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(PurgeError::Corrupted(format!(
                "file is {} bytes, smaller than header and footer",
                file_size
            )));
        }
        let mut reader = BufReader::new(file);

        let header = SegmentHeader::read_from(&mut reader)?;

        reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let footer = SegmentFooter::read_from(&mut reader)?;

        let content_size = file_size - FOOTER_SIZE as u64;
        let calculated_crc = calculate_crc(&mut reader, content_size)?;
        if calculated_crc != footer.file_crc32 {
            return Err(PurgeError::ChecksumMismatch {
                expected: footer.file_crc32,
                actual: calculated_crc,
            });
        }

        let index_end = footer
            .index_offset
            .checked_add(footer.index_size as u64)
            .filter(|&end| end <= content_size);
        if index_end.is_none() || footer.index_offset < HEADER_SIZE as u64 {
            return Err(PurgeError::Corrupted(format!(
                "index at {}+{} lies outside the file",
                footer.index_offset, footer.index_size
            )));
        }

        reader.seek(SeekFrom::Start(footer.index_offset))?;
        let index = BlockIndex::read_from(&mut reader)?;
        if index.len() as u64 != footer.block_count {
            return Err(PurgeError::Corrupted(format!(
                "index holds {} entries, footer expects {} blocks",
                index.len(),
                footer.block_count
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            footer,
            index,
        })
    }

    /// Returns the segment path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file header.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Returns the file footer.
    pub fn footer(&self) -> &SegmentFooter {
        &self.footer
    }

    /// Returns the block index.
    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    /// Returns the number of blocks in the file.
    pub fn block_count(&self) -> u64 {
        self.footer.block_count
    }

    /// Returns a lazy iterator over all blocks in on-disk order.
    ///
    /// Each block's CRC is verified as it is read. The iterator is finite and
    /// not restartable; call `blocks` again for a fresh pass. After the first
    /// error it yields nothing further.
    pub fn blocks(&self) -> Result<BlockIterator> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(BlockIterator {
            reader,
            remaining: self.footer.block_count,
        })
    }
}

/// Sequential block iterator returned by [`SegmentReader::blocks`].
pub struct BlockIterator {
    reader: BufReader<File>,
    remaining: u64,
}

impl Iterator for BlockIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match Block::read_from(&mut self.reader) {
            Ok(block) => {
                self.remaining -= 1;
                Some(Ok(block))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, usize::try_from(self.remaining).ok())
    }
}

/// Calculates the CRC32 of the first `size` bytes.
fn calculate_crc<R: Read + Seek>(reader: &mut R, size: u64) -> Result<u32> {
    reader.seek(SeekFrom::Start(0))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = [0u8; 8192];
    let mut remaining = size;

    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let n = reader.read(&mut buffer[..to_read])?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }

    Ok(hasher.finalize())
}
