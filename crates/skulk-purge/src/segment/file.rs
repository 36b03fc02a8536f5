//! Segment file format.
//!
//! A segment holds an ordered run of data blocks followed by a block index.
//! Blocks are addressed by composite key and carry an opaque payload that is
//! never decoded here.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (24 bytes)                                      │
//! │  - Magic: "SKSG" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: 2 bytes                                         │
//! │  - Min Timestamp: i64 (8 bytes)                              │
//! │  - Max Timestamp: i64 (8 bytes)                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data Blocks (file order is significant)                     │
//! │  - Composite key, time range, payload, block CRC             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Block Index                                                 │
//! │  - One entry per block, in block order, plus Bloom filter    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (40 bytes)                                           │
//! │  - Offsets, counts, file CRC, reverse magic                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{PurgeError, Result};
use crate::Timestamp;
use std::io::{Read, Write};

/// Magic bytes for the segment header: "SKSG"
pub const SEGMENT_MAGIC: [u8; 4] = *b"SKSG";

/// Reverse magic bytes for the segment footer: "GSKS"
pub const SEGMENT_MAGIC_REVERSE: [u8; 4] = *b"GSKS";

/// Current segment file format version.
pub const SEGMENT_VERSION: u16 = 1;

/// File extension of segment files.
pub const SEGMENT_EXTENSION: &str = "segment";

/// Header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 40;

/// Largest composite key a block may carry.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Segment file header (24 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes: "SKSG"
    pub magic: [u8; 4],
    /// File format version.
    pub version: u16,
    /// Minimum timestamp over all blocks.
    pub min_timestamp: Timestamp,
    /// Maximum timestamp over all blocks.
    pub max_timestamp: Timestamp,
}

impl Default for SegmentHeader {
    fn default() -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
        }
    }
}

impl SegmentHeader {
    /// Creates a header for the given time bounds.
    pub fn with_bounds(min_timestamp: Timestamp, max_timestamp: Timestamp) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
            ..Self::default()
        }
    }

    /// Writes the header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        // Reserved (2 bytes)
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&self.min_timestamp.to_le_bytes())?;
        writer.write_all(&self.max_timestamp.to_le_bytes())?;
        Ok(())
    }

    /// Reads a header.
    ///
    /// # Errors
    ///
    /// Returns `PurgeError::InvalidMagic` if the magic bytes don't match and
    /// `PurgeError::UnsupportedVersion` for versions newer than this build.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = array4(&buf[0..4]);
        if magic != SEGMENT_MAGIC {
            return Err(PurgeError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version == 0 || version > SEGMENT_VERSION {
            return Err(PurgeError::UnsupportedVersion(version));
        }

        Ok(Self {
            magic,
            version,
            min_timestamp: i64::from_le_bytes(array8(&buf[8..16])),
            max_timestamp: i64::from_le_bytes(array8(&buf[16..24])),
        })
    }
}

/// Segment file footer (40 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFooter {
    /// Offset of the block index from file start.
    pub index_offset: u64,
    /// Size of the block index in bytes.
    pub index_size: u32,
    /// Number of data blocks.
    pub block_count: u64,
    /// Size of the data section in bytes.
    pub data_size: u64,
    /// CRC32 of everything before the footer.
    pub file_crc32: u32,
    /// Reverse magic bytes: "GSKS"
    pub magic_reverse: [u8; 4],
}

impl SegmentFooter {
    /// Creates a footer.
    pub fn new(
        index_offset: u64,
        index_size: u32,
        block_count: u64,
        data_size: u64,
        file_crc32: u32,
    ) -> Self {
        Self {
            index_offset,
            index_size,
            block_count,
            data_size,
            file_crc32,
            magic_reverse: SEGMENT_MAGIC_REVERSE,
        }
    }

    /// Writes the footer using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.index_size.to_le_bytes())?;
        writer.write_all(&self.block_count.to_le_bytes())?;
        writer.write_all(&self.data_size.to_le_bytes())?;
        writer.write_all(&self.file_crc32.to_le_bytes())?;
        writer.write_all(&self.magic_reverse)?;
        // Reserved (4 bytes)
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Reads a footer.
    ///
    /// # Errors
    ///
    /// Returns `PurgeError::InvalidMagic` if the reverse magic doesn't match.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic_reverse = array4(&buf[32..36]);
        if magic_reverse != SEGMENT_MAGIC_REVERSE {
            return Err(PurgeError::InvalidMagic(magic_reverse));
        }

        Ok(Self {
            index_offset: u64::from_le_bytes(array8(&buf[0..8])),
            index_size: u32::from_le_bytes(array4(&buf[8..12])),
            block_count: u64::from_le_bytes(array8(&buf[12..20])),
            data_size: u64::from_le_bytes(array8(&buf[20..28])),
            file_crc32: u32::from_le_bytes(array4(&buf[28..32])),
            magic_reverse,
        })
    }
}

/// A data block as stored in a segment.
///
/// ## Binary Layout
///
/// ```text
/// Size    Field
/// ----    -----
/// 2       key_len (u16 LE)
/// K       key[key_len]
/// 8       min_ts (i64 LE)
/// 8       max_ts (i64 LE)
/// 4       payload_len (u32 LE)
/// P       payload[payload_len]
/// 4       block_crc32 (u32 LE), over all preceding fields
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Composite key (series key + field).
    pub key: Vec<u8>,
    /// Minimum timestamp covered by the payload.
    pub min_ts: Timestamp,
    /// Maximum timestamp covered by the payload.
    pub max_ts: Timestamp,
    /// Opaque encoded payload.
    pub payload: Vec<u8>,
}

impl Block {
    /// Creates a block.
    pub fn new(
        key: impl Into<Vec<u8>>,
        min_ts: Timestamp,
        max_ts: Timestamp,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: key.into(),
            min_ts,
            max_ts,
            payload: payload.into(),
        }
    }

    /// Returns the size of the block in bytes when serialized.
    pub fn serialized_size(&self) -> usize {
        2 + self.key.len() + 8 + 8 + 4 + self.payload.len() + 4
    }

    /// Serializes a block from borrowed parts.
    ///
    /// # Errors
    ///
    /// Returns `PurgeError::Corrupted` if the key or payload exceed the
    /// format's length fields.
    pub fn encode<W: Write>(
        writer: &mut W,
        key: &[u8],
        min_ts: Timestamp,
        max_ts: Timestamp,
        payload: &[u8],
    ) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(PurgeError::Corrupted(format!(
                "key of {} bytes exceeds {} byte limit",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            PurgeError::Corrupted(format!("payload of {} bytes is too large", payload.len()))
        })?;

        let mut hasher = crc32fast::Hasher::new();
        let key_len = (key.len() as u16).to_le_bytes();
        let min = min_ts.to_le_bytes();
        let max = max_ts.to_le_bytes();
        let plen = payload_len.to_le_bytes();
        for part in [&key_len[..], key, &min[..], &max[..], &plen[..], payload] {
            hasher.update(part);
            writer.write_all(part)?;
        }
        writer.write_all(&hasher.finalize().to_le_bytes())?;
        Ok(())
    }

    /// Writes the block to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        Self::encode(writer, &self.key, self.min_ts, self.max_ts, &self.payload)
    }

    /// Reads a block and verifies its CRC.
    ///
    /// # Errors
    ///
    /// Returns `PurgeError::ChecksumMismatch` if CRC verification fails.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut hasher = crc32fast::Hasher::new();

        let mut buf2 = [0u8; 2];
        reader.read_exact(&mut buf2)?;
        hasher.update(&buf2);
        let key_len = u16::from_le_bytes(buf2) as usize;

        let mut key = vec![0u8; key_len];
        reader.read_exact(&mut key)?;
        hasher.update(&key);

        let mut buf8 = [0u8; 8];
        reader.read_exact(&mut buf8)?;
        hasher.update(&buf8);
        let min_ts = i64::from_le_bytes(buf8);

        reader.read_exact(&mut buf8)?;
        hasher.update(&buf8);
        let max_ts = i64::from_le_bytes(buf8);

        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        hasher.update(&buf4);
        let payload_len = u32::from_le_bytes(buf4) as usize;

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;
        hasher.update(&payload);

        reader.read_exact(&mut buf4)?;
        let expected = u32::from_le_bytes(buf4);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(PurgeError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            key,
            min_ts,
            max_ts,
            payload,
        })
    }
}

/// Index entry locating one data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Composite key of the block.
    pub key: Vec<u8>,
    /// Offset of the block from file start.
    pub offset: u64,
    /// Serialized size of the block.
    pub size: u32,
    /// Minimum timestamp in the block.
    pub min_ts: Timestamp,
    /// Maximum timestamp in the block.
    pub max_ts: Timestamp,
}

impl IndexEntry {
    /// Writes the entry.
    ///
    /// Format: key_len u16, key, offset u64, size u32, min_ts i64, max_ts i64.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.key.len() as u16).to_le_bytes())?;
        writer.write_all(&self.key)?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;
        writer.write_all(&self.min_ts.to_le_bytes())?;
        writer.write_all(&self.max_ts.to_le_bytes())?;
        Ok(())
    }

    /// Reads an entry.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf2 = [0u8; 2];
        reader.read_exact(&mut buf2)?;
        let mut key = vec![0u8; u16::from_le_bytes(buf2) as usize];
        reader.read_exact(&mut key)?;

        let mut buf8 = [0u8; 8];
        reader.read_exact(&mut buf8)?;
        let offset = u64::from_le_bytes(buf8);

        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let size = u32::from_le_bytes(buf4);

        reader.read_exact(&mut buf8)?;
        let min_ts = i64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let max_ts = i64::from_le_bytes(buf8);

        Ok(Self {
            key,
            offset,
            size,
            min_ts,
            max_ts,
        })
    }
}

/// Number of hash functions for the Bloom filter.
const BLOOM_FILTER_DEFAULT_HASH_COUNT: u8 = 3;

/// Bloom filter over composite keys.
///
/// `h_i(x) = xxhash64(x, seed=i) % size_bits` for `i` in `0..hash_count`.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    hash_count: u8,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_items` (about 10 bits per item).
    pub fn new(expected_items: usize) -> Self {
        let num_bits = (expected_items * 10).max(64);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            hash_count: BLOOM_FILTER_DEFAULT_HASH_COUNT,
        }
    }

    fn positions<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = (usize, u64)> + 'a {
        let num_bits = (self.bits.len() * 64) as u64;
        (0..self.hash_count).map(move |seed| {
            let bit_idx = xxhash_rust::xxh64::xxh64(key, seed as u64) % num_bits;
            ((bit_idx / 64) as usize, 1u64 << (bit_idx % 64))
        })
    }

    /// Adds a key.
    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<_> = self.positions(key).collect();
        for (word, mask) in positions {
            self.bits[word] |= mask;
        }
    }

    /// Returns `false` if the key is definitely absent.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        if self.bits.is_empty() {
            return false;
        }
        self.positions(key)
            .all(|(word, mask)| self.bits[word] & mask != 0)
    }

    /// Writes the filter.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.bits.len() as u32).to_le_bytes())?;
        // Hash count (1 byte) + 3 bytes reserved
        writer.write_all(&[self.hash_count, 0, 0, 0])?;
        for word in &self.bits {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a filter.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let num_words = u32::from_le_bytes(buf4) as usize;

        reader.read_exact(&mut buf4)?;
        let hash_count = buf4[0];

        let mut bits = Vec::with_capacity(num_words.min(1 << 20));
        let mut buf8 = [0u8; 8];
        for _ in 0..num_words {
            reader.read_exact(&mut buf8)?;
            bits.push(u64::from_le_bytes(buf8));
        }

        Ok(Self { bits, hash_count })
    }
}

/// Block index: entries in block order plus a Bloom filter over keys.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
    bloom: BloomFilter,
}

impl BlockIndex {
    /// Builds an index from entries in block order.
    pub fn from_entries(entries: Vec<IndexEntry>) -> Self {
        let mut bloom = BloomFilter::new(entries.len());
        for entry in &entries {
            bloom.insert(&entry.key);
        }
        Self { entries, bloom }
    }

    /// Returns true if some block carries exactly this composite key.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.bloom.maybe_contains(key) && self.entries.iter().any(|e| e.key == key)
    }

    /// Returns the entries in block order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the index.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for entry in &self.entries {
            entry.write_to(writer)?;
        }
        self.bloom.write_to(writer)
    }

    /// Reads an index.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let entry_count = u32::from_le_bytes(buf4) as usize;

        let mut entries = Vec::with_capacity(entry_count.min(1 << 16));
        for _ in 0..entry_count {
            entries.push(IndexEntry::read_from(reader)?);
        }
        let bloom = BloomFilter::read_from(reader)?;

        Ok(Self { entries, bloom })
    }
}

fn array4(slice: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(slice);
    out
}

fn array8(slice: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_size() {
        let mut buf = Vec::new();
        SegmentHeader::default().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = SegmentHeader::with_bounds(-5, 1_000);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let read = SegmentHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, header);
    }

    #[test]
    fn test_header_invalid_magic() {
        let mut buf = Vec::new();
        SegmentHeader::default().write_to(&mut buf).unwrap();
        buf[0] = b'X';
        let result = SegmentHeader::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(PurgeError::InvalidMagic(_))));
    }

    #[test]
    fn test_header_future_version() {
        let mut buf = Vec::new();
        SegmentHeader::default().write_to(&mut buf).unwrap();
        buf[4..6].copy_from_slice(&(SEGMENT_VERSION + 1).to_le_bytes());
        let result = SegmentHeader::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(PurgeError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = SegmentFooter::new(100, 20, 3, 76, 0xDEAD_BEEF);
        let mut buf = Vec::new();
        footer.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), FOOTER_SIZE);
        let read = SegmentFooter::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, footer);
    }

    #[test]
    fn test_footer_invalid_magic() {
        let mut buf = Vec::new();
        SegmentFooter::new(0, 0, 0, 0, 0).write_to(&mut buf).unwrap();
        buf[32] = 0;
        let result = SegmentFooter::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(PurgeError::InvalidMagic(_))));
    }

    #[test]
    fn test_block_size_and_roundtrip() {
        let block = Block::new(b"cpu,host=a#!~#idle".to_vec(), 10, 20, vec![1, 2, 3]);
        let mut buf = Vec::new();
        block.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), block.serialized_size());
        let read = Block::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, block);
    }

    #[test]
    fn test_block_corrupted_crc() {
        let block = Block::new(b"k#!~#f".to_vec(), 0, 0, vec![9; 16]);
        let mut buf = Vec::new();
        block.write_to(&mut buf).unwrap();
        // First payload byte: 2 + 6 + 8 + 8 + 4 = 28
        buf[28] ^= 0xFF;
        let result = Block::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(PurgeError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_block_key_too_long() {
        let key = vec![b'a'; MAX_KEY_LEN + 1];
        let result = Block::encode(&mut Vec::new(), &key, 0, 0, &[]);
        assert!(matches!(result, Err(PurgeError::Corrupted(_))));
    }

    #[test]
    fn test_bloom_filter() {
        let mut bloom = BloomFilter::new(100);
        bloom.insert(b"cpu#!~#a");
        bloom.insert(b"mem#!~#b");
        assert!(bloom.maybe_contains(b"cpu#!~#a"));
        assert!(bloom.maybe_contains(b"mem#!~#b"));
    }

    #[test]
    fn test_block_index_roundtrip() {
        let entries = vec![
            IndexEntry {
                key: b"cpu#!~#a".to_vec(),
                offset: 24,
                size: 40,
                min_ts: 1,
                max_ts: 2,
            },
            IndexEntry {
                key: b"mem#!~#b".to_vec(),
                offset: 64,
                size: 40,
                min_ts: 3,
                max_ts: 4,
            },
        ];
        let index = BlockIndex::from_entries(entries.clone());
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();
        let read = BlockIndex::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read.entries(), &entries[..]);
        assert!(read.contains_key(b"mem#!~#b"));
        assert!(!read.contains_key(b"disk#!~#c"));
    }
}
