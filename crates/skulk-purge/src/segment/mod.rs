//! Segment files: on-disk format, reader and writer.

pub mod file;
pub mod reader;
pub mod writer;

pub use file::{Block, BlockIndex, IndexEntry, SegmentFooter, SegmentHeader, SEGMENT_EXTENSION};
pub use reader::{BlockIterator, SegmentReader};
pub use writer::{SegmentFileHandle, SegmentWriter};
