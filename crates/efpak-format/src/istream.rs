//! Component C: the input stream (reader) over a memory-mapped package.

use crate::block::{BlockHeader, Compression};
use crate::reader::{BlockMemory, InflateReader, RamReader};
use efpak_io::Error;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Owns the memory mapping of a package file on disk. Kept separate from
/// [`InputStream`] so the stream itself can borrow the bytes directly
/// rather than through `self`, which sidesteps the self-referential-struct
/// problem a naive port of the C layout would run into.
pub struct PackageFile {
    mmap: Mmap,
}

impl PackageFile {
    pub fn open<P: AsRef<Path>>(path: P) -> efpak_io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the package file is not expected to be mutated by another
        // process while a reader is live; the caller owns that invariant,
        // matching the format's stated shared-resource contract.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> InMemoryPackage {
        InMemoryPackage { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn reader(&self) -> InputStream<'_> {
        InputStream::new(&self.mmap)
    }
}

/// An in-memory stand-in for [`PackageFile`], used by tests and by any
/// caller (the authoring CLI, mostly) that already holds the package bytes
/// without wanting to round-trip them through the filesystem.
pub struct InMemoryPackage {
    bytes: Vec<u8>,
}

impl InMemoryPackage {
    pub fn reader(&self) -> InputStream<'_> {
        InputStream::new(&self.bytes)
    }
}

/// Walks blocks in a package and exposes per-block payload access.
///
/// `'a` is the lifetime of the underlying package bytes, not of the stream
/// itself: a [`BlockHeader`] handed back by [`Self::next_block`] borrows
/// from the package directly, so it is safe to hold on to past subsequent
/// calls, even though it no longer describes "the current block" once the
/// stream has moved on.
pub struct InputStream<'a> {
    data: &'a [u8],
    offset: u64,
    current: Option<BlockHeader<'a>>,
    block: Option<BlockMemory<'a>>,
}

impl<'a> InputStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0, current: None, block: None }
    }

    /// Advances past the previously yielded block (if any) and parses the
    /// header at the new offset. Returns `None` at exactly end-of-stream.
    pub fn next_block(&mut self) -> efpak_io::Result<Option<BlockHeader<'a>>> {
        if self.block.is_some() {
            return Err(Error::Operation(
                "next_block called while still inside a block".into(),
            ));
        }
        if let Some(header) = &self.current {
            let advance = header
                .header_size
                .checked_add(header.comp_data_size)
                .ok_or_else(|| Error::Format("block size overflow".into()))?;
            self.offset = self
                .offset
                .checked_add(advance)
                .ok_or_else(|| Error::Format("block offset overflow".into()))?;
            if self.offset > self.data.len() as u64 {
                return Err(Error::Format(
                    "block extends past end of package".into(),
                ));
            }
        }

        if self.offset == self.data.len() as u64 {
            self.current = None;
            return Ok(None);
        }

        let header = BlockHeader::parse(&self.data[self.offset as usize..])?;
        if self.offset + header.header_size > self.data.len() as u64 {
            return Err(Error::Format("header extends past end of package".into()));
        }
        if self.offset == 0 && !header.is_valid_format() {
            return Err(Error::Format(
                "package does not start with a FORMAT block carrying the EFPK signature".into(),
            ));
        }
        log::trace!(
            "block at offset {}: type={:?} comp={:?} raw_data_size={}",
            self.offset,
            header.block_type,
            header.comp,
            header.raw_data_size
        );
        self.current = Some(header.clone());
        Ok(self.current.clone())
    }

    /// Opens the payload of the current block for reading. Must be matched
    /// with [`Self::end_block`] before the next `next_block` call.
    pub fn start_block(&mut self) -> efpak_io::Result<()> {
        if self.block.is_some() {
            return Err(Error::Operation("already inside a block".into()));
        }
        let header = self
            .current
            .as_ref()
            .ok_or_else(|| Error::Operation("no current block to start".into()))?;

        let payload_start = self.offset + header.header_size;
        let payload_end = payload_start + header.comp_data_size;
        if payload_end > self.data.len() as u64 {
            return Err(Error::Format("block payload extends past end of package".into()));
        }
        let payload = &self.data[payload_start as usize..payload_end as usize];

        let mem = match header.comp {
            Compression::None => BlockMemory::Ram(RamReader::new(payload)),
            Compression::Gzip => BlockMemory::Inflate(InflateReader::new(payload)),
            Compression::Unknown(c) => {
                return Err(Error::Unsupported(format!("unknown block compression {c}")));
            }
        };
        self.block = Some(mem);
        Ok(())
    }

    /// Releases the current block's payload cursor. A no-op if no block is
    /// open, mirroring the source's auto-`end_block` on `fini`.
    pub fn end_block(&mut self) {
        self.block = None;
    }

    pub fn seek(&mut self, offset: u64) -> efpak_io::Result<()> {
        self.block
            .as_mut()
            .ok_or_else(|| Error::Operation("not inside a block".into()))?
            .seek(offset)
    }

    /// Pulls the next chunk of the current block's decoded payload. `want =
    /// None` requests "the rest of what's buffered", matching the backing
    /// reader's natural chunk size rather than a caller-chosen size.
    pub fn next(&mut self, want: Option<u64>) -> efpak_io::Result<&[u8]> {
        self.block
            .as_mut()
            .ok_or_else(|| Error::Operation("not inside a block".into()))?
            .next(want)
    }

    pub fn is_in_block(&self) -> bool {
        self.block.is_some()
    }
}

impl<'a> Drop for InputStream<'a> {
    fn drop(&mut self) {
        // Scope-bound cleanup in place of the source's explicit `fini`.
        self.block = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockType, PartId, PREFIX_LEN};

    /// A FORMAT block followed by one uncompressed FILE block, hand-built so
    /// the reader's iteration can be tested without going through
    /// `OutputStream`.
    fn sample_package(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();

        let mut format_tail = crate::block::FORMAT_SIGNATURE.to_vec();
        format_tail.push(0);
        push_header(&mut buf, 0, 0, &format_tail, 0, 0);

        let mut file_tail = Vec::new();
        let path = b"/etc/fw.conf\0";
        file_tail.extend_from_slice(&(path.len() as u16).to_le_bytes());
        file_tail.extend_from_slice(path);
        push_header(&mut buf, 3, 0, &file_tail, payload.len() as u64, payload.len() as u64);
        buf.extend_from_slice(payload);

        buf
    }

    fn push_header(buf: &mut Vec<u8>, block_type: u8, comp: u8, tail: &[u8], comp_size: u64, raw_size: u64) {
        let header_size = (PREFIX_LEN + tail.len()) as u64;
        buf.push(0);
        buf.push(block_type);
        buf.push(comp);
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf.extend_from_slice(&comp_size.to_le_bytes());
        buf.extend_from_slice(&raw_size.to_le_bytes());
        buf.extend_from_slice(tail);
    }

    #[test]
    fn walks_blocks_in_order() {
        let payload = b"firmware bytes";
        let data = sample_package(payload);
        let mut stream = InputStream::new(&data);

        let format = stream.next_block().unwrap().unwrap();
        assert_eq!(format.block_type, BlockType::Format);

        let file = stream.next_block().unwrap().unwrap();
        assert_eq!(file.block_type, BlockType::File);

        assert!(stream.next_block().unwrap().is_none());
    }

    #[test]
    fn reads_whole_payload_in_chunks() {
        let payload = b"firmware bytes that span more than one chunk request".to_vec();
        let data = sample_package(&payload);
        let mut stream = InputStream::new(&data);
        stream.next_block().unwrap(); // FORMAT
        stream.next_block().unwrap(); // FILE

        stream.start_block().unwrap();
        let mut collected = Vec::new();
        loop {
            let chunk = stream.next(Some(8)).unwrap();
            if chunk.is_empty() {
                break;
            }
            collected.extend_from_slice(chunk);
        }
        stream.end_block();
        assert_eq!(collected, payload);
    }

    #[test]
    fn next_block_while_inside_a_block_is_an_error() {
        let data = sample_package(b"x");
        let mut stream = InputStream::new(&data);
        stream.next_block().unwrap();
        stream.start_block().unwrap();
        assert!(stream.next_block().is_err());
    }

    #[test]
    fn next_without_start_block_is_an_error() {
        let data = sample_package(b"x");
        let mut stream = InputStream::new(&data);
        stream.next_block().unwrap();
        assert!(stream.next(None).is_err());
    }

    #[test]
    fn rejects_a_package_not_starting_with_format() {
        let mut buf = Vec::new();
        let tail = [PartId::Root.to_u8(), crate::block::FsId::Squash.to_u8()];
        push_header(&mut buf, 2, 0, &tail, 0, 0);
        let mut stream = InputStream::new(&buf);
        assert!(stream.next_block().is_err());
    }
}
