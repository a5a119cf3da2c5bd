//! Component B: the block memory reader.
//!
//! A uniform "seek + next-chunk" cursor over a single block's payload. The
//! source's C implementation dispatches through a pair of function pointers
//! per the backing store (RAM slice vs. inflater); here that's a tagged
//! `enum`, which is the idiomatic replacement the design notes call for.

use crate::inflate::{Inflater, DEFAULT_OSIZE};
use efpak_io::Error;

/// A raw, uncompressed payload slice. Seeks are unconstrained within
/// `[0, len]`; `next` hands back a sub-slice and advances the cursor.
pub struct RamReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> RamReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn seek(&mut self, offset: u64) -> efpak_io::Result<()> {
        let offset = offset as usize;
        if offset > self.data.len() {
            return Err(Error::Format("seek past end of block payload".into()));
        }
        self.cursor = offset;
        Ok(())
    }

    /// Returns up to `want` bytes (or everything remaining when `want` is
    /// `None`) starting at the cursor, then advances past them.
    pub fn next(&mut self, want: Option<u64>) -> efpak_io::Result<&'a [u8]> {
        let remaining = self.data.len() - self.cursor;
        let take = want.map(|w| (w as usize).min(remaining)).unwrap_or(remaining);
        let slice = &self.data[self.cursor..self.cursor + take];
        self.cursor += take;
        Ok(slice)
    }
}

/// A gzip-framed payload, decoded on the fly. Forward-seek only: reaching an
/// earlier offset would require re-decoding from the start, which the
/// format's design deliberately doesn't support (installs stream forward
/// once, and `list`/`extract` don't need backward seeks either).
pub struct InflateReader<'a> {
    inflater: Inflater<'a>,
    obuf: Vec<u8>,
    obuf_len: usize,
    obuf_pos: usize,
    logical_offset: u64,
}

impl<'a> InflateReader<'a> {
    pub fn new(compressed: &'a [u8]) -> Self {
        let mut inflater = Inflater::new();
        inflater.set_single_input(compressed);
        Self {
            inflater,
            obuf: vec![0u8; DEFAULT_OSIZE],
            obuf_len: 0,
            obuf_pos: 0,
            logical_offset: 0,
        }
    }

    fn refill(&mut self) -> efpak_io::Result<bool> {
        self.obuf_len = self.inflater.next_output(&mut self.obuf)?;
        self.obuf_pos = 0;
        Ok(self.obuf_len > 0)
    }

    pub fn seek(&mut self, offset: u64) -> efpak_io::Result<()> {
        if offset < self.logical_offset {
            return Err(Error::Format(
                "inflate block reader cannot seek backward".into(),
            ));
        }
        while self.logical_offset < offset {
            if self.obuf_pos == self.obuf_len && !self.refill()? {
                return Err(Error::Format(
                    "seek target lies beyond end of block payload".into(),
                ));
            }
            let avail = self.obuf_len - self.obuf_pos;
            let need = (offset - self.logical_offset) as usize;
            let take = need.min(avail);
            self.obuf_pos += take;
            self.logical_offset += take as u64;
        }
        Ok(())
    }

    /// Returns up to `want` bytes (or the rest of the current decoded chunk
    /// when `want` is `None`). Pulls a fresh chunk from the decoder only
    /// when the current one is exhausted, so callers who want sector-sized
    /// pieces get them without forcing extra decoder work.
    pub fn next(&mut self, want: Option<u64>) -> efpak_io::Result<&[u8]> {
        if self.obuf_pos == self.obuf_len {
            self.refill()?;
        }
        let avail = self.obuf_len - self.obuf_pos;
        let take = want.map(|w| (w as usize).min(avail)).unwrap_or(avail);
        let start = self.obuf_pos;
        self.obuf_pos += take;
        self.logical_offset += take as u64;
        Ok(&self.obuf[start..start + take])
    }
}

/// The polymorphic block payload cursor: a raw slice or a decompressing
/// view over one, behind a single interface.
pub enum BlockMemory<'a> {
    Ram(RamReader<'a>),
    Inflate(InflateReader<'a>),
}

impl<'a> BlockMemory<'a> {
    pub fn seek(&mut self, offset: u64) -> efpak_io::Result<()> {
        match self {
            Self::Ram(r) => r.seek(offset),
            Self::Inflate(r) => r.seek(offset),
        }
    }

    pub fn next(&mut self, want: Option<u64>) -> efpak_io::Result<&[u8]> {
        match self {
            Self::Ram(r) => r.next(want),
            Self::Inflate(r) => r.next(want),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn ram_reader_seeks_and_reads_sub_slices() {
        let data = b"0123456789";
        let mut reader = RamReader::new(data);
        assert_eq!(reader.next(Some(4)).unwrap(), b"0123");
        reader.seek(8).unwrap();
        assert_eq!(reader.next(None).unwrap(), b"89");
    }

    #[test]
    fn ram_reader_seek_past_end_is_an_error() {
        let data = b"abc";
        let mut reader = RamReader::new(data);
        assert!(reader.seek(10).is_err());
    }

    #[test]
    fn inflate_reader_decodes_forward_and_rejects_backward_seek() {
        let payload = b"efpak payload data repeated ".repeat(50);
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut reader = InflateReader::new(&compressed);
        reader.seek(10).unwrap();
        let chunk = reader.next(Some(5)).unwrap().to_vec();
        assert_eq!(chunk, payload[10..15]);
        assert!(reader.seek(5).is_err());
    }

    #[test]
    fn block_memory_dispatches_to_the_active_variant() {
        let data = b"hello world";
        let mut mem = BlockMemory::Ram(RamReader::new(data));
        assert_eq!(mem.next(Some(5)).unwrap(), b"hello");
    }
}
