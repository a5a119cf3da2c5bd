//! Component A: the streaming inflater.
//!
//! The package writer only ever gzip-frames a block's payload in one shot
//! (the whole compressed slice is known up front, from a memory-mapped
//! source file), so unlike a general-purpose streaming decompressor this
//! type is fed its entire input at construction and immediately told there
//! is no more coming. The `set_input`/`set_eoi` split is kept anyway: it
//! documents the contract a chunked caller would use, and the block memory
//! reader (`BlockMemory::Inflate`) depends on exactly this shape.

use efpak_io::Error;
use flate2::read::MultiGzDecoder;
use std::io::Read;

/// Default output chunk size: large enough to amortize disk writes, and a
/// multiple of the 512-byte sector size the installer writes in.
pub const DEFAULT_OSIZE: usize = 64 * 1024;

pub struct Inflater<'a> {
    decoder: Option<MultiGzDecoder<&'a [u8]>>,
    eoi: bool,
    done: bool,
}

impl<'a> Inflater<'a> {
    /// Allocates an inflater with no input yet attached.
    pub fn new() -> Self {
        Self { decoder: None, eoi: false, done: false }
    }

    /// Replaces the input window. The previous input must have been fully
    /// consumed by `next_output` first.
    pub fn set_input(&mut self, data: &'a [u8]) {
        self.decoder = Some(MultiGzDecoder::new(data));
    }

    /// Declares that no more input will be supplied after the current window.
    pub fn set_eoi(&mut self) {
        self.eoi = true;
    }

    /// Convenience for the common case: the entire compressed block is
    /// already in memory, so feed it and mark end-of-input in one call.
    pub fn set_single_input(&mut self, data: &'a [u8]) {
        self.set_input(data);
        self.set_eoi();
    }

    /// Fills `out` as far as the decoder can go before running dry. Returns
    /// the number of bytes written, which is less than `out.len()` only when
    /// the underlying stream has ended.
    pub fn next_output(&mut self, out: &mut [u8]) -> efpak_io::Result<usize> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::Compression("inflater has no input attached".into()))?;
        let mut total = 0;
        while total < out.len() {
            let n = decoder
                .read(&mut out[total..])
                .map_err(|e| Error::Compression(format!("gzip decode failed: {e}")))?;
            if n == 0 {
                self.done = true;
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// True once end-of-input has been declared and the decoder has
    /// produced its last (possibly empty) chunk.
    pub fn is_done(&self) -> bool {
        self.eoi && self.done
    }
}

impl<'a> Default for Inflater<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decodes_single_chunk() {
        let payload = b"efpak firmware payload".repeat(100);
        let compressed = gzip(&payload);
        let mut inflater = Inflater::new();
        inflater.set_single_input(&compressed);

        let mut out = vec![0u8; payload.len() + 1024];
        let mut total = 0;
        loop {
            let n = inflater.next_output(&mut out[total..]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(&out[..total], &payload[..]);
        assert!(inflater.is_done());
    }

    #[test]
    fn not_done_until_eoi_and_drained() {
        let compressed = gzip(b"short");
        let mut inflater = Inflater::new();
        inflater.set_input(&compressed);
        assert!(!inflater.is_done());
        let mut out = vec![0u8; 64];
        inflater.next_output(&mut out).unwrap();
        // `set_eoi` was never called, so even a fully drained decoder isn't "done".
        assert!(!inflater.is_done());
    }

    #[test]
    fn next_output_without_input_is_an_error() {
        let mut inflater = Inflater::new();
        let mut out = vec![0u8; 16];
        assert!(inflater.next_output(&mut out).is_err());
    }
}
