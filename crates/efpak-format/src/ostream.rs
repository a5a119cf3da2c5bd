//! Component D: the output stream (writer). Appends framed blocks to a
//! package file, compressing payloads above a size threshold.

use crate::block::{BlockType, Compression, FsId, PartId, HookExec, HookWhen, FORMAT_SIGNATURE, PREFIX_LEN};
use efpak_io::Error;
use flate2::write::GzEncoder;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// Payloads at or below this size are stored raw; larger ones are
/// gzip-compressed, matching the authoring tool's own threshold.
pub const COMPRESS_THRESHOLD: u64 = 64 * 1024;

pub struct OutputStream {
    file: File,
}

impl OutputStream {
    /// Opens `path` for appending, creating it if missing. A brand-new
    /// (empty) file immediately gets a FORMAT block written to it, so every
    /// package that exists on disk starts with one.
    pub fn create_or_open<P: AsRef<Path>>(path: P) -> efpak_io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        let mut stream = Self { file };
        if len == 0 {
            stream.write_format_block()?;
        }
        Ok(stream)
    }

    fn write_format_block(&mut self) -> efpak_io::Result<()> {
        let mut tail = Vec::with_capacity(5);
        tail.extend_from_slice(&FORMAT_SIGNATURE);
        tail.push(0); // format vers

        let header_size = (PREFIX_LEN + tail.len()) as u64;
        self.write_header(BlockType::Format, Compression::None, header_size, 0, 0, &tail)?;
        Ok(())
    }

    /// Adds a whole-disk image block: the payload must start with a valid
    /// MBR, but that's the installer's concern to validate, not the
    /// writer's.
    pub fn add_disk(&mut self, image_path: &Path) -> efpak_io::Result<()> {
        let raw = read_source(image_path)?;
        let (comp, payload) = compress_if_large(&raw)?;
        let tail = [0u8]; // dummy byte
        self.write_block(BlockType::Disk, comp, &tail, &payload, raw.len() as u64)
    }

    pub fn add_part(&mut self, image_path: &Path, part_id: PartId, fs_id: FsId) -> efpak_io::Result<()> {
        let raw = read_source(image_path)?;
        let (comp, payload) = compress_if_large(&raw)?;
        let tail = [part_id.to_u8(), fs_id.to_u8()];
        self.write_block(BlockType::Part, comp, &tail, &payload, raw.len() as u64)
    }

    /// Adds a loose file, to be written at `dest` (an absolute path) during
    /// install.
    pub fn add_file(&mut self, local_path: &Path, dest: &str) -> efpak_io::Result<()> {
        let raw = read_source(local_path)?;
        let (comp, payload) = compress_if_large(&raw)?;
        let tail = path_tail(dest);
        self.write_block(BlockType::File, comp, &tail, &payload, raw.len() as u64)
    }

    /// Adds a hook. `data_path` is the object to run (staged under `exec_path`
    /// at install time); when `None`, `exec_path` is instead the path of an
    /// object that already exists on the target and is run in place, and the
    /// block carries no payload.
    pub fn add_hook(
        &mut self,
        data_path: Option<&Path>,
        exec_path: &str,
        when: HookWhen,
        exec: HookExec,
    ) -> efpak_io::Result<()> {
        let mut tail = Vec::new();
        tail.extend_from_slice(&when.bits().to_le_bytes());
        tail.extend_from_slice(&exec.bits().to_le_bytes());
        tail.extend_from_slice(&path_tail(exec_path));

        match data_path {
            Some(path) => {
                let raw = read_source(path)?;
                let (comp, payload) = compress_if_large(&raw)?;
                self.write_block(BlockType::Hook, comp, &tail, &payload, raw.len() as u64)
            }
            None => self.write_block(BlockType::Hook, Compression::None, &tail, &[], 0),
        }
    }

    fn write_block(
        &mut self,
        block_type: BlockType,
        comp: Compression,
        tail: &[u8],
        payload: &[u8],
        raw_len: u64,
    ) -> efpak_io::Result<()> {
        let header_size = (PREFIX_LEN + tail.len()) as u64;
        self.write_header(block_type, comp, header_size, payload.len() as u64, raw_len, tail)?;
        self.file.write_all(payload)?;
        log::debug!(
            "wrote {block_type:?} block: comp={comp:?} header_size={header_size} comp_data_size={} raw_data_size={raw_len}",
            payload.len()
        );
        Ok(())
    }

    fn write_header(
        &mut self,
        block_type: BlockType,
        comp: Compression,
        header_size: u64,
        comp_data_size: u64,
        raw_data_size: u64,
        tail: &[u8],
    ) -> efpak_io::Result<()> {
        let mut buf = Vec::with_capacity(PREFIX_LEN + tail.len());
        buf.push(0); // vers
        buf.push(block_type.to_u8());
        buf.push(comp.to_u8());
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf.extend_from_slice(&comp_data_size.to_le_bytes());
        buf.extend_from_slice(&raw_data_size.to_le_bytes());
        buf.extend_from_slice(tail);
        self.file.write_all(&buf)?;
        Ok(())
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHeader;
    use crate::istream::InputStream;

    #[test]
    fn new_package_starts_with_a_format_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.efpak");
        OutputStream::create_or_open(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = BlockHeader::parse(&bytes).unwrap();
        assert!(header.is_valid_format());
    }

    #[test]
    fn reopening_an_existing_package_does_not_duplicate_the_format_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.efpak");
        OutputStream::create_or_open(&path).unwrap();
        OutputStream::create_or_open(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let mut stream = InputStream::new(&bytes);
        let mut count = 0;
        while stream.next_block().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn small_file_payload_round_trips_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("fw.bin");
        let payload = b"small payload";
        std::fs::write(&src_path, payload).unwrap();

        let pkg_path = dir.path().join("pkg.efpak");
        let mut out = OutputStream::create_or_open(&pkg_path).unwrap();
        out.add_file(&src_path, "/etc/fw.bin").unwrap();
        drop(out);

        let bytes = std::fs::read(&pkg_path).unwrap();
        let mut stream = InputStream::new(&bytes);
        stream.next_block().unwrap(); // FORMAT
        let file_header = stream.next_block().unwrap().unwrap();
        assert_eq!(file_header.block_type, BlockType::File);
        assert_eq!(file_header.comp, Compression::None);

        stream.start_block().unwrap();
        let chunk = stream.next(None).unwrap();
        assert_eq!(chunk, payload);
        stream.end_block();
    }

    #[test]
    fn large_part_payload_is_gzip_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("root.img");
        let payload = vec![0x5a_u8; (COMPRESS_THRESHOLD + 1) as usize];
        std::fs::write(&src_path, &payload).unwrap();

        let pkg_path = dir.path().join("pkg.efpak");
        let mut out = OutputStream::create_or_open(&pkg_path).unwrap();
        out.add_part(&src_path, PartId::Root, FsId::Squash).unwrap();
        drop(out);

        let bytes = std::fs::read(&pkg_path).unwrap();
        let mut stream = InputStream::new(&bytes);
        stream.next_block().unwrap(); // FORMAT
        let part_header = stream.next_block().unwrap().unwrap();
        assert_eq!(part_header.comp, Compression::Gzip);
        assert_eq!(part_header.raw_data_size, payload.len() as u64);
        assert!(part_header.comp_data_size < part_header.raw_data_size);

        stream.start_block().unwrap();
        let mut decoded = Vec::new();
        loop {
            let chunk = stream.next(Some(4096)).unwrap();
            if chunk.is_empty() {
                break;
            }
            decoded.extend_from_slice(chunk);
        }
        stream.end_block();
        assert_eq!(decoded, payload);
    }
}

fn path_tail(path: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(path.len() + 3);
    let path_len = (path.len() + 1) as u16;
    bytes.extend_from_slice(&path_len.to_le_bytes());
    bytes.extend_from_slice(path.as_bytes());
    bytes.push(0);
    bytes
}

fn read_source(path: &Path) -> efpak_io::Result<Vec<u8>> {
    std::fs::read(path).map_err(Error::Io)
}

/// Compresses `raw` with gzip framing if it's larger than
/// [`COMPRESS_THRESHOLD`], otherwise returns it unchanged. Any I/O or
/// compression failure here aborts the whole `add_*` call: the writer is an
/// authoring tool, not a transactional store, so a partial trailing block is
/// the caller's problem to discard, not something this layer recovers from.
fn compress_if_large(raw: &[u8]) -> efpak_io::Result<(Compression, Vec<u8>)> {
    if (raw.len() as u64) <= COMPRESS_THRESHOLD {
        return Ok((Compression::None, raw.to_vec()));
    }
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(raw)
        .map_err(|e| Error::Compression(format!("gzip encode failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::Compression(format!("gzip encode failed: {e}")))?;
    Ok((Compression::Gzip, compressed))
}
