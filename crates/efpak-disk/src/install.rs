//! Component G (part 2): the installer.
//!
//! Dispatches every block in a package over a device: DISK and PART blocks
//! go to raw sectors picked by [`layout`], FILE blocks go to the live
//! filesystem by absolute path, HOOK and unrecognized blocks are skipped.
//! The in-memory MBR is only ever patched, never written, until every block
//! has been processed successfully — sector 0 is committed exactly once, at
//! the very end, so a failure partway through an install never leaves the
//! device pointing at a half-written slot.

use crate::disk::{RawDisk, SectorWriter, SECTOR_SIZE};
use crate::kernel::publish_and_mount;
use crate::layout::{select_target, Layout};
use crate::mbr::{is_valid_signature, Mbr, MbrEntry, MBR_SIZE, PART_TYPE_FAT32_LBA, PART_TYPE_LINUX, STATUS_INACTIVE};
use efpak_format::block::path_tail_to_str;
use efpak_format::{BlockHeader, BlockTail, BlockType, FsId, InputStream, PartId};
use efpak_io::{Error, Result};
use std::io::Write;
use std::path::Path;

/// Ties a disk handle to the band layout and in-memory MBR established the
/// first time a DISK or PART block is processed — lazily, per §4.G, so a
/// package made only of FILE/HOOK blocks never has to touch sector 0 at all.
pub struct Installer {
    disk: RawDisk,
    layout: Option<Layout>,
    mbr: Option<Mbr>,
    mbr_dirty: bool,
    saw_disk_block: bool,
    saw_part_block: bool,
}

impl Installer {
    /// Installs onto the device the running root filesystem came from.
    pub fn open_root() -> Result<Self> {
        Ok(Self::from_disk(RawDisk::open_root()?))
    }

    /// Installs onto `/dev/<name>` directly.
    pub fn open_named(name: &str) -> Result<Self> {
        Ok(Self::from_disk(RawDisk::open_named(name)?))
    }

    fn from_disk(disk: RawDisk) -> Self {
        Self { disk, layout: None, mbr: None, mbr_dirty: false, saw_disk_block: false, saw_part_block: false }
    }

    /// Runs every block of `stream` through the installer, then commits the
    /// MBR once if anything changed it.
    pub fn run(&mut self, stream: &mut InputStream<'_>) -> Result<()> {
        while let Some(header) = stream.next_block()? {
            match header.block_type {
                BlockType::Format => {
                    if !header.is_valid_format() {
                        return Err(Error::Format("unexpected FORMAT block signature".into()));
                    }
                }
                BlockType::Disk => self.install_disk(stream, &header)?,
                BlockType::Part => self.install_part(stream, &header)?,
                BlockType::File => self.install_file(stream, &header)?,
                BlockType::Hook | BlockType::Unknown(_) => {
                    log::debug!("skipping {:?} block during install", header.block_type);
                }
            }
        }
        if self.mbr_dirty {
            self.commit_mbr()?;
        }
        Ok(())
    }

    /// Establishes `layout`/`mbr` from the device's own sector 0, the first
    /// time a PART block needs them. A device with no active boot entry
    /// (never provisioned by a DISK block) fails here, per
    /// [`Layout::compute`]'s own check.
    fn ensure_layout_from_device(&mut self) -> Result<()> {
        if self.layout.is_some() {
            return Ok(());
        }
        let mut sector0 = vec![0u8; MBR_SIZE];
        self.disk.read_sectors(0, 1, &mut sector0)?;
        let mbr = if is_valid_signature(&sector0) {
            Mbr::parse(&sector0)?
        } else {
            Mbr::blank()
        };
        let layout = Layout::compute(self.disk.sector_count, &mbr)?;
        log::debug!("install layout established from device mbr, boot entry at index {}", layout.boot_index);
        self.layout = Some(layout);
        self.mbr = Some(mbr);
        Ok(())
    }

    /// Establishes `layout`/`mbr` from an incoming DISK image's own MBR
    /// instead of the device's current one, the first time a DISK block is
    /// processed.
    fn ensure_layout_from_image(&mut self, image_mbr: &Mbr) -> Result<()> {
        if self.layout.is_some() {
            return Ok(());
        }
        let layout = Layout::compute(self.disk.sector_count, image_mbr)?;
        log::debug!("install layout established from disk image mbr, boot entry at index {}", layout.boot_index);
        self.layout = Some(layout);
        self.mbr = Some(image_mbr.clone());
        Ok(())
    }

    fn install_part(&mut self, stream: &mut InputStream<'_>, header: &BlockHeader<'_>) -> Result<()> {
        let (part_id_raw, fs_id_raw) = match &header.tail {
            BlockTail::Part { part_id, fs_id } => (*part_id, *fs_id),
            _ => return Err(Error::Format("PART block missing its tail".into())),
        };
        let part_id = PartId::from_u8(part_id_raw)?;
        let fs_id = FsId::from_u8(fs_id_raw)?;
        if self.saw_disk_block {
            return Err(Error::Operation(
                "PART block cannot follow a DISK block in the same package".into(),
            ));
        }
        self.saw_part_block = true;

        self.ensure_layout_from_device()?;
        let layout = *self.layout.as_ref().unwrap();
        let mbr = self.mbr.as_ref().unwrap();
        let (offset, _) = select_target(&layout, mbr, part_id);
        let band_size = layout.band(part_id).size;
        if header.raw_data_size > band_size * SECTOR_SIZE {
            return Err(Error::Layout(format!(
                "{part_id:?} partition is {} bytes, area holds {}",
                header.raw_data_size,
                band_size * SECTOR_SIZE
            )));
        }

        stream.start_block()?;
        let mut sink = SectorSink::new(&self.disk, offset);
        let result = stream_to_sink(stream, header.raw_data_size, |chunk| sink.write(chunk));
        stream.end_block();
        result?;
        let end_sector = sink.finish()?;
        let written_size = end_sector - offset;

        self.patch_entry(part_id, offset, written_size);
        log::info!("installed {part_id:?} partition at sector {offset} ({written_size} sectors)");

        let guard = publish_and_mount(&self.disk, part_id, fs_id, offset, written_size)?;
        guard.commit();
        Ok(())
    }

    fn install_disk(&mut self, stream: &mut InputStream<'_>, header: &BlockHeader<'_>) -> Result<()> {
        if self.saw_part_block {
            return Err(Error::Operation(
                "DISK block cannot follow a PART block in the same package".into(),
            ));
        }
        self.saw_disk_block = true;

        stream.start_block()?;
        let result = self.install_disk_payload(stream, header.raw_data_size);
        stream.end_block();
        result
    }

    /// A DISK block's payload is itself a whole-disk image: an MBR sector
    /// followed by the bootloader staging area, then the boot, root and app
    /// partition images back to back, in that fixed order, each bounded by
    /// the embedded MBR's own entries. We never copy this image
    /// byte-for-byte onto the target — its bands were sized for whatever
    /// device built it — instead each piece is re-streamed straight into
    /// this device's own band bases (`area_off[i]`, never an inactive-slot
    /// pick: a DISK block provisions a device from scratch, so there is no
    /// live slot to protect).
    fn install_disk_payload(&mut self, stream: &mut InputStream<'_>, total_len: u64) -> Result<()> {
        if total_len < MBR_SIZE as u64 {
            return Err(Error::Format("disk image is shorter than one mbr sector".into()));
        }
        let mut mbr_buf = Vec::with_capacity(MBR_SIZE);
        stream_to_sink(stream, MBR_SIZE as u64, |chunk| {
            mbr_buf.extend_from_slice(chunk);
            Ok(())
        })?;
        let image_mbr = Mbr::parse(&mbr_buf)?;
        self.ensure_layout_from_image(&image_mbr)?;
        let layout = *self.layout.as_ref().unwrap();
        let mut consumed = MBR_SIZE as u64;

        // The image's first managed partition rarely starts at sector 1;
        // whatever lies between is the bootloader staging area, piped
        // straight across to the same sector on the target disk.
        let boot_entry = image_mbr.entries[layout.mbr_index(PartId::Boot)];
        let empty_sectors = boot_entry.addr().0.saturating_sub(1);
        let empty_len = empty_sectors * SECTOR_SIZE;
        {
            let mut sink = SectorSink::new(&self.disk, layout.empty.offset + 1);
            stream_to_sink(stream, empty_len, |chunk| sink.write(chunk))?;
            sink.finish()?;
        }
        consumed += empty_len;

        for part_id in [PartId::Boot, PartId::Root, PartId::App] {
            let entry = image_mbr.entries[layout.mbr_index(part_id)];
            if !entry.is_valid() {
                continue;
            }
            let part_len = entry.addr().1 * SECTOR_SIZE;
            let (offset, _) = layout.band(part_id).lower_half();

            let mut sink = SectorSink::new(&self.disk, offset);
            stream_to_sink(stream, part_len, |chunk| sink.write(chunk))?;
            sink.finish()?;
            consumed += part_len;

            self.patch_entry(part_id, offset, part_len / SECTOR_SIZE);
            log::info!(
                "installed {part_id:?} from disk image at sector {offset} ({} sectors)",
                part_len / SECTOR_SIZE
            );
        }

        if consumed < total_len {
            let trailing = total_len - consumed;
            let mut discarded = 0u64;
            stream_to_sink(stream, trailing, |chunk| {
                discarded += chunk.len() as u64;
                Ok(())
            })?;
            log::debug!("discarded {discarded} trailing byte(s) of disk image padding");
        }
        Ok(())
    }

    fn install_file(&mut self, stream: &mut InputStream<'_>, header: &BlockHeader<'_>) -> Result<()> {
        let path_bytes = match &header.tail {
            BlockTail::File { path } => *path,
            _ => return Err(Error::Format("FILE block missing its tail".into())),
        };
        let path = match path_tail_to_str(path_bytes) {
            Ok(path) => path,
            Err(e) => {
                log::warn!("skipping FILE block with an invalid destination path: {e}");
                return Ok(());
            }
        };
        if !path.starts_with('/') {
            return Err(Error::Operation(format!("FILE destination {path} is not absolute")));
        }
        let dest = Path::new(path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let mut file = std::fs::File::create(dest).map_err(Error::Io)?;

        stream.start_block()?;
        let result = stream_to_sink(stream, header.raw_data_size, |chunk| {
            file.write_all(chunk).map_err(Error::Io)
        });
        stream.end_block();
        result?;
        log::info!("installed file {path} ({} bytes)", header.raw_data_size);
        Ok(())
    }

    /// Writes `part_id`'s new address into its own MBR entry (§4.G's
    /// `mbr_index[i] = boot_index + i`). The app slot gets its status and
    /// type forced to inactive/Linux since it may never have existed before
    /// this install; boot and root keep whatever status they already carry
    /// (boot's active bit in particular must not move — it already points
    /// at the one entry we're updating in place).
    fn patch_entry(&mut self, part_id: PartId, offset: u64, size: u64) {
        let layout = *self.layout.as_ref().unwrap();
        let geometry = self.disk.geometry;
        let idx = layout.mbr_index(part_id);
        let mbr = self.mbr.as_mut().unwrap();
        mbr.entries[idx].set_addr(geometry, offset, size);
        match part_id {
            PartId::Boot => mbr.entries[idx].part_type = PART_TYPE_FAT32_LBA,
            PartId::Root => mbr.entries[idx].part_type = PART_TYPE_LINUX,
            PartId::App => {
                mbr.entries[idx] = MbrEntry {
                    status: STATUS_INACTIVE,
                    part_type: PART_TYPE_LINUX,
                    ..mbr.entries[idx]
                };
            }
        }
        self.mbr_dirty = true;
    }

    fn commit_mbr(&mut self) -> Result<()> {
        let mbr = self.mbr.as_ref().expect("mbr_dirty implies mbr was established");
        self.disk.write_sectors(0, 1, &mbr.to_bytes())?;
        self.mbr_dirty = false;
        log::info!("committed mbr to sector 0");
        Ok(())
    }
}

/// Pulls exactly `remaining` bytes out of the block currently open on
/// `stream`, handing each chunk to `sink` as it arrives. Fails if the block
/// runs dry before `remaining` is satisfied — a short block is a corrupt
/// package, not something to silently zero-fill.
fn stream_to_sink(
    stream: &mut InputStream<'_>,
    mut remaining: u64,
    mut sink: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    const CHUNK: u64 = 1024 * 1024;
    while remaining > 0 {
        let want = remaining.min(CHUNK);
        let chunk = stream.next(Some(want))?;
        if chunk.is_empty() {
            return Err(Error::Format("block payload ended before its declared length".into()));
        }
        sink(chunk)?;
        remaining -= chunk.len() as u64;
    }
    Ok(())
}

/// Buffers a byte stream into whole 512-byte sectors and writes each one to
/// the device as it fills, so callers can feed it payload chunks of any
/// size without worrying about sector alignment. Generic over [`SectorWriter`]
/// rather than tied to [`RawDisk`] directly, so the buffering/padding
/// arithmetic can be tested against an in-memory double.
struct SectorSink<'a, D: SectorWriter> {
    disk: &'a D,
    next_sector: u64,
    pending: Vec<u8>,
}

impl<'a, D: SectorWriter> SectorSink<'a, D> {
    fn new(disk: &'a D, start_sector: u64) -> Self {
        Self { disk, next_sector: start_sector, pending: Vec::with_capacity(SECTOR_SIZE as usize) }
    }

    fn write(&mut self, mut chunk: &[u8]) -> Result<()> {
        let sector_size = SECTOR_SIZE as usize;
        if !self.pending.is_empty() {
            let need = sector_size - self.pending.len();
            let take = need.min(chunk.len());
            self.pending.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.pending.len() == sector_size {
                self.disk.write_sectors(self.next_sector, 1, &self.pending)?;
                self.next_sector += 1;
                self.pending.clear();
            }
        }

        let whole_sectors = chunk.len() / sector_size;
        if whole_sectors > 0 {
            let whole_len = whole_sectors * sector_size;
            self.disk
                .write_sectors(self.next_sector, whole_sectors as u64, &chunk[..whole_len])?;
            self.next_sector += whole_sectors as u64;
            chunk = &chunk[whole_len..];
        }

        self.pending.extend_from_slice(chunk);
        Ok(())
    }

    /// Flushes a trailing partial sector, zero-padded, and returns the
    /// sector just past the last one written.
    fn finish(mut self) -> Result<u64> {
        if !self.pending.is_empty() {
            self.pending.resize(SECTOR_SIZE as usize, 0);
            self.disk.write_sectors(self.next_sector, 1, &self.pending)?;
            self.next_sector += 1;
        }
        Ok(self.next_sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// An in-memory stand-in for [`RawDisk`] that just records every
    /// `(sector, count, bytes)` triple it's asked to write, so
    /// [`SectorSink`]'s buffering/padding arithmetic can be checked without a
    /// real block device.
    #[derive(Default)]
    struct FakeDisk {
        writes: RefCell<Vec<(u64, u64, Vec<u8>)>>,
    }

    impl SectorWriter for FakeDisk {
        fn write_sectors(&self, sector: u64, count: u64, buf: &[u8]) -> Result<()> {
            self.writes.borrow_mut().push((sector, count, buf.to_vec()));
            Ok(())
        }
    }

    impl FakeDisk {
        fn all_bytes(&self) -> Vec<u8> {
            self.writes.borrow().iter().flat_map(|(_, _, buf)| buf.clone()).collect()
        }
    }

    #[test]
    fn sector_sink_buffers_until_a_whole_sector_is_available() {
        let disk = FakeDisk::default();
        let mut sink = SectorSink::new(&disk, 100);
        sink.write(&[1u8; 300]).unwrap();
        assert!(disk.writes.borrow().is_empty(), "a partial sector is not flushed early");
        sink.write(&[2u8; 300]).unwrap();
        assert_eq!(disk.writes.borrow().len(), 1);
        assert_eq!(disk.writes.borrow()[0].0, 100);
    }

    #[test]
    fn sector_sink_pads_a_trailing_partial_sector_with_zeros() {
        let disk = FakeDisk::default();
        let mut sink = SectorSink::new(&disk, 0);
        let payload = vec![0x7au8; 700]; // one whole sector plus 188 bytes
        sink.write(&payload).unwrap();
        let end = sink.finish().unwrap();

        assert_eq!(end, 2, "700 bytes rounds up to 2 sectors");
        let written = disk.all_bytes();
        assert_eq!(written.len(), 2 * SECTOR_SIZE as usize);
        assert_eq!(&written[..700], &payload[..]);
        assert!(written[700..].iter().all(|&b| b == 0), "padding is zero-filled");
    }

    #[test]
    fn sector_sink_passes_whole_sectors_straight_through() {
        let disk = FakeDisk::default();
        let mut sink = SectorSink::new(&disk, 0);
        sink.write(&[9u8; SECTOR_SIZE as usize * 3]).unwrap();
        let end = sink.finish().unwrap();
        assert_eq!(end, 3);
        assert_eq!(disk.all_bytes().len(), 3 * SECTOR_SIZE as usize);
    }

    #[test]
    fn stream_to_sink_errors_on_a_short_block() {
        let data = super::tests_support::sample_package(b"abc");
        let mut stream = InputStream::new(&data);
        stream.next_block().unwrap(); // FORMAT
        stream.next_block().unwrap(); // FILE
        stream.start_block().unwrap();
        // Ask for more than the block actually carries.
        let result = stream_to_sink(&mut stream, 1000, |_| Ok(()));
        assert!(result.is_err());
    }
}

/// A minimal hand-built package shared by this module's tests: a FORMAT
/// block followed by one uncompressed FILE block whose payload is `payload`.
/// Kept out of `mod tests` so `#[cfg(test)]` still gates it.
#[cfg(test)]
mod tests_support {
    use efpak_format::block::{FORMAT_SIGNATURE, PREFIX_LEN};

    pub fn sample_package(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();

        let mut format_tail = FORMAT_SIGNATURE.to_vec();
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
}
