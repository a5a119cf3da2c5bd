//! Component F: the MBR codec.
//!
//! Generalizes `hadris-common`'s `Chs` type (`part/mbr.rs`), which hard-codes
//! the 255 heads / 63 sectors-per-track BIOS translation, to whatever
//! geometry the disk handle actually reports: the installer must agree with
//! the translation the booted BIOS/bootloader used, not a fixed scheme, so
//! every conversion here takes a [`Geometry`] rather than assuming one.

use efpak_io::{Error, Result};

/// Number of partition entries a classic DOS MBR carries.
pub const MBR_ENTRY_COUNT: usize = 4;
/// Size in bytes of a sector-0 MBR image: 446 bytes of bootcode, four
/// 16-byte entries, and the 2-byte `0x55 0xAA` signature.
pub const MBR_SIZE: usize = 512;

const BOOT_CODE_LEN: usize = 446;
const ENTRY_LEN: usize = 16;
const PARTITION_TABLE_OFFSET: usize = BOOT_CODE_LEN;
const SIGNATURE_OFFSET: usize = 510;

/// The only two partition types the installer manages: FAT32 with LBA
/// addressing (boot) and Linux native (root, app).
pub const PART_TYPE_FAT32_LBA: u8 = 0x0c;
pub const PART_TYPE_LINUX: u8 = 0x83;

pub const STATUS_ACTIVE: u8 = 0x80;
pub const STATUS_INACTIVE: u8 = 0x00;

/// CHS geometry as reported by `HDIO_GETGEO`, or the fallback the installer
/// uses when that ioctl isn't available on the underlying device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

impl Geometry {
    pub const FALLBACK_HEADS: u32 = 255;
    pub const FALLBACK_SECTORS: u32 = 63;

    /// The geometry `disk.c`'s `get_chs_geom` falls back to when
    /// `HDIO_GETGEO` fails: a fixed 255/63 BIOS translation with the
    /// cylinder count derived from the reported sector count.
    pub fn fallback(total_sectors: u64) -> Self {
        let spc = Self::FALLBACK_HEADS as u64 * Self::FALLBACK_SECTORS as u64;
        Self {
            heads: Self::FALLBACK_HEADS,
            sectors: Self::FALLBACK_SECTORS,
            cylinders: (total_sectors / spc) as u32,
        }
    }
}

/// A 3-byte CHS address as packed into an MBR entry: head, then
/// sector-in-low-6-bits/cylinder-high-bits, then cylinder-low-8-bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Chs(pub [u8; 3]);

/// The sentinel CHS value meaning "beyond what CHS addressing can reach"
/// (cylinder > 1023): every field saturated to `0xFF`.
pub const CHS_OUT_OF_RANGE: Chs = Chs([0xFF, 0xFF, 0xFF]);

/// Converts a 0-based LBA to a CHS address under `geom`. Saturates to
/// [`CHS_OUT_OF_RANGE`] once the cylinder would exceed the 10-bit field,
/// the same overflow `hadris-common::part::mbr::Chs::new` guards against.
pub fn lba_to_chs(geom: Geometry, lba: u64) -> Chs {
    let spt = geom.sectors as u64;
    let hpc = geom.heads as u64;
    if spt == 0 || hpc == 0 {
        return CHS_OUT_OF_RANGE;
    }
    let c = lba / (spt * hpc);
    if c > 0x3ff {
        return CHS_OUT_OF_RANGE;
    }
    let h = (lba / spt) % hpc;
    let s = (lba % spt) + 1;
    Chs([
        h as u8,
        (s as u8 & 0x3f) | (((c >> 2) & 0xc0) as u8),
        c as u8,
    ])
}

/// Recovers the LBA a CHS address encodes under `geom`. The inverse of
/// [`lba_to_chs`]; [`CHS_OUT_OF_RANGE`] maps back to `u64::MAX`.
pub fn chs_to_lba(geom: Geometry, chs: Chs) -> u64 {
    if chs == CHS_OUT_OF_RANGE {
        return u64::MAX;
    }
    let spt = geom.sectors as u64;
    let hpc = geom.heads as u64;
    let hi = ((chs.0[1] as u64) << 2) & !0xffu64;
    let c = hi | chs.0[2] as u64;
    let h = chs.0[0] as u64;
    let s = (chs.0[1] & 0x3f) as u64;
    (c * hpc + h) * spt + s - 1
}

/// One 16-byte MBR partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbrEntry {
    pub status: u8,
    pub first_chs: Chs,
    pub part_type: u8,
    pub last_chs: Chs,
    pub first_lba: u32,
    pub sector_count: u32,
}

impl MbrEntry {
    fn parse(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), ENTRY_LEN);
        Self {
            status: buf[0],
            first_chs: Chs([buf[1], buf[2], buf[3]]),
            part_type: buf[4],
            last_chs: Chs([buf[5], buf[6], buf[7]]),
            first_lba: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            sector_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), ENTRY_LEN);
        buf[0] = self.status;
        buf[1..4].copy_from_slice(&self.first_chs.0);
        buf[4] = self.part_type;
        buf[5..8].copy_from_slice(&self.last_chs.0);
        buf[8..12].copy_from_slice(&self.first_lba.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sector_count.to_le_bytes());
    }

    /// `status` has no bits set below the active bit, and `part_type` is one
    /// of the two types the installer manages. A valid-but-inactive entry is
    /// still a real partition; `is_valid` doesn't imply `is_active`.
    pub fn is_valid(&self) -> bool {
        (self.status & !STATUS_ACTIVE) == 0
            && matches!(self.part_type, PART_TYPE_FAT32_LBA | PART_TYPE_LINUX)
    }

    pub fn is_active(&self) -> bool {
        self.status & STATUS_ACTIVE != 0
    }

    /// Writes `off`/`size` (in sectors) into both the CHS and LBA fields, so
    /// the two representations never disagree, per §3's invariant.
    pub fn set_addr(&mut self, geom: Geometry, off: u64, size: u64) {
        self.first_chs = lba_to_chs(geom, off);
        self.last_chs = lba_to_chs(geom, off + size - 1);
        self.first_lba = off as u32;
        self.sector_count = size as u32;
    }

    /// Reads `(offset, size)` in sectors from the LBA fields, which the
    /// installer treats as authoritative over CHS (`get_mbe_addr`'s `#if 0`
    /// branch in the original is dead code; only the LBA path is live).
    pub fn addr(&self) -> (u64, u64) {
        (self.first_lba as u64, self.sector_count as u64)
    }
}

/// The full sector-0 MBR: 446 bytes of bootcode (opaque to us — never
/// inspected, always round-tripped byte-for-byte) plus the four entries and
/// the `0x55 0xAA` signature.
#[derive(Clone)]
pub struct Mbr {
    pub boot_code: [u8; BOOT_CODE_LEN],
    pub entries: [MbrEntry; MBR_ENTRY_COUNT],
}

impl Mbr {
    /// Parses a 512-byte sector. Fails if the buffer is short or the
    /// `0x55 0xAA` signature is missing.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < MBR_SIZE {
            return Err(Error::Format(format!(
                "mbr sector is {} bytes, need {MBR_SIZE}",
                buf.len()
            )));
        }
        if !is_valid_signature(buf) {
            return Err(Error::Format("missing 0x55 0xAA mbr signature".into()));
        }
        let mut boot_code = [0u8; BOOT_CODE_LEN];
        boot_code.copy_from_slice(&buf[..BOOT_CODE_LEN]);
        let mut entries = [MbrEntry::default(); MBR_ENTRY_COUNT];
        for (i, entry) in entries.iter_mut().enumerate() {
            let start = PARTITION_TABLE_OFFSET + i * ENTRY_LEN;
            *entry = MbrEntry::parse(&buf[start..start + ENTRY_LEN]);
        }
        Ok(Self { boot_code, entries })
    }

    pub fn to_bytes(&self) -> [u8; MBR_SIZE] {
        let mut buf = [0u8; MBR_SIZE];
        buf[..BOOT_CODE_LEN].copy_from_slice(&self.boot_code);
        for (i, entry) in self.entries.iter().enumerate() {
            let start = PARTITION_TABLE_OFFSET + i * ENTRY_LEN;
            entry.write(&mut buf[start..start + ENTRY_LEN]);
        }
        buf[SIGNATURE_OFFSET] = 0x55;
        buf[SIGNATURE_OFFSET + 1] = 0xaa;
        buf
    }

    /// Index of the first active entry, or [`MBR_ENTRY_COUNT`] if none are.
    pub fn find_active(&self) -> usize {
        self.entries
            .iter()
            .position(|e| e.is_active())
            .unwrap_or(MBR_ENTRY_COUNT)
    }

    /// A boot sector with no partitions yet: all-zero bootcode, no valid
    /// entries. What a freshly provisioned device starts from before its
    /// first install.
    pub fn blank() -> Self {
        Self { boot_code: [0u8; BOOT_CODE_LEN], entries: [MbrEntry::default(); MBR_ENTRY_COUNT] }
    }
}

pub fn is_valid_signature(buf: &[u8]) -> bool {
    buf.len() >= MBR_SIZE && buf[SIGNATURE_OFFSET] == 0x55 && buf[SIGNATURE_OFFSET + 1] == 0xaa
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry { cylinders: 1024, heads: 255, sectors: 63 }
    }

    #[test]
    fn chs_lba_round_trip() {
        let geom = geom();
        for lba in [0u64, 1, 62, 63, 63 * 254, 63 * 255, 63 * 255 * 1023] {
            let chs = lba_to_chs(geom, lba);
            assert_eq!(chs_to_lba(geom, chs), lba, "lba {lba}");
        }
    }

    #[test]
    fn chs_overflow_saturates() {
        let geom = geom();
        let chs = lba_to_chs(geom, 63 * 255 * 1024);
        assert_eq!(chs, CHS_OUT_OF_RANGE);
        assert_eq!(chs_to_lba(geom, chs), u64::MAX);
    }

    #[test]
    fn entry_validity() {
        let mut e = MbrEntry::default();
        e.part_type = PART_TYPE_LINUX;
        assert!(e.is_valid());
        assert!(!e.is_active());
        e.status = STATUS_ACTIVE;
        assert!(e.is_valid());
        assert!(e.is_active());
        e.status = 0x40;
        assert!(!e.is_valid());
        e.status = STATUS_ACTIVE;
        e.part_type = 0x07;
        assert!(!e.is_valid());
    }

    #[test]
    fn mbr_round_trip() {
        let mut mbr = Mbr { boot_code: [0u8; BOOT_CODE_LEN], entries: [MbrEntry::default(); 4] };
        mbr.boot_code[0] = 0xeb;
        mbr.entries[0].status = STATUS_ACTIVE;
        mbr.entries[0].part_type = PART_TYPE_FAT32_LBA;
        mbr.entries[0].set_addr(geom(), 2048, 1024);
        let bytes = mbr.to_bytes();
        assert!(is_valid_signature(&bytes));
        let parsed = Mbr::parse(&bytes).unwrap();
        assert_eq!(parsed.boot_code, mbr.boot_code);
        assert_eq!(parsed.find_active(), 0);
        assert_eq!(parsed.entries[0].addr(), (2048, 1024));
    }

    #[test]
    fn rejects_missing_signature() {
        let buf = [0u8; MBR_SIZE];
        assert!(Mbr::parse(&buf).is_err());
    }
}
