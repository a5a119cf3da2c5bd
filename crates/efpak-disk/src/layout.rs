//! Component G (part 1): the static area/band layout over the device.
//!
//! Mirrors `install_get_part_layout`: reserve a small "empty" region for the
//! MBR and a bootloader stage, then one band per managed partition kind,
//! each band sized for two install slots (A/B) so the installer can always
//! write the *inactive* half while the active one stays live and mounted.
//! Boot, root and app occupy three consecutive MBR entries starting at
//! whichever entry is currently active — not a fixed `[0, 1, 2]` — so the
//! same three-partition scheme keeps working after the active entry has
//! moved to index 1 (§9's design note (c)).

use crate::mbr::Mbr;
use efpak_format::PartId;
use efpak_io::{Error, Result};

const MIB: u64 = 1024 * 1024;
const SECTOR_SIZE: u64 = 512;

/// MBR sector plus a 2MiB bootloader staging area, matching the source's
/// `EMPTY_PART_SIZE`.
pub const EMPTY_SIZE: u64 = (SECTOR_SIZE + 2 * MIB) / SECTOR_SIZE;
/// Band big enough for two 256MiB boot slots.
pub const BOOT_BAND_SIZE: u64 = 2 * 256 * MIB / SECTOR_SIZE;
/// Band big enough for two 512MiB root slots.
pub const ROOT_BAND_SIZE: u64 = 2 * 512 * MIB / SECTOR_SIZE;
/// Band big enough for two 512MiB app slots.
pub const APP_BAND_SIZE: u64 = 2 * 512 * MIB / SECTOR_SIZE;

/// One managed partition's band: offset and total size in sectors, covering
/// both A/B slots back to back.
#[derive(Debug, Clone, Copy)]
pub struct Band {
    pub offset: u64,
    pub size: u64,
}

impl Band {
    /// The lower half: `area_off[i]` in §4.G's notation.
    pub fn lower_half(&self) -> (u64, u64) {
        (self.offset, self.size / 2)
    }

    /// The upper half: `area_off[i] + area_size[i]/2`.
    pub fn upper_half(&self) -> (u64, u64) {
        (self.offset + self.size / 2, self.size / 2)
    }
}

/// The full set of bands the installer manages, laid out back to back
/// starting at sector 0, plus the MBR entry index boot/root/app occupy.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub boot_index: usize,
    pub empty: Band,
    pub boot: Band,
    pub root: Band,
    pub app: Band,
}

impl Layout {
    /// Lays the bands out in order (empty, boot, root, app), checks the
    /// device is large enough to hold all of them, and records which MBR
    /// entry the boot partition occupies in `mbr` — root and app follow at
    /// `boot_index + 1` and `boot_index + 2`.
    ///
    /// `boot_index` must be 0 or 1 so three consecutive entries exist to
    /// hold boot/root/app; a device with no active entry at all (a virgin
    /// disk that has never received a DISK block) fails here; it needs a
    /// DISK install first, which establishes its own layout from the
    /// incoming image's MBR instead of the device's current one.
    pub fn compute(total_sectors: u64, mbr: &Mbr) -> Result<Self> {
        let boot_index = mbr.find_active();
        if boot_index > 1 {
            return Err(Error::Layout(format!(
                "active mbr entry {boot_index} leaves no room for the three consecutive boot/root/app entries"
            )));
        }

        let empty = Band { offset: 0, size: EMPTY_SIZE };
        let boot = Band { offset: empty.offset + empty.size, size: BOOT_BAND_SIZE };
        let root = Band { offset: boot.offset + boot.size, size: ROOT_BAND_SIZE };
        let app = Band { offset: root.offset + root.size, size: APP_BAND_SIZE };
        let required = app.offset + app.size;
        // 4 GiB worth of 512-byte sectors: the installer never addresses
        // past this regardless of how large the device actually is.
        let addressable = total_sectors.min((4 * 1024 * MIB) / SECTOR_SIZE);
        if required > addressable {
            return Err(Error::Layout(format!(
                "device has {total_sectors} addressable sectors, layout needs at least {required}"
            )));
        }
        Ok(Self { boot_index, empty, boot, root, app })
    }

    pub fn band(&self, part_id: PartId) -> Band {
        match part_id {
            PartId::Boot => self.boot,
            PartId::Root => self.root,
            PartId::App => self.app,
        }
    }

    /// The MBR entry `part_id` occupies: three consecutive entries starting
    /// at [`Self::boot_index`].
    pub fn mbr_index(&self, part_id: PartId) -> usize {
        self.boot_index + part_id.index()
    }
}

/// Picks which half of `part_id`'s band to write to this install: the lower
/// half (`area_off[i]`), unless that partition's own MBR entry already
/// points there, in which case the upper half — §4.G's "destination offset
/// is `area_off[i]` unless it equals the currently active `part_off[i]`"
/// rule, read per-partition from its own entry rather than from a single
/// disk-wide A/B flag. A partition with no valid entry yet (never
/// installed) is treated as "not at the lower half" and lands there first.
pub fn select_target(layout: &Layout, mbr: &Mbr, part_id: PartId) -> (u64, u64) {
    let band = layout.band(part_id);
    let entry = &mbr.entries[layout.mbr_index(part_id)];
    let current_offset = if entry.is_valid() { entry.addr().0 } else { 0 };
    if current_offset == band.offset {
        band.upper_half()
    } else {
        band.lower_half()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbr::{MbrEntry, PART_TYPE_LINUX, STATUS_ACTIVE};

    fn blank_mbr() -> Mbr {
        Mbr { boot_code: [0u8; 446], entries: [MbrEntry::default(); 4] }
    }

    fn mbr_active_at(index: usize) -> Mbr {
        let mut mbr = blank_mbr();
        mbr.entries[index].status = STATUS_ACTIVE;
        mbr.entries[index].part_type = PART_TYPE_LINUX;
        mbr
    }

    #[test]
    fn bands_are_contiguous_and_ordered() {
        let layout = Layout::compute(10_000_000, &mbr_active_at(0)).unwrap();
        assert_eq!(layout.boot.offset, layout.empty.offset + layout.empty.size);
        assert_eq!(layout.root.offset, layout.boot.offset + layout.boot.size);
        assert_eq!(layout.app.offset, layout.root.offset + layout.root.size);
    }

    #[test]
    fn rejects_too_small_device() {
        assert!(Layout::compute(1000, &mbr_active_at(0)).is_err());
    }

    #[test]
    fn rejects_no_active_entry() {
        assert!(Layout::compute(10_000_000, &blank_mbr()).is_err());
    }

    #[test]
    fn rejects_active_entry_two_or_three() {
        assert!(Layout::compute(10_000_000, &mbr_active_at(2)).is_err());
    }

    #[test]
    fn mbr_index_follows_boot_index() {
        let layout = Layout::compute(10_000_000, &mbr_active_at(1)).unwrap();
        assert_eq!(layout.boot_index, 1);
        assert_eq!(layout.mbr_index(PartId::Boot), 1);
        assert_eq!(layout.mbr_index(PartId::Root), 2);
        assert_eq!(layout.mbr_index(PartId::App), 3);
    }

    #[test]
    fn select_target_uses_lower_half_when_never_installed() {
        let mbr = mbr_active_at(0);
        let layout = Layout::compute(10_000_000, &mbr).unwrap();
        assert_eq!(select_target(&layout, &mbr, PartId::Root), layout.root.lower_half());
    }

    #[test]
    fn select_target_flips_to_upper_half_once_lower_is_live() {
        let mut mbr = mbr_active_at(0);
        let layout = Layout::compute(10_000_000, &mbr).unwrap();
        let (off, size) = layout.root.lower_half();
        mbr.entries[layout.mbr_index(PartId::Root)].part_type = PART_TYPE_LINUX;
        mbr.entries[layout.mbr_index(PartId::Root)].set_addr(
            crate::mbr::Geometry { cylinders: 1024, heads: 255, sectors: 63 },
            off,
            size,
        );
        assert_eq!(select_target(&layout, &mbr, PartId::Root), layout.root.upper_half());
    }
}
