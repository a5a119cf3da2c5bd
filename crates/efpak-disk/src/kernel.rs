//! Kernel partition-table refresh and mount-point management for a freshly
//! written install slot.
//!
//! After [`crate::install::Installer`] finishes streaming a PART block to
//! raw sectors, the new slot still needs to become a live, mounted
//! filesystem before the device can be considered "updated": the running
//! kernel has to learn about the partition (`BLKPG_ADD_PARTITION`), a device
//! node has to exist for it, and it has to be mounted at its fixed staging
//! point. [`publish_and_mount`] drives all three steps and returns a
//! [`MountGuard`] that undoes whichever of them succeeded if the caller
//! drops it without calling [`MountGuard::commit`] — the scope-bound
//! cleanup the design notes call for in place of the source's cascading
//! `goto on_error_N` unwinding.

use crate::disk::RawDisk;
use efpak_format::{FsId, PartId};
use efpak_io::{Error, Result};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

const BLKPG_DEVNAMELTH: usize = 64;
const BLKPG_VOLNAMELTH: usize = 64;
const BLKPG_ADD_PARTITION: i32 = 1;
const BLKPG_DEL_PARTITION: i32 = 2;

/// Mirrors Linux's `struct blkpg_partition` (`linux/blkpg.h`).
#[repr(C)]
struct BlkpgPartition {
    start: i64,
    length: i64,
    pno: i32,
    devname: [libc::c_char; BLKPG_DEVNAMELTH],
    volname: [libc::c_char; BLKPG_VOLNAMELTH],
}

/// Mirrors Linux's `struct blkpg_ioctl_arg`.
#[repr(C)]
struct BlkpgIoctlArg {
    op: i32,
    flags: i32,
    datalen: i32,
    data: *mut libc::c_void,
}

// BLKPG = _IO(0x12, 105): linux/blkpg.h.
nix::ioctl_write_ptr_bad!(blkpg_ioctl, 0x1269, BlkpgIoctlArg);

fn blkpg(fd: RawFd, op: i32, part: &mut BlkpgPartition) -> Result<()> {
    let arg = BlkpgIoctlArg {
        op,
        flags: 0,
        datalen: std::mem::size_of::<BlkpgPartition>() as i32,
        data: part as *mut BlkpgPartition as *mut libc::c_void,
    };
    unsafe { blkpg_ioctl(fd, &arg) }
        .map_err(|e| Error::Io(std::io::Error::from(e)))?;
    Ok(())
}

fn make_partition(dev_path: &Path, pno: i32, offset_sectors: u64, size_sectors: u64) -> BlkpgPartition {
    let mut devname = [0 as libc::c_char; BLKPG_DEVNAMELTH];
    let name_bytes = dev_path.as_os_str().as_encoded_bytes();
    for (dst, &src) in devname.iter_mut().zip(name_bytes.iter()).take(BLKPG_DEVNAMELTH - 1) {
        *dst = src as libc::c_char;
    }
    BlkpgPartition {
        start: (offset_sectors * crate::disk::SECTOR_SIZE) as i64,
        length: (size_sectors * crate::disk::SECTOR_SIZE) as i64,
        pno,
        devname,
        volname: [0 as libc::c_char; BLKPG_VOLNAMELTH],
    }
}

/// The reserved partition number (and device-node minor) for a newly
/// installed slot, per §6: boot/root/app get 5/6/7.
fn reserved_minor(part_id: PartId) -> i32 {
    match part_id {
        PartId::Boot => 5,
        PartId::Root => 6,
        PartId::App => 7,
    }
}

/// The fixed staging mount point for a partition kind.
fn mount_point(part_id: PartId) -> &'static str {
    match part_id {
        PartId::Boot => "/tmp/new_boot",
        PartId::Root => "/tmp/new_root",
        PartId::App => "/tmp/new_app",
    }
}

/// Publishes the sectors `[offset_sectors, offset_sectors + size_sectors)`
/// of `disk` as a new partition, creates its device node if missing, and
/// mounts it read-write (read-only for [`PartId::Root`]) at its fixed
/// staging point.
///
/// Returns a guard that rolls every completed step back on drop unless
/// [`MountGuard::commit`] is called — matching §7's rollback contract: "if
/// mount fails after BLKPG_ADD succeeds, the core undoes BLKPG_ADD and
/// unlinks created nodes before returning."
pub fn publish_and_mount(
    disk: &RawDisk,
    part_id: PartId,
    fs_id: FsId,
    offset_sectors: u64,
    size_sectors: u64,
) -> Result<MountGuard> {
    let pno = reserved_minor(part_id);
    let dev_path = PathBuf::from(format!("{}p{pno}", disk.dev_path.display()));
    let mount_point = PathBuf::from(mount_point(part_id));

    let mut part = make_partition(&dev_path, pno, offset_sectors, size_sectors);
    blkpg(disk.fd(), BLKPG_ADD_PARTITION, &mut part)?;
    log::debug!("published {dev_path:?} to the kernel partition table");

    let mut guard = MountGuard {
        committed: false,
        disk_fd: disk.fd(),
        dev_path,
        mount_point,
        part,
        node_created: false,
        mounted: false,
    };

    if let Err(e) = guard.finish_mount(disk.major, pno, fs_id, part_id) {
        // Guard's Drop performs the rollback; we just propagate the error.
        return Err(e);
    }
    Ok(guard)
}

/// Owns the steps [`publish_and_mount`] performed, so they can be undone in
/// reverse if the caller never calls [`Self::commit`].
pub struct MountGuard {
    committed: bool,
    disk_fd: RawFd,
    dev_path: PathBuf,
    mount_point: PathBuf,
    part: BlkpgPartition,
    node_created: bool,
    mounted: bool,
}

impl MountGuard {
    fn finish_mount(&mut self, major: u32, pno: i32, fs_id: FsId, part_id: PartId) -> Result<()> {
        if !self.dev_path.exists() {
            mknod_block(&self.dev_path, major, pno as u32)?;
            self.node_created = true;
        }
        std::fs::create_dir_all(&self.mount_point).map_err(Error::Io)?;
        // Best-effort: a stale mount from a previous install attempt should
        // not fail this one.
        let _ = nix::mount::umount(&self.mount_point);

        let flags = if part_id == PartId::Root {
            nix::mount::MsFlags::MS_RDONLY
        } else {
            nix::mount::MsFlags::empty()
        };
        nix::mount::mount(
            Some(self.dev_path.as_path()),
            &self.mount_point,
            Some(fs_id.name()),
            flags,
            None::<&str>,
        )
        .map_err(|e| Error::Io(std::io::Error::from(e)))?;
        self.mounted = true;
        log::info!("mounted {:?} at {}", self.dev_path, self.mount_point.display());
        Ok(())
    }

    /// Marks every step performed so far as permanent: [`Drop`] becomes a
    /// no-op. Called once the install for this slot has fully succeeded.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        log::warn!("rolling back partial install of {:?}", self.dev_path);
        if self.mounted {
            let _ = nix::mount::umount(&self.mount_point);
        }
        let _ = std::fs::remove_dir(&self.mount_point);
        if self.node_created {
            let _ = std::fs::remove_file(&self.dev_path);
        }
        let _ = blkpg(self.disk_fd, BLKPG_DEL_PARTITION, &mut self.part);
    }
}

fn mknod_block(path: &Path, major: u32, minor: u32) -> Result<()> {
    let dev = nix::sys::stat::makedev(major as u64, minor as u64);
    nix::sys::stat::mknod(path, nix::sys::stat::SFlag::S_IFBLK, nix::sys::stat::Mode::from_bits_truncate(0o660), dev)
        .map_err(|e| Error::Io(std::io::Error::from(e)))
}
