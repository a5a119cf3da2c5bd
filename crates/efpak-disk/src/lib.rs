//! Partitioned-disk install: the MBR codec, the raw disk handle, and the
//! A/B install orchestrator that ties them together.
//!
//! Linux-only: geometry discovery, sector I/O and partition enumeration all
//! go through Linux-specific ioctls and `/sys/class/block`.

pub mod disk;
pub mod install;
pub mod kernel;
pub mod layout;
pub mod mbr;

pub use disk::{ExistingPartition, RawDisk, SectorWriter};
pub use install::Installer;
pub use kernel::{publish_and_mount, MountGuard};
pub use layout::{select_target, Band, Layout};
pub use mbr::{Chs, Geometry, Mbr, MbrEntry};
