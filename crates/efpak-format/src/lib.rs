//! The efpak container format and streaming codec.
//!
//! A package is an ordered sequence of length-framed blocks: a FORMAT block
//! always leads, followed by any number of DISK, PART, FILE and HOOK
//! blocks. Each block's payload may be stored raw or gzip-framed; readers
//! see a uniform chunked view over either (see [`reader`]) regardless of
//! which.

pub mod block;
pub mod inflate;
pub mod istream;
pub mod ostream;
pub mod reader;

pub use block::{
    BlockHeader, BlockTail, BlockType, Compression, FsId, HookExec, HookResult, HookWhen, PartId,
    FORMAT_SIGNATURE,
};
pub use efpak_io::{Error, Result};
pub use istream::{InMemoryPackage, InputStream, PackageFile};
pub use ostream::OutputStream;
pub use reader::{BlockMemory, InflateReader, RamReader};
