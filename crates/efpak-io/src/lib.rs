//! I/O traits and the shared error type used across the efpak crates.
//!
//! The tool only ever runs hosted on a Linux machine (authoring a package on
//! a workstation, or installing one on the device itself), so unlike some of
//! our other crates there is no no-std story here: we re-export the
//! standard library's I/O traits directly and build our error type on top of
//! [`std::io::Error`].

pub use std::io::{Error as IoError, Read, Seek, SeekFrom, Write};

/// Errors shared by the package codec and the disk installer.
///
/// Each variant corresponds to one of the error kinds in the on-disk format
/// and installer design: a bad signature or truncated block is a
/// [`Error::Format`], an unexpected decompressor return code is a
/// [`Error::Compression`], and so on. Keeping them in one enum lets the
/// installer propagate a [`Read`]/[`Write`] failure from deep inside the
/// block codec without having to know which layer produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error("{0}")]
    Format(String),

    #[error("{0}")]
    Compression(String),

    #[error("{0}")]
    Layout(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Operation(String),
}

pub type Result<T> = core::result::Result<T, Error>;
