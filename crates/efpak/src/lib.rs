//! Authoring and extraction helpers over the efpak container format, plus
//! the disk installer. Re-exports [`efpak_format`] and [`efpak_disk`] so a
//! caller rarely needs to depend on either directly — the same role the
//! facade crate in the teacher's own workspace plays over its format and
//! filesystem crates.

pub mod hooks;

pub use efpak_disk::{Installer, Mbr, RawDisk};
pub use efpak_format::{
    BlockHeader, BlockTail, BlockType, Compression, FsId, HookExec, HookResult, HookWhen,
    InMemoryPackage, InputStream, OutputStream, PackageFile, PartId,
};
pub use efpak_io::{Error, Result};

use efpak_format::block::path_tail_to_str;
use std::path::Path;

/// One block's fields, copied out of a borrowed [`BlockHeader`] into an
/// owned struct so a summary can outlive the reader it came from.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub index: usize,
    pub block_type: BlockType,
    pub comp: Compression,
    pub header_size: u64,
    pub comp_data_size: u64,
    pub raw_data_size: u64,
    pub detail: String,
}

/// Creates a new, empty package at `path`. Fails if `path` already exists.
pub fn create<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        return Err(Error::Operation(format!("{} already exists", path.display())));
    }
    OutputStream::create_or_open(path)?;
    log::info!("created empty package at {}", path.display());
    Ok(())
}

/// Walks every block of the package at `path` and returns one summary per
/// block, in stream order.
pub fn list<P: AsRef<Path>>(path: P) -> Result<Vec<BlockSummary>> {
    let file = PackageFile::open(path)?;
    let mut reader = file.reader();
    let mut out = Vec::new();
    let mut index = 0;
    while let Some(header) = reader.next_block()? {
        out.push(summarize(index, &header));
        index += 1;
    }
    Ok(out)
}

fn summarize(index: usize, header: &BlockHeader<'_>) -> BlockSummary {
    let detail = match &header.tail {
        BlockTail::Format { signature, vers } => format!("signature={signature:?} vers={vers}"),
        BlockTail::Disk => String::new(),
        BlockTail::Part { part_id, fs_id } => format!("part_id={part_id} fs_id={fs_id}"),
        BlockTail::File { path } => match path_tail_to_str(path) {
            Ok(p) => p.to_string(),
            Err(_) => "<invalid>".to_string(),
        },
        BlockTail::Hook { when, exec, path } => match path_tail_to_str(path) {
            Ok(p) => format!("when={when:?} exec={exec:?} path={p}"),
            Err(_) => "<invalid>".to_string(),
        },
        BlockTail::Unknown => String::new(),
    };
    BlockSummary {
        index,
        block_type: header.block_type,
        comp: header.comp,
        header_size: header.header_size,
        comp_data_size: header.comp_data_size,
        raw_data_size: header.raw_data_size,
        detail,
    }
}

/// Writes every block's decoded payload to `dir/%04x`, in stream order,
/// including the leading FORMAT block.
pub fn extract<P: AsRef<Path>, D: AsRef<Path>>(path: P, dir: D) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(Error::Io)?;
    let file = PackageFile::open(path)?;
    let mut reader = file.reader();
    let mut index = 0usize;
    while let Some(header) = reader.next_block()? {
        let out_path = dir.join(format!("{index:04x}"));
        let mut out = std::fs::File::create(&out_path).map_err(Error::Io)?;
        reader.start_block()?;
        let result = drain_block(&mut reader, header.raw_data_size, &mut out);
        reader.end_block();
        result?;
        log::debug!("extracted {:?} block to {}", header.block_type, out_path.display());
        index += 1;
    }
    Ok(())
}

fn drain_block(reader: &mut InputStream<'_>, mut remaining: u64, out: &mut std::fs::File) -> Result<()> {
    use std::io::Write;
    const CHUNK: u64 = 1024 * 1024;
    while remaining > 0 {
        let want = remaining.min(CHUNK);
        let chunk = reader.next(Some(want))?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(chunk).map_err(Error::Io)?;
        remaining -= chunk.len() as u64;
    }
    Ok(())
}

/// Recursively adds every regular file under `src` to the package at
/// `package_path`, each as a FILE block whose destination is `dest_prefix`
/// joined with the file's path relative to `src`.
///
/// Does not guard against symlink cycles: `read_dir` never descends into a
/// directory through itself, and the original tool doesn't guard against
/// cycles through symlinks either, so neither do we.
pub fn add_dir<P: AsRef<Path>>(package_path: P, src: &Path, dest_prefix: &str) -> Result<()> {
    let mut stream = OutputStream::create_or_open(package_path)?;
    add_dir_rec(&mut stream, src, src, dest_prefix)
}

fn add_dir_rec(stream: &mut OutputStream, root: &Path, dir: &Path, dest_prefix: &str) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(Error::Io)? {
        let entry = entry.map_err(Error::Io)?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(Error::Io)?;
        if file_type.is_dir() {
            add_dir_rec(stream, root, &path, dest_prefix)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| Error::Operation("walked file escaped its own root".into()))?;
            let dest = format!("{}/{}", dest_prefix.trim_end_matches('/'), rel.display());
            stream.add_file(&path, &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn create_refuses_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.efpak");
        create(&path).unwrap();
        assert!(create(&path).is_err());
    }

    #[test]
    fn list_sees_the_leading_format_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.efpak");
        create(&path).unwrap();
        let blocks = list(&path).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_type, BlockType::Format);
    }

    #[test]
    fn add_dir_walks_nested_files() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.txt"), b"a").unwrap();
        std::fs::File::create(src.path().join("sub/b.txt"))
            .unwrap()
            .write_all(b"b")
            .unwrap();

        let pkg_dir = tempfile::tempdir().unwrap();
        let pkg_path = pkg_dir.path().join("pkg.efpak");
        add_dir(&pkg_path, src.path(), "/opt/app").unwrap();

        let blocks = list(&pkg_path).unwrap();
        let files: Vec<_> = blocks
            .iter()
            .filter(|b| b.block_type == BlockType::File)
            .collect();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|b| b.detail == "/opt/app/a.txt"));
        assert!(files.iter().any(|b| b.detail == "/opt/app/sub/b.txt"));
    }

    #[test]
    fn extract_writes_one_file_per_block() {
        let dir = tempfile::tempdir().unwrap();
        let pkg_path = dir.path().join("pkg.efpak");
        create(&pkg_path).unwrap();

        let out_dir = dir.path().join("out");
        extract(&pkg_path, &out_dir).unwrap();
        assert!(out_dir.join("0000").exists());
    }
}
