//! Block header types: the shared prefix every block starts with, and the
//! five type-specific tails that follow it.

use efpak_io::Error;

/// Length of the shared header prefix: `vers`, `type`, `comp`, `header_size`,
/// `comp_data_size`, `raw_data_size`.
pub const PREFIX_LEN: usize = 1 + 1 + 1 + 8 + 8 + 8;

/// The 4-byte magic that opens every package.
pub const FORMAT_SIGNATURE: [u8; 4] = *b"EFPK";

/// One of the block kinds a package can carry. `Unknown` is not an error at
/// parse time: the install loop is specified to skip blocks it doesn't
/// recognize rather than reject the whole package, so the type has to be
/// representable even when it isn't one of the five known values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Format,
    Disk,
    Part,
    File,
    Hook,
    Unknown(u8),
}

impl BlockType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Format,
            1 => Self::Disk,
            2 => Self::Part,
            3 => Self::File,
            4 => Self::Hook,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Format => 0,
            Self::Disk => 1,
            Self::Part => 2,
            Self::File => 3,
            Self::Hook => 4,
            Self::Unknown(v) => v,
        }
    }
}

/// Per-block compression scheme. `comp = 1` is gzip framing over the raw
/// payload (what the writer calls "zlib" for historical reasons, but the
/// window is initialized to accept the gzip header, not raw zlib).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Unknown(u8),
}

impl Compression {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Gzip,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartId {
    Boot,
    Root,
    App,
}

impl PartId {
    pub fn from_u8(v: u8) -> efpak_io::Result<Self> {
        match v {
            0 => Ok(Self::Boot),
            1 => Ok(Self::Root),
            2 => Ok(Self::App),
            other => Err(Error::Unsupported(format!("unknown partition id {other}"))),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Boot => 0,
            Self::Root => 1,
            Self::App => 2,
        }
    }

    /// Index into the three-slot layout table computed by the installer.
    pub fn index(self) -> usize {
        self.to_u8() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsId {
    Vfat,
    Squash,
    Ext2,
    Ext3,
}

impl FsId {
    pub fn from_u8(v: u8) -> efpak_io::Result<Self> {
        match v {
            0 => Ok(Self::Vfat),
            1 => Ok(Self::Squash),
            2 => Ok(Self::Ext2),
            3 => Ok(Self::Ext3),
            other => Err(Error::Unsupported(format!("unknown filesystem id {other}"))),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Vfat => 0,
            Self::Squash => 1,
            Self::Ext2 => 2,
            Self::Ext3 => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Vfat => "vfat",
            Self::Squash => "squashfs",
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
        }
    }

    /// The filesystem a partition kind defaults to when the author doesn't
    /// name one explicitly, mirroring how the authoring tool picks a
    /// filesystem from the partition name alone.
    pub fn default_for(part_id: PartId) -> Self {
        match part_id {
            PartId::Boot => Self::Vfat,
            PartId::Root => Self::Squash,
            PartId::App => Self::Ext3,
        }
    }
}

bitflags::bitflags! {
    /// `when_flags` of a HOOK block: the points in the install process at
    /// which the hook should run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HookWhen: u32 {
        const NOW = 1 << 0;
        const PREX = 1 << 1;
        const POSTX = 1 << 2;
        const COMPL = 1 << 3;
        const MBR = 1 << 4;
    }

    /// `exec_flags` of a HOOK block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HookExec: u32 {
        const EXECVE = 1 << 0;
    }
}

/// Return codes a hook process may report back to the installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    Continue,
    SkipBlock,
    StopSuccess,
    StopError,
}

impl HookResult {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Continue,
            1 => Self::SkipBlock,
            2 => Self::StopSuccess,
            _ => Self::StopError,
        }
    }
}

/// The type-specific tail that follows the shared prefix. Borrows into
/// whatever buffer the header was parsed from, consistent with the reader's
/// borrowed-header design: a `FILE`/`HOOK` path never needs to be copied
/// just to be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockTail<'a> {
    Format { signature: [u8; 4], vers: u8 },
    Disk,
    Part { part_id: u8, fs_id: u8 },
    File { path: &'a [u8] },
    Hook { when: HookWhen, exec: HookExec, path: &'a [u8] },
    /// A HOOK we don't understand the flags of, or any non-enumerated type.
    Unknown,
}

/// A fully parsed block header, borrowed from the package's backing bytes.
///
/// Per the format's lifetime contract, this is valid only as long as the
/// bytes it was parsed from are, which in the reader is the lifetime of the
/// memory-mapped package file, not of any particular call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader<'a> {
    pub vers: u8,
    pub block_type: BlockType,
    pub comp: Compression,
    pub header_size: u64,
    pub comp_data_size: u64,
    pub raw_data_size: u64,
    pub tail: BlockTail<'a>,
}

impl<'a> BlockHeader<'a> {
    /// Parses a header from the start of `buf`. `buf` may extend beyond the
    /// header into the block's payload and subsequent blocks; only
    /// `header_size` bytes of it are consulted.
    pub fn parse(buf: &'a [u8]) -> efpak_io::Result<Self> {
        if buf.len() < PREFIX_LEN {
            return Err(Error::Format("truncated block header".into()));
        }
        let vers = buf[0];
        let block_type = BlockType::from_u8(buf[1]);
        let comp = Compression::from_u8(buf[2]);
        let header_size = u64::from_le_bytes(buf[3..11].try_into().unwrap());
        let comp_data_size = u64::from_le_bytes(buf[11..19].try_into().unwrap());
        let raw_data_size = u64::from_le_bytes(buf[19..27].try_into().unwrap());

        if (header_size as usize) < PREFIX_LEN || (header_size as usize) > buf.len() {
            return Err(Error::Format(format!(
                "header_size {header_size} out of range for available {} bytes",
                buf.len()
            )));
        }
        if matches!(comp, Compression::None) && comp_data_size != raw_data_size {
            return Err(Error::Format(
                "comp_data_size must equal raw_data_size when uncompressed".into(),
            ));
        }

        let tail_buf = &buf[PREFIX_LEN..header_size as usize];
        let tail = match block_type {
            BlockType::Format => {
                if tail_buf.len() < 5 {
                    return Err(Error::Format("truncated FORMAT tail".into()));
                }
                let signature: [u8; 4] = tail_buf[0..4].try_into().unwrap();
                BlockTail::Format { signature, vers: tail_buf[4] }
            }
            BlockType::Disk => BlockTail::Disk,
            BlockType::Part => {
                if tail_buf.len() < 2 {
                    return Err(Error::Format("truncated PART tail".into()));
                }
                BlockTail::Part { part_id: tail_buf[0], fs_id: tail_buf[1] }
            }
            BlockType::File => {
                let path = parse_path_tail(tail_buf)?;
                BlockTail::File { path }
            }
            BlockType::Hook => {
                if tail_buf.len() < 10 {
                    return Err(Error::Format("truncated HOOK tail".into()));
                }
                let when = HookWhen::from_bits_truncate(u32::from_le_bytes(
                    tail_buf[0..4].try_into().unwrap(),
                ));
                let exec = HookExec::from_bits_truncate(u32::from_le_bytes(
                    tail_buf[4..8].try_into().unwrap(),
                ));
                let path = parse_path_tail(&tail_buf[8..])?;
                BlockTail::Hook { when, exec, path }
            }
            BlockType::Unknown(_) => BlockTail::Unknown,
        };

        Ok(Self {
            vers,
            block_type,
            comp,
            header_size,
            comp_data_size,
            raw_data_size,
            tail,
        })
    }

    /// `true` if this is the leading FORMAT block with the expected signature.
    pub fn is_valid_format(&self) -> bool {
        matches!(
            (&self.block_type, &self.tail),
            (BlockType::Format, BlockTail::Format { signature, .. }) if *signature == FORMAT_SIGNATURE
        )
    }
}

/// Parses a `path_len:u16` + path tail, validating only that the declared
/// length fits within the buffer. Whether the path is actually
/// NUL-terminated is left to [`path_tail_to_str`]: a block whose path lacks
/// a terminator is still a structurally valid block, just one that `list`
/// reports as invalid and `install_file` skips, rather than one that aborts
/// the whole package walk.
fn parse_path_tail(buf: &[u8]) -> efpak_io::Result<&[u8]> {
    if buf.len() < 2 {
        return Err(Error::Format("truncated path length".into()));
    }
    let path_len = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize;
    let path_buf = buf.get(2..2 + path_len).ok_or_else(|| {
        Error::Format("declared path_len exceeds header".into())
    })?;
    Ok(path_buf)
}

/// Strips the trailing NUL and decodes a path tail as UTF-8 for display or
/// filesystem use. Errors if no NUL appears within the tail at all: callers
/// (`list`, `install_file`) treat that as a bad block rather than a crash.
pub fn path_tail_to_str(path: &[u8]) -> efpak_io::Result<&str> {
    let end = path
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Format("path is not NUL-terminated within path_len".into()))?;
    core::str::from_utf8(&path[..end])
        .map_err(|e| Error::Format(format!("path is not valid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(block_type: u8, comp: u8, tail: &[u8], comp_data_size: u64, raw_data_size: u64) -> Vec<u8> {
        let header_size = (PREFIX_LEN + tail.len()) as u64;
        let mut buf = vec![0u8, block_type, comp];
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf.extend_from_slice(&comp_data_size.to_le_bytes());
        buf.extend_from_slice(&raw_data_size.to_le_bytes());
        buf.extend_from_slice(tail);
        buf
    }

    #[test]
    fn parses_format_block() {
        let mut tail = FORMAT_SIGNATURE.to_vec();
        tail.push(0);
        let buf = header_bytes(0, 0, &tail, 0, 0);
        let header = BlockHeader::parse(&buf).unwrap();
        assert_eq!(header.block_type, BlockType::Format);
        assert!(header.is_valid_format());
    }

    #[test]
    fn rejects_format_block_with_wrong_signature() {
        let mut tail = b"NOPE".to_vec();
        tail.push(0);
        let buf = header_bytes(0, 0, &tail, 0, 0);
        let header = BlockHeader::parse(&buf).unwrap();
        assert!(!header.is_valid_format());
    }

    #[test]
    fn parses_part_tail() {
        let tail = [PartId::Root.to_u8(), FsId::Squash.to_u8()];
        let buf = header_bytes(2, 0, &tail, 100, 100);
        let header = BlockHeader::parse(&buf).unwrap();
        match header.tail {
            BlockTail::Part { part_id, fs_id } => {
                assert_eq!(PartId::from_u8(part_id).unwrap(), PartId::Root);
                assert_eq!(FsId::from_u8(fs_id).unwrap(), FsId::Squash);
            }
            other => panic!("unexpected tail {other:?}"),
        }
    }

    #[test]
    fn parses_file_tail_path() {
        let mut tail = Vec::new();
        let path = b"/etc/fw.conf\0";
        tail.extend_from_slice(&(path.len() as u16).to_le_bytes());
        tail.extend_from_slice(path);
        let buf = header_bytes(3, 0, &tail, 10, 10);
        let header = BlockHeader::parse(&buf).unwrap();
        match header.tail {
            BlockTail::File { path } => assert_eq!(path_tail_to_str(path).unwrap(), "/etc/fw.conf"),
            other => panic!("unexpected tail {other:?}"),
        }
    }

    #[test]
    fn parses_file_tail_missing_terminator_but_rejects_it_as_a_path() {
        let mut tail = Vec::new();
        let path = b"/etc/fw.conf";
        tail.extend_from_slice(&(path.len() as u16).to_le_bytes());
        tail.extend_from_slice(path);
        let buf = header_bytes(3, 0, &tail, 10, 10);
        let header = BlockHeader::parse(&buf).unwrap();
        match header.tail {
            BlockTail::File { path } => assert!(path_tail_to_str(path).is_err()),
            other => panic!("unexpected tail {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_header() {
        let buf = vec![0u8; PREFIX_LEN - 1];
        assert!(BlockHeader::parse(&buf).is_err());
    }

    #[test]
    fn rejects_mismatched_uncompressed_sizes() {
        let tail = [PartId::Boot.to_u8(), FsId::Vfat.to_u8()];
        let buf = header_bytes(2, 0, &tail, 100, 200);
        assert!(BlockHeader::parse(&buf).is_err());
    }

    #[test]
    fn hook_tail_decodes_flags_and_path() {
        let mut tail = Vec::new();
        tail.extend_from_slice(&HookWhen::PREX.bits().to_le_bytes());
        tail.extend_from_slice(&HookExec::EXECVE.bits().to_le_bytes());
        let path = b"/opt/hook.sh\0";
        tail.extend_from_slice(&(path.len() as u16).to_le_bytes());
        tail.extend_from_slice(path);
        let buf = header_bytes(4, 0, &tail, 5, 5);
        let header = BlockHeader::parse(&buf).unwrap();
        match header.tail {
            BlockTail::Hook { when, exec, path } => {
                assert_eq!(when, HookWhen::PREX);
                assert_eq!(exec, HookExec::EXECVE);
                assert_eq!(path_tail_to_str(path).unwrap(), "/opt/hook.sh");
            }
            other => panic!("unexpected tail {other:?}"),
        }
    }

    #[test]
    fn hook_result_maps_known_codes() {
        assert_eq!(HookResult::from_code(0), HookResult::Continue);
        assert_eq!(HookResult::from_code(1), HookResult::SkipBlock);
        assert_eq!(HookResult::from_code(2), HookResult::StopSuccess);
        assert_eq!(HookResult::from_code(99), HookResult::StopError);
    }
}
