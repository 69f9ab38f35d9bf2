//! Nether-VCS: packed shader-combo archives
//!
//! One archive holds every compiled variant of a single shader. Variants are
//! grouped by *static combo*; all *dynamic combos* of one static combo are
//! packed together into a run of length-prefixed, optionally compressed
//! blocks. Static combos with byte-identical packed content are stored once
//! and referenced through an alias table.
//!
//! # File Structure
//!
//! ```text
//! +-------------------------------------------------+
//! | Header (28 bytes)                               |
//! |  version            u32   (6)                   |
//! |  total_combos       u32                         |
//! |  dynamic_combos     u32                         |
//! |  flags              u32                         |
//! |  centroid_mask      u32                         |
//! |  directory_len      u32   (includes sentinel)   |
//! |  crc                u32   (0, for external use) |
//! +-------------------------------------------------+
//! | Directory, sorted by static combo id            |
//! |  [static_combo_id u32][file_offset u32] ...     |
//! |  [0xFFFFFFFF][end of data offset]               |
//! +-------------------------------------------------+
//! | Alias count u32                                 |
//! |  [static_combo_id u32][source_id u32] ...       |
//! +-------------------------------------------------+
//! | Packed static combos (see below)                |
//! +-------------------------------------------------+
//! ```
//!
//! # Packed Static Combo
//!
//! ```text
//! [block header u32][payload] ... [0xFFFFFFFF]
//!
//! block header: top two bits select the encoding
//!   10 = raw, 01 = LZ4 (size prepended), low 30 bits = payload length
//!
//! uncompressed block: [dynamic_combo_id u32][size u32][bytes] ...
//! ```
//!
//! All numeric fields use the archive's [`Endian`] (little-endian unless the
//! target asks otherwise).
//!
//! # Usage
//!
//! ```
//! use nether_vcs::{pack_static_combo, DynamicCombo, Endian, ShaderArchive, PackedStaticCombo};
//! use nether_vcs::{VcsReader, VcsWriter};
//! use std::io::Cursor;
//!
//! let packed = pack_static_combo(
//!     Endian::Little,
//!     vec![DynamicCombo::new(1, b"second".to_vec()), DynamicCombo::new(0, b"first".to_vec())],
//! )
//! .unwrap();
//!
//! let archive = ShaderArchive {
//!     total_combos: 4,
//!     dynamic_combos: 2,
//!     flags: 0,
//!     centroid_mask: 0,
//!     static_combos: vec![PackedStaticCombo { id: 0, data: packed }],
//! };
//!
//! let mut file = Cursor::new(Vec::new());
//! VcsWriter::new(&mut file, Endian::Little).write_archive(&archive).unwrap();
//!
//! let parsed = VcsReader::new(file.get_ref().as_slice(), Endian::Little)
//!     .read_archive()
//!     .unwrap();
//! let combos = parsed.dynamic_combos(0).unwrap().unwrap();
//! assert_eq!(combos[0].code, b"first");
//! ```

mod block;
mod reader;
mod writer;

pub use block::{StaticComboPacker, pack_static_combo, unpack_static_combo};
pub use reader::{VcsArchive, VcsReader};
pub use writer::{ArchiveStats, VcsWriter};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

// =============================================================================
// Constants
// =============================================================================

/// Archive format version written by [`VcsWriter`]
pub const VCS_VERSION: u32 = 6;

/// Size of the fixed archive header in bytes
pub const VCS_HEADER_SIZE: usize = 28;

/// Directory key terminating the static combo directory
pub const DIRECTORY_SENTINEL: u32 = 0xFFFF_FFFF;

/// Marker following the last block of a packed static combo
pub const END_OF_BLOCKS: u32 = 0xFFFF_FFFF;

/// Upper bound for one uncompressed staging block (1 MiB)
pub const MAX_UNPACKED_BLOCK_SIZE: usize = 1024 * 1024;

/// Block header bit: payload stored as-is
pub const BLOCK_RAW: u32 = 0x8000_0000;

/// Block header bit: payload is LZ4 compressed with the size prepended
pub const BLOCK_LZ4: u32 = 0x4000_0000;

/// Mask selecting the encoding bits of a block header
pub const BLOCK_KIND_MASK: u32 = 0xC000_0000;

/// Mask selecting the payload length of a block header
pub const BLOCK_LEN_MASK: u32 = 0x3FFF_FFFF;

// =============================================================================
// Types
// =============================================================================

/// Byte order of every numeric field in an archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Endian {
    /// PC targets
    #[default]
    Little,
    /// Console targets
    Big,
}

impl Endian {
    /// Append a u32 to an in-memory buffer
    pub fn put_u32(self, buf: &mut Vec<u8>, value: u32) {
        let mut bytes = [0u8; 4];
        match self {
            Endian::Little => LittleEndian::write_u32(&mut bytes, value),
            Endian::Big => BigEndian::write_u32(&mut bytes, value),
        }
        buf.extend_from_slice(&bytes);
    }

    /// Read a u32 from the start of a slice, if there are enough bytes
    pub fn get_u32(self, bytes: &[u8]) -> Option<u32> {
        let bytes = bytes.get(..4)?;
        Some(match self {
            Endian::Little => LittleEndian::read_u32(bytes),
            Endian::Big => BigEndian::read_u32(bytes),
        })
    }

    /// Write a u32 to a stream
    pub fn write_u32<W: Write>(self, writer: &mut W, value: u32) -> io::Result<()> {
        match self {
            Endian::Little => writer.write_u32::<LittleEndian>(value),
            Endian::Big => writer.write_u32::<BigEndian>(value),
        }
    }

    /// Read a u32 from a stream
    pub fn read_u32<R: Read>(self, reader: &mut R) -> io::Result<u32> {
        match self {
            Endian::Little => reader.read_u32::<LittleEndian>(),
            Endian::Big => reader.read_u32::<BigEndian>(),
        }
    }
}

/// Compiled output of one dynamic combo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicCombo {
    /// Dynamic combo index within its static combo
    pub id: u32,
    /// Compiler output
    pub code: Vec<u8>,
}

impl DynamicCombo {
    pub fn new(id: u32, code: Vec<u8>) -> Self {
        Self { id, code }
    }
}

/// A static combo whose dynamic combos are already packed into blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedStaticCombo {
    /// Static combo id (64-bit at the API boundary, 32-bit on disk)
    pub id: u64,
    /// Output of [`pack_static_combo`], end marker included
    pub data: Vec<u8>,
}

/// Everything needed to write one shader archive
#[derive(Debug, Clone, Default)]
pub struct ShaderArchive {
    /// Size of the shader's full combo space
    pub total_combos: u64,
    /// Number of dynamic combos per static combo
    pub dynamic_combos: u64,
    /// Shader flags scraped from the compile command
    pub flags: u32,
    /// Centroid mask scraped from the compile command
    pub centroid_mask: u32,
    /// Packed static combos, in any order
    pub static_combos: Vec<PackedStaticCombo>,
}

/// Fixed archive header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcsHeader {
    pub version: u32,
    pub total_combos: u32,
    pub dynamic_combos: u32,
    pub flags: u32,
    pub centroid_mask: u32,
    /// Directory records, sentinel included
    pub directory_len: u32,
    pub crc: u32,
}

/// One directory entry: where a static combo's packed data starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub static_combo_id: u32,
    pub file_offset: u32,
}

/// A static combo that reuses another static combo's packed data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasRecord {
    pub static_combo_id: u32,
    pub source_static_combo_id: u32,
}

// =============================================================================
// Error Type
// =============================================================================

/// Errors produced while packing, writing or reading archives
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] io::Error),

    /// On-disk ids are 32-bit and 0xFFFFFFFF is reserved for the sentinel
    #[error("combo id {0} does not fit the 32-bit archive directory")]
    ComboIdOverflow(u64),

    #[error("archive offset {0} exceeds the 32-bit directory range")]
    OffsetOverflow(u64),

    #[error("block payload of {0} bytes exceeds the 30-bit length field")]
    BlockTooLarge(usize),

    #[error("unrecognized block encoding 0x{0:08x}")]
    UnknownBlockKind(u32),

    #[error("unsupported archive version {0}")]
    UnsupportedVersion(u32),

    #[error("archive data truncated: {0}")]
    Truncated(&'static str),

    #[error("block decompression failed: {0}")]
    Decompress(String),
}
