//! Static combo block packing
//!
//! Dynamic combos are staged into uncompressed buffers of at most
//! [`MAX_UNPACKED_BLOCK_SIZE`] bytes. Each full buffer becomes one block,
//! LZ4 compressed when that makes it smaller.

use crate::{
    BLOCK_KIND_MASK, BLOCK_LEN_MASK, BLOCK_LZ4, BLOCK_RAW, DynamicCombo, END_OF_BLOCKS, Endian,
    MAX_UNPACKED_BLOCK_SIZE, VcsError,
};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Per-record overhead reserved when deciding whether a block is full
const RECORD_SLACK: usize = 16;

/// Incremental packer for the dynamic combos of one static combo
///
/// Records must be pushed in ascending dynamic combo order.
pub struct StaticComboPacker {
    endian: Endian,
    staging: Vec<u8>,
    packed: Vec<u8>,
}

impl StaticComboPacker {
    pub fn new(endian: Endian) -> Self {
        Self {
            endian,
            staging: Vec::new(),
            packed: Vec::new(),
        }
    }

    /// Append one dynamic combo, flushing the staging block first if it would overflow
    pub fn push(&mut self, id: u32, code: &[u8]) -> Result<(), VcsError> {
        if self.staging.len() + code.len() + RECORD_SLACK >= MAX_UNPACKED_BLOCK_SIZE {
            self.flush()?;
        }

        let size = u32::try_from(code.len()).map_err(|_| VcsError::BlockTooLarge(code.len()))?;
        self.endian.put_u32(&mut self.staging, id);
        self.endian.put_u32(&mut self.staging, size);
        self.staging.extend_from_slice(code);
        Ok(())
    }

    /// Emit the staging buffer as one block
    fn flush(&mut self) -> Result<(), VcsError> {
        if self.staging.is_empty() {
            return Ok(());
        }

        let compressed = compress_prepend_size(&self.staging);
        let (kind, payload) = if compressed.len() < self.staging.len() {
            (BLOCK_LZ4, compressed.as_slice())
        } else {
            (BLOCK_RAW, self.staging.as_slice())
        };

        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= BLOCK_LEN_MASK)
            .ok_or(VcsError::BlockTooLarge(payload.len()))?;

        self.endian.put_u32(&mut self.packed, kind | len);
        self.packed.extend_from_slice(payload);
        self.staging.clear();
        Ok(())
    }

    /// Flush the last block and append the end marker
    pub fn finish(mut self) -> Result<Vec<u8>, VcsError> {
        self.flush()?;
        self.endian.put_u32(&mut self.packed, END_OF_BLOCKS);
        Ok(self.packed)
    }
}

/// Pack the dynamic combos of one static combo
///
/// Combos are sorted by id first; completion order does not matter.
pub fn pack_static_combo(
    endian: Endian,
    mut combos: Vec<DynamicCombo>,
) -> Result<Vec<u8>, VcsError> {
    combos.sort_by_key(|combo| combo.id);

    let mut packer = StaticComboPacker::new(endian);
    for combo in &combos {
        packer.push(combo.id, &combo.code)?;
    }
    packer.finish()
}

/// Decode a packed static combo
///
/// Returns the dynamic combos and the number of bytes consumed, end marker included.
pub fn unpack_static_combo(
    endian: Endian,
    data: &[u8],
) -> Result<(Vec<DynamicCombo>, usize), VcsError> {
    let mut combos = Vec::new();
    let mut pos = 0;

    loop {
        let header = data
            .get(pos..)
            .and_then(|rest| endian.get_u32(rest))
            .ok_or(VcsError::Truncated("block header"))?;
        pos += 4;

        if header == END_OF_BLOCKS {
            break;
        }

        let len = (header & BLOCK_LEN_MASK) as usize;
        let payload = data
            .get(pos..pos + len)
            .ok_or(VcsError::Truncated("block payload"))?;
        pos += len;

        let block = match header & BLOCK_KIND_MASK {
            BLOCK_RAW => payload.to_vec(),
            BLOCK_LZ4 => decompress_size_prepended(payload)
                .map_err(|e| VcsError::Decompress(e.to_string()))?,
            _ => return Err(VcsError::UnknownBlockKind(header)),
        };

        let mut offset = 0;
        while offset < block.len() {
            let id = endian
                .get_u32(&block[offset..])
                .ok_or(VcsError::Truncated("dynamic combo id"))?;
            let size = block
                .get(offset + 4..)
                .and_then(|rest| endian.get_u32(rest))
                .ok_or(VcsError::Truncated("dynamic combo size"))? as usize;
            offset += 8;

            let code = block
                .get(offset..offset + size)
                .ok_or(VcsError::Truncated("dynamic combo code"))?;
            combos.push(DynamicCombo::new(id, code.to_vec()));
            offset += size;
        }
    }

    Ok((combos, pos))
}
