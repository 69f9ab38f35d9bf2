//! Archive writer
//!
//! Writes one shader archive. Identical static combos are detected by CRC32
//! followed by a full byte comparison and stored once.

use crate::{
    AliasRecord, DIRECTORY_SENTINEL, DirectoryRecord, Endian, ShaderArchive, VCS_VERSION,
    VcsError, VcsHeader,
};
use hashbrown::HashMap;
use std::io::{Seek, SeekFrom, Write};

/// Summary of a written archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Static combos with their own packed data
    pub unique_static_combos: usize,
    /// Static combos stored as aliases
    pub duplicate_static_combos: usize,
    /// Total archive size in bytes
    pub bytes_written: u64,
}

/// Writer for shader archives
pub struct VcsWriter<W: Write + Seek> {
    writer: W,
    endian: Endian,
}

/// A unique static combo waiting to be written
struct UniqueCombo<'a> {
    id: u32,
    crc: u32,
    data: &'a [u8],
}

fn archive_id(id: u64) -> Result<u32, VcsError> {
    u32::try_from(id)
        .ok()
        .filter(|id| *id != DIRECTORY_SENTINEL)
        .ok_or(VcsError::ComboIdOverflow(id))
}

impl<W: Write + Seek> VcsWriter<W> {
    pub fn new(writer: W, endian: Endian) -> Self {
        Self { writer, endian }
    }

    /// Write a complete archive
    pub fn write_archive(&mut self, archive: &ShaderArchive) -> Result<ArchiveStats, VcsError> {
        let (unique, aliases) = deduplicate(archive)?;

        let header = VcsHeader {
            version: VCS_VERSION,
            total_combos: u32::try_from(archive.total_combos)
                .map_err(|_| VcsError::ComboIdOverflow(archive.total_combos))?,
            dynamic_combos: u32::try_from(archive.dynamic_combos)
                .map_err(|_| VcsError::ComboIdOverflow(archive.dynamic_combos))?,
            flags: archive.flags,
            centroid_mask: archive.centroid_mask,
            directory_len: (unique.len() + 1) as u32,
            // Left as 0 for external tooling to fill in
            crc: 0,
        };

        let start = self.writer.stream_position()?;
        self.write_header(&header)?;

        // Placeholder directory, rewritten once offsets are known
        let directory_pos = self.writer.stream_position()?;
        for _ in 0..header.directory_len {
            self.endian.write_u32(&mut self.writer, 0)?;
            self.endian.write_u32(&mut self.writer, 0)?;
        }

        self.endian.write_u32(&mut self.writer, aliases.len() as u32)?;
        for alias in &aliases {
            self.endian.write_u32(&mut self.writer, alias.static_combo_id)?;
            self.endian
                .write_u32(&mut self.writer, alias.source_static_combo_id)?;
        }

        let mut directory = Vec::with_capacity(unique.len() + 1);
        for combo in &unique {
            directory.push(DirectoryRecord {
                static_combo_id: combo.id,
                file_offset: self.offset(start)?,
            });
            self.writer.write_all(combo.data)?;
        }
        directory.push(DirectoryRecord {
            static_combo_id: DIRECTORY_SENTINEL,
            file_offset: self.offset(start)?,
        });

        let end = self.writer.seek(SeekFrom::Current(0))?;
        self.writer.seek(SeekFrom::Start(directory_pos))?;
        for record in &directory {
            self.endian.write_u32(&mut self.writer, record.static_combo_id)?;
            self.endian.write_u32(&mut self.writer, record.file_offset)?;
        }
        self.writer.seek(SeekFrom::Start(end))?;
        self.writer.flush()?;

        Ok(ArchiveStats {
            unique_static_combos: unique.len(),
            duplicate_static_combos: aliases.len(),
            bytes_written: end - start,
        })
    }

    /// Write the 28-byte header
    fn write_header(&mut self, header: &VcsHeader) -> Result<(), VcsError> {
        for value in [
            header.version,
            header.total_combos,
            header.dynamic_combos,
            header.flags,
            header.centroid_mask,
            header.directory_len,
            header.crc,
        ] {
            self.endian.write_u32(&mut self.writer, value)?;
        }
        Ok(())
    }

    /// Current position relative to the start of the archive
    fn offset(&mut self, start: u64) -> Result<u32, VcsError> {
        let offset = self.writer.stream_position()? - start;
        u32::try_from(offset).map_err(|_| VcsError::OffsetOverflow(offset))
    }

    /// Consume the writer and return the inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Split static combos into unique ones (sorted by id) and sorted aliases
///
/// The lowest id among identical combos keeps the data.
fn deduplicate(
    archive: &ShaderArchive,
) -> Result<(Vec<UniqueCombo<'_>>, Vec<AliasRecord>), VcsError> {
    let mut sorted = Vec::with_capacity(archive.static_combos.len());
    for combo in &archive.static_combos {
        sorted.push((archive_id(combo.id)?, combo.data.as_slice()));
    }
    sorted.sort_by_key(|(id, _)| *id);

    let mut unique: Vec<UniqueCombo<'_>> = Vec::with_capacity(sorted.len());
    let mut aliases = Vec::new();
    let mut by_crc: HashMap<u32, Vec<usize>> = HashMap::new();

    for (id, data) in sorted {
        let crc = crc32fast::hash(data);
        let candidates = by_crc.entry(crc).or_default();

        let source = candidates
            .iter()
            .map(|&idx| &unique[idx])
            .find(|existing| existing.crc == crc && existing.data == data)
            .map(|existing| existing.id);

        match source {
            Some(source_static_combo_id) => aliases.push(AliasRecord {
                static_combo_id: id,
                source_static_combo_id,
            }),
            None => {
                candidates.push(unique.len());
                unique.push(UniqueCombo { id, crc, data });
            }
        }
    }

    Ok((unique, aliases))
}
