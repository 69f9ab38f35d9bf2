//! Archive reader
//!
//! Parses a complete archive into memory. Used by the `inspect` tooling and
//! by tests to verify what the writer produced.

use crate::{
    AliasRecord, DIRECTORY_SENTINEL, DirectoryRecord, DynamicCombo, Endian, VCS_HEADER_SIZE,
    VCS_VERSION, VcsError, VcsHeader, unpack_static_combo,
};
use std::io::{self, Read};

/// Most records reserved up front; counts come from the file and may be garbage
const MAX_PREALLOCATED_RECORDS: usize = 4096;

/// Reader for shader archives
pub struct VcsReader<R: Read> {
    reader: R,
    endian: Endian,
}

/// A parsed archive
#[derive(Debug, Clone)]
pub struct VcsArchive {
    pub header: VcsHeader,
    /// Directory records, sentinel excluded
    pub directory: Vec<DirectoryRecord>,
    pub aliases: Vec<AliasRecord>,
    /// Offset of the end of the data region (the sentinel record's offset)
    end_offset: u32,
    /// Offset at which `data` starts
    data_start: u32,
    data: Vec<u8>,
    endian: Endian,
}

impl<R: Read> VcsReader<R> {
    pub fn new(reader: R, endian: Endian) -> Self {
        Self { reader, endian }
    }

    /// Read a complete archive
    pub fn read_archive(&mut self) -> Result<VcsArchive, VcsError> {
        let header = self.read_header()?;
        if header.version != VCS_VERSION {
            return Err(VcsError::UnsupportedVersion(header.version));
        }

        let mut directory =
            Vec::with_capacity((header.directory_len as usize).min(MAX_PREALLOCATED_RECORDS));
        let mut end_offset = None;
        for _ in 0..header.directory_len {
            let static_combo_id = self.read_u32("directory record")?;
            let file_offset = self.read_u32("directory record")?;
            if static_combo_id == DIRECTORY_SENTINEL {
                end_offset = Some(file_offset);
                break;
            }
            directory.push(DirectoryRecord {
                static_combo_id,
                file_offset,
            });
        }
        let end_offset = end_offset.ok_or(VcsError::Truncated("directory sentinel"))?;

        let alias_count = self.read_u32("alias count")?;
        let mut aliases =
            Vec::with_capacity((alias_count as usize).min(MAX_PREALLOCATED_RECORDS));
        for _ in 0..alias_count {
            aliases.push(AliasRecord {
                static_combo_id: self.read_u32("alias record")?,
                source_static_combo_id: self.read_u32("alias record")?,
            });
        }

        let data_start =
            VCS_HEADER_SIZE + header.directory_len as usize * 8 + 4 + aliases.len() * 8;
        let mut data = Vec::new();
        self.reader.read_to_end(&mut data)?;

        Ok(VcsArchive {
            header,
            directory,
            aliases,
            end_offset,
            data_start: data_start as u32,
            data,
            endian: self.endian,
        })
    }

    fn read_header(&mut self) -> Result<VcsHeader, VcsError> {
        Ok(VcsHeader {
            version: self.read_u32("header")?,
            total_combos: self.read_u32("header")?,
            dynamic_combos: self.read_u32("header")?,
            flags: self.read_u32("header")?,
            centroid_mask: self.read_u32("header")?,
            directory_len: self.read_u32("header")?,
            crc: self.read_u32("header")?,
        })
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, VcsError> {
        self.endian.read_u32(&mut self.reader).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                VcsError::Truncated(what)
            } else {
                VcsError::Io(e)
            }
        })
    }
}

impl VcsArchive {
    /// Static combo ids present in the archive, aliases included, ascending
    pub fn static_combo_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .directory
            .iter()
            .map(|record| record.static_combo_id)
            .chain(self.aliases.iter().map(|alias| alias.static_combo_id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Follow the alias table to the static combo that owns the data
    ///
    /// The alias table is sorted by static combo id.
    pub fn resolve(&self, static_combo_id: u32) -> u32 {
        self.aliases
            .binary_search_by_key(&static_combo_id, |alias| alias.static_combo_id)
            .map_or(static_combo_id, |idx| self.aliases[idx].source_static_combo_id)
    }

    /// Packed bytes of one static combo, or `None` if it was never stored
    pub fn packed_bytes(&self, static_combo_id: u32) -> Result<Option<&[u8]>, VcsError> {
        let id = self.resolve(static_combo_id);
        let Ok(idx) = self
            .directory
            .binary_search_by_key(&id, |record| record.static_combo_id)
        else {
            return Ok(None);
        };

        let start = self.directory[idx].file_offset;
        let end = self
            .directory
            .get(idx + 1)
            .map_or(self.end_offset, |next| next.file_offset);

        let local = |offset: u32| offset.checked_sub(self.data_start).map(|o| o as usize);
        let range = local(start)
            .zip(local(end))
            .filter(|(start, end)| start <= end)
            .ok_or(VcsError::Truncated("directory offsets"))?;

        self.data
            .get(range.0..range.1)
            .map(Some)
            .ok_or(VcsError::Truncated("static combo data"))
    }

    /// Decoded dynamic combos of one static combo, ascending by id
    pub fn dynamic_combos(
        &self,
        static_combo_id: u32,
    ) -> Result<Option<Vec<DynamicCombo>>, VcsError> {
        match self.packed_bytes(static_combo_id)? {
            Some(bytes) => Ok(Some(unpack_static_combo(self.endian, bytes)?.0)),
            None => Ok(None),
        }
    }

    /// Size of the data region in bytes
    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}
