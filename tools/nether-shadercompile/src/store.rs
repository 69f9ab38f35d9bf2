//! Result store
//!
//! Compiled dynamic combos are staged per static combo until the watermark
//! passes the static combo's last command. The static combo is then taken
//! out, packed (outside any lock) and put back as packed bytes; its staged
//! blobs are freed at that point. An entry is handed over for writing once
//! the watermark passes its last command and no pack is still in flight.

use crate::combo::CommandSpace;
use nether_vcs::{
    ArchiveStats, DynamicCombo, Endian, PackedStaticCombo, ShaderArchive, VcsError, VcsWriter,
    pack_static_combo,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Result store and archive errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to pack static combo {static_combo}: {source}")]
    Pack { static_combo: u64, source: VcsError },

    #[error("failed to write archive {path}: {source}")]
    Archive { path: PathBuf, source: VcsError },

    #[error("archive I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A static combo whose dynamic combos are all compiled, ready to pack
#[derive(Debug)]
pub struct UnpackedStaticCombo {
    pub entry: usize,
    pub static_combo: u64,
    pub dynamic: Vec<DynamicCombo>,
}

impl UnpackedStaticCombo {
    /// Pack into blocks
    pub fn pack(self, endian: Endian) -> Result<PackedResult, StoreError> {
        let static_combo = self.static_combo;
        let data = pack_static_combo(endian, self.dynamic)
            .map_err(|source| StoreError::Pack { static_combo, source })?;
        Ok(PackedResult {
            entry: self.entry,
            static_combo,
            data,
        })
    }
}

/// A packed static combo on its way back into the store
#[derive(Debug)]
pub struct PackedResult {
    pub entry: usize,
    pub static_combo: u64,
    pub data: Vec<u8>,
}

/// An entry with every command below the watermark
#[derive(Debug)]
pub struct FinishedEntry {
    pub entry: usize,
    pub static_combos: Vec<PackedStaticCombo>,
}

#[derive(Debug, Default)]
struct EntryResults {
    /// Static combos still collecting dynamic combos, by static combo number
    open: BTreeMap<u64, Vec<DynamicCombo>>,
    packed: BTreeMap<u64, Vec<u8>>,
    /// Static combos taken out for packing and not yet returned
    in_flight: usize,
    taken: bool,
}

/// Compiled results of every entry
#[derive(Debug)]
pub struct ResultStore {
    entries: Vec<EntryResults>,
    /// Entries `[0, next_entry)` have been handed over
    next_entry: usize,
}

impl ResultStore {
    pub fn new(num_entries: usize) -> Self {
        Self {
            entries: (0..num_entries).map(|_| EntryResults::default()).collect(),
            next_entry: 0,
        }
    }

    /// Stage one compiled dynamic combo
    pub fn add_dynamic(&mut self, entry: usize, static_combo: u64, dynamic_combo: u64, code: Vec<u8>) {
        let results = &mut self.entries[entry];
        if results.taken || results.packed.contains_key(&static_combo) {
            debug!(entry, static_combo, dynamic_combo, "Late result for a packed static combo ignored");
            return;
        }
        results
            .open
            .entry(static_combo)
            .or_default()
            .push(DynamicCombo::new(dynamic_combo as u32, code));
    }

    /// Store a static combo packed elsewhere (remote workers)
    pub fn insert_packed(&mut self, entry: usize, static_combo: u64, data: Vec<u8>) {
        let results = &mut self.entries[entry];
        if results.taken {
            debug!(entry, static_combo, "Packed result for a written entry ignored");
            return;
        }
        results.packed.entry(static_combo).or_insert(data);
    }

    /// Take out every static combo whose commands all lie below the watermark
    pub fn take_completed(&mut self, space: &CommandSpace, watermark: u64) -> Vec<UnpackedStaticCombo> {
        let mut completed = Vec::new();

        for (idx, results) in self.entries.iter_mut().enumerate().skip(self.next_entry) {
            let info = space.entry(idx);
            if info.command_start >= watermark {
                break;
            }
            if results.open.is_empty() {
                continue;
            }

            // Static combos run from the highest number down in command order
            let done_offsets = (watermark.min(info.command_end) - info.command_start)
                / info.num_dynamic_combos();
            if done_offsets == 0 {
                continue;
            }
            let threshold = info.num_static_combos() - done_offsets;

            let ready = results.open.split_off(&threshold);
            results.in_flight += ready.len();
            completed.extend(ready.into_iter().map(|(static_combo, dynamic)| {
                UnpackedStaticCombo {
                    entry: idx,
                    static_combo,
                    dynamic,
                }
            }));
        }

        completed
    }

    /// Return a static combo taken by [`take_completed`](Self::take_completed)
    pub fn return_packed(&mut self, result: PackedResult) {
        let results = &mut self.entries[result.entry];
        results.in_flight = results.in_flight.saturating_sub(1);
        results.packed.insert(result.static_combo, result.data);
    }

    /// Release a static combo that failed to pack
    pub fn abandon_packing(&mut self, entry: usize) {
        let results = &mut self.entries[entry];
        results.in_flight = results.in_flight.saturating_sub(1);
    }

    /// Hand over entries whose commands all lie below the watermark, in order
    ///
    /// Stops at the first entry that still has packing in flight.
    pub fn take_finished(&mut self, space: &CommandSpace, watermark: u64) -> Vec<FinishedEntry> {
        let mut finished = Vec::new();

        while let Some(results) = self.entries.get_mut(self.next_entry) {
            let info = space.entry(self.next_entry);
            if info.command_end > watermark || results.in_flight > 0 || !results.open.is_empty() {
                break;
            }

            results.taken = true;
            let static_combos = std::mem::take(&mut results.packed)
                .into_iter()
                .map(|(id, data)| PackedStaticCombo { id, data })
                .collect();
            finished.push(FinishedEntry {
                entry: self.next_entry,
                static_combos,
            });
            self.next_entry += 1;
        }

        finished
    }

    /// Take every packed static combo, leaving entries open for more
    pub fn drain_packed(&mut self) -> Vec<PackedResult> {
        let mut drained = Vec::new();
        for (entry, results) in self.entries.iter_mut().enumerate() {
            drained.extend(
                std::mem::take(&mut results.packed)
                    .into_iter()
                    .map(|(static_combo, data)| PackedResult {
                        entry,
                        static_combo,
                        data,
                    }),
            );
        }
        drained
    }

    /// Whether every entry has been handed over
    pub fn is_drained(&self) -> bool {
        self.next_entry == self.entries.len()
    }
}

/// Values scraped from an entry's command line for the archive header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderInfo {
    pub centroid_mask: u32,
    pub flags: u32,
    pub shader_model: String,
}

impl ShaderInfo {
    /// Scrape `CENTROIDMASK`, `FLAGS` (hex) and `SHADER_MODEL_*` defines
    pub fn scrape(command: &str, define_prefix: &str) -> Self {
        let find = |name: &str| {
            let token = format!("{}{}", define_prefix, name);
            command.find(&token).map(|pos| &command[pos + token.len()..])
        };
        let word = |rest: &str| -> String {
            rest.chars()
                .take_while(|c| !c.is_whitespace() && *c != '=')
                .collect()
        };

        let centroid_mask = find("CENTROIDMASK=").and_then(|rest| word(rest).parse().ok());
        let flags = find("FLAGS=0x").and_then(|rest| u32::from_str_radix(&word(rest), 16).ok());
        let shader_model = find("SHADER_MODEL_").map(word);

        if centroid_mask.is_none() || flags.is_none() || shader_model.is_none() {
            debug!(command, "Shader info incomplete, missing values default to 0");
        }

        Self {
            centroid_mask: centroid_mask.unwrap_or(0),
            flags: flags.unwrap_or(0),
            shader_model: shader_model.unwrap_or_default(),
        }
    }
}

/// Where and how archives are written
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub output_dir: PathBuf,
    pub extension: String,
    pub endian: Endian,
    pub define_prefix: String,
}

impl ArchiveOptions {
    /// Archive path of an entry
    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{}", name, self.extension))
    }
}

/// Write the archive of a finished entry
pub fn write_entry_archive(
    space: &CommandSpace,
    finished: FinishedEntry,
    options: &ArchiveOptions,
) -> Result<ArchiveStats, StoreError> {
    let entry = space.entry(finished.entry);
    let info = space
        .seek(entry.command_start)
        .map(|cursor| space.format_command(&cursor, &options.define_prefix))
        .map(|command| ShaderInfo::scrape(&command, &options.define_prefix))
        .unwrap_or_default();

    let archive = ShaderArchive {
        total_combos: entry.num_combos(),
        dynamic_combos: entry.num_dynamic_combos(),
        flags: info.flags,
        centroid_mask: info.centroid_mask,
        static_combos: finished.static_combos,
    };

    let path = options.archive_path(&entry.name);
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StoreError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    // Written beside the target and renamed, so a crash never leaves half an archive
    let tmp = path.with_extension(format!("{}.tmp", options.extension));
    let stats = match write_and_rename(&archive, &tmp, &path, options.endian) {
        Ok(stats) => stats,
        Err(e) => {
            match std::fs::remove_file(&tmp) {
                Ok(()) => debug!("Removed {}", tmp.display()),
                Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
                Err(rm) => warn!("Failed to remove {}: {}", tmp.display(), rm),
            }
            return Err(e);
        }
    };

    debug!(
        entry = %entry.name,
        shader_model = %info.shader_model,
        unique = stats.unique_static_combos,
        duplicates = stats.duplicate_static_combos,
        bytes = stats.bytes_written,
        "Archive written"
    );
    Ok(stats)
}

fn write_and_rename(
    archive: &ShaderArchive,
    tmp: &Path,
    path: &Path,
    endian: Endian,
) -> Result<ArchiveStats, StoreError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StoreError::Io { path, source }
    };

    let file = File::create(tmp).map_err(io_err(tmp))?;
    let mut writer = BufWriter::new(file);
    let stats = VcsWriter::new(&mut writer, endian)
        .write_archive(archive)
        .map_err(|source| StoreError::Archive {
            path: path.to_path_buf(),
            source,
        })?;
    writer.flush().map_err(io_err(tmp))?;
    drop(writer);
    std::fs::rename(tmp, path).map_err(io_err(path))?;
    Ok(stats)
}

/// Delete an archive left over from an earlier run
///
/// Returns whether a file was removed.
pub fn remove_stale_archive(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadOptions, build_command_space};
    use nether_vcs::VcsReader;

    /// Two entries: "big" with 3 static x 2 dynamic, "small" with 2 dynamic
    fn space() -> CommandSpace {
        let job = "\
#BEGIN big
big.fxc
#DEFINES-D
D=0..1
#DEFINES-S
S=0..2
#COMMAND
fxc /DCENTROIDMASK=5 /DFLAGS=0x1f /DSHADER_MODEL_PS_3_0=1
#END
#BEGIN small
small.fxc
#DEFINES-D
X=0..1
#COMMAND
fxc
#END
";
        build_command_space(job, &LoadOptions::default()).unwrap()
    }

    fn fill(store: &mut ResultStore, space: &CommandSpace, commands: std::ops::Range<u64>) {
        for command in commands {
            let cursor = space.seek(command).unwrap();
            let (s, d) = space.split(&cursor);
            store.add_dynamic(cursor.entry(), s, d, vec![command as u8; 4]);
        }
    }

    fn pack_all(store: &mut ResultStore, space: &CommandSpace, watermark: u64) -> usize {
        let completed = store.take_completed(space, watermark);
        let count = completed.len();
        for combo in completed {
            store.return_packed(combo.pack(Endian::Little).unwrap());
        }
        count
    }

    #[test]
    fn test_watermark_gates_packing() {
        let space = space();
        let mut store = ResultStore::new(2);
        fill(&mut store, &space, 0..3);

        // Commands 0..2 are static combo 2; static combo 1 is half done
        assert_eq!(pack_all(&mut store, &space, 1), 0);
        assert_eq!(pack_all(&mut store, &space, 3), 1);
        assert!(store.take_finished(&space, 3).is_empty());

        fill(&mut store, &space, 3..6);
        assert_eq!(pack_all(&mut store, &space, 6), 2);

        let finished = store.take_finished(&space, 6);
        assert_eq!(finished.len(), 1);
        let ids: Vec<u64> = finished[0].static_combos.iter().map(|c| c.id).collect();
        assert_eq!(ids, [0, 1, 2]);
    }

    #[test]
    fn test_in_flight_pack_blocks_handover() {
        let space = space();
        let mut store = ResultStore::new(2);
        fill(&mut store, &space, 0..6);

        let completed = store.take_completed(&space, 6);
        assert_eq!(completed.len(), 3);
        assert!(store.take_finished(&space, 6).is_empty());

        for combo in completed {
            store.return_packed(combo.pack(Endian::Little).unwrap());
        }
        assert_eq!(store.take_finished(&space, 6).len(), 1);
        assert!(!store.is_drained());
    }

    #[test]
    fn test_skipped_entry_finishes_empty() {
        let space = space();
        let mut store = ResultStore::new(2);
        let finished = store.take_finished(&space, space.num_commands());
        assert_eq!(finished.len(), 2);
        assert!(finished.iter().all(|f| f.static_combos.is_empty()));
        assert!(store.is_drained());
    }

    #[test]
    fn test_late_results_ignored() {
        let space = space();
        let mut store = ResultStore::new(2);
        store.take_finished(&space, space.num_commands());
        store.add_dynamic(0, 0, 0, vec![1]);
        store.insert_packed(1, 0, vec![2]);
        assert!(store.take_completed(&space, space.num_commands()).is_empty());
    }

    #[test]
    fn test_drain_packed() {
        let space = space();
        let mut store = ResultStore::new(2);
        store.insert_packed(1, 0, vec![7]);
        fill(&mut store, &space, 0..2);
        pack_all(&mut store, &space, 2);

        let mut drained = store.drain_packed();
        drained.sort_by_key(|p| (p.entry, p.static_combo));
        let keys: Vec<_> = drained.iter().map(|p| (p.entry, p.static_combo)).collect();
        assert_eq!(keys, [(0, 2), (1, 0)]);
        assert!(store.drain_packed().is_empty());
    }

    #[test]
    fn test_shader_info_scrape() {
        let info = ShaderInfo::scrape(
            "fxc /DCENTROIDMASK=5 /DFLAGS=0x1f /DSHADER_MODEL_PS_3_0=1 /DA=0",
            "/D",
        );
        assert_eq!(info.centroid_mask, 5);
        assert_eq!(info.flags, 0x1f);
        assert_eq!(info.shader_model, "PS_3_0");

        let info = ShaderInfo::scrape("fxc -DFLAGS=0x10", "/D");
        assert_eq!(info, ShaderInfo::default());
    }

    #[test]
    fn test_write_entry_archive() {
        let dir = tempfile::tempdir().unwrap();
        let space = space();
        let mut store = ResultStore::new(2);
        fill(&mut store, &space, 0..6);
        pack_all(&mut store, &space, 6);

        let options = ArchiveOptions {
            output_dir: dir.path().join("out"),
            extension: "vcs".into(),
            endian: Endian::Little,
            define_prefix: "/D".into(),
        };
        let finished = store.take_finished(&space, 6).pop().unwrap();
        let stats = write_entry_archive(&space, finished, &options).unwrap();
        assert_eq!(stats.unique_static_combos, 3);

        let path = options.archive_path("big");
        let bytes = std::fs::read(&path).unwrap();
        let archive = VcsReader::new(bytes.as_slice(), Endian::Little)
            .read_archive()
            .unwrap();
        assert_eq!(archive.header.total_combos, 6);
        assert_eq!(archive.header.dynamic_combos, 2);
        assert_eq!(archive.header.flags, 0x1f);
        assert_eq!(archive.header.centroid_mask, 5);

        // Command 0 is static 2, dynamic 1
        let combos = archive.dynamic_combos(2).unwrap().unwrap();
        assert_eq!(combos[1].code, vec![0u8; 4]);

        assert!(remove_stale_archive(&path).unwrap());
        assert!(!remove_stale_archive(&path).unwrap());
    }

    #[test]
    fn test_failed_write_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let space = space();
        let mut store = ResultStore::new(2);
        fill(&mut store, &space, 0..6);
        pack_all(&mut store, &space, 6);

        let options = ArchiveOptions {
            output_dir: dir.path().to_path_buf(),
            extension: "vcs".into(),
            endian: Endian::Little,
            define_prefix: "/D".into(),
        };
        // A directory in the way of the rename
        let path = options.archive_path("big");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();

        let finished = store.take_finished(&space, 6).pop().unwrap();
        let err = write_entry_archive(&space, finished, &options).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(!dir.path().join("big.vcs.tmp").exists());
        assert!(path.join("keep").exists());
    }
}
