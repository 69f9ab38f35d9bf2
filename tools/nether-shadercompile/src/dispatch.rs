//! Work dispatch
//!
//! The static combo space is cut into work units. Workers claim units from
//! a [`UnitQueue`], walk the commands of their unit and hand every result to
//! the shared [`ResultStore`]. All shared state sits behind one coarse lock
//! that is never held while the compiler runs.
//!
//! After each unit the watermark (every command below it is finished) is
//! recomputed. Static combos below it are packed and entries below it are
//! written out, which keeps memory bounded on large jobs.

use crate::combo::{CommandSpace, Cursor};
use crate::compiler::{CompileOutput, CompileSpawnError, ShaderCompiler};
use crate::diagnostics::{Diagnostics, missing_listing};
use crate::store::{
    ArchiveOptions, FinishedEntry, PackedResult, ResultStore, StoreError, remove_stale_archive,
    write_entry_archive,
};
use hashbrown::HashMap;
use nether_vcs::Endian;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Static combo counts up to this get one static combo per unit
const SMALL_JOB_STATIC_COMBOS: u64 = 1024;

/// Static combo counts above this get [`LARGE_JOB_UNIT_SIZE`] per unit
const LARGE_JOB_STATIC_COMBOS: u64 = 1024 * 10;

const LARGE_JOB_UNIT_SIZE: u64 = 10;

/// Minimum time between progress lines
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies a worker thread or remote connection
pub type WorkerId = usize;

/// Static combos per work unit for a job of `num_static_combos`
pub fn static_combos_per_unit(num_static_combos: u64) -> u64 {
    if num_static_combos <= SMALL_JOB_STATIC_COMBOS {
        1
    } else if num_static_combos > LARGE_JOB_STATIC_COMBOS {
        LARGE_JOB_UNIT_SIZE
    } else {
        num_static_combos / SMALL_JOB_STATIC_COMBOS
    }
}

/// Logical CPUs minus one, at least one
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// A run of global static combo indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUnit {
    pub index: u64,
    pub static_start: u64,
    pub static_end: u64,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    unit: WorkUnit,
    /// Every command of the unit below this is finished
    position: u64,
}

/// Hands out work units and tracks what is in flight
#[derive(Debug)]
pub struct UnitQueue {
    statics: Range<u64>,
    per_unit: u64,
    num_units: u64,
    next: u64,
    requeued: BTreeSet<u64>,
    in_flight: HashMap<WorkerId, InFlight>,
    completed: u64,
}

impl UnitQueue {
    /// Queue over a run of static combos, `per_unit` at a time
    pub fn new(statics: Range<u64>, per_unit: u64) -> Self {
        let per_unit = per_unit.max(1);
        let len = statics.end.saturating_sub(statics.start);
        Self {
            num_units: len.div_ceil(per_unit),
            statics,
            per_unit,
            next: 0,
            requeued: BTreeSet::new(),
            in_flight: HashMap::new(),
            completed: 0,
        }
    }

    /// Queue over every static combo of a command space
    pub fn for_space(space: &CommandSpace) -> Self {
        let statics = space.num_static_combos();
        Self::new(0..statics, static_combos_per_unit(statics))
    }

    pub fn num_units(&self) -> u64 {
        self.num_units
    }

    pub fn per_unit(&self) -> u64 {
        self.per_unit
    }

    pub fn unit(&self, index: u64) -> WorkUnit {
        let static_start = self.statics.start + index * self.per_unit;
        WorkUnit {
            index,
            static_start,
            static_end: (static_start + self.per_unit).min(self.statics.end),
        }
    }

    /// Claim the next unit for a worker, requeued units first
    pub fn claim(&mut self, worker: WorkerId, space: &CommandSpace) -> Option<WorkUnit> {
        let index = match self.requeued.pop_first() {
            Some(index) => index,
            None if self.next < self.num_units => {
                self.next += 1;
                self.next - 1
            }
            None => return None,
        };

        let unit = self.unit(index);
        let position = space
            .unit_command_range(unit.static_start, unit.static_end)
            .start;
        self.in_flight.insert(worker, InFlight { unit, position });
        Some(unit)
    }

    /// Record that a worker finished every command of its unit below `command`
    pub fn set_position(&mut self, worker: WorkerId, command: u64) {
        if let Some(in_flight) = self.in_flight.get_mut(&worker) {
            in_flight.position = in_flight.position.max(command);
        }
    }

    /// The worker finished its unit
    pub fn complete(&mut self, worker: WorkerId) -> Option<WorkUnit> {
        let in_flight = self.in_flight.remove(&worker)?;
        self.completed += 1;
        Some(in_flight.unit)
    }

    /// The worker went away; its unit goes back in the queue
    pub fn abandon(&mut self, worker: WorkerId) -> Option<WorkUnit> {
        let in_flight = self.in_flight.remove(&worker)?;
        self.requeued.insert(in_flight.unit.index);
        Some(in_flight.unit)
    }

    /// Units neither claimed nor finished
    pub fn has_pending(&self) -> bool {
        !self.requeued.is_empty() || self.next < self.num_units
    }

    /// Every unit has completed
    pub fn is_finished(&self) -> bool {
        self.completed == self.num_units
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Lowest command that may still be unfinished
    pub fn low_water_command(&self, space: &CommandSpace) -> u64 {
        let unit_start = |index: u64| {
            let unit = self.unit(index);
            space.unit_command_range(unit.static_start, unit.static_end).start
        };

        let in_flight = self.in_flight.values().map(|f| f.position);
        let requeued = self.requeued.first().map(|&index| unit_start(index));
        let unclaimed = if self.next < self.num_units {
            unit_start(self.next)
        } else {
            space.unit_command_range(self.statics.end, self.statics.end).start
        };

        in_flight
            .chain(requeued)
            .fold(unclaimed, u64::min)
    }
}

/// State shared by all workers, behind one lock
#[derive(Debug)]
pub struct Shared {
    pub queue: UnitQueue,
    pub store: ResultStore,
    pub diagnostics: Diagnostics,
    watermark: u64,
    pub stats: RunStats,
    last_progress: Instant,
}

impl Shared {
    /// Raise the watermark to the queue's low water, never lowering it
    fn advance_watermark(&mut self, space: &CommandSpace) -> u64 {
        self.watermark = self.watermark.max(self.queue.low_water_command(space));
        self.watermark
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Compiler invocations
    pub commands_run: u64,
    pub commands_failed: u64,
    pub archives_written: usize,
    /// Static combos stored as aliases across all archives
    pub duplicate_static_combos: usize,
}

/// What happens to finished results
#[derive(Debug, Clone)]
pub enum Output {
    /// Write one archive per entry
    Archives(ArchiveOptions),
    /// Keep packed static combos for the caller (remote workers)
    Packed,
}

/// Per-run settings
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub define_prefix: String,
    /// Drop listings of successful compiles
    pub suppress_warnings: bool,
    /// Machine name attached to diagnostics
    pub machine: String,
    pub endian: Endian,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            define_prefix: "/D".to_string(),
            suppress_warnings: false,
            machine: "local".to_string(),
            endian: Endian::Little,
        }
    }
}

/// Everything a finished run hands back
#[derive(Debug)]
pub struct JobResults {
    pub diagnostics: Diagnostics,
    pub stats: RunStats,
    /// Packed static combos, only for [`Output::Packed`]
    pub packed: Vec<PackedResult>,
}

/// One compile run over a range of static combos
pub struct Job<'a> {
    space: &'a CommandSpace,
    shared: Mutex<Shared>,
    output: Output,
    options: JobOptions,
}

impl<'a> Job<'a> {
    pub fn new(space: &'a CommandSpace, queue: UnitQueue, output: Output, options: JobOptions) -> Self {
        let shared = Shared {
            queue,
            store: ResultStore::new(space.entries().len()),
            diagnostics: Diagnostics::new(),
            watermark: 0,
            stats: RunStats::default(),
            last_progress: Instant::now(),
        };
        Self {
            space,
            shared: Mutex::new(shared),
            output,
            options,
        }
    }

    /// A run over the whole command space that writes archives
    pub fn coordinator(space: &'a CommandSpace, archives: ArchiveOptions, options: JobOptions) -> Self {
        Self::new(space, UnitQueue::for_space(space), Output::Archives(archives), options)
    }

    /// A run over one unit that keeps its packed static combos
    pub fn for_unit(space: &'a CommandSpace, unit: WorkUnit, options: JobOptions) -> Self {
        let queue = UnitQueue::new(unit.static_start..unit.static_end, 1);
        Self::new(space, queue, Output::Packed, options)
    }

    pub fn space(&self) -> &'a CommandSpace {
        self.space
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Run `f` with the shared state locked
    pub fn with_shared<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        f(&mut self.shared.lock())
    }

    /// Compile every unit on `threads` local workers
    pub fn run_local<C: ShaderCompiler>(&self, compiler: &C, threads: usize) {
        let threads = threads.max(1);
        let units = self.shared.lock().queue.num_units();
        info!(
            threads,
            units,
            commands = self.space.num_commands(),
            "Compiling"
        );

        if threads == 1 {
            self.worker_loop(compiler, 0);
        } else {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("shadercompile-{}", i))
                .build()
            {
                Ok(pool) => pool.scope(|scope| {
                    for worker in 0..threads {
                        scope.spawn(move |_| self.worker_loop(compiler, worker));
                    }
                }),
                Err(e) => {
                    warn!("Failed to build worker pool, compiling on one thread: {}", e);
                    self.worker_loop(compiler, 0);
                }
            }
        }

        self.flush();
    }

    /// Claim and compile units until none are left
    fn worker_loop<C: ShaderCompiler>(&self, compiler: &C, worker: WorkerId) {
        loop {
            let Some(unit) = self.shared.lock().queue.claim(worker, self.space) else {
                break;
            };
            debug!(worker, unit = unit.index, "Unit claimed");

            let commands = self
                .space
                .unit_command_range(unit.static_start, unit.static_end);
            if let Some(cursor) = self.space.seek(commands.start) {
                self.compile_commands(compiler, worker, cursor, commands.end);
            }

            self.shared.lock().queue.complete(worker);
            self.flush();
        }
    }

    fn compile_commands<C: ShaderCompiler>(
        &self,
        compiler: &C,
        worker: WorkerId,
        mut cursor: Cursor,
        end: u64,
    ) {
        while self.space.next_not_skipped(&mut cursor, end) {
            let command_line = self
                .space
                .format_command(&cursor, &self.options.define_prefix);
            let result = compiler.compile(worker, &command_line);

            {
                let mut shared = self.shared.lock();
                self.record(&mut shared, &cursor, result);
                shared.queue.set_position(worker, cursor.command() + 1);
                self.report_progress(&mut shared);
            }

            if !self.space.step(&mut cursor) {
                break;
            }
        }
    }

    /// Store one compiler result
    fn record(
        &self,
        shared: &mut Shared,
        cursor: &Cursor,
        result: Result<CompileOutput, CompileSpawnError>,
    ) {
        let entry = self.space.entry(cursor.entry());
        let command = cursor.command();
        shared.stats.commands_run += 1;

        match result {
            Ok(output) if output.success => {
                if !self.options.suppress_warnings && !output.listing.trim().is_empty() {
                    shared.diagnostics.record_listing(
                        command,
                        &output.listing,
                        &entry.source_file,
                        &self.options.machine,
                    );
                }
                let (static_combo, dynamic_combo) = self.space.split(cursor);
                shared
                    .store
                    .add_dynamic(cursor.entry(), static_combo, dynamic_combo, output.code);
            }
            Ok(output) => {
                let listing = if output.listing.trim().is_empty() {
                    missing_listing(command)
                } else {
                    output.listing
                };
                self.record_failure(shared, cursor.entry(), command, &listing);
            }
            Err(e) => {
                let listing = format!("(0): error {}: {}", command, e);
                self.record_failure(shared, cursor.entry(), command, &listing);
            }
        }
    }

    fn record_failure(&self, shared: &mut Shared, entry: usize, command: u64, listing: &str) {
        let info = self.space.entry(entry);
        shared.stats.commands_failed += 1;
        shared
            .diagnostics
            .record_listing(command, listing, &info.source_file, &self.options.machine);
        if !shared.diagnostics.is_failed(&info.name) {
            warn!(entry = %info.name, command, "Shader failed to compile");
            shared.diagnostics.mark_failed(&info.name);
        }
    }

    fn report_progress(&self, shared: &mut Shared) {
        if shared.last_progress.elapsed() < PROGRESS_INTERVAL {
            return;
        }
        shared.last_progress = Instant::now();
        info!(
            "Compiled {} commands, {} of {} units done",
            shared.stats.commands_run,
            shared.queue.completed(),
            shared.queue.num_units()
        );
    }

    /// Pack and write everything below the watermark
    pub fn flush(&self) {
        let unpacked = {
            let mut shared = self.shared.lock();
            let watermark = shared.advance_watermark(self.space);
            shared.store.take_completed(self.space, watermark)
        };

        let endian = self.options.endian;
        let packed: Vec<_> = unpacked
            .into_par_iter()
            .map(|combo| (combo.entry, combo.pack(endian)))
            .collect();

        let finished = {
            let mut shared = self.shared.lock();
            for (entry, result) in packed {
                match result {
                    Ok(result) => shared.store.return_packed(result),
                    Err(e) => {
                        shared.store.abandon_packing(entry);
                        self.record_store_error(&mut shared, entry, &e);
                    }
                }
            }
            match self.output {
                Output::Archives(_) => {
                    let watermark = shared.watermark;
                    shared.store.take_finished(self.space, watermark)
                }
                Output::Packed => Vec::new(),
            }
        };

        for entry in finished {
            self.finish_entry(entry);
        }
    }

    /// Write or discard the archive of a finished entry
    fn finish_entry(&self, finished: FinishedEntry) {
        let Output::Archives(options) = &self.output else {
            return;
        };
        let entry = self.space.entry(finished.entry);
        let path = options.archive_path(&entry.name);

        let failed = self.shared.lock().diagnostics.is_failed(&entry.name);
        if failed {
            discard_archive(&entry.name, &path);
            return;
        }
        if finished.static_combos.is_empty() {
            debug!(entry = %entry.name, "Every combo skipped, no archive written");
            discard_archive(&entry.name, &path);
            return;
        }

        let index = finished.entry;
        match write_entry_archive(self.space, finished, options) {
            Ok(stats) => {
                let mut shared = self.shared.lock();
                shared.stats.archives_written += 1;
                shared.stats.duplicate_static_combos += stats.duplicate_static_combos;
            }
            Err(e) => {
                let mut shared = self.shared.lock();
                self.record_store_error(&mut shared, index, &e);
                drop(shared);
                // A partial archive is worse than none
                discard_archive(&entry.name, &path);
            }
        }
    }

    fn record_store_error(&self, shared: &mut Shared, entry: usize, error: &StoreError) {
        let info = self.space.entry(entry);
        warn!(entry = %info.name, "{}", error);
        let listing = format!("{}: error: {}", info.name, error);
        shared.diagnostics.record_listing(
            info.command_start,
            &listing,
            &info.source_file,
            &self.options.machine,
        );
        shared.diagnostics.mark_failed(&info.name);
    }

    /// Finish the run and hand back diagnostics, counters and packed results
    pub fn into_results(self) -> JobResults {
        let mut shared = self.shared.into_inner();
        let packed = match self.output {
            Output::Packed => shared.store.drain_packed(),
            Output::Archives(_) => {
                if !shared.store.is_drained() {
                    warn!("Some entries were never written; units are still outstanding");
                }
                Vec::new()
            }
        };

        JobResults {
            diagnostics: shared.diagnostics,
            stats: shared.stats,
            packed,
        }
    }
}

/// Remove an entry's archive from an earlier run, if there is one
fn discard_archive(name: &str, path: &std::path::Path) {
    match remove_stale_archive(path) {
        Ok(true) => info!(entry = %name, "Removed stale archive {}", path.display()),
        Ok(false) => {}
        Err(e) => warn!(entry = %name, "{}", e),
    }
}
