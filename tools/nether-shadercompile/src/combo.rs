//! Combo spaces
//!
//! Every entry's defines span a mixed-radix number space. The digit of a
//! define is `value - min`, and the first-declared define is the least
//! significant digit, so combo 0 has every define at its minimum.
//!
//! Commands walk each entry from its last combo down to combo 0: command
//! offset 0 within an entry has every define at its maximum, and stepping
//! forward decrements the counter like an odometer. Dynamic defines are
//! declared before static ones, which keeps `combo / num_dynamic_combos` a
//! valid static combo number and makes every static combo a contiguous run
//! of commands.
//!
//! The [`CommandSpace`] lays all entries end to end in one `u64` command
//! range and keeps cursors at regular checkpoints so any command can be
//! reached without walking from the start.

use crate::config::CfgEntry;
use crate::expr::Expr;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::ops::Range;
use thiserror::Error;

/// Largest combo count an entry may have (archive ids are 32-bit)
pub const MAX_ENTRY_COMBOS: u64 = u32::MAX as u64;

/// Minimum spacing of seek checkpoints, in static combos
const MIN_CHECKPOINT_INTERVAL: u64 = 1000;

/// Checkpoints per entry once the entry is large enough
const CHECKPOINTS_PER_ENTRY: u64 = 500;

/// A named integer parameter with an inclusive range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Define {
    pub name: String,
    pub min: i32,
    pub max: i32,
    pub is_static: bool,
}

impl Define {
    pub fn new(name: impl Into<String>, min: i32, max: i32, is_static: bool) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            is_static,
        }
    }

    /// Number of values the define takes
    pub fn range(&self) -> u64 {
        (self.max as i64 - self.min as i64 + 1).max(0) as u64
    }
}

/// Errors building a combo space
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComboError {
    #[error("define {name} has an empty range {min}..{max}")]
    EmptyRange { name: String, min: i32, max: i32 },

    #[error("dynamic define {0} is declared after a static define")]
    DynamicAfterStatic(String),

    #[error("{0} combos exceed the 32-bit archive limit")]
    TooManyCombos(u64),
}

/// The combo space of one entry: its defines plus the skip expression
#[derive(Debug, Clone)]
pub struct ComboSpace {
    defines: Vec<Define>,
    skip: Expr,
    num_combos: u64,
    num_dynamic_combos: u64,
    num_static_combos: u64,
}

impl ComboSpace {
    /// Build a space; dynamic defines must come before static ones
    pub fn new(defines: Vec<Define>, skip: Expr) -> Result<Self, ComboError> {
        let mut seen_static = false;
        for define in &defines {
            if define.max < define.min {
                return Err(ComboError::EmptyRange {
                    name: define.name.clone(),
                    min: define.min,
                    max: define.max,
                });
            }
            if define.is_static {
                seen_static = true;
            } else if seen_static {
                return Err(ComboError::DynamicAfterStatic(define.name.clone()));
            }
        }

        let product = |is_static: bool| {
            defines
                .iter()
                .filter(|d| d.is_static == is_static)
                .fold(1u64, |acc, d| acc.saturating_mul(d.range()))
        };
        let num_dynamic_combos = product(false);
        let num_static_combos = product(true);
        let num_combos = num_dynamic_combos.saturating_mul(num_static_combos);

        if num_combos > MAX_ENTRY_COMBOS {
            return Err(ComboError::TooManyCombos(num_combos));
        }

        Ok(Self {
            defines,
            skip,
            num_combos,
            num_dynamic_combos,
            num_static_combos,
        })
    }

    pub fn defines(&self) -> &[Define] {
        &self.defines
    }

    pub fn skip(&self) -> &Expr {
        &self.skip
    }

    pub fn num_combos(&self) -> u64 {
        self.num_combos
    }

    pub fn num_dynamic_combos(&self) -> u64 {
        self.num_dynamic_combos
    }

    pub fn num_static_combos(&self) -> u64 {
        self.num_static_combos
    }

    /// Static combo number of a combo
    pub fn static_index(&self, combo: u64) -> u64 {
        combo / self.num_dynamic_combos
    }

    /// Dynamic combo number of a combo
    pub fn dynamic_index(&self, combo: u64) -> u64 {
        combo % self.num_dynamic_combos
    }

    /// Define values of a combo number
    pub fn decode(&self, combo: u64) -> Vec<i32> {
        let mut values = vec![0; self.defines.len()];
        self.decode_into(combo, &mut values);
        values
    }

    /// Define values of a combo number, written into `values`
    pub fn decode_into(&self, mut combo: u64, values: &mut [i32]) {
        for (value, define) in values.iter_mut().zip(&self.defines) {
            let range = define.range();
            *value = (define.min as i64 + (combo % range) as i64) as i32;
            combo /= range;
        }
    }

    /// Combo number of a set of define values
    pub fn encode(&self, values: &[i32]) -> u64 {
        self.defines
            .iter()
            .zip(values)
            .rev()
            .fold(0, |combo, (define, &value)| {
                combo * define.range() + (value as i64 - define.min as i64) as u64
            })
    }

    /// Define values at a command offset within the entry
    pub fn values_at_offset(&self, offset: u64) -> Vec<i32> {
        self.decode(self.num_combos - 1 - offset)
    }

    /// Whether the skip expression rejects a combo
    pub fn is_skipped(&self, combo: u64) -> bool {
        self.skip.eval(&self.decode(combo)) != 0
    }

    /// Whether the skip expression rejects a set of define values
    pub fn skips_values(&self, values: &[i32]) -> bool {
        self.skip.eval(values) != 0
    }

    /// Count the encoded values down by `n` in place
    ///
    /// Each digit borrows from the next one when it passes its minimum.
    /// `n` must not exceed the current combo number.
    fn count_down(&self, values: &mut [i32], mut n: u64) {
        for (value, define) in values.iter_mut().zip(&self.defines) {
            if n == 0 {
                break;
            }
            let range = define.range();
            let digit = (*value as i64 - define.min as i64) as u64;
            let sub = n % range;
            n /= range;

            let digit = if digit >= sub {
                digit - sub
            } else {
                n += 1;
                digit + range - sub
            };
            *value = (define.min as i64 + digit as i64) as i32;
        }
    }

    /// Count the encoded values down by one, returning false on wrap
    fn decrement(&self, values: &mut [i32]) -> bool {
        for (value, define) in values.iter_mut().zip(&self.defines) {
            if *value > define.min {
                *value -= 1;
                return true;
            }
            *value = define.max;
        }
        false
    }
}

/// A position in the command space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    entry: usize,
    command: u64,
    combo: u64,
    values: Vec<i32>,
}

impl Cursor {
    /// Index of the entry in [`CommandSpace::entries`]
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Global command number
    pub fn command(&self) -> u64 {
        self.command
    }

    /// Combo number within the entry
    pub fn combo(&self) -> u64 {
        self.combo
    }

    /// Define values, in declaration order
    pub fn values(&self) -> &[i32] {
        &self.values
    }
}

/// All entries laid out in one command range
#[derive(Debug, Clone)]
pub struct CommandSpace {
    entries: Vec<CfgEntry>,
    /// Global static index at which each entry starts
    static_starts: Vec<u64>,
    num_commands: u64,
    num_static_combos: u64,
    checkpoints: BTreeMap<u64, Cursor>,
}

impl CommandSpace {
    /// Lay out entries, largest first
    pub fn new(mut entries: Vec<CfgEntry>) -> Self {
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.num_combos()));

        let mut static_starts = Vec::with_capacity(entries.len());
        let mut command = 0;
        let mut statics = 0;
        for entry in &mut entries {
            entry.command_start = command;
            command += entry.num_combos();
            entry.command_end = command;

            static_starts.push(statics);
            statics += entry.num_static_combos();
        }

        let mut space = Self {
            entries,
            static_starts,
            num_commands: command,
            num_static_combos: statics,
            checkpoints: BTreeMap::new(),
        };
        space.build_checkpoints();
        space
    }

    fn build_checkpoints(&mut self) {
        let mut checkpoints = BTreeMap::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            let interval = MIN_CHECKPOINT_INTERVAL.max(entry.num_static_combos() / CHECKPOINTS_PER_ENTRY);
            let step = interval * entry.num_dynamic_combos();

            let mut command = entry.command_start;
            while command < entry.command_end {
                checkpoints.insert(command, self.cursor_at(idx, command));
                command += step;
            }
        }
        tracing::debug!(
            checkpoints = checkpoints.len(),
            commands = self.num_commands,
            "Command space checkpoints built"
        );
        self.checkpoints = checkpoints;
    }

    fn cursor_at(&self, entry: usize, command: u64) -> Cursor {
        let info = &self.entries[entry];
        let combo = info.num_combos() - 1 - (command - info.command_start);
        Cursor {
            entry,
            command,
            combo,
            values: info.space.decode(combo),
        }
    }

    pub fn entries(&self) -> &[CfgEntry] {
        &self.entries
    }

    pub fn entry(&self, idx: usize) -> &CfgEntry {
        &self.entries[idx]
    }

    /// Total number of commands
    pub fn num_commands(&self) -> u64 {
        self.num_commands
    }

    /// Total number of static combos across all entries
    pub fn num_static_combos(&self) -> u64 {
        self.num_static_combos
    }

    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// Entry owning a command
    pub fn entry_for_command(&self, command: u64) -> Option<usize> {
        if command >= self.num_commands {
            return None;
        }
        Some(
            self.entries
                .partition_point(|entry| entry.command_end <= command),
        )
    }

    /// Entry and static offset (in command order) of a global static index
    pub fn entry_for_static(&self, global_static: u64) -> Option<(usize, u64)> {
        if global_static >= self.num_static_combos {
            return None;
        }
        let idx = self
            .static_starts
            .partition_point(|&start| start <= global_static)
            - 1;
        Some((idx, global_static - self.static_starts[idx]))
    }

    /// First command of a global static index (the end of the space past the last one)
    fn static_to_command(&self, global_static: u64) -> u64 {
        match self.entry_for_static(global_static) {
            Some((idx, offset)) => {
                let entry = &self.entries[idx];
                entry.command_start + offset * entry.num_dynamic_combos()
            }
            None => self.num_commands,
        }
    }

    /// Commands covered by a run of global static indices
    pub fn unit_command_range(&self, static_start: u64, static_end: u64) -> Range<u64> {
        self.static_to_command(static_start)..self.static_to_command(static_end)
    }

    /// Commands of one static combo of an entry
    pub fn static_combo_commands(&self, entry: usize, static_combo: u64) -> Range<u64> {
        let info = &self.entries[entry];
        let nd = info.num_dynamic_combos();
        let offset = info.num_static_combos() - 1 - static_combo;
        let start = info.command_start + offset * nd;
        start..start + nd
    }

    /// Cursor at a command, or `None` past the end of the space
    pub fn seek(&self, command: u64) -> Option<Cursor> {
        let (&start, checkpoint) = self.checkpoints.range(..=command).next_back()?;
        let mut cursor = checkpoint.clone();
        self.advance(&mut cursor, command - start).then_some(cursor)
    }

    /// Move forward exactly `n` commands, crossing entries as needed
    ///
    /// Returns false, leaving the cursor exhausted, when the space runs out.
    pub fn advance(&self, cursor: &mut Cursor, n: u64) -> bool {
        let mut remaining = n;
        loop {
            let Some(entry) = self.entries.get(cursor.entry) else {
                return false;
            };

            let left = entry.command_end - cursor.command;
            if remaining < left {
                entry.space.count_down(&mut cursor.values, remaining);
                cursor.combo -= remaining;
                cursor.command += remaining;
                return true;
            }

            remaining -= left;
            if !self.enter_next_entry(cursor) {
                return false;
            }
        }
    }

    /// Move forward one command
    pub fn step(&self, cursor: &mut Cursor) -> bool {
        let Some(entry) = self.entries.get(cursor.entry) else {
            return false;
        };
        if entry.space.decrement(&mut cursor.values) {
            cursor.combo -= 1;
            cursor.command += 1;
            true
        } else {
            self.enter_next_entry(cursor)
        }
    }

    /// Place the cursor on the first command of the following entry
    fn enter_next_entry(&self, cursor: &mut Cursor) -> bool {
        let next = cursor.entry + 1;
        match self.entries.get(next) {
            Some(entry) => {
                *cursor = Cursor {
                    entry: next,
                    command: entry.command_start,
                    combo: entry.num_combos() - 1,
                    values: entry.space.decode(entry.num_combos() - 1),
                };
                true
            }
            None => {
                cursor.entry = self.entries.len();
                cursor.command = self.num_commands;
                cursor.combo = 0;
                cursor.values.clear();
                false
            }
        }
    }

    /// Whether the cursor's combo is skipped
    pub fn is_skipped(&self, cursor: &Cursor) -> bool {
        self.entries
            .get(cursor.entry)
            .is_some_and(|entry| entry.space.skips_values(&cursor.values))
    }

    /// Move to the first non-skipped command at or after the cursor, below `limit`
    pub fn next_not_skipped(&self, cursor: &mut Cursor, limit: u64) -> bool {
        loop {
            if cursor.command >= limit || cursor.entry >= self.entries.len() {
                return false;
            }
            if !self.is_skipped(cursor) {
                return true;
            }
            if !self.step(cursor) {
                return false;
            }
        }
    }

    /// Static and dynamic combo numbers of the cursor
    pub fn split(&self, cursor: &Cursor) -> (u64, u64) {
        let space = &self.entries[cursor.entry].space;
        (space.static_index(cursor.combo), space.dynamic_index(cursor.combo))
    }

    /// Full compiler command line for the cursor
    pub fn format_command(&self, cursor: &Cursor, define_prefix: &str) -> String {
        let Some(entry) = self.entries.get(cursor.entry) else {
            return String::new();
        };

        let mut command = entry.command_prefix.clone();
        let _ = write!(command, " {}SHADERCOMBO={}", define_prefix, cursor.combo);
        for (define, value) in entry.space.defines().iter().zip(&cursor.values) {
            let _ = write!(command, " {}{}={}", define_prefix, define.name, value);
        }
        if !entry.command_suffix.is_empty() {
            command.push(' ');
            command.push_str(&entry.command_suffix);
        }
        command
    }
}
