//! Job description loader
//!
//! A job description lists one block per shader entry:
//!
//! ```text
//! #BEGIN water_ps30
//! water_ps2x.fxc
//! #DEFINES-D
//! FOGTYPE=0..2
//! #DEFINES-S
//! REFLECT=0..1
//! #SKIP
//! $FOGTYPE == 2 && $REFLECT
//! #COMMAND
//! fxc.exe /nologo /Tps_3_0
//! /Dmain=main water_ps2x.fxc
//! #END
//! ```
//!
//! Blank lines and `//` comments are ignored everywhere. `#DEFINES-S` and
//! `#DEFINES-D` blocks may repeat; dynamic defines are moved in front of
//! static ones. The skip expression may span several lines, which are
//! joined with spaces.

use crate::combo::{ComboError, ComboSpace, CommandSpace, Define};
use crate::expr::{Expr, ExprError};
use hashbrown::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// One shader entry of the job description
#[derive(Debug, Clone)]
pub struct CfgEntry {
    pub name: String,
    pub source_file: String,
    pub command_prefix: String,
    pub command_suffix: String,
    pub space: ComboSpace,
    /// First command of the entry, assigned by [`CommandSpace::new`]
    pub command_start: u64,
    /// One past the last command of the entry
    pub command_end: u64,
}

impl CfgEntry {
    pub fn new(
        name: impl Into<String>,
        source_file: impl Into<String>,
        command_prefix: impl Into<String>,
        command_suffix: impl Into<String>,
        space: ComboSpace,
    ) -> Self {
        Self {
            name: name.into(),
            source_file: source_file.into(),
            command_prefix: command_prefix.into(),
            command_suffix: command_suffix.into(),
            space,
            command_start: 0,
            command_end: 0,
        }
    }

    pub fn num_combos(&self) -> u64 {
        self.space.num_combos()
    }

    pub fn num_static_combos(&self) -> u64 {
        self.space.num_static_combos()
    }

    pub fn num_dynamic_combos(&self) -> u64 {
        self.space.num_dynamic_combos()
    }
}

/// Loader options
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Treat an unparsable skip expression as an error instead of "skip nothing"
    pub strict_skip: bool,
}

/// Job description errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read job description {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: entry {entry}: {source}")]
    Combo {
        line: usize,
        entry: String,
        source: ComboError,
    },

    #[error("line {line}: entry {entry}: invalid skip expression: {source}")]
    Skip {
        line: usize,
        entry: String,
        source: ExprError,
    },
}

impl ConfigError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    /// Expecting the source file name
    Header,
    Defines { is_static: bool },
    Skip,
    Command,
}

/// An entry being parsed
struct EntryBuilder {
    name: String,
    line: usize,
    section: Section,
    source_file: Option<String>,
    defines: Vec<Define>,
    skip_text: Vec<String>,
    skip_line: usize,
    command: Vec<String>,
    has_command: bool,
}

impl EntryBuilder {
    fn new(name: String, line: usize) -> Self {
        Self {
            name,
            line,
            section: Section::Header,
            source_file: None,
            defines: Vec::new(),
            skip_text: Vec::new(),
            skip_line: line,
            command: Vec::new(),
            has_command: false,
        }
    }

    fn content(&mut self, text: &str, line: usize) -> Result<(), ConfigError> {
        match self.section {
            Section::Header if self.source_file.is_none() => {
                self.source_file = Some(text.to_string());
            }
            Section::Header => {
                return Err(ConfigError::syntax(
                    line,
                    format!("unexpected line '{}' before a section marker", text),
                ));
            }
            Section::Defines { is_static } => {
                if let Some(define) = parse_define(text, is_static, line)? {
                    self.defines.push(define);
                } else {
                    warn!(entry = %self.name, line, "Dropping define with an empty range: {}", text);
                }
            }
            Section::Skip => self.skip_text.push(text.to_string()),
            Section::Command if self.command.len() < 2 => self.command.push(text.to_string()),
            Section::Command => {
                return Err(ConfigError::syntax(
                    line,
                    "a command has exactly a prefix and a suffix line",
                ));
            }
        }
        Ok(())
    }

    fn finish(self, options: &LoadOptions) -> Result<CfgEntry, ConfigError> {
        let source_file = self.source_file.ok_or_else(|| {
            ConfigError::syntax(self.line, format!("entry {} has no source file", self.name))
        })?;
        if !self.has_command || self.command.is_empty() {
            return Err(ConfigError::syntax(
                self.line,
                format!("entry {} has no #COMMAND section", self.name),
            ));
        }

        // Dynamic defines first so static combos are contiguous
        let mut defines = self.defines;
        defines.sort_by_key(|define| define.is_static);

        let names: Vec<&str> = defines.iter().map(|d| d.name.as_str()).collect();
        let text = self.skip_text.join(" ");
        let skip = if options.strict_skip {
            Expr::parse(&text, &names).map_err(|source| ConfigError::Skip {
                line: self.skip_line,
                entry: self.name.clone(),
                source,
            })?
        } else {
            let (skip, error) = Expr::parse_lenient(&text, &names);
            if let Some(error) = error {
                warn!(
                    entry = %self.name,
                    line = self.skip_line,
                    %error,
                    "Invalid skip expression, compiling every combo"
                );
            }
            skip
        };

        let space = ComboSpace::new(defines, skip).map_err(|source| ConfigError::Combo {
            line: self.line,
            entry: self.name.clone(),
            source,
        })?;

        let mut command = self.command.into_iter();
        let prefix = command.next().unwrap_or_default();
        let suffix = command.next().unwrap_or_default();

        Ok(CfgEntry::new(self.name, source_file, prefix, suffix, space))
    }
}

/// Parse `NAME=min..max`, returning `None` for an empty range
fn parse_define(text: &str, is_static: bool, line: usize) -> Result<Option<Define>, ConfigError> {
    let bad_range = || ConfigError::syntax(line, format!("bad define range '{}'", text));

    let (name, range) = text.split_once('=').ok_or_else(bad_range)?;
    let (min, max) = range.split_once("..").ok_or_else(bad_range)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(bad_range());
    }
    let min: i32 = min.trim().parse().map_err(|_| bad_range())?;
    let max: i32 = max.trim().parse().map_err(|_| bad_range())?;

    if max < min {
        return Ok(None);
    }
    Ok(Some(Define::new(name, min, max, is_static)))
}

/// Entry name after `#BEGIN`, which must be followed by whitespace
fn begin_marker(text: &str) -> Option<&str> {
    text.strip_prefix("#BEGIN")
        .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

/// Parse a job description into entries, in file order
pub fn parse_job(text: &str, options: &LoadOptions) -> Result<Vec<CfgEntry>, ConfigError> {
    let mut entries = Vec::new();
    let mut names = HashSet::new();
    let mut current: Option<EntryBuilder> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let text = raw.trim();
        if text.is_empty() || text.starts_with("//") {
            continue;
        }

        if let Some(name) = begin_marker(text) {
            if current.is_some() {
                return Err(ConfigError::syntax(line, "#BEGIN inside an unfinished entry"));
            }
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::syntax(line, "#BEGIN without an entry name"));
            }
            current = Some(EntryBuilder::new(name.to_string(), line));
            continue;
        }

        let Some(builder) = current.as_mut() else {
            return Err(ConfigError::syntax(
                line,
                format!("expected #BEGIN, found '{}'", text),
            ));
        };

        match text {
            "#DEFINES-S" => builder.section = Section::Defines { is_static: true },
            "#DEFINES-D" => builder.section = Section::Defines { is_static: false },
            "#SKIP" => {
                builder.section = Section::Skip;
                builder.skip_line = line;
            }
            "#COMMAND" => {
                builder.section = Section::Command;
                builder.has_command = true;
            }
            "#END" => {
                if let Some(builder) = current.take() {
                    let entry = builder.finish(options)?;
                    if names.insert(entry.name.clone()) {
                        entries.push(entry);
                    } else {
                        debug!(entry = %entry.name, line, "Duplicate entry ignored");
                    }
                }
            }
            marker if marker.starts_with('#') => {
                return Err(ConfigError::syntax(
                    line,
                    format!("unknown marker '{}'", marker),
                ));
            }
            content => builder.content(content, line)?,
        }
    }

    if let Some(builder) = current {
        return Err(ConfigError::syntax(
            builder.line,
            format!("entry {} is missing #END", builder.name),
        ));
    }

    Ok(entries)
}

/// Parse a job description and lay out its command space
pub fn build_command_space(text: &str, options: &LoadOptions) -> Result<CommandSpace, ConfigError> {
    let entries = parse_job(text, options)?;
    let space = CommandSpace::new(entries);
    debug!(
        entries = space.entries().len(),
        commands = space.num_commands(),
        static_combos = space.num_static_combos(),
        "Job description loaded"
    );
    Ok(space)
}

/// Read a job description file
pub fn read_job(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = "\
// water shaders
#BEGIN water
water.fxc
#DEFINES-S
REFLECT=0..1
#DEFINES-D
FOG=0..2

#SKIP
$FOG == 2
  && $REFLECT
#COMMAND
fxc /nologo
/Dmain=main water.fxc
#END

#BEGIN sky
sky.fxc
#COMMAND
fxc /nologo
#END
";

    fn parse(text: &str) -> Result<Vec<CfgEntry>, ConfigError> {
        parse_job(text, &LoadOptions::default())
    }

    fn syntax_line(err: ConfigError) -> usize {
        match err {
            ConfigError::Syntax { line, .. } => line,
            other => panic!("expected a syntax error, got {other}"),
        }
    }

    #[test]
    fn test_parse_entries() {
        let entries = parse(JOB).unwrap();
        assert_eq!(entries.len(), 2);

        let water = &entries[0];
        assert_eq!(water.name, "water");
        assert_eq!(water.source_file, "water.fxc");
        assert_eq!(water.command_prefix, "fxc /nologo");
        assert_eq!(water.command_suffix, "/Dmain=main water.fxc");
        assert_eq!(water.num_combos(), 6);
        assert_eq!(water.num_dynamic_combos(), 3);

        // FOG moved in front of REFLECT
        let names: Vec<&str> = water.space.defines().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["FOG", "REFLECT"]);

        // Multi-line skip joined and resolved after reordering
        assert!(water.space.skips_values(&[2, 1]));
        assert!(!water.space.skips_values(&[2, 0]));

        let sky = &entries[1];
        assert_eq!(sky.num_combos(), 1);
        assert_eq!(sky.command_suffix, "");
        assert!(sky.space.skip().is_never());
    }

    #[test]
    fn test_duplicate_entries_keep_first() {
        let text = "#BEGIN a\nfirst.fxc\n#COMMAND\nx\n#END\n#BEGIN a\nsecond.fxc\n#COMMAND\ny\n#END\n";
        let entries = parse(text).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source_file, "first.fxc");
    }

    #[test]
    fn test_empty_range_dropped() {
        let text = "#BEGIN a\na.fxc\n#DEFINES-D\nX=3..1\nY=0..1\n#COMMAND\nx\n#END\n";
        let entries = parse(text).unwrap();
        assert_eq!(entries[0].space.defines().len(), 1);
        assert_eq!(entries[0].num_combos(), 2);
    }

    #[test]
    fn test_syntax_errors_report_lines() {
        let bad_range = "#BEGIN a\na.fxc\n#DEFINES-D\nX=0-1\n#COMMAND\nx\n#END\n";
        assert_eq!(syntax_line(parse(bad_range).unwrap_err()), 4);

        let unknown = "#BEGIN a\na.fxc\n#DEFINES-X\n#END\n";
        assert_eq!(syntax_line(parse(unknown).unwrap_err()), 3);

        let no_command = "#BEGIN a\na.fxc\n#DEFINES-D\nX=0..1\n#END\n";
        assert_eq!(syntax_line(parse(no_command).unwrap_err()), 1);

        let no_end = "\n#BEGIN a\na.fxc\n#COMMAND\nx\n";
        assert_eq!(syntax_line(parse(no_end).unwrap_err()), 2);

        let stray = "a.fxc\n";
        assert_eq!(syntax_line(parse(stray).unwrap_err()), 1);

        let nested = "#BEGIN a\n#BEGIN b\n";
        assert_eq!(syntax_line(parse(nested).unwrap_err()), 2);
    }

    #[test]
    fn test_begin_needs_whitespace_before_name() {
        let glued = "#BEGINwater\nwater.fxc\n#COMMAND\nx\n#END\n";
        assert_eq!(syntax_line(parse(glued).unwrap_err()), 1);

        let bare = "#BEGIN\nwater.fxc\n#COMMAND\nx\n#END\n";
        assert_eq!(syntax_line(parse(bare).unwrap_err()), 1);

        let tab = "#BEGIN\twater\nwater.fxc\n#COMMAND\nx\n#END\n";
        assert_eq!(parse(tab).unwrap()[0].name, "water");
    }

    #[test]
    fn test_bad_skip_lenient_and_strict() {
        let text = "#BEGIN a\na.fxc\n#DEFINES-D\nX=0..1\n#SKIP\n$X >\n#COMMAND\nx\n#END\n";

        let entries = parse(text).unwrap();
        assert!(entries[0].space.skip().is_never());

        let err = parse_job(text, &LoadOptions { strict_skip: true }).unwrap_err();
        assert!(matches!(err, ConfigError::Skip { line: 5, .. }));
    }

    #[test]
    fn test_too_many_combos_is_fatal() {
        let text = "#BEGIN a\na.fxc\n#DEFINES-D\nA=0..65535\nB=0..65536\n#COMMAND\nx\n#END\n";
        let err = parse(text).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Combo {
                source: ComboError::TooManyCombos(_),
                ..
            }
        ));
    }

    #[test]
    fn test_build_command_space() {
        let space = build_command_space(JOB, &LoadOptions::default()).unwrap();
        assert_eq!(space.num_commands(), 7);
        assert_eq!(space.entry(0).name, "water");
        assert_eq!(space.entry(1).command_start, 6);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_job(&dir.path().join("missing.txt")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
