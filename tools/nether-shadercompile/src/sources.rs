//! Shader sources for the compiler scratch directories
//!
//! Compiler commands name their sources relative to the working directory,
//! which is a per-worker scratch directory. Before a worker runs its first
//! command the sources are copied in flat, by file name.
//!
//! The files come from the shader directory. When it holds a
//! [`SOURCE_LIST_FILE`] every line of it names a file to copy (includes
//! and all); otherwise the source file of each entry is copied.

use crate::combo::CommandSpace;
use bitcode::{Decode, Encode};
use hashbrown::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// List of files to copy, one path per line, relative to the shader directory
pub const SOURCE_LIST_FILE: &str = "uniquefilestocopy.txt";

/// One file copied into every scratch directory
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SourceFile {
    /// Bare file name, no directories
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read source list {path}: {source}")]
    List {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Last component of a path written with either separator
fn bare_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn relative_path(path: &str) -> PathBuf {
    path.split(['/', '\\']).filter(|part| !part.is_empty()).collect()
}

/// Paths of the files to copy, relative to `shader_dir`
pub fn source_names(shader_dir: &Path, space: &CommandSpace) -> Result<Vec<String>, SourceError> {
    let list_path = shader_dir.join(SOURCE_LIST_FILE);
    if list_path.is_file() {
        let text = std::fs::read_to_string(&list_path).map_err(|source| SourceError::List {
            path: list_path.clone(),
            source,
        })?;
        debug!("Copying sources listed in {}", list_path.display());
        return Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect());
    }

    let mut seen = HashSet::new();
    Ok(space
        .entries()
        .iter()
        .map(|entry| entry.source_file.trim())
        .filter(|name| !name.is_empty() && seen.insert(*name))
        .map(str::to_string)
        .collect())
}

/// Read every source the job needs
///
/// Files that can't be read are skipped with a warning; the commands that
/// need them fail and get reported like any other compile error.
pub fn load_sources(shader_dir: &Path, space: &CommandSpace) -> Result<Vec<SourceFile>, SourceError> {
    let mut names = HashSet::new();
    let mut sources = Vec::new();

    for listed in source_names(shader_dir, space)? {
        let name = bare_name(&listed);
        if name.is_empty() || !names.insert(name.to_string()) {
            continue;
        }

        let path = shader_dir.join(relative_path(&listed));
        match std::fs::read(&path) {
            Ok(data) => sources.push(SourceFile {
                name: name.to_string(),
                data,
            }),
            Err(e) => warn!("Can't read shader source {}: {}", path.display(), e),
        }
    }

    debug!(count = sources.len(), "Loaded shader sources");
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadOptions, build_command_space};

    const JOB: &str = "\
#BEGIN water
water.fxc
#DEFINES-S
A=0..1
#COMMAND
fxc
#END
#BEGIN water_lit
water.fxc
#COMMAND
fxc
#END
#BEGIN sky
shaders/sky.fxc
#COMMAND
fxc
#END
";

    fn space() -> CommandSpace {
        build_command_space(JOB, &LoadOptions::default()).unwrap()
    }

    #[test]
    fn test_entry_sources_without_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("water.fxc"), b"water").unwrap();
        std::fs::create_dir(dir.path().join("shaders")).unwrap();
        std::fs::write(dir.path().join("shaders").join("sky.fxc"), b"sky").unwrap();

        let names = source_names(dir.path(), &space()).unwrap();
        assert_eq!(names, ["water.fxc", "shaders/sky.fxc"]);

        let sources = load_sources(dir.path(), &space()).unwrap();
        assert_eq!(
            sources,
            [
                SourceFile {
                    name: "water.fxc".into(),
                    data: b"water".to_vec(),
                },
                SourceFile {
                    name: "sky.fxc".into(),
                    data: b"sky".to_vec(),
                },
            ]
        );
    }

    #[test]
    fn test_list_file_wins_and_missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("inc")).unwrap();
        std::fs::write(dir.path().join("inc").join("common.h"), b"#define X 1").unwrap();
        std::fs::write(dir.path().join("water.fxc"), b"water").unwrap();
        std::fs::write(
            dir.path().join(SOURCE_LIST_FILE),
            "inc\\common.h\r\n\r\nwater.fxc\nmissing.fxc\n",
        )
        .unwrap();

        let sources = load_sources(dir.path(), &space()).unwrap();
        let names: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["common.h", "water.fxc"]);
        assert_eq!(sources[0].data, b"#define X 1");
    }

    #[test]
    fn test_bare_name() {
        assert_eq!(bare_name("a/b\\c.fxc"), "c.fxc");
        assert_eq!(bare_name("c.fxc"), "c.fxc");
        assert_eq!(relative_path("a\\b/c.fxc"), Path::new("a").join("b").join("c.fxc"));
    }
}
