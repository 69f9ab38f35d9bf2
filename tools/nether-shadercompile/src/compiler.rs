//! Shader compiler backends
//!
//! The dispatcher only sees [`ShaderCompiler`]. [`ExternalCompiler`] runs a
//! command line through the platform shell inside a per-worker scratch
//! directory and picks the results up from there. The shader sources are
//! copied into each scratch directory before its first command.

use crate::sources::SourceFile;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use thiserror::Error;

/// File the compiler writes its output to
pub const RESULT_FILE: &str = "shader.o";

/// File the compiler writes its listing to
pub const LISTING_FILE: &str = "output.txt";

/// Result of one compiler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOutput {
    pub success: bool,
    /// Compiled code, empty on failure
    pub code: Vec<u8>,
    /// Warnings or errors, possibly empty
    pub listing: String,
}

impl CompileOutput {
    pub fn success(code: Vec<u8>, listing: impl Into<String>) -> Self {
        Self {
            success: true,
            code,
            listing: listing.into(),
        }
    }

    pub fn failure(listing: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Vec::new(),
            listing: listing.into(),
        }
    }
}

/// Errors that prevent a compiler run from happening at all
#[derive(Debug, Error)]
pub enum CompileSpawnError {
    #[error("compiler executable '{name}' not found: {source}")]
    NotFound { name: String, source: which::Error },

    #[error("failed to prepare scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to launch compiler: {0}")]
    Launch(#[source] std::io::Error),

    #[error("failed to read compiler output {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Something that turns a command line into compiled code
pub trait ShaderCompiler: Send + Sync {
    /// Run one command on behalf of `worker`
    ///
    /// Compiler failures are reported through [`CompileOutput::success`];
    /// `Err` means the compiler could not be run.
    fn compile(&self, worker: usize, command: &str) -> Result<CompileOutput, CompileSpawnError>;

    /// Files every command expects in its working directory
    ///
    /// Replaces anything provided earlier. Compilers that don't run in a
    /// working directory of their own ignore this.
    fn provide_sources(&self, _sources: Vec<SourceFile>) {}
}

#[derive(Debug, Default)]
struct Staging {
    sources: Arc<Vec<SourceFile>>,
    /// Workers whose scratch directory holds the current sources
    staged: HashSet<usize>,
}

/// Runs compiler command lines through the shell
#[derive(Debug)]
pub struct ExternalCompiler {
    scratch_root: PathBuf,
    /// Directory prepended to `PATH` for the compiler
    search_dir: Option<PathBuf>,
    staging: Mutex<Staging>,
}

impl ExternalCompiler {
    /// Create a compiler that keeps per-worker scratch directories under `scratch_root`
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            search_dir: None,
            staging: Mutex::new(Staging::default()),
        }
    }

    /// Make sure `executable` is reachable and put its directory on `PATH`
    pub fn with_executable(mut self, executable: &str) -> Result<Self, CompileSpawnError> {
        let path = which::which(executable).map_err(|source| CompileSpawnError::NotFound {
            name: executable.to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Resolved shader compiler");
        self.search_dir = path.parent().map(Path::to_path_buf);
        Ok(self)
    }

    /// Scratch directory of one worker
    pub fn scratch_dir(&self, worker: usize) -> PathBuf {
        self.scratch_root.join(format!("worker-{}", worker))
    }

    /// Copy the sources into `dir` unless this worker already has them
    fn stage_sources(&self, worker: usize, dir: &Path) -> Result<(), CompileSpawnError> {
        let sources = {
            let staging = self.staging.lock();
            if staging.staged.contains(&worker) {
                return Ok(());
            }
            Arc::clone(&staging.sources)
        };

        for file in sources.iter() {
            let path = dir.join(&file.name);
            std::fs::write(&path, &file.data)
                .map_err(|source| CompileSpawnError::Scratch { path, source })?;
        }
        tracing::debug!(worker, count = sources.len(), dir = %dir.display(), "Staged shader sources");

        let mut staging = self.staging.lock();
        // Sources replaced while copying get staged on the next command
        if Arc::ptr_eq(&staging.sources, &sources) {
            staging.staged.insert(worker);
        }
        Ok(())
    }

    fn shell(command: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }

    fn search_path(&self) -> Option<std::ffi::OsString> {
        let dir = self.search_dir.as_ref()?;
        let current = std::env::var_os("PATH").unwrap_or_default();
        let paths = std::iter::once(dir.clone()).chain(std::env::split_paths(&current));
        std::env::join_paths(paths).ok()
    }
}

fn remove_stale(path: &Path) -> Result<(), CompileSpawnError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CompileSpawnError::Scratch {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Captured stderr then stdout, for compilers that don't write a listing file
fn captured_listing(output: &Output) -> String {
    let mut listing = String::from_utf8_lossy(&output.stderr).into_owned();
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        if !listing.is_empty() && !listing.ends_with('\n') {
            listing.push('\n');
        }
        listing.push_str(&stdout);
    }
    listing
}

impl ShaderCompiler for ExternalCompiler {
    fn compile(&self, worker: usize, command: &str) -> Result<CompileOutput, CompileSpawnError> {
        let dir = self.scratch_dir(worker);
        std::fs::create_dir_all(&dir).map_err(|source| CompileSpawnError::Scratch {
            path: dir.clone(),
            source,
        })?;
        self.stage_sources(worker, &dir)?;

        let result_path = dir.join(RESULT_FILE);
        let listing_path = dir.join(LISTING_FILE);
        remove_stale(&result_path)?;
        remove_stale(&listing_path)?;

        let mut cmd = Self::shell(command);
        cmd.current_dir(&dir);
        if let Some(path) = self.search_path() {
            cmd.env("PATH", path);
        }
        let output = cmd.output().map_err(CompileSpawnError::Launch)?;

        let listing = match std::fs::read(&listing_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => captured_listing(&output),
        };

        if !output.status.success() || !result_path.exists() {
            tracing::trace!(status = ?output.status, command, "Compiler run failed");
            return Ok(CompileOutput::failure(listing));
        }

        let code = std::fs::read(&result_path).map_err(|source| CompileSpawnError::Output {
            path: result_path.clone(),
            source,
        })?;
        Ok(CompileOutput::success(code, listing))
    }

    fn provide_sources(&self, sources: Vec<SourceFile>) {
        let mut staging = self.staging.lock();
        staging.sources = Arc::new(sources);
        staging.staged.clear();
    }
}
