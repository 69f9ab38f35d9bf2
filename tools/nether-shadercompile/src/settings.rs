//! Tool settings (shadercompile.toml)
//!
//! Every field is optional; a missing file means all defaults. Command line
//! flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File looked up in the working directory when `--config` is not given
pub const DEFAULT_SETTINGS_FILE: &str = "shadercompile.toml";

/// Settings loading errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid settings {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// All tool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub compiler: CompilerSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

/// How the shader compiler is run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerSettings {
    /// Executable checked with `which` before compiling; its directory goes on `PATH`
    #[serde(default)]
    pub executable: Option<String>,
    /// Prefix of every define on the command line (default: "/D")
    #[serde(default = "default_define_prefix")]
    pub define_prefix: String,
    /// Drop listings of successful compiles (default: false)
    #[serde(default)]
    pub suppress_warnings: bool,
    /// Root of the per-worker scratch directories (default: system temp dir)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    /// Directory holding the shader sources (default: the job file's directory)
    #[serde(default)]
    pub shader_path: Option<PathBuf>,
}

/// Work distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Local worker threads (default: logical CPUs minus one)
    #[serde(default)]
    pub threads: Option<usize>,
    /// Seconds the coordinator waits with no worker connected (default: 300)
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// Seconds a remote worker may take on one unit before it is requeued (default: 1800)
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
}

/// Archive output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Archive file extension (default: "vcs")
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Write big-endian archives (default: false)
    #[serde(default)]
    pub big_endian: bool,
}

fn default_define_prefix() -> String {
    "/D".to_string()
}
fn default_worker_timeout_secs() -> u64 {
    300
}
fn default_unit_timeout_secs() -> u64 {
    1800
}
fn default_extension() -> String {
    "vcs".to_string()
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            executable: None,
            define_prefix: default_define_prefix(),
            suppress_warnings: false,
            scratch_dir: None,
            shader_path: None,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            threads: None,
            worker_timeout_secs: default_worker_timeout_secs(),
            unit_timeout_secs: default_unit_timeout_secs(),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            extension: default_extension(),
            big_endian: false,
        }
    }
}

impl Settings {
    pub fn parse(content: &str, path: &Path) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load settings from a file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Load an explicit file, or [`DEFAULT_SETTINGS_FILE`] if it exists, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Path::new(DEFAULT_SETTINGS_FILE);
                if path.is_file() {
                    tracing::debug!("Using {}", DEFAULT_SETTINGS_FILE);
                    Self::load(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.worker_timeout_secs)
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.unit_timeout_secs.max(1))
    }

    /// Shader source directory, defaulting to the directory of `job`
    pub fn shader_path(&self, job: &Path) -> PathBuf {
        match &self.compiler.shader_path {
            Some(path) => path.clone(),
            None => job
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        }
    }

    /// Scratch root, defaulting to a directory under the system temp dir
    pub fn scratch_dir(&self) -> PathBuf {
        self.compiler
            .scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("nether-shadercompile"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let settings = Settings::parse("", Path::new("x.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.compiler.define_prefix, "/D");
        assert_eq!(settings.output.extension, "vcs");
        assert_eq!(settings.worker_timeout(), Duration::from_secs(300));
        assert_eq!(settings.unit_timeout(), Duration::from_secs(1800));
        assert_eq!(
            settings.shader_path(Path::new("shaders/job.txt")),
            PathBuf::from("shaders")
        );
        assert_eq!(settings.shader_path(Path::new("job.txt")), PathBuf::from("."));
    }

    #[test]
    fn test_partial_sections() {
        let content = r#"
[compiler]
executable = "fxc"
define_prefix = "-D"

shader_path = "src/shaders"

[dispatch]
threads = 6
unit_timeout_secs = 0

[output]
big_endian = true
"#;
        let settings = Settings::parse(content, Path::new("x.toml")).unwrap();
        assert_eq!(settings.compiler.executable.as_deref(), Some("fxc"));
        assert_eq!(settings.compiler.define_prefix, "-D");
        assert!(!settings.compiler.suppress_warnings);
        assert_eq!(settings.dispatch.threads, Some(6));
        assert_eq!(settings.dispatch.worker_timeout_secs, 300);
        assert_eq!(settings.unit_timeout(), Duration::from_secs(1));
        assert_eq!(
            settings.shader_path(Path::new("shaders/job.txt")),
            PathBuf::from("src/shaders")
        );
        assert!(settings.output.big_endian);
        assert_eq!(settings.output.extension, "vcs");
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shadercompile.toml");

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));

        std::fs::write(&path, "[dispatch]\nthreads = \"many\"\n").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
        assert!(err.to_string().contains("shadercompile.toml"));

        std::fs::write(&path, "[output]\nextension = \"bin\"\n").unwrap();
        let settings = Settings::load_or_default(Some(&path)).unwrap();
        assert_eq!(settings.output.extension, "bin");
    }
}
