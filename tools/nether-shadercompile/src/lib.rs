//! nether-shadercompile library
//!
//! Compiles every define combination of a set of shaders and packs the
//! results into one `.vcs` archive per shader.
//!
//! - [`config`] reads the job description into a [`combo::CommandSpace`]
//! - [`sources`] gathers the shader sources every compiler run needs
//! - [`dispatch`] compiles work units on local threads, [`remote`] on other machines
//! - [`store`] packs finished static combos and writes archives
//! - [`diagnostics`] collects compiler messages for the final report

pub mod combo;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod expr;
pub mod remote;
pub mod settings;
pub mod sources;
pub mod store;

pub use combo::{CommandSpace, ComboSpace, Cursor, Define};
pub use compiler::{CompileOutput, ExternalCompiler, ShaderCompiler};
pub use config::{CfgEntry, LoadOptions, build_command_space};
pub use diagnostics::{Diagnostics, ReportOptions};
pub use dispatch::{Job, JobOptions, JobResults, RunStats};
pub use settings::Settings;
pub use sources::SourceFile;
