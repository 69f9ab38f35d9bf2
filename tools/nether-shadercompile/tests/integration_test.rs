//! End-to-end compile runs with a scripted compiler.
//!
//! Each test writes a job description, runs it through the dispatcher and
//! reads the resulting archives back.

use nether_shadercompile::compiler::{CompileOutput, CompileSpawnError, ShaderCompiler};
use nether_shadercompile::dispatch::{Job, JobOptions, JobResults};
use nether_shadercompile::store::ArchiveOptions;
use nether_shadercompile::{LoadOptions, ReportOptions, build_command_space, sources};
use nether_vcs::{Endian, VcsArchive, VcsReader};
use parking_lot::Mutex;
use std::path::Path;
use tempfile::tempdir;

/// Compiler that returns a code blob chosen by the test
struct ScriptedCompiler<F> {
    script: F,
    commands: Mutex<Vec<String>>,
}

impl<F> ScriptedCompiler<F>
where
    F: Fn(&str) -> CompileOutput + Send + Sync,
{
    fn new(script: F) -> Self {
        Self {
            script,
            commands: Mutex::new(Vec::new()),
        }
    }

    fn invocations(&self) -> usize {
        self.commands.lock().len()
    }
}

impl<F> ShaderCompiler for ScriptedCompiler<F>
where
    F: Fn(&str) -> CompileOutput + Send + Sync,
{
    fn compile(&self, _worker: usize, command: &str) -> Result<CompileOutput, CompileSpawnError> {
        self.commands.lock().push(command.to_string());
        Ok((self.script)(command))
    }
}

fn echo(command: &str) -> CompileOutput {
    CompileOutput::success(command.as_bytes().to_vec(), "")
}

fn archive_options(dir: &Path, endian: Endian) -> ArchiveOptions {
    ArchiveOptions {
        output_dir: dir.to_path_buf(),
        extension: "vcs".into(),
        endian,
        define_prefix: "/D".into(),
    }
}

fn run<C: ShaderCompiler>(job_text: &str, archives: &ArchiveOptions, compiler: &C, threads: usize) -> JobResults {
    let space = build_command_space(job_text, &LoadOptions::default()).unwrap();
    let options = JobOptions {
        endian: archives.endian,
        ..JobOptions::default()
    };
    let job = Job::coordinator(&space, archives.clone(), options);
    job.run_local(compiler, threads);
    job.into_results()
}

fn read_archive(archives: &ArchiveOptions, name: &str) -> VcsArchive {
    let bytes = std::fs::read(archives.archive_path(name)).unwrap();
    VcsReader::new(bytes.as_slice(), archives.endian)
        .read_archive()
        .unwrap()
}

#[test]
fn test_skipped_combos_are_never_compiled() {
    let job = "\
#BEGIN shader
shader.fxc
#DEFINES-D
A=0..1
#DEFINES-S
B=0..1
#SKIP
$A == 1 && $B == 1
#COMMAND
fxc
#END
";
    let dir = tempdir().unwrap();
    let archives = archive_options(dir.path(), Endian::Little);
    let compiler = ScriptedCompiler::new(echo);

    let results = run(job, &archives, &compiler, 1);
    assert_eq!(compiler.invocations(), 3);
    assert_eq!(results.stats.commands_run, 3);
    assert!(results.diagnostics.failed_shaders().is_empty());

    let archive = read_archive(&archives, "shader");
    assert_eq!(archive.header.total_combos, 4);
    assert_eq!(archive.header.dynamic_combos, 2);
    assert_eq!(archive.static_combo_ids(), vec![0, 1]);

    let b1 = archive.dynamic_combos(1).unwrap().unwrap();
    assert_eq!(b1.len(), 1);
    assert_eq!(b1[0].id, 0);
    assert_eq!(b1[0].code, b"fxc /DSHADERCOMBO=2 /DA=0 /DB=1");

    let b0 = archive.dynamic_combos(0).unwrap().unwrap();
    let ids: Vec<u32> = b0.iter().map(|c| c.id).collect();
    assert_eq!(ids, [0, 1]);
}

#[test]
fn test_failed_shader_removes_stale_archive() {
    let job = "\
#BEGIN broken
broken.fxc
#DEFINES-S
Q=0..2
#COMMAND
fxc
#END
#BEGIN fine
fine.fxc
#DEFINES-D
R=0..1
#COMMAND
fxc
#END
";
    let dir = tempdir().unwrap();
    let archives = archive_options(dir.path(), Endian::Little);
    std::fs::write(archives.archive_path("broken"), b"old archive").unwrap();

    let compiler = ScriptedCompiler::new(|command: &str| {
        if command.contains("/DQ=1") {
            CompileOutput::failure("C:\\build\\tmp\\broken.fxc(12): error X3000: syntax error")
        } else {
            CompileOutput::success(vec![1, 2, 3], "(3): warning X3206: implicit truncation")
        }
    });

    let results = run(job, &archives, &compiler, 2);
    assert_eq!(results.diagnostics.failed_shaders(), ["broken"]);
    assert_eq!(results.stats.archives_written, 1);
    assert!(!archives.archive_path("broken").exists());
    assert!(archives.archive_path("fine").exists());

    let space = build_command_space(job, &LoadOptions::default()).unwrap();
    let report = results
        .diagnostics
        .render_report(&space, &ReportOptions::default());
    assert!(report.starts_with("FAILED:    broken\n"));
    assert!(report.contains("broken.fxc(12): error X3000: syntax error\n"));
    assert!(report.contains("    Reported 1 time(s)"));
    assert!(report.contains("    fxc /DSHADERCOMBO=1 /DQ=1\n"));

    // One warning line per successful shader source
    let warnings: Vec<_> = results
        .diagnostics
        .messages()
        .iter()
        .filter(|m| m.text.contains("warning X3206"))
        .collect();
    assert_eq!(warnings.len(), 2);
    let total: u64 = warnings.iter().map(|m| m.count).sum();
    assert_eq!(total, 4);
}

#[test]
fn test_identical_static_combos_are_aliased() {
    let job = "\
#BEGIN same
same.fxc
#DEFINES-D
D=0..1
#DEFINES-S
S=0..2
#COMMAND
fxc
#END
";
    let dir = tempdir().unwrap();
    let archives = archive_options(dir.path(), Endian::Little);

    // Output depends only on the dynamic define
    let compiler = ScriptedCompiler::new(|command: &str| {
        let code = if command.contains("/DD=0") { b"zero".to_vec() } else { b"one".to_vec() };
        CompileOutput::success(code, "")
    });

    let results = run(job, &archives, &compiler, 3);
    assert_eq!(results.stats.duplicate_static_combos, 2);

    let archive = read_archive(&archives, "same");
    assert_eq!(archive.directory.len(), 1);
    assert_eq!(archive.directory[0].static_combo_id, 0);
    assert_eq!(archive.aliases.len(), 2);
    assert_eq!(archive.resolve(2), 0);
    assert_eq!(archive.static_combo_ids(), vec![0, 1, 2]);

    let combos = archive.dynamic_combos(2).unwrap().unwrap();
    assert_eq!(combos[0].code, b"zero");
    assert_eq!(combos[1].code, b"one");
}

#[test]
fn test_many_threads_big_endian() {
    let job = "\
#BEGIN wide
wide.fxc
#DEFINES-D
L=0..3
#DEFINES-S
X=0..3
Y=0..3
Z=0..3
#SKIP
$X == 3 && $L > 1
#COMMAND
fxc
/Emain
#END
#BEGIN tiny
tiny.fxc
#DEFINES-S
T=0..1
#COMMAND
fxc
#END
";
    let dir = tempdir().unwrap();
    let archives = archive_options(dir.path(), Endian::Big);
    let compiler = ScriptedCompiler::new(echo);

    let results = run(job, &archives, &compiler, 4);
    // 256 + 2 commands, X == 3 with L in 2..=3 skipped: 16 * 2
    assert_eq!(compiler.invocations(), 256 - 32 + 2);
    assert_eq!(results.stats.archives_written, 2);

    let archive = read_archive(&archives, "wide");
    assert_eq!(archive.header.total_combos, 256);
    assert_eq!(archive.header.dynamic_combos, 4);
    let ids = archive.static_combo_ids();
    assert_eq!(ids, (0..64).collect::<Vec<u32>>());

    // Static combo of X=3, Y=2, Z=1
    let static_combo = 3 + 2 * 4 + 16;
    let combos = archive.dynamic_combos(static_combo).unwrap().unwrap();
    assert_eq!(combos.len(), 2);
    let expected = format!(
        "fxc /DSHADERCOMBO={} /DL=1 /DX=3 /DY=2 /DZ=1 /Emain",
        static_combo * 4 + 1
    );
    assert_eq!(combos[1].code, expected.as_bytes());

    // Wrong byte order does not parse
    let bytes = std::fs::read(archives.archive_path("tiny")).unwrap();
    assert!(
        VcsReader::new(bytes.as_slice(), Endian::Little)
            .read_archive()
            .is_err()
    );
}

#[test]
fn test_unwritable_archive_fails_only_that_shader() {
    let job = "\
#BEGIN blocked
blocked.fxc
#DEFINES-S
B=0..1
#COMMAND
fxc
#END
#BEGIN open
open.fxc
#DEFINES-D
O=0..1
#COMMAND
fxc
#END
";
    let dir = tempdir().unwrap();
    let archives = archive_options(dir.path(), Endian::Little);
    // A directory where the archive should go
    let blocked = archives.archive_path("blocked");
    std::fs::create_dir(&blocked).unwrap();
    std::fs::write(blocked.join("keep"), b"x").unwrap();

    let compiler = ScriptedCompiler::new(echo);
    let results = run(job, &archives, &compiler, 2);

    assert_eq!(results.diagnostics.failed_shaders(), ["blocked"]);
    assert_eq!(results.stats.archives_written, 1);
    assert_eq!(results.stats.commands_failed, 0);
    assert!(blocked.join("keep").exists());

    let archive = read_archive(&archives, "open");
    assert_eq!(archive.static_combo_ids(), vec![0]);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);

    let space = build_command_space(job, &LoadOptions::default()).unwrap();
    let report = results
        .diagnostics
        .render_report(&space, &ReportOptions::default());
    assert!(report.starts_with("FAILED:    blocked\n"));
}

#[cfg(unix)]
#[test]
fn test_relative_sources_reach_the_compiler() {
    use nether_shadercompile::{ExternalCompiler, ShaderCompiler};

    let job = "\
#BEGIN water
water.fxc
#DEFINES-S
A=0..1
#COMMAND
true
&& cat water.fxc > shader.o
#END
";
    let shader_dir = tempdir().unwrap();
    std::fs::write(shader_dir.path().join("water.fxc"), b"float4 main() : COLOR").unwrap();
    let space = build_command_space(job, &LoadOptions::default()).unwrap();
    let source_files = sources::load_sources(shader_dir.path(), &space).unwrap();
    assert_eq!(source_files.len(), 1);

    let scratch = tempdir().unwrap();
    let compiler = ExternalCompiler::new(scratch.path());
    compiler.provide_sources(source_files);

    let out = tempdir().unwrap();
    let archives = archive_options(out.path(), Endian::Little);
    let results = run(job, &archives, &compiler, 2);

    assert!(
        results.diagnostics.failed_shaders().is_empty(),
        "{:?}",
        results.diagnostics.messages()
    );
    assert_eq!(results.stats.commands_run, 2);
    let archive = read_archive(&archives, "water");
    let combos = archive.dynamic_combos(1).unwrap().unwrap();
    assert_eq!(combos[0].code, b"float4 main() : COLOR");
}
