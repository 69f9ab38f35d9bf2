//! nether-shadercompile - shader variant compiler
//!
//! Compiles every define combo of the shaders in a job description and
//! writes one .vcs archive per shader.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nether_shadercompile::dispatch::{self, Job, JobOptions, RunStats};
use nether_shadercompile::remote::{self, CoordinatorOptions, JobDescription};
use nether_shadercompile::store::ArchiveOptions;
use nether_shadercompile::{
    CommandSpace, ExternalCompiler, LoadOptions, ReportOptions, Settings, ShaderCompiler,
    build_command_space, config, sources,
};
use nether_vcs::{Endian, VcsReader};
use std::fs::File;
use std::io::BufReader;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "nether-shadercompile")]
#[command(about = "Nethercore shader variant compiler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile every combo of a job description
    Compile {
        /// Job description file
        job: PathBuf,

        /// Output directory for archives
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Local worker threads (default: logical CPUs minus one)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Hand work to remote workers connecting to this address instead of compiling locally
        #[arg(long)]
        listen: Option<String>,

        /// Settings file (default: shadercompile.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory holding the shader sources (default: the job file's directory)
        #[arg(long)]
        shader_path: Option<PathBuf>,

        /// Treat unparsable skip expressions as errors
        #[arg(long)]
        strict_skip: bool,

        /// Don't report warnings from successful compiles
        #[arg(long)]
        suppress_warnings: bool,

        /// Break example commands down in the error report
        #[arg(long)]
        verbose_errors: bool,

        /// Write big-endian archives
        #[arg(long)]
        big_endian: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Compile units for a coordinator
    Worker {
        /// Coordinator address
        #[arg(long)]
        connect: String,

        /// Local worker threads (default: logical CPUs minus one)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Settings file (default: shadercompile.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// List the entries of a job description with their combo counts
    Info {
        /// Job description file
        job: PathBuf,
    },

    /// Print the header, directory and aliases of an archive
    Inspect {
        /// Archive file
        archive: PathBuf,

        /// Archive is big-endian
        #[arg(long)]
        big_endian: bool,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            job,
            output,
            threads,
            listen,
            config,
            shader_path,
            strict_skip,
            suppress_warnings,
            verbose_errors,
            big_endian,
            verbose,
        } => {
            init_logging(verbose);

            let mut settings = Settings::load_or_default(config.as_deref())?;
            settings.compiler.suppress_warnings |= suppress_warnings;
            settings.output.big_endian |= big_endian;
            if threads.is_some() {
                settings.dispatch.threads = threads;
            }
            if shader_path.is_some() {
                settings.compiler.shader_path = shader_path;
            }

            let failed = compile(&job, &output, listen.as_deref(), strict_skip, verbose_errors, &settings)?;
            if failed > 0 {
                std::process::exit(i32::try_from(failed).unwrap_or(i32::MAX));
            }
        }

        Commands::Worker {
            connect,
            threads,
            config,
            verbose,
        } => {
            init_logging(verbose);

            let settings = Settings::load_or_default(config.as_deref())?;
            let compiler = external_compiler(&settings)?;
            let threads = threads
                .or(settings.dispatch.threads)
                .unwrap_or_else(dispatch::default_threads);

            tracing::info!("Connecting to {}", connect);
            let stats = remote::run_worker(connect.as_str(), &compiler, threads)
                .with_context(|| format!("Lost coordinator {}", connect))?;
            tracing::info!(
                "Worker done: {} commands, {} failed",
                stats.commands_run,
                stats.commands_failed
            );
        }

        Commands::Info { job } => {
            init_logging(false);
            let space = load_space(&job, false)?;
            print_info(&space);
        }

        Commands::Inspect {
            archive,
            big_endian,
        } => {
            init_logging(false);
            inspect(&archive, endian(big_endian))?;
        }
    }

    Ok(())
}

fn endian(big_endian: bool) -> Endian {
    if big_endian { Endian::Big } else { Endian::Little }
}

fn load_space(job: &Path, strict_skip: bool) -> Result<CommandSpace> {
    let text = config::read_job(job)?;
    build_command_space(&text, &LoadOptions { strict_skip })
        .with_context(|| format!("Invalid job description {}", job.display()))
}

fn external_compiler(settings: &Settings) -> Result<ExternalCompiler> {
    let compiler = ExternalCompiler::new(settings.scratch_dir());
    match &settings.compiler.executable {
        Some(executable) => Ok(compiler.with_executable(executable)?),
        None => Ok(compiler),
    }
}

/// Run a compile job, returning the number of failed shaders
fn compile(
    job_path: &Path,
    output: &Path,
    listen: Option<&str>,
    strict_skip: bool,
    verbose_errors: bool,
    settings: &Settings,
) -> Result<usize> {
    let job_text = config::read_job(job_path)?;
    let space = build_command_space(&job_text, &LoadOptions { strict_skip })
        .with_context(|| format!("Invalid job description {}", job_path.display()))?;
    tracing::info!(
        "{} shaders, {} commands",
        space.entries().len(),
        space.num_commands()
    );

    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create output directory: {}", output.display()))?;

    let shader_path = settings.shader_path(job_path);
    let source_files = sources::load_sources(&shader_path, &space)?;
    tracing::info!(
        "{} shader sources from {}",
        source_files.len(),
        shader_path.display()
    );

    let endian = endian(settings.output.big_endian);
    let archives = ArchiveOptions {
        output_dir: output.to_path_buf(),
        extension: settings.output.extension.clone(),
        endian,
        define_prefix: settings.compiler.define_prefix.clone(),
    };
    let options = JobOptions {
        define_prefix: settings.compiler.define_prefix.clone(),
        suppress_warnings: settings.compiler.suppress_warnings,
        machine: "local".to_string(),
        endian,
    };

    let job = Job::coordinator(&space, archives, options);
    match listen {
        Some(addr) => {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("Failed to listen on {}", addr))?;
            let coordinator = CoordinatorOptions {
                description: JobDescription {
                    job_text,
                    strict_skip,
                    define_prefix: settings.compiler.define_prefix.clone(),
                    suppress_warnings: settings.compiler.suppress_warnings,
                    big_endian: settings.output.big_endian,
                    sources: source_files,
                },
                worker_timeout: settings.worker_timeout(),
                unit_timeout: settings.unit_timeout(),
            };
            remote::serve(&job, listener, &coordinator).context("Distributed compile failed")?;
        }
        None => {
            let compiler = external_compiler(settings)?;
            compiler.provide_sources(source_files);
            let threads = settings
                .dispatch
                .threads
                .unwrap_or_else(dispatch::default_threads);
            job.run_local(&compiler, threads);
        }
    }

    let results = job.into_results();
    let report = results.diagnostics.render_report(
        &space,
        &ReportOptions {
            define_prefix: settings.compiler.define_prefix.clone(),
            verbose: verbose_errors,
        },
    );
    if !report.is_empty() {
        print!("{}", report);
    }

    print_summary(&results.stats, results.diagnostics.failed_shaders().len());
    Ok(results.diagnostics.failed_shaders().len())
}

fn print_summary(stats: &RunStats, failed: usize) {
    tracing::info!(
        "{} commands compiled ({} failed), {} archives written, {} duplicate static combos",
        stats.commands_run,
        stats.commands_failed,
        stats.archives_written,
        stats.duplicate_static_combos
    );
    if failed > 0 {
        tracing::error!("{} shader(s) failed", failed);
    }
}

fn print_info(space: &CommandSpace) {
    println!(
        "{:<32} {:>12} {:>10} {:>12}  source",
        "entry", "static", "dynamic", "total"
    );
    for entry in space.entries() {
        println!(
            "{:<32} {:>12} {:>10} {:>12}  {}",
            entry.name,
            entry.num_static_combos(),
            entry.num_dynamic_combos(),
            entry.num_combos(),
            entry.source_file
        );
    }
    println!();
    println!("Shaders:       {}", space.entries().len());
    println!("Static combos: {}", space.num_static_combos());
    println!("Commands:      {}", space.num_commands());
    println!(
        "Work units:    {}",
        dispatch::UnitQueue::for_space(space).num_units()
    );
}

fn inspect(path: &Path, endian: Endian) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let archive = VcsReader::new(BufReader::new(file), endian)
        .read_archive()
        .with_context(|| format!("Failed to read archive {}", path.display()))?;

    let header = &archive.header;
    println!("Version:        {}", header.version);
    println!("Total combos:   {}", header.total_combos);
    println!("Dynamic combos: {}", header.dynamic_combos);
    println!("Flags:          0x{:08x}", header.flags);
    println!("Centroid mask:  0x{:08x}", header.centroid_mask);
    println!("Data bytes:     {}", archive.data_len());

    println!("\nDirectory ({} static combos):", archive.directory.len());
    for record in &archive.directory {
        let dynamic = archive
            .dynamic_combos(record.static_combo_id)?
            .map_or(0, |combos| combos.len());
        println!(
            "  {:>10}  offset {:>10}  {} dynamic",
            record.static_combo_id, record.file_offset, dynamic
        );
    }

    if !archive.aliases.is_empty() {
        println!("\nAliases ({}):", archive.aliases.len());
        for alias in &archive.aliases {
            println!(
                "  {:>10} -> {}",
                alias.static_combo_id, alias.source_static_combo_id
            );
        }
    }

    Ok(())
}
