//! Remote workers
//!
//! A coordinator listens on TCP and hands work units to worker processes on
//! other machines. Workers rebuild the command space from the job text, stage
//! the shader sources shipped with it, compile each unit on their own pool and
//! send back packed static combos with their diagnostics. A unit whose worker
//! goes away or stays silent past the unit timeout is put back in the queue.
//!
//! Messages are bitcode encoded with a small header:
//! `[NSCW][version: u16 LE][length: u32 LE][payload]`.

use crate::compiler::ShaderCompiler;
use crate::config::{ConfigError, LoadOptions, build_command_space};
use crate::diagnostics::ReportedMessage;
use crate::dispatch::{Job, JobOptions, RunStats, WorkUnit, WorkerId};
use crate::sources::SourceFile;
use bitcode::{Decode, Encode};
use nether_vcs::Endian;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Magic bytes of every message
pub const WIRE_MAGIC: [u8; 4] = *b"NSCW";

/// Protocol version, bumped on breaking changes
pub const WIRE_VERSION: u16 = 2;

/// Magic (4) + version (2) + length (4)
pub const WIRE_HEADER_SIZE: usize = 10;

/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_SIZE: usize = 512 * 1024 * 1024;

/// How often idle loops look at the queue again
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Job text and the settings a worker needs to reproduce the command space
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct JobDescription {
    pub job_text: String,
    pub strict_skip: bool,
    pub define_prefix: String,
    pub suppress_warnings: bool,
    pub big_endian: bool,
    /// Copied into every scratch directory of the worker
    pub sources: Vec<SourceFile>,
}

/// One packed static combo
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PackedCombo {
    pub entry: u32,
    pub static_combo: u64,
    pub data: Vec<u8>,
}

/// Everything a worker produced for one unit
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct UnitResult {
    pub unit: u64,
    pub combos: Vec<PackedCombo>,
    pub messages: Vec<ReportedMessage>,
    pub failed: Vec<String>,
    pub commands_run: u64,
    pub commands_failed: u64,
}

/// Coordinator and worker messages
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum WireMessage {
    /// Worker -> coordinator, first message on a connection
    Hello { machine: String },
    /// Coordinator -> worker, reply to `Hello`
    Job(JobDescription),
    /// Coordinator -> worker
    Assign {
        unit: u64,
        static_start: u64,
        static_end: u64,
    },
    /// Worker -> coordinator
    UnitResult(UnitResult),
    /// Coordinator -> worker, no work left
    Shutdown,
}

impl WireMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Job(_) => "Job",
            Self::Assign { .. } => "Assign",
            Self::UnitResult(_) => "UnitResult",
            Self::Shutdown => "Shutdown",
        }
    }

    /// Serialize with framing
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = bitcode::encode(self);
        let mut bytes = Vec::with_capacity(WIRE_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&WIRE_MAGIC);
        bytes.extend_from_slice(&WIRE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Deserialize a framed message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let header: &[u8; WIRE_HEADER_SIZE] = bytes
            .get(..WIRE_HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or(WireError::TooShort)?;
        let length = parse_header(header)?;

        let payload = &bytes[WIRE_HEADER_SIZE..];
        if payload.len() < length {
            return Err(WireError::IncompletePayload {
                expected: length,
                got: payload.len(),
            });
        }
        decode_payload(&payload[..length])
    }
}

/// Framing and payload errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("message too short")]
    TooShort,

    #[error("invalid magic bytes (expected NSCW)")]
    InvalidMagic,

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },

    #[error("incomplete payload: expected {expected} bytes, got {got}")]
    IncompletePayload { expected: usize, got: usize },

    #[error("payload of {0} bytes exceeds the limit")]
    TooLarge(usize),

    #[error("failed to decode message: {0}")]
    DecodeFailed(String),
}

/// Transport and protocol errors
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },

    #[error("no result for unit {unit} within {after:?}")]
    UnitTimeout { unit: u64, after: Duration },

    #[error("worker returned unit {got} while working on unit {expected}")]
    WrongUnit { expected: u64, got: u64 },

    #[error("result names entry {0}, which does not exist")]
    UnknownEntry(u32),

    #[error("job rejected: {0}")]
    Job(#[from] ConfigError),

    #[error("no worker connected for {0:?} with units still outstanding")]
    NoWorkers(Duration),
}

fn parse_header(header: &[u8; WIRE_HEADER_SIZE]) -> Result<usize, WireError> {
    if header[0..4] != WIRE_MAGIC {
        return Err(WireError::InvalidMagic);
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != WIRE_VERSION {
        return Err(WireError::VersionMismatch {
            expected: WIRE_VERSION,
            got: version,
        });
    }
    let length = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(WireError::TooLarge(length));
    }
    Ok(length)
}

fn decode_payload(payload: &[u8]) -> Result<WireMessage, WireError> {
    bitcode::decode(payload).map_err(|e| WireError::DecodeFailed(e.to_string()))
}

/// Write one framed message and flush
pub fn write_message<W: Write>(writer: &mut W, message: &WireMessage) -> Result<(), RemoteError> {
    writer.write_all(&message.to_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message
pub fn read_message<R: Read>(reader: &mut R) -> Result<WireMessage, RemoteError> {
    let mut header = [0u8; WIRE_HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let length = parse_header(&header)?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    Ok(decode_payload(&payload)?)
}

/// A framed connection
struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn new(stream: TcpStream) -> Result<Self, RemoteError> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: BufWriter::new(stream),
        })
    }

    fn send(&mut self, message: &WireMessage) -> Result<(), RemoteError> {
        write_message(&mut self.writer, message)
    }

    fn recv(&mut self) -> Result<WireMessage, RemoteError> {
        read_message(&mut self.reader)
    }
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub description: JobDescription,
    /// Fatal when no worker is connected this long with units outstanding
    pub worker_timeout: Duration,
    /// A worker silent this long is dropped and its unit requeued
    pub unit_timeout: Duration,
}

/// Hand out every unit of `job` to remote workers connecting to `listener`
pub fn serve(job: &Job<'_>, listener: TcpListener, options: &CoordinatorOptions) -> Result<(), RemoteError> {
    listener.set_nonblocking(true)?;
    if let Ok(addr) = listener.local_addr() {
        info!("Waiting for workers on {}", addr);
    }

    let active = AtomicUsize::new(0);
    let mut next_worker: WorkerId = 0;
    let mut idle_since = Instant::now();

    let result = std::thread::scope(|scope| {
        loop {
            if job.with_shared(|shared| shared.queue.is_finished()) {
                return Ok(());
            }

            match listener.accept() {
                Ok((stream, addr)) => {
                    let worker = next_worker;
                    next_worker += 1;
                    active.fetch_add(1, Ordering::SeqCst);
                    let active = &active;
                    scope.spawn(move || {
                        if let Err(e) = serve_worker(job, stream, worker, addr, options) {
                            warn!(worker, %addr, "Worker dropped: {}", e);
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if active.load(Ordering::SeqCst) > 0 {
                        idle_since = Instant::now();
                    } else if idle_since.elapsed() >= options.worker_timeout {
                        return Err(RemoteError::NoWorkers(options.worker_timeout));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    });

    job.flush();
    result
}

/// Serve one worker connection until the queue runs dry or the worker goes away
fn serve_worker(
    job: &Job<'_>,
    stream: TcpStream,
    worker: WorkerId,
    addr: SocketAddr,
    options: &CoordinatorOptions,
) -> Result<(), RemoteError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(options.unit_timeout))?;
    let mut conn = Connection::new(stream)?;

    let machine = match conn.recv()? {
        WireMessage::Hello { machine } => machine,
        other => {
            return Err(RemoteError::Unexpected {
                expected: "Hello",
                got: other.kind(),
            });
        }
    };
    info!(worker, %addr, %machine, "Worker connected");
    conn.send(&WireMessage::Job(options.description.clone()))?;

    loop {
        let claimed = job.with_shared(|shared| {
            let unit = shared.queue.claim(worker, job.space());
            (unit, shared.queue.is_finished())
        });

        let unit = match claimed {
            (Some(unit), _) => unit,
            (None, true) => {
                conn.send(&WireMessage::Shutdown)?;
                info!(worker, %machine, "Worker released");
                return Ok(());
            }
            // Everything is claimed; wait in case a unit comes back
            (None, false) => {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
        };

        match run_remote_unit(job, &mut conn, worker, unit, options.unit_timeout) {
            Ok(()) => job.flush(),
            Err(e) => {
                job.with_shared(|shared| shared.queue.abandon(worker));
                warn!(worker, unit = unit.index, "Unit requeued");
                return Err(e);
            }
        }
    }
}

fn run_remote_unit(
    job: &Job<'_>,
    conn: &mut Connection,
    worker: WorkerId,
    unit: WorkUnit,
    unit_timeout: Duration,
) -> Result<(), RemoteError> {
    debug!(worker, unit = unit.index, "Assigning unit");
    conn.send(&WireMessage::Assign {
        unit: unit.index,
        static_start: unit.static_start,
        static_end: unit.static_end,
    })?;

    let reply = conn.recv().map_err(|e| match e {
        RemoteError::Io(io) if is_timeout(&io) => RemoteError::UnitTimeout {
            unit: unit.index,
            after: unit_timeout,
        },
        other => other,
    })?;
    let result = match reply {
        WireMessage::UnitResult(result) => result,
        other => {
            return Err(RemoteError::Unexpected {
                expected: "UnitResult",
                got: other.kind(),
            });
        }
    };
    if result.unit != unit.index {
        return Err(RemoteError::WrongUnit {
            expected: unit.index,
            got: result.unit,
        });
    }
    let num_entries = job.space().entries().len();
    if let Some(bad) = result.combos.iter().find(|c| c.entry as usize >= num_entries) {
        return Err(RemoteError::UnknownEntry(bad.entry));
    }

    job.with_shared(|shared| {
        for combo in result.combos {
            shared
                .store
                .insert_packed(combo.entry as usize, combo.static_combo, combo.data);
        }
        shared.diagnostics.merge(result.messages);
        for name in &result.failed {
            shared.diagnostics.mark_failed(name);
        }
        shared.stats.commands_run += result.commands_run;
        shared.stats.commands_failed += result.commands_failed;
        shared.queue.complete(worker);
    });
    Ok(())
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Connect to a coordinator and compile units until it says stop
pub fn run_worker<A: ToSocketAddrs, C: ShaderCompiler>(
    addr: A,
    compiler: &C,
    threads: usize,
) -> Result<RunStats, RemoteError> {
    let stream = TcpStream::connect(addr)?;
    let machine = stream
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "worker".to_string());
    let mut conn = Connection::new(stream)?;

    conn.send(&WireMessage::Hello {
        machine: machine.clone(),
    })?;
    let mut description = match conn.recv()? {
        WireMessage::Job(description) => description,
        other => {
            return Err(RemoteError::Unexpected {
                expected: "Job",
                got: other.kind(),
            });
        }
    };

    debug!(count = description.sources.len(), "Received shader sources");
    compiler.provide_sources(std::mem::take(&mut description.sources));

    let load = LoadOptions {
        strict_skip: description.strict_skip,
    };
    let space = build_command_space(&description.job_text, &load)?;
    let options = JobOptions {
        define_prefix: description.define_prefix.clone(),
        suppress_warnings: description.suppress_warnings,
        machine,
        endian: if description.big_endian {
            Endian::Big
        } else {
            Endian::Little
        },
    };
    info!(
        entries = space.entries().len(),
        commands = space.num_commands(),
        "Joined job"
    );

    let mut total = RunStats::default();
    loop {
        let unit = match conn.recv()? {
            WireMessage::Assign {
                unit,
                static_start,
                static_end,
            } => WorkUnit {
                index: unit,
                static_start,
                static_end,
            },
            WireMessage::Shutdown => {
                info!(commands = total.commands_run, "Coordinator finished");
                return Ok(total);
            }
            other => {
                return Err(RemoteError::Unexpected {
                    expected: "Assign",
                    got: other.kind(),
                });
            }
        };

        let unit_job = Job::for_unit(&space, unit, options.clone());
        unit_job.run_local(compiler, threads);
        let mut results = unit_job.into_results();

        total.commands_run += results.stats.commands_run;
        total.commands_failed += results.stats.commands_failed;

        let reply = UnitResult {
            unit: unit.index,
            combos: results
                .packed
                .into_iter()
                .map(|p| PackedCombo {
                    entry: p.entry as u32,
                    static_combo: p.static_combo,
                    data: p.data,
                })
                .collect(),
            messages: results.diagnostics.take_messages(),
            failed: results.diagnostics.take_failed(),
            commands_run: results.stats.commands_run,
            commands_failed: results.stats.commands_failed,
        };
        conn.send(&WireMessage::UnitResult(reply))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileOutput, CompileSpawnError};
    use crate::store::ArchiveOptions;
    use nether_vcs::VcsReader;

    #[test]
    fn test_framing_round_trip() {
        let msg = WireMessage::Assign {
            unit: 7,
            static_start: 70,
            static_end: 80,
        };
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[0..4], b"NSCW");
        assert_eq!(WireMessage::from_bytes(&bytes).unwrap(), msg);

        let mut stream = Vec::new();
        write_message(&mut stream, &WireMessage::Shutdown).unwrap();
        write_message(&mut stream, &msg).unwrap();
        let mut reader = stream.as_slice();
        assert_eq!(read_message(&mut reader).unwrap(), WireMessage::Shutdown);
        assert_eq!(read_message(&mut reader).unwrap(), msg);
    }

    #[test]
    fn test_framing_errors() {
        let bytes = WireMessage::Shutdown.to_bytes();

        assert_eq!(WireMessage::from_bytes(&bytes[..5]), Err(WireError::TooShort));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert_eq!(WireMessage::from_bytes(&bad_magic), Err(WireError::InvalidMagic));

        let mut bad_version = bytes.clone();
        bad_version[4] = 99;
        assert_eq!(
            WireMessage::from_bytes(&bad_version),
            Err(WireError::VersionMismatch {
                expected: WIRE_VERSION,
                got: 99
            })
        );

        let mut long = bytes.clone();
        long[6..10].copy_from_slice(&100u32.to_le_bytes());
        assert!(matches!(
            WireMessage::from_bytes(&long),
            Err(WireError::IncompletePayload { expected: 100, .. })
        ));

        let mut huge = bytes;
        huge[6..10].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(WireMessage::from_bytes(&huge), Err(WireError::TooLarge(_))));
    }

    #[test]
    fn test_no_workers_times_out() {
        let space = build_command_space(
            "#BEGIN a\na.fxc\n#DEFINES-S\nX=0..1\n#COMMAND\nfxc\n#END\n",
            &LoadOptions::default(),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job = Job::coordinator(&space, archive_options(dir.path()), JobOptions::default());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let options = CoordinatorOptions {
            description: description(""),
            worker_timeout: Duration::from_millis(100),
            unit_timeout: Duration::from_secs(10),
        };
        assert!(matches!(
            serve(&job, listener, &options),
            Err(RemoteError::NoWorkers(_))
        ));
    }

    struct EchoCompiler;

    impl ShaderCompiler for EchoCompiler {
        fn compile(&self, _worker: usize, command: &str) -> Result<CompileOutput, CompileSpawnError> {
            if command.contains("/DX=1 /DY=1") {
                Ok(CompileOutput::failure("(9): error E9: no"))
            } else {
                Ok(CompileOutput::success(command.as_bytes().to_vec(), ""))
            }
        }
    }

    fn description(job_text: &str) -> JobDescription {
        JobDescription {
            job_text: job_text.to_string(),
            strict_skip: false,
            define_prefix: "/D".into(),
            suppress_warnings: false,
            big_endian: false,
            sources: Vec::new(),
        }
    }

    fn archive_options(dir: &std::path::Path) -> ArchiveOptions {
        ArchiveOptions {
            output_dir: dir.to_path_buf(),
            extension: "vcs".into(),
            endian: Endian::Little,
            define_prefix: "/D".into(),
        }
    }

    #[test]
    fn test_loopback_worker() {
        let job_text = "\
#BEGIN good
good.fxc
#DEFINES-D
D=0..1
#DEFINES-S
S=0..2
#COMMAND
fxc
#END
#BEGIN bad
bad.fxc
#DEFINES-S
X=0..1
Y=0..1
#COMMAND
fxc
#END
";
        let space = build_command_space(job_text, &LoadOptions::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let archives = archive_options(dir.path());
        let job = Job::coordinator(&space, archives.clone(), JobOptions::default());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let options = CoordinatorOptions {
            description: description(job_text),
            worker_timeout: Duration::from_secs(10),
            unit_timeout: Duration::from_secs(10),
        };

        let worker = std::thread::spawn(move || run_worker(addr, &EchoCompiler, 2));
        serve(&job, listener, &options).unwrap();
        let worker_stats = worker.join().unwrap().unwrap();

        let results = job.into_results();
        assert_eq!(worker_stats.commands_run, 10);
        assert_eq!(results.stats.commands_run, 10);
        assert_eq!(results.stats.commands_failed, 1);
        assert_eq!(results.diagnostics.failed_shaders(), ["bad"]);
        assert_eq!(results.diagnostics.messages()[0].text, "bad.fxc(9): error E9: no");

        assert!(!archives.archive_path("bad").exists());
        let bytes = std::fs::read(archives.archive_path("good")).unwrap();
        let archive = VcsReader::new(bytes.as_slice(), Endian::Little)
            .read_archive()
            .unwrap();
        assert_eq!(archive.static_combo_ids(), vec![0, 1, 2]);
        let combos = archive.dynamic_combos(1).unwrap().unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[0].code, b"fxc /DSHADERCOMBO=2 /DD=0 /DS=1");
    }

    #[test]
    fn test_silent_worker_unit_is_requeued() {
        let job_text = "#BEGIN a\na.fxc\n#DEFINES-S\nX=0..1\n#COMMAND\nfxc\n#END\n";
        let space = build_command_space(job_text, &LoadOptions::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let archives = archive_options(dir.path());
        let job = Job::coordinator(&space, archives.clone(), JobOptions::default());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let options = CoordinatorOptions {
            description: description(job_text),
            worker_timeout: Duration::from_secs(10),
            unit_timeout: Duration::from_millis(300),
        };

        // Takes a unit and never answers
        let (assigned_tx, assigned_rx) = std::sync::mpsc::channel();
        let silent = std::thread::spawn(move || {
            let mut conn = Connection::new(TcpStream::connect(addr).unwrap()).unwrap();
            conn.send(&WireMessage::Hello {
                machine: "silent".into(),
            })
            .unwrap();
            assert!(matches!(conn.recv().unwrap(), WireMessage::Job(_)));
            let assigned = conn.recv().unwrap();
            assigned_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_secs(2));
            assigned
        });
        let worker = std::thread::spawn(move || {
            assigned_rx.recv().unwrap();
            run_worker(addr, &EchoCompiler, 1)
        });

        serve(&job, listener, &options).unwrap();
        let worker_stats = worker.join().unwrap().unwrap();
        assert!(matches!(silent.join().unwrap(), WireMessage::Assign { unit: 0, .. }));

        // The requeued unit was compiled by the other worker
        assert_eq!(worker_stats.commands_run, 2);
        let results = job.into_results();
        assert_eq!(results.stats.commands_run, 2);
        assert!(results.diagnostics.failed_shaders().is_empty());

        let bytes = std::fs::read(archives.archive_path("a")).unwrap();
        let archive = VcsReader::new(bytes.as_slice(), Endian::Little)
            .read_archive()
            .unwrap();
        assert_eq!(archive.static_combo_ids(), vec![0, 1]);
    }

    /// Answers with the bytes of the source named at the end of the command
    #[derive(Default)]
    struct SourceEchoCompiler {
        sources: parking_lot::Mutex<Vec<SourceFile>>,
    }

    impl ShaderCompiler for SourceEchoCompiler {
        fn compile(&self, _worker: usize, command: &str) -> Result<CompileOutput, CompileSpawnError> {
            let sources = self.sources.lock();
            Ok(match sources.iter().find(|file| command.ends_with(&file.name)) {
                Some(file) => CompileOutput::success(file.data.clone(), ""),
                None => CompileOutput::failure("(1): error X1507: failed to open source file"),
            })
        }

        fn provide_sources(&self, sources: Vec<SourceFile>) {
            *self.sources.lock() = sources;
        }
    }

    #[test]
    fn test_worker_receives_sources() {
        let job_text = "#BEGIN water\nwater.fxc\n#DEFINES-S\nX=0..1\n#COMMAND\nfxc\nwater.fxc\n#END\n";
        let space = build_command_space(job_text, &LoadOptions::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let archives = archive_options(dir.path());
        let job = Job::coordinator(&space, archives.clone(), JobOptions::default());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut description = description(job_text);
        description.sources = vec![SourceFile {
            name: "water.fxc".into(),
            data: b"water source".to_vec(),
        }];
        let options = CoordinatorOptions {
            description,
            worker_timeout: Duration::from_secs(10),
            unit_timeout: Duration::from_secs(10),
        };

        let worker = std::thread::spawn(move || run_worker(addr, &SourceEchoCompiler::default(), 1));
        serve(&job, listener, &options).unwrap();
        worker.join().unwrap().unwrap();

        let results = job.into_results();
        assert!(results.diagnostics.failed_shaders().is_empty());
        let bytes = std::fs::read(archives.archive_path("water")).unwrap();
        let archive = VcsReader::new(bytes.as_slice(), Endian::Little)
            .read_archive()
            .unwrap();
        let combos = archive.dynamic_combos(1).unwrap().unwrap();
        assert_eq!(combos[0].code, b"water source");
    }
}
