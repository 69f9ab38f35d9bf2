//! Compiler diagnostics
//!
//! Listings from tens of thousands of compiler runs mostly repeat the same
//! few lines. Each line is normalized so the same warning reads the same on
//! every machine, then stored once with the first command that produced it
//! and a running count.

use crate::combo::CommandSpace;
use bitcode::{Decode, Encode};
use hashbrown::{HashMap, HashSet};
use std::fmt::Write;

/// One unique compiler message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ReportedMessage {
    pub text: String,
    /// Command number that first produced the message
    pub first_command: u64,
    pub first_machine: String,
    pub count: u64,
}

/// Report rendering options
#[derive(Debug, Clone)]
pub struct ReportOptions {
    /// Prefix used when re-deriving example commands
    pub define_prefix: String,
    /// Break example commands down into source, target and define values
    pub verbose: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            define_prefix: "/D".to_string(),
            verbose: false,
        }
    }
}

/// Deduplicated messages and failed shaders
#[derive(Debug, Default)]
pub struct Diagnostics {
    messages: Vec<ReportedMessage>,
    index: HashMap<String, usize>,
    failed: Vec<String>,
    failed_set: HashSet<String>,
}

/// Listing line for a compiler run that failed without any output
pub fn missing_listing(command: u64) -> String {
    format!(
        "(0): error {}: compiler failed without error description - missing or crashed compiler executable?",
        command
    )
}

/// Normalize one listing line
///
/// Strips a drive letter and the directory in front of `file(line):`, and
/// names the source file on lines that start with `(` or `memory(`.
pub fn normalize_line(line: &str, source_file: &str) -> String {
    let mut line = line.trim_end();

    let bytes = line.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        line = &line[2..];
    }

    if let Some(colon) = line.find(':') {
        if let Some(slash) = line[..colon].rfind(['\\', '/']) {
            line = &line[slash + 1..];
        }
    }

    if line.starts_with('(') {
        format!("{}{}", source_file, line)
    } else if let Some(rest) = line.strip_prefix("memory") {
        if rest.starts_with('(') {
            format!("{}{}", source_file, rest)
        } else {
            line.to_string()
        }
    } else {
        line.to_string()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every line of a compiler listing
    pub fn record_listing(&mut self, command: u64, listing: &str, source_file: &str, machine: &str) {
        for line in listing.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let text = normalize_line(line, source_file);
            self.record(text, command, machine, 1);
        }
    }

    fn record(&mut self, text: String, command: u64, machine: &str, count: u64) {
        match self.index.get(&text) {
            Some(&idx) => self.messages[idx].count += count,
            None => {
                self.index.insert(text.clone(), self.messages.len());
                self.messages.push(ReportedMessage {
                    text,
                    first_command: command,
                    first_machine: machine.to_string(),
                    count,
                });
            }
        }
    }

    /// Fold in messages reported by another process
    pub fn merge(&mut self, report: Vec<ReportedMessage>) {
        for message in report {
            self.record(
                message.text,
                message.first_command,
                &message.first_machine,
                message.count,
            );
        }
    }

    /// Hand over everything recorded so far, leaving this aggregator empty
    pub fn take_messages(&mut self) -> Vec<ReportedMessage> {
        self.index.clear();
        std::mem::take(&mut self.messages)
    }

    pub fn messages(&self) -> &[ReportedMessage] {
        &self.messages
    }

    /// Mark a shader entry as failed
    pub fn mark_failed(&mut self, entry: &str) {
        if self.failed_set.insert(entry.to_string()) {
            self.failed.push(entry.to_string());
        }
    }

    pub fn is_failed(&self, entry: &str) -> bool {
        self.failed_set.contains(entry)
    }

    /// Failed shader entries, in the order they failed
    pub fn failed_shaders(&self) -> &[String] {
        &self.failed
    }

    /// Hand over the failed entry names, leaving the set empty
    pub fn take_failed(&mut self) -> Vec<String> {
        self.failed_set.clear();
        std::mem::take(&mut self.failed)
    }

    /// Final report: failed shaders, then each unique message with an example command
    pub fn render_report(&self, space: &CommandSpace, options: &ReportOptions) -> String {
        let mut out = String::new();

        for name in &self.failed {
            let _ = writeln!(out, "FAILED:    {}", name);
        }

        for message in &self.messages {
            let cursor = space.seek(message.first_command);
            let command = match &cursor {
                Some(cursor) => space.format_command(cursor, &options.define_prefix),
                None => format!("cmd # {}", message.first_command),
            };

            let _ = writeln!(out, "\n{}", message.text);
            let _ = writeln!(
                out,
                "    Reported {} time(s), first machine \"{}\", example command:",
                message.count, message.first_machine
            );

            if options.verbose {
                let _ = writeln!(out, "    Verbose Description:");
                if let Some(cursor) = &cursor {
                    let entry = space.entry(cursor.entry());
                    let _ = writeln!(out, "        Src File: {}", entry.source_file);
                    let _ = writeln!(out, "        Tgt File: {}", entry.name);
                    let _ = writeln!(out, "        Combo # : {}", cursor.combo());
                    for (define, value) in entry.space.defines().iter().zip(cursor.values()) {
                        let _ = writeln!(out, "                  {} {}", value, define.name);
                    }
                }
            }

            let _ = writeln!(out, "    {}", command);
        }

        out
    }
}
