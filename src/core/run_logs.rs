//! Run log files - one directory per run, one file pair per attempt
//!
//! Directories are named `NN_<exec>` with `NN` counting down from 99, so the
//! newest run sorts first in a directory listing.

use super::events::Stream;
use crate::error::ConfigError;
use chrono::Local;
use regex::Regex;
use std::fs::{self, File};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const FIRST_RUN_NUMBER: u32 = 99;

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ANSI pattern is a valid regex")
    })
}

/// Remove ANSI escape sequences (colors, cursor movement, titles)
pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ansi_pattern().replace_all(line, "")
}

/// Number prefix of a run log directory name, if it has one
fn run_number(name: &str) -> Option<u32> {
    let (number, rest) = name.split_once('_')?;
    if number.len() != 2 || rest.is_empty() {
        return None;
    }
    number.parse().ok()
}

fn existing_run_dirs(root: &Path) -> Result<Vec<(u32, PathBuf)>, ConfigError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(number) = run_number(&entry.file_name().to_string_lossy()) {
            dirs.push((number, entry.path()));
        }
    }
    Ok(dirs)
}

/// Create the next run log directory below `root`.
///
/// Fails with [`ConfigError::RunLogsFull`] once `01_*` exists.
pub fn next_run_logs_dir(root: &Path, exec_name: &str) -> Result<PathBuf, ConfigError> {
    let lowest = existing_run_dirs(root)?
        .into_iter()
        .map(|(number, _)| number)
        .min();
    let number = match lowest {
        None => FIRST_RUN_NUMBER,
        Some(lowest) if lowest <= 1 => return Err(ConfigError::RunLogsFull(root.to_path_buf())),
        Some(lowest) => lowest - 1,
    };

    let dir = root.join(format!("{:02}_{}", number, exec_name));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Whether no further run directory can be created below `root`
pub fn is_full(root: &Path) -> Result<bool, ConfigError> {
    Ok(existing_run_dirs(root)?
        .iter()
        .any(|(number, _)| *number <= 1))
}

/// Delete every run log directory below `root`, returns how many were removed
pub fn clean_run_logs(root: &Path) -> Result<usize, ConfigError> {
    let dirs = existing_run_dirs(root)?;
    for (_, dir) in &dirs {
        fs::remove_dir_all(dir)?;
    }
    Ok(dirs.len())
}

/// Open `.stdout.log`/`.stderr.log` pair of one attempt
pub struct RunLogFiles {
    stdout: LineWriter<File>,
    stderr: LineWriter<File>,
    strip_ansi: bool,
    include_time: bool,
    failed: bool,
}

impl RunLogFiles {
    pub fn create(dir: &Path, stem: &str, strip_ansi: bool, include_time: bool) -> Result<Self, ConfigError> {
        fs::create_dir_all(dir)?;
        let open = |suffix: &str| -> Result<LineWriter<File>, ConfigError> {
            Ok(LineWriter::new(File::create(dir.join(format!("{}.{}.log", stem, suffix)))?))
        };
        Ok(Self {
            stdout: open("stdout")?,
            stderr: open("stderr")?,
            strip_ansi,
            include_time,
            failed: false,
        })
    }

    /// Append a line; write failures are logged once and then ignored
    pub fn write_line(&mut self, stream: Stream, line: &str) {
        if self.failed {
            return;
        }
        let content = if self.strip_ansi {
            strip_ansi(line)
        } else {
            line.into()
        };
        let writer = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        let result = if self.include_time {
            writeln!(writer, "[{}] {}", Local::now().format("%H:%M:%S"), content)
        } else {
            writeln!(writer, "{}", content)
        };
        if let Err(e) = result {
            log::warn!("Failed to write {} log: {}", stream, e);
            self.failed = true;
        }
    }
}
