//! Per-attempt session log: banner, stage notes, command transcripts, and
//! the appended settings diff.
//!
//! Log files are plain text and append-only. The settings block is guarded
//! by a sentinel line so that capture is idempotent: a file already
//! carrying the sentinel is never extended with a second block.

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::env::{settings_diff, EnvSnapshot};

/// Marker line delimiting the appended configuration-diff block.
pub const SETTINGS_SENTINEL: &str = "### SETTINGS ###";

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap_or_else(|_| unreachable!()));

/// Strip terminal color escape sequences; logs must be plain text.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Writer for one session log file.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    banner: String,
    file: File,
}

impl SessionLog {
    /// Create the log for one build attempt. The file name derives from the
    /// kernel name plus date and time: `<kernelname>_<date>_<time>.log`.
    pub fn create(dir: &Path, kernel_name: &str, banner: String) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let now = Local::now();
        let name = format!(
            "{}_{}_{}.log",
            kernel_name,
            now.format("%Y%m%d"),
            now.format("%H%M%S")
        );
        let path = dir.join(name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{banner}")?;
        Ok(SessionLog { path, banner, file })
    }

    /// Open an existing log file for appending (used after reinit).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the file and write the banner again. Used when a failed
    /// stage is restarted so the transcript reflects the fresh attempt.
    pub fn reinit(&mut self) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        writeln!(file, "{}", self.banner)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }

    /// Append a stage note with a timestamp prefix.
    pub fn note(&mut self, text: &str) -> io::Result<()> {
        let stamp = Local::now().format("%H:%M:%S");
        writeln!(self.file, "[{stamp}] {text}")
    }

    /// Append a raw output line from a supervised command.
    pub fn append_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.file, "{line}")
    }

    /// Append the header of one command transcript.
    pub fn transcript_header(&mut self, argv: &str) -> io::Result<()> {
        writeln!(self.file, "$ {argv}")
    }

    /// Capture the settings diff into the log.
    ///
    /// Idempotent: returns `Ok(false)` without touching the file when the
    /// sentinel is already present. Otherwise strips color escapes from the
    /// whole log, appends the sentinel and the filtered diff lines, and
    /// returns `Ok(true)`.
    pub fn capture(
        &mut self,
        before: &EnvSnapshot,
        denylist: &[&str],
    ) -> io::Result<bool> {
        self.file.flush()?;
        let content = fs::read_to_string(&self.path)?;
        if content.contains(SETTINGS_SENTINEL) {
            return Ok(false);
        }

        let plain = strip_ansi(&content);
        let after = EnvSnapshot::capture();
        let diff = settings_diff(before, &after, denylist);

        let mut rewritten = plain;
        if !rewritten.ends_with('\n') {
            rewritten.push('\n');
        }
        rewritten.push_str(SETTINGS_SENTINEL);
        rewritten.push('\n');
        for line in diff {
            rewritten.push_str(&line);
            rewritten.push('\n');
        }
        fs::write(&self.path, rewritten)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(true)
    }
}
