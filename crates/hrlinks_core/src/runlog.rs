use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};

pub const ERROR_MARKER: &str = "! ERROR: ";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only run log. Every line is timestamped; error lines carry
/// `ERROR_MARKER` and are always echoed to the console writer.
pub struct RunLog {
    path: PathBuf,
    file: File,
    console: Box<dyn Write>,
    echo_progress: bool,
    error_count: usize,
}

impl fmt::Debug for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLog")
            .field("path", &self.path)
            .field("echo_progress", &self.echo_progress)
            .field("error_count", &self.error_count)
            .finish_non_exhaustive()
    }
}

impl RunLog {
    /// Open the log with stdout as the console.
    pub fn open(path: &Path, echo_progress: bool) -> Result<Self> {
        Self::open_with_console(path, echo_progress, Box::new(io::stdout()))
    }

    /// Open the log echoing to `console`. Machine-readable runs pass stderr
    /// here and keep stdout for their own output.
    pub fn open_with_console(
        path: &Path,
        echo_progress: bool,
        console: Box<dyn Write>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            console,
            echo_progress,
            error_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Progress line, echoed to the console when the log was opened with echo on.
    pub fn progress(&mut self, message: &str) -> Result<()> {
        self.write_line(false, message)?;
        if self.echo_progress {
            self.echo(message)?;
        }
        Ok(())
    }

    /// Line recorded in the log file only.
    pub fn note(&mut self, message: &str) -> Result<()> {
        self.write_line(false, message)
    }

    pub fn error(&mut self, message: &str) -> Result<()> {
        self.error_count += 1;
        self.write_line(true, message)?;
        self.echo(&format!("{ERROR_MARKER}{message}"))
    }

    fn echo(&mut self, message: &str) -> Result<()> {
        writeln!(self.console, "{message}")
            .and_then(|()| self.console.flush())
            .context("failed to write run log to console")
    }

    fn write_line(&mut self, is_error: bool, message: &str) -> Result<()> {
        let now = Local::now().naive_local();
        let mut rendered = String::new();
        for line in message.lines() {
            rendered.push_str(&format_line(now, is_error, line));
            rendered.push('\n');
        }
        if rendered.is_empty() {
            rendered = format_line(now, is_error, "");
            rendered.push('\n');
        }
        self.file
            .write_all(rendered.as_bytes())
            .with_context(|| format!("failed to write log file {}", self.path.display()))
    }
}

pub fn format_line(timestamp: NaiveDateTime, is_error: bool, message: &str) -> String {
    let marker = if is_error { ERROR_MARKER } else { "" };
    format!(
        "[{}] {marker}{message}",
        timestamp.format(TIMESTAMP_FORMAT)
    )
}
