//! Per-device data log files.
//!
//! One file per worker at `<output_dir>/<EXPERIMENT>_<TITLE>.log`, both names
//! upper-cased with spaces replaced by underscores. Files are opened in append
//! mode and hold one `<elapsed_ms>,<field_1>,...,<field_k>` record per line.

use crate::error::AppResult;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// File-name form of an experiment or device title.
pub fn normalize(name: &str) -> String {
    name.replace(' ', "_").to_uppercase()
}

/// Path of the data log for `title` within `experiment`.
pub fn log_filename(output_dir: &Path, experiment: &str, title: &str) -> PathBuf {
    output_dir.join(format!(
        "{}_{}.log",
        normalize(experiment),
        normalize(title)
    ))
}

/// Buffered, append-only data log.
#[derive(Debug)]
pub struct DataLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl DataLog {
    /// Open (or create) the log for `title` within `experiment`, creating `output_dir`.
    pub fn open(output_dir: &Path, experiment: &str, title: &str) -> AppResult<Self> {
        fs::create_dir_all(output_dir)?;
        let path = log_filename(output_dir, experiment, title);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), "Opened data log");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    pub fn write_line(&mut self, line: &str) -> AppResult<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Push buffered records to the file.
    pub fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}
