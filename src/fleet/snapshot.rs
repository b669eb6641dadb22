//! JSONL snapshot writer with daily file rotation.

use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{NaiveDate, Utc};
use tracing::warn;

use crate::models::stats::FleetSnapshot;
use crate::{AppError, Result};

struct DayFile {
    date: NaiveDate,
    writer: BufWriter<fs::File>,
}

/// Appends one [`FleetSnapshot`] per line to `<dir>/stats-YYYY-MM-DD.jsonl`,
/// opening a new file when the calendar date changes between writes.
pub struct SnapshotWriter {
    dir: PathBuf,
    current: Option<DayFile>,
}

impl SnapshotWriter {
    /// Writer storing files in `dir`, which is created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create snapshot directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir, current: None })
    }

    /// Directory holding the snapshot files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for `date`.
    #[must_use]
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("stats-{date}.jsonl"))
    }

    fn open(path: &Path) -> Result<BufWriter<fs::File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AppError::Io(format!("failed to open {}: {e}", path.display())))?;
        Ok(BufWriter::new(file))
    }

    /// Append `snapshot` and flush.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] when the file cannot be opened or written.
    pub fn write(&mut self, snapshot: &FleetSnapshot) -> Result<()> {
        let today = Utc::now().date_naive();
        if self.current.as_ref().is_none_or(|f| f.date != today) {
            let writer = Self::open(&self.path_for(today))?;
            self.current = Some(DayFile {
                date: today,
                writer,
            });
        }
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };

        let line = serde_json::to_string(snapshot)
            .map_err(|e| AppError::Io(format!("failed to serialize snapshot: {e}")))?;
        if let Err(e) = writeln!(file.writer, "{line}").and_then(|()| file.writer.flush()) {
            warn!("failed to write snapshot: {e}");
            self.current = None;
            return Err(AppError::Io(format!("snapshot write failed: {e}")));
        }
        Ok(())
    }
}
