//! Append-only history of analysis results, one JSON document per line.
use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use common::AnalysisResult;

use crate::{Error, Result};

const HISTORY_HANDLE: &str = "history";

pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The default history file inside a store directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join("history.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, result: &AnalysisResult) -> Result<()> {
        let line = serde_json::to_string(result).map_err(|e| Error::persistence(HISTORY_HANDLE, e))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;

        Ok(())
    }

    /// All stored results, newest first. Unreadable lines are skipped with a warning.
    pub fn list(&self) -> Result<Vec<AnalysisResult>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut results = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(number, line)| match serde_json::from_str(line) {
                Ok(result) => Some(result),
                Err(e) => {
                    log::warn!("Skipping history line {}: {e}", number + 1);
                    None
                }
            })
            .collect::<Vec<AnalysisResult>>();
        results.reverse();

        Ok(results)
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
