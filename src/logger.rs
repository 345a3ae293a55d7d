use chrono::{DateTime, Utc};
use log::info;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{io::Write, path::PathBuf};

use crate::error::LogicError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// One frame crossing the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireLogEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub phase: String,
    pub payload: String,
}

impl WireLogEntry {
    pub fn new(direction: Direction, phase: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            phase: phase.into(),
            payload: payload.into(),
        }
    }
}

/// Buffered JSONL writer, optionally rewritten as a JSON array on drop.
#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(
        file_path: P,
        buffer_size: usize,
        final_format_json: bool,
    ) -> Self {
        let mut path = file_path.into();
        let wanted = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(std::ffi::OsStr::new(wanted)) {
            path.set_extension(wanted);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.file_path
    }

    pub fn add(&mut self, data: T) -> Result<(), LogicError> {
        self.buffer.push(data);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), LogicError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let write_result = (|| {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            let mut writer = std::io::BufWriter::new(file);
            for data in &self.buffer {
                let json_line = serde_json::to_string(data)?;
                writeln!(writer, "{}", json_line)?;
            }
            writer.flush()?;
            Ok::<(), LogicError>(())
        })();

        match write_result {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Wire log flush failure {}/{}: {}",
                    self.flush_failures,
                    self.max_flush_failures,
                    e
                );

                if self.flush_failures >= self.max_flush_failures {
                    return Err(LogicError::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "Too many consecutive flush failures ({}) for {:?}",
                            self.max_flush_failures, self.file_path
                        ),
                    });
                }

                // Keep the buffered entries for the next attempt
                Ok(())
            }
        }
    }

    /// Rewrite the JSONL file as one pretty JSON array
    pub fn finalize_as_json(&mut self) -> Result<(), LogicError> {
        if !self.final_format_json {
            return Ok(());
        }

        self.flush()?;

        let content = std::fs::read_to_string(&self.file_path).map_err(|source| LogicError::Io {
            source,
            context: format!("Could not read JSONL file at {:?}", self.file_path),
        })?;

        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<T>, _>>()?;

        let json_output = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.file_path, json_output).map_err(|source| LogicError::Io {
            source,
            context: format!("Could not write JSON file at {:?}", self.file_path),
        })?;

        info!("Converted {} entries from JSONL to JSON format", entries.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
        let _ = self.finalize_as_json();
    }
}
