//! Progress tracking and checkpointing for resumable downloads.

use crate::error::DownloadError;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// Checkpoint document name, one per output directory.
pub const PROGRESS_FILE: &str = ".datacite-data-file-dl-progress.json";

/// Completion record for a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    pub size: u64,
    pub checksum: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct CheckpointDocument {
    version: u32,
    updated_at: String,
    files: Vec<FileStatus>,
}

/// Aggregate statistics over completed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressStats {
    pub files_completed: usize,
    pub bytes_completed: u64,
}

/// Durable per-object completion state, persisted as a JSON document in the
/// output directory.
///
/// All mutations and the persist step run under one lock, so concurrent
/// download workers never tear the on-disk document: it is always a complete
/// snapshot of the map at some serialization point. Persistence rewrites the
/// whole document on every completion; downloads dominate cost, so
/// durability wins over write amplification.
#[derive(Debug)]
pub struct ProgressTracker {
    output_dir: PathBuf,
    files: Mutex<HashMap<String, FileStatus>>,
}

impl ProgressTracker {
    /// Loads prior progress from the checkpoint document if one exists.
    /// A missing document means empty prior state, not an error.
    pub fn load(output_dir: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let output_dir = output_dir.into();
        let mut files = HashMap::new();

        let progress_file = output_dir.join(PROGRESS_FILE);
        if progress_file.exists() {
            let content = std::fs::read_to_string(&progress_file)?;
            let doc: CheckpointDocument = serde_json::from_str(&content)?;
            for status in doc.files {
                files.insert(status.path.clone(), status);
            }
        }

        Ok(Self {
            output_dir,
            files: Mutex::new(files),
        })
    }

    fn progress_file(&self) -> PathBuf {
        self.output_dir.join(PROGRESS_FILE)
    }

    fn save(&self, files: &HashMap<String, FileStatus>) -> Result<(), DownloadError> {
        std::fs::create_dir_all(&self.output_dir)?;

        let doc = CheckpointDocument {
            version: 1,
            updated_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            files: files.values().cloned().collect(),
        };

        // Write-then-rename so a crash mid-write never leaves a torn document.
        let target = self.progress_file();
        let temp = target.with_extension("json.tmp");
        std::fs::write(&temp, serde_json::to_string_pretty(&doc)?)?;
        std::fs::rename(&temp, &target)?;
        Ok(())
    }

    /// Records an object as completed and persists the full snapshot.
    pub fn mark_complete(
        &self,
        path: &str,
        size: u64,
        checksum: &str,
    ) -> Result<(), DownloadError> {
        let mut files = self.files.lock().unwrap();
        files.insert(
            path.to_string(),
            FileStatus {
                path: path.to_string(),
                size,
                checksum: checksum.trim_matches('"').to_string(),
                completed: true,
                completed_at: Some(
                    humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
                ),
            },
        );
        self.save(&files)
    }

    pub fn is_complete(&self, path: &str) -> bool {
        let files = self.files.lock().unwrap();
        files.get(path).is_some_and(|s| s.completed)
    }

    pub fn completed_files(&self) -> Vec<String> {
        let files = self.files.lock().unwrap();
        files
            .values()
            .filter(|s| s.completed)
            .map(|s| s.path.clone())
            .collect()
    }

    pub fn stats(&self) -> ProgressStats {
        let files = self.files.lock().unwrap();
        let completed: Vec<_> = files.values().filter(|s| s.completed).collect();
        ProgressStats {
            files_completed: completed.len(),
            bytes_completed: completed.iter().map(|s| s.size).sum(),
        }
    }

    /// Drops all state and deletes the checkpoint document.
    pub fn clear(&self) -> Result<(), DownloadError> {
        let mut files = self.files.lock().unwrap();
        files.clear();
        let progress_file = self.progress_file();
        if progress_file.exists() {
            std::fs::remove_file(progress_file)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    completed_bytes: u64,
    completed_files: usize,
    failed_files: usize,
}

/// Thread-safe aggregate progress for parallel downloads, with an optional
/// byte-level progress bar.
#[derive(Debug)]
pub struct AggregateProgress {
    total_files: usize,
    counters: Mutex<Counters>,
    bar: Option<ProgressBar>,
}

impl AggregateProgress {
    pub fn new(total_files: usize, total_bytes: u64, show_progress: bool) -> Self {
        let bar = if show_progress {
            let pb = ProgressBar::new(total_bytes);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}",
                    )
                    .unwrap()
                    .progress_chars("█▓▒░ "),
            );
            pb.set_message(format!("Downloading {total_files} files"));
            Some(pb)
        } else {
            None
        };

        Self {
            total_files,
            counters: Mutex::new(Counters::default()),
            bar,
        }
    }

    /// Adds freshly transferred bytes to the aggregate.
    pub fn update(&self, bytes_downloaded: u64) {
        let mut counters = self.counters.lock().unwrap();
        counters.completed_bytes += bytes_downloaded;
        if let Some(bar) = &self.bar {
            bar.inc(bytes_downloaded);
        }
    }

    pub fn complete_file(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.completed_files += 1;
        if let Some(bar) = &self.bar {
            bar.set_message(format!(
                "{}/{} files",
                counters.completed_files, self.total_files
            ));
        }
    }

    pub fn fail_file(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.failed_files += 1;
    }

    pub fn completed_files(&self) -> usize {
        self.counters.lock().unwrap().completed_files
    }

    pub fn failed_files(&self) -> usize {
        self.counters.lock().unwrap().failed_files
    }

    pub fn completed_bytes(&self) -> u64 {
        self.counters.lock().unwrap().completed_bytes
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}
