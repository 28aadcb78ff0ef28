//! Per-object download pipeline: filtering, fetch with retry, verification,
//! and atomic placement.

use crate::auth::CredentialManager;
use crate::error::DownloadError;
use crate::progress::{AggregateProgress, ProgressTracker};
use crate::retry::RetryPolicy;
use crate::safe_path::safe_join;
use crate::storage::{self, ObjectDescriptor, ProgressFn};
use crate::verify::verify_checksum;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Parses a human-readable size such as `500MB`, `1.5GB`, or `1024` into
/// bytes. A bare number is taken as bytes.
pub fn parse_size(input: &str) -> Result<u64, DownloadError> {
    let text = input.trim().to_ascii_uppercase();
    let invalid = || DownloadError::InvalidArgument(format!("invalid size: `{input}`"));

    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        "TB" => 1 << 40,
        _ => return Err(invalid()),
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok((value * multiplier as f64) as u64)
}

/// Inclusion rules applied to each candidate object before download.
#[derive(Debug, Default)]
pub struct DownloadFilters {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
    max_size: Option<u64>,
}

impl DownloadFilters {
    pub fn new(
        include: &[String],
        exclude: &[String],
        max_size: Option<u64>,
    ) -> Result<Self, DownloadError> {
        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>, DownloadError> {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p).map_err(|e| {
                        DownloadError::InvalidArgument(format!("invalid pattern `{p}`: {e}"))
                    })
                })
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
            max_size,
        })
    }
}

/// Decides whether an object should be downloaded.
///
/// Checks run in order: already-completed objects are skipped first, then
/// include patterns (when any are given, the filename must match one), then
/// exclude patterns, then the size ceiling. Patterns match the filename
/// only, never the full key.
pub fn should_download(
    obj: &ObjectDescriptor,
    rel_path: &str,
    tracker: &ProgressTracker,
    filters: &DownloadFilters,
) -> bool {
    if tracker.is_complete(rel_path) {
        debug!("Skipping {} (already downloaded)", obj.key);
        return false;
    }

    let filename = obj.key.rsplit('/').next().unwrap_or(&obj.key);

    if !filters.include.is_empty() && !filters.include.iter().any(|p| p.matches(filename)) {
        debug!("Skipping {} (no include pattern matches)", obj.key);
        return false;
    }
    if filters.exclude.iter().any(|p| p.matches(filename)) {
        debug!("Skipping {} (exclude pattern matches)", obj.key);
        return false;
    }
    if let Some(max) = filters.max_size {
        if obj.size > max {
            debug!("Skipping {} ({} bytes exceeds size limit)", obj.key, obj.size);
            return false;
        }
    }
    true
}

/// Strips the listing prefix from a key to get the path relative to the
/// output directory. A key that reduces to nothing falls back to its last
/// path segment.
pub fn relative_key_path(key: &str, prefix: &str) -> String {
    let stripped = key.strip_prefix(prefix).unwrap_or(key);
    let stripped = stripped.trim_start_matches('/');
    if stripped.is_empty() {
        key.trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(key)
            .to_string()
    } else {
        stripped.to_string()
    }
}

/// Outcome of one object's download attempt.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub key: String,
    pub rel_path: String,
    pub size: u64,
    pub checksum: String,
    pub success: bool,
    pub error: Option<String>,
}

fn temp_path_for(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Downloads one object to `local_path` via a temporary file.
///
/// The object is streamed to `<local_path>.tmp`, verified against its ETag
/// (unless verification is skipped or the ETag is a multipart digest), and
/// only then renamed into place. The destination never holds a partial
/// file; the temporary is removed on any failure.
pub async fn download_file_with_retry(
    manager: &CredentialManager,
    bucket: &str,
    obj: &ObjectDescriptor,
    local_path: &Path,
    policy: &RetryPolicy,
    skip_verify: bool,
    progress: Option<ProgressFn>,
) -> Result<(), DownloadError> {
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = temp_path_for(local_path);

    let outcome: Result<(), DownloadError> = async {
        policy
            .run_with_client(manager, |client| {
                let bucket = bucket.to_string();
                let key = obj.key.clone();
                let temp_path = temp_path.clone();
                let progress = progress.clone();
                async move {
                    storage::download_object(&client, &bucket, &key, &temp_path, progress).await
                }
            })
            .await?;

        if !skip_verify && !obj.etag.is_empty() {
            verify_checksum(&temp_path, &obj.etag).await?;
        }
        tokio::fs::rename(&temp_path, local_path).await?;
        Ok(())
    }
    .await;

    if let Err(e) = outcome {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }
    debug!("Downloaded {} to {}", obj.key, local_path.display());
    Ok(())
}

/// Runs one object through path validation, download, and progress
/// accounting, capturing any failure in the returned result rather than
/// propagating it.
#[allow(clippy::too_many_arguments)]
pub async fn download_worker(
    manager: &CredentialManager,
    bucket: &str,
    obj: &ObjectDescriptor,
    output_dir: &Path,
    prefix: &str,
    policy: &RetryPolicy,
    skip_verify: bool,
    aggregate: Option<Arc<AggregateProgress>>,
) -> DownloadResult {
    let rel_path = relative_key_path(&obj.key, prefix);
    let mut result = DownloadResult {
        key: obj.key.clone(),
        rel_path: rel_path.clone(),
        size: obj.size,
        checksum: obj.etag.trim_matches('"').to_string(),
        success: false,
        error: None,
    };

    let local_path = match safe_join(output_dir, &rel_path) {
        Ok(path) => path,
        Err(e) => {
            if let Some(aggregate) = &aggregate {
                aggregate.fail_file();
            }
            result.error = Some(e.to_string());
            return result;
        }
    };

    let progress: Option<ProgressFn> = aggregate.as_ref().map(|aggregate| {
        let aggregate = Arc::clone(aggregate);
        Arc::new(move |n: u64| aggregate.update(n)) as ProgressFn
    });

    match download_file_with_retry(manager, bucket, obj, &local_path, policy, skip_verify, progress)
        .await
    {
        Ok(()) => {
            if let Some(aggregate) = &aggregate {
                aggregate.complete_file();
            }
            result.success = true;
        }
        Err(e) => {
            if let Some(aggregate) = &aggregate {
                aggregate.fail_file();
            }
            result.error = Some(e.to_string());
        }
    }
    result
}
