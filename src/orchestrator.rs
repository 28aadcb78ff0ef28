//! Coordinates listing, filtering, and concurrent downloads of a set of
//! objects.

use crate::auth::CredentialManager;
use crate::download::{self, DownloadFilters, DownloadResult};
use crate::error::DownloadError;
use crate::progress::{AggregateProgress, ProgressTracker};
use crate::retry::RetryPolicy;
use crate::storage::{self, ObjectDescriptor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Upper bound on concurrent downloads regardless of configuration.
pub const MAX_WORKERS: usize = 32;

/// Drives the download of many objects against one bucket.
pub struct Downloader {
    manager: Arc<CredentialManager>,
    bucket: String,
    output_dir: PathBuf,
    policy: RetryPolicy,
    skip_verify: bool,
}

impl Downloader {
    pub fn new(
        manager: Arc<CredentialManager>,
        bucket: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        policy: RetryPolicy,
        skip_verify: bool,
    ) -> Self {
        Self {
            manager,
            bucket: bucket.into(),
            output_dir: output_dir.into(),
            policy,
            skip_verify,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Folders and files directly under a prefix, for browsing.
    pub async fn list_contents(
        &self,
        prefix: &str,
    ) -> Result<(Vec<String>, Vec<String>), DownloadError> {
        let client = self.manager.get_client().await?;
        self.policy
            .run(|| storage::list_contents(&client, prefix, &self.bucket))
            .await
    }

    /// Every object under a prefix, recursively.
    pub async fn list_all_objects(
        &self,
        prefix: &str,
    ) -> Result<Vec<ObjectDescriptor>, DownloadError> {
        let client = self.manager.get_client().await?;
        self.policy
            .run(|| storage::list_all_objects(&client, prefix, &self.bucket))
            .await
    }

    /// Lists everything under `prefix` and applies the filters and the
    /// resume state. Returns the objects to fetch and the number skipped.
    pub async fn build_download_list(
        &self,
        prefix: &str,
        filters: &DownloadFilters,
        tracker: &ProgressTracker,
    ) -> Result<(Vec<ObjectDescriptor>, usize), DownloadError> {
        let all = self.list_all_objects(prefix).await?;
        let total = all.len();

        let wanted: Vec<ObjectDescriptor> = all
            .into_iter()
            .filter(|obj| {
                let rel_path = download::relative_key_path(&obj.key, prefix);
                download::should_download(obj, &rel_path, tracker, filters)
            })
            .collect();

        let skipped = total - wanted.len();
        debug!("{total} objects listed, {skipped} skipped, {} to download", wanted.len());
        Ok((wanted, skipped))
    }

    /// Downloads a single object, with its own progress bar. Used from the
    /// interactive browser where one file is fetched at a time.
    pub async fn download_file(
        &self,
        obj: &ObjectDescriptor,
        prefix: &str,
        tracker: &ProgressTracker,
        show_progress: bool,
    ) -> DownloadResult {
        let aggregate = Arc::new(AggregateProgress::new(1, obj.size, show_progress));
        let result = download::download_worker(
            &self.manager,
            &self.bucket,
            obj,
            &self.output_dir,
            prefix,
            &self.policy,
            self.skip_verify,
            Some(Arc::clone(&aggregate)),
        )
        .await;
        aggregate.finish();

        if result.success {
            if let Err(e) = tracker.mark_complete(&result.rel_path, result.size, &result.checksum)
            {
                warn!("Failed to record progress for {}: {e}", result.rel_path);
            }
        }
        result
    }

    /// Downloads objects one at a time.
    pub async fn download_sequential(
        &self,
        objects: &[ObjectDescriptor],
        prefix: &str,
        tracker: &ProgressTracker,
        show_progress: bool,
    ) -> Vec<DownloadResult> {
        let total_bytes: u64 = objects.iter().map(|o| o.size).sum();
        let aggregate = Arc::new(AggregateProgress::new(
            objects.len(),
            total_bytes,
            show_progress,
        ));

        let mut results = Vec::with_capacity(objects.len());
        for obj in objects {
            let result = download::download_worker(
                &self.manager,
                &self.bucket,
                obj,
                &self.output_dir,
                prefix,
                &self.policy,
                self.skip_verify,
                Some(Arc::clone(&aggregate)),
            )
            .await;
            if result.success {
                if let Err(e) =
                    tracker.mark_complete(&result.rel_path, result.size, &result.checksum)
                {
                    warn!("Failed to record progress for {}: {e}", result.rel_path);
                }
            } else if let Some(error) = &result.error {
                warn!("Failed to download {}: {error}", result.key);
            }
            results.push(result);
        }

        aggregate.finish();
        results
    }

    /// Downloads objects concurrently with a bounded worker pool.
    ///
    /// One failing object never aborts the others; its failure is captured
    /// in the returned results. Completed objects are checkpointed as they
    /// finish, so an interrupted run resumes without refetching them.
    pub async fn download_parallel(
        &self,
        objects: &[ObjectDescriptor],
        prefix: &str,
        tracker: Arc<ProgressTracker>,
        workers: usize,
        show_progress: bool,
    ) -> Vec<DownloadResult> {
        let workers = workers.clamp(1, MAX_WORKERS);
        let total_bytes: u64 = objects.iter().map(|o| o.size).sum();
        info!(
            "Downloading {} files ({} bytes) with {workers} workers",
            objects.len(),
            total_bytes
        );

        let aggregate = Arc::new(AggregateProgress::new(
            objects.len(),
            total_bytes,
            show_progress,
        ));
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(objects.len());

        for obj in objects.iter().cloned() {
            let manager = Arc::clone(&self.manager);
            let bucket = self.bucket.clone();
            let output_dir = self.output_dir.clone();
            let prefix = prefix.to_string();
            let policy = self.policy;
            let skip_verify = self.skip_verify;
            let aggregate = Arc::clone(&aggregate);
            let semaphore = Arc::clone(&semaphore);
            let tracker = Arc::clone(&tracker);

            handles.push(tokio::spawn(async move {
                // Holding the permit for the whole task bounds concurrency.
                let _permit = semaphore.acquire_owned().await;
                let result = download::download_worker(
                    &manager,
                    &bucket,
                    &obj,
                    &output_dir,
                    &prefix,
                    &policy,
                    skip_verify,
                    Some(aggregate),
                )
                .await;
                if result.success {
                    if let Err(e) =
                        tracker.mark_complete(&result.rel_path, result.size, &result.checksum)
                    {
                        warn!("Failed to record progress for {}: {e}", result.rel_path);
                    }
                } else if let Some(error) = &result.error {
                    warn!("Failed to download {}: {error}", result.key);
                }
                result
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => warn!("Download task panicked: {e}"),
            }
        }

        aggregate.finish();
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::get_object::GetObjectOutput;
    use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Output;
    use aws_sdk_s3::types::Object;
    use aws_smithy_mocks_experimental::{mock, mock_client, RuleMode};
    use aws_smithy_runtime_api::{client::orchestrator::HttpResponse, http::StatusCode};
    use aws_smithy_types::body::SdkBody;
    use aws_smithy_types::byte_stream::ByteStream;
    use std::time::Duration;

    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn hello_object(key: &str) -> Object {
        Object::builder()
            .key(key)
            .size(11)
            .e_tag(format!("\"{HELLO_MD5}\""))
            .build()
    }

    fn downloader(client: aws_sdk_s3::Client, output_dir: &std::path::Path) -> Downloader {
        Downloader::new(
            Arc::new(CredentialManager::with_fixed_client(client)),
            "bucket",
            output_dir,
            fast_policy(),
            false,
        )
    }

    #[tokio::test]
    async fn build_download_list_filters_and_counts_skips() {
        let list = mock!(aws_sdk_s3::Client::list_objects_v2).then_output(|| {
            ListObjectsV2Output::builder()
                .contents(hello_object("dois/a.json"))
                .contents(hello_object("dois/b.csv"))
                .contents(hello_object("dois/c.json"))
                .build()
        });
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(mock_client!(aws_sdk_s3, [&list]), dir.path());
        let tracker = ProgressTracker::load(dir.path()).unwrap();
        tracker.mark_complete("a.json", 11, HELLO_MD5).unwrap();

        let filters = DownloadFilters::new(&["*.json".into()], &[], None).unwrap();
        let (wanted, skipped) = dl
            .build_download_list("dois/", &filters, &tracker)
            .await
            .unwrap();

        // a.json resumed, b.csv filtered out, c.json remains.
        assert_eq!(skipped, 2);
        assert_eq!(wanted.len(), 1);
        assert_eq!(wanted[0].key, "dois/c.json");
    }

    #[tokio::test]
    async fn parallel_download_fetches_everything_and_checkpoints() {
        let get = mock!(aws_sdk_s3::Client::get_object).then_output(|| {
            GetObjectOutput::builder()
                .body(ByteStream::from_static(b"hello world"))
                .build()
        });
        let dir = tempfile::tempdir().unwrap();
        // MatchAny keeps the rule live across all three requests.
        let dl = downloader(
            mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&get]),
            dir.path(),
        );
        let tracker = Arc::new(ProgressTracker::load(dir.path()).unwrap());

        let objects: Vec<ObjectDescriptor> = ["dois/a.json", "dois/sub/b.json", "dois/c.json"]
            .iter()
            .map(|key| ObjectDescriptor {
                key: key.to_string(),
                size: 11,
                etag: format!("\"{HELLO_MD5}\""),
            })
            .collect();

        let results = dl
            .download_parallel(&objects, "dois/", Arc::clone(&tracker), 3, false)
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        for rel in ["a.json", "sub/b.json", "c.json"] {
            assert_eq!(std::fs::read(dir.path().join(rel)).unwrap(), b"hello world");
            assert!(tracker.is_complete(rel));
        }
        assert_eq!(tracker.stats().files_completed, 3);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_rest() {
        // A 500 response goes through real deserialization and surfaces as a
        // retryable storage error.
        let bad = mock!(aws_sdk_s3::Client::get_object)
            .match_requests(|input| input.key() == Some("dois/bad.json"))
            .then_http_response(|| {
                HttpResponse::new(StatusCode::try_from(500).unwrap(), SdkBody::empty())
            });
        let good = mock!(aws_sdk_s3::Client::get_object).then_output(|| {
            GetObjectOutput::builder()
                .body(ByteStream::from_static(b"hello world"))
                .build()
        });
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(
            mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&bad, &good]),
            dir.path(),
        );
        let tracker = Arc::new(ProgressTracker::load(dir.path()).unwrap());

        let objects: Vec<ObjectDescriptor> = ["dois/good.json", "dois/bad.json"]
            .iter()
            .map(|key| ObjectDescriptor {
                key: key.to_string(),
                size: 11,
                etag: format!("\"{HELLO_MD5}\""),
            })
            .collect();

        let results = dl
            .download_parallel(&objects, "dois/", Arc::clone(&tracker), 2, false)
            .await;

        let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key, "dois/bad.json");
        assert!(dir.path().join("good.json").exists());
        assert!(!dir.path().join("bad.json").exists());
        assert!(tracker.is_complete("good.json"));
        assert!(!tracker.is_complete("bad.json"));
    }

    #[tokio::test]
    async fn sequential_download_checkpoints_each_file() {
        let get = mock!(aws_sdk_s3::Client::get_object).then_output(|| {
            GetObjectOutput::builder()
                .body(ByteStream::from_static(b"hello world"))
                .build()
        });
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(
            mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&get]),
            dir.path(),
        );
        let tracker = ProgressTracker::load(dir.path()).unwrap();

        let objects = vec![
            ObjectDescriptor {
                key: "dois/a.json".into(),
                size: 11,
                etag: format!("\"{HELLO_MD5}\""),
            },
            ObjectDescriptor {
                key: "dois/b.json".into(),
                size: 11,
                etag: format!("\"{HELLO_MD5}\""),
            },
        ];

        let results = dl
            .download_sequential(&objects, "dois/", &tracker, false)
            .await;

        assert!(results.iter().all(|r| r.success));
        assert!(tracker.is_complete("a.json"));
        assert!(tracker.is_complete("b.json"));
    }
}
