//! Retry with exponential backoff, with an optional credential-refresh path.

use crate::auth::CredentialManager;
use crate::error::DownloadError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff policy: `delay(attempt) = min(base_delay * 2^(attempt-1), max_delay)`.
///
/// `max_retries` is the attempt budget; at least one attempt is always made
/// even when it is configured as zero.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(32);
        let base_ms = self.base_delay.as_millis() as u64;
        Duration::from_millis(base_ms.saturating_mul(factor)).min(self.max_delay)
    }

    /// Runs an operation, retrying retryable failures with backoff.
    ///
    /// Non-retryable failures propagate immediately. Once the attempt budget
    /// is exhausted the last failure is wrapped in `RetriesExhausted`.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, DownloadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let attempts = self.attempts();
        let mut attempt = 1u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if attempt >= attempts {
                        return Err(DownloadError::RetriesExhausted {
                            attempts,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Attempt {attempt}/{attempts} failed: {e}. Waiting {}...",
                        humantime::format_duration(delay)
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs an operation that needs an S3 client, refreshing credentials on
    /// authentication failure.
    ///
    /// A client is obtained from the manager before the first attempt. When a
    /// failure is classified as a credential error and no refresh has happened
    /// yet in this sequence, the credentials are force-refreshed and the
    /// operation retried immediately; that correction step consumes neither a
    /// backoff delay nor an attempt. At most one refresh happens per sequence,
    /// which bounds wasted refreshes when the credentials are fundamentally
    /// invalid rather than merely expired.
    pub async fn run_with_client<T, F, Fut>(
        &self,
        manager: &CredentialManager,
        mut op: F,
    ) -> Result<T, DownloadError>
    where
        F: FnMut(aws_sdk_s3::Client) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let attempts = self.attempts();
        let mut client = manager.get_client().await?;
        let mut refreshed = false;
        let mut attempt = 1u32;

        loop {
            match op(client.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if e.is_credential_error() {
                        if !refreshed {
                            warn!(
                                "Credential error on attempt {attempt}/{attempts}: {e}. \
                                 Refreshing credentials..."
                            );
                            client = manager.force_refresh().await?;
                            refreshed = true;
                            continue;
                        }
                        warn!(
                            "Credential error persists after refresh on attempt \
                             {attempt}/{attempts}: {e}"
                        );
                    }

                    if attempt >= attempts {
                        return Err(DownloadError::RetriesExhausted {
                            attempts,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Attempt {attempt}/{attempts} failed: {e}. Waiting {}...",
                        humantime::format_duration(delay)
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }
    }

    fn transient() -> DownloadError {
        DownloadError::Storage {
            code: None,
            message: "connection reset".to_string(),
        }
    }

    fn expired_token() -> DownloadError {
        DownloadError::Storage {
            code: Some("ExpiredToken".to_string()),
            message: "token expired".to_string(),
        }
    }

    async fn mock_manager() -> CredentialManager {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let body = r#"{"access_key_id":"k","secret_access_key":"s","session_token":"t"}"#;
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        CredentialManager::new("u", "p").with_api_url(format!("http://{addr}"))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = fast_policy(3)
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_and_wraps_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = fast_policy(3)
            .run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            DownloadError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, DownloadError::Storage { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zero_retries_still_attempts_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = fast_policy(0)
            .run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            DownloadError::RetriesExhausted { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn non_retryable_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = fast_policy(3)
            .run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DownloadError::Authentication("bad".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, DownloadError::Authentication(_)));
    }

    #[tokio::test]
    async fn credential_error_triggers_exactly_one_refresh() {
        let manager = mock_manager().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let started = std::time::Instant::now();
        let result = RetryPolicy::default()
            .run_with_client(&manager, |_client| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(expired_token())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Initial fetch plus the forced refresh.
        assert_eq!(manager.refresh_count().await, 2);
        // The refresh transition must not consume a backoff sleep.
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn persistent_credential_errors_refresh_only_once() {
        let manager = mock_manager().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = fast_policy(3)
            .run_with_client(&manager, |_client| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(expired_token()) }
            })
            .await
            .unwrap_err();

        // 3 budgeted attempts plus the free post-refresh attempt.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(manager.refresh_count().await, 2);
        match err {
            DownloadError::RetriesExhausted { source, .. } => {
                assert!(source.is_credential_error());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
