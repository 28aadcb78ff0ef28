//! DataCite API authentication and AWS credential lifecycle management.

use crate::error::DownloadError;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::info;

/// Credential-issuing endpoint for the data file bucket.
pub const API_URL: &str = "https://api.datacite.org/credentials/datafile";

/// Default AWS STS tokens last 1 hour (3600s).
pub const DEFAULT_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(3600);

/// Default refresh interval: refresh credentials after 20 minutes of use
/// (buffer = 3600 - 1200 = 2400 seconds remaining).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1200);

const DEFAULT_REGION: &str = "us-east-1";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Temporary AWS credentials for S3 access.
///
/// Immutable once constructed; a refresh replaces the whole value rather
/// than mutating fields in place.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub fetched_at: SystemTime,
    pub lifetime: Duration,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.into(),
            fetched_at: SystemTime::now(),
            lifetime: DEFAULT_CREDENTIAL_LIFETIME,
        }
    }

    fn age(&self) -> Duration {
        self.fetched_at.elapsed().unwrap_or_default()
    }

    /// Whether the credentials will expire within the buffer period.
    pub fn is_expiring_soon(&self, buffer: Duration) -> bool {
        self.age() >= self.lifetime.saturating_sub(buffer)
    }

    /// Seconds until the credentials expire, saturating at zero.
    pub fn seconds_until_expiry(&self) -> u64 {
        self.lifetime.saturating_sub(self.age()).as_secs()
    }
}

/// Fetches temporary AWS credentials from the DataCite API.
///
/// Network failures are wrapped as authentication failures rather than
/// retried here; retry is the caller's concern.
pub async fn fetch_credentials(
    http: &reqwest::Client,
    api_url: &str,
    username: &str,
    password: &str,
) -> Result<Credentials, DownloadError> {
    let response = http
        .get(api_url)
        .basic_auth(username, Some(password))
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| DownloadError::Authentication(format!("network error: {e}")))?;

    match response.status().as_u16() {
        200 => {}
        401 => {
            return Err(DownloadError::Authentication(
                "invalid username or password".to_string(),
            ))
        }
        403 => {
            return Err(DownloadError::Authentication(
                "access denied, check your account permissions".to_string(),
            ))
        }
        status => {
            return Err(DownloadError::Authentication(format!(
                "unexpected response from DataCite API: {status}"
            )))
        }
    }

    let data: serde_json::Value = response
        .json()
        .await
        .map_err(|e| DownloadError::Authentication(format!("invalid response from API: {e}")))?;

    let field = |name: &str| -> Result<String, DownloadError> {
        data.get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                DownloadError::Authentication(format!(
                    "missing field `{name}` in credential response"
                ))
            })
    };

    Ok(Credentials::new(
        field("access_key_id")?,
        field("secret_access_key")?,
        field("session_token")?,
    ))
}

#[derive(Debug, Default)]
struct Inner {
    credentials: Option<Credentials>,
    client: Option<aws_sdk_s3::Client>,
    refresh_count: u64,
}

/// Manages AWS credentials with automatic refresh before expiration.
///
/// Safe for unbounded concurrent callers: the read path checks expiry under
/// a shared lock, and refreshes collapse to a single fetch via re-check
/// under the write lock. The credentials and the S3 client bound to them are
/// replaced together as one unit.
#[derive(Debug)]
pub struct CredentialManager {
    username: String,
    password: String,
    api_url: String,
    refresh_interval: Duration,
    refresh_buffer: Duration,
    http: reqwest::Client,
    inner: RwLock<Inner>,
}

impl CredentialManager {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_intervals(
            username,
            password,
            DEFAULT_REFRESH_INTERVAL,
            DEFAULT_CREDENTIAL_LIFETIME,
        )
    }

    pub fn with_intervals(
        username: impl Into<String>,
        password: impl Into<String>,
        refresh_interval: Duration,
        credential_lifetime: Duration,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            api_url: API_URL.to_string(),
            refresh_interval,
            refresh_buffer: credential_lifetime.saturating_sub(refresh_interval),
            http: reqwest::Client::new(),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Override the credential-issuing endpoint.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Manager pre-seeded with fresh credentials bound to the given client,
    /// so no credential fetch ever happens.
    #[cfg(test)]
    pub(crate) fn with_fixed_client(client: aws_sdk_s3::Client) -> Self {
        let manager = Self::new("test", "test");
        {
            let inner = manager.inner.try_write();
            let mut inner = inner.expect("new manager is uncontended");
            inner.credentials = Some(Credentials::new("k", "s", "t"));
            inner.client = Some(client);
        }
        manager
    }

    fn create_client(&self, creds: &Credentials) -> aws_sdk_s3::Client {
        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string());
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
                Some(creds.session_token.clone()),
                None,
                "datacite-credential-api",
            ))
            .build();
        aws_sdk_s3::Client::from_conf(config)
    }

    fn needs_refresh(&self, inner: &Inner) -> bool {
        match (&inner.credentials, &inner.client) {
            (Some(creds), Some(_)) => creds.is_expiring_soon(self.refresh_buffer),
            _ => true,
        }
    }

    async fn refresh_locked(&self, inner: &mut Inner) -> Result<(), DownloadError> {
        let creds =
            fetch_credentials(&self.http, &self.api_url, &self.username, &self.password).await?;
        inner.client = Some(self.create_client(&creds));
        inner.refresh_count += 1;

        let remaining = creds.seconds_until_expiry();
        info!(
            "Credentials refreshed (refresh #{}). Valid for {} minutes, will refresh in {} minutes.",
            inner.refresh_count,
            remaining / 60,
            self.refresh_interval.as_secs() / 60,
        );
        inner.credentials = Some(creds);
        Ok(())
    }

    /// Returns an S3 client, refreshing credentials first if needed.
    pub async fn get_client(&self) -> Result<aws_sdk_s3::Client, DownloadError> {
        {
            let inner = self.inner.read().await;
            if !self.needs_refresh(&inner) {
                if let Some(client) = &inner.client {
                    return Ok(client.clone());
                }
            }
        }

        let mut inner = self.inner.write().await;
        // Re-check after acquiring the write lock: concurrent callers that
        // all observed stale credentials collapse into a single refresh.
        if self.needs_refresh(&inner) {
            self.refresh_locked(&mut inner).await?;
        }
        match &inner.client {
            Some(client) => Ok(client.clone()),
            None => Err(DownloadError::Authentication(
                "no S3 client available".to_string(),
            )),
        }
    }

    /// Proactively refresh credentials if they are expiring soon.
    pub async fn ensure_fresh(&self) -> Result<(), DownloadError> {
        {
            let inner = self.inner.read().await;
            if !self.needs_refresh(&inner) {
                return Ok(());
            }
        }
        let mut inner = self.inner.write().await;
        if self.needs_refresh(&inner) {
            self.refresh_locked(&mut inner).await?;
        }
        Ok(())
    }

    /// Unconditionally refresh credentials, bypassing the expiry check.
    ///
    /// Used when a caller has independent evidence (an authentication error
    /// from the storage service) that the current credentials are invalid.
    pub async fn force_refresh(&self) -> Result<aws_sdk_s3::Client, DownloadError> {
        info!("Forcing credential refresh due to authentication error...");
        let mut inner = self.inner.write().await;
        self.refresh_locked(&mut inner).await?;
        match &inner.client {
            Some(client) => Ok(client.clone()),
            None => Err(DownloadError::Authentication(
                "no S3 client available".to_string(),
            )),
        }
    }

    /// Number of times credentials have been refreshed.
    pub async fn refresh_count(&self) -> u64 {
        self.inner.read().await.refresh_count
    }

    /// Current credentials, if any have been fetched.
    pub async fn credentials(&self) -> Option<Credentials> {
        self.inner.read().await.credentials.clone()
    }
}
