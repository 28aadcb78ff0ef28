//! datacite-dl - Resumable bulk downloader for DataCite monthly data files
//!
//! This library downloads public data files from the DataCite S3 bucket,
//! authenticating against the DataCite API for short-lived AWS credentials
//! and refreshing them transparently during long runs.
//!
//! # Features
//!
//! - **Resumable Downloads**: A checkpoint file records completed objects
//! - **MD5 Verification**: Downloaded content is verified against its ETag
//! - **Concurrent Workers**: Bounded parallel downloads across objects
//! - **Credential Refresh**: Expired tokens are refreshed mid-run
//! - **Automatic Retry**: Exponential backoff for transient failures
//!
//! # Example
//!
//! ```no_run
//! use datacite_dl::{CredentialManager, Downloader, RetryPolicy};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), datacite_dl::DownloadError> {
//! let manager = Arc::new(CredentialManager::new("user", "password"));
//! let downloader = Downloader::new(
//!     manager,
//!     datacite_dl::DEFAULT_BUCKET,
//!     "./datafiles",
//!     RetryPolicy::default(),
//!     false,
//! );
//! let objects = downloader.list_all_objects("dois/").await?;
//! println!("{} objects available", objects.len());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod download;
pub mod error;
pub mod interactive;
pub mod orchestrator;
pub mod output;
pub mod progress;
pub mod retry;
pub mod safe_path;
pub mod storage;
pub mod verify;

pub use auth::{CredentialManager, Credentials};
pub use download::{DownloadFilters, DownloadResult};
pub use error::DownloadError;
pub use orchestrator::Downloader;
pub use progress::ProgressTracker;
pub use retry::RetryPolicy;
pub use storage::{ObjectDescriptor, DEFAULT_BUCKET};
