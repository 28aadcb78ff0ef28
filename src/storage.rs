//! S3 listing and object fetch operations.

use crate::error::DownloadError;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Bucket holding the monthly data files.
pub const DEFAULT_BUCKET: &str = "monthly-datafile.datacite.org";

/// Progress callback invoked with incremental byte counts.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// One listed object: key, size, and its ETag-like content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

/// Maps an SDK error into the local taxonomy, preserving the service error
/// code for credential classification.
pub(crate) fn storage_error<E, R>(err: SdkError<E, R>) -> DownloadError
where
    SdkError<E, R>: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = err.code().map(str::to_string);
    let message = DisplayErrorContext(&err).to_string();
    DownloadError::Storage { code, message }
}

/// Lists folders (common prefixes) and files directly under a prefix.
///
/// Returns both sorted by name, with the prefix stripped.
pub async fn list_contents(
    client: &Client,
    prefix: &str,
    bucket: &str,
) -> Result<(Vec<String>, Vec<String>), DownloadError> {
    let mut folders = Vec::new();
    let mut files = Vec::new();
    let mut continuation_token: Option<String> = None;

    loop {
        let page = client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .delimiter("/")
            .set_continuation_token(continuation_token.take())
            .send()
            .await
            .map_err(storage_error)?;

        for cp in page.common_prefixes() {
            if let Some(folder) = cp.prefix() {
                let name = folder
                    .strip_prefix(prefix)
                    .unwrap_or(folder)
                    .trim_end_matches('/');
                if !name.is_empty() {
                    folders.push(name.to_string());
                }
            }
        }

        for obj in page.contents() {
            let Some(key) = obj.key() else { continue };
            if key == prefix {
                continue;
            }
            let name = key.strip_prefix(prefix).unwrap_or(key);
            if !name.is_empty() {
                files.push(name.to_string());
            }
        }

        if page.is_truncated().unwrap_or(false) {
            continuation_token = page.next_continuation_token().map(str::to_string);
            if continuation_token.is_none() {
                break;
            }
        } else {
            break;
        }
    }

    folders.sort();
    files.sort();
    Ok((folders, files))
}

/// Lists all objects under a prefix recursively (no delimiter).
///
/// Folder-marker objects (key ending in `/` with size 0) are dropped; they
/// exist only to make "directories" visible in bucket browsers.
pub async fn list_all_objects(
    client: &Client,
    prefix: &str,
    bucket: &str,
) -> Result<Vec<ObjectDescriptor>, DownloadError> {
    let mut objects = Vec::new();
    let mut continuation_token: Option<String> = None;

    loop {
        let page = client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token.take())
            .send()
            .await
            .map_err(storage_error)?;

        for obj in page.contents() {
            let Some(key) = obj.key() else { continue };
            let size = obj.size().unwrap_or(0).max(0) as u64;
            if key.ends_with('/') && size == 0 {
                continue;
            }
            objects.push(ObjectDescriptor {
                key: key.to_string(),
                size,
                etag: obj.e_tag().unwrap_or_default().to_string(),
            });
        }

        if page.is_truncated().unwrap_or(false) {
            continuation_token = page.next_continuation_token().map(str::to_string);
            if continuation_token.is_none() {
                break;
            }
        } else {
            break;
        }
    }

    Ok(objects)
}

/// Streams an object to a local file, reporting incremental byte counts to
/// the progress callback as chunks arrive.
pub async fn download_object(
    client: &Client,
    bucket: &str,
    key: &str,
    dest: &Path,
    progress: Option<ProgressFn>,
) -> Result<(), DownloadError> {
    let response = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(storage_error)?;

    let mut body = response.body;
    let mut file = BufWriter::new(tokio::fs::File::create(dest).await?);

    while let Some(chunk) = body.try_next().await.map_err(|e| DownloadError::Storage {
        code: None,
        message: format!("error reading object body for {key}: {e}"),
    })? {
        if let Some(progress) = &progress {
            progress(chunk.len() as u64);
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(())
}
