//! Checksum computation and verification against S3 ETags.

use crate::error::DownloadError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Chunk size for streaming hash computation (8MB).
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Computes the MD5 hash of a local file as a hex string.
///
/// Reads the file in chunks so arbitrarily large files never load fully into
/// memory. Runs on a blocking task to keep the async runtime responsive.
pub async fn compute_md5(path: &Path) -> Result<String, DownloadError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        use md5::{Digest, Md5};
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(CHUNK_SIZE, file);
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| {
        DownloadError::Io(std::io::Error::other(format!("task join error: {e}")))
    })?
}

/// Verifies a local file against an S3 ETag.
///
/// Surrounding quotes are stripped from the expected value before comparison.
/// Multipart-upload ETags (containing `-`) use a different algorithm and
/// cannot be compared to a plain MD5, so verification is skipped for them.
pub async fn verify_checksum(path: &Path, expected_etag: &str) -> Result<(), DownloadError> {
    let expected = expected_etag.trim_matches('"');

    if expected.contains('-') {
        debug!("skipping checksum for multipart upload: {}", path.display());
        return Ok(());
    }

    let actual = compute_md5(path).await?;

    if actual != expected {
        return Err(DownloadError::ChecksumMismatch {
            path: PathBuf::from(path),
            expected: expected.to_string(),
            actual,
        });
    }

    debug!("checksum verified: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // MD5 of the ASCII string "hello world"
    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn compute_md5_of_known_content() {
        let f = write_temp(b"hello world");
        assert_eq!(compute_md5(f.path()).await.unwrap(), HELLO_MD5);
    }

    #[tokio::test]
    async fn compute_md5_of_empty_file() {
        let f = write_temp(b"");
        assert_eq!(
            compute_md5(f.path()).await.unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[tokio::test]
    async fn verify_passes_on_match() {
        let f = write_temp(b"hello world");
        verify_checksum(f.path(), HELLO_MD5).await.unwrap();
    }

    #[tokio::test]
    async fn verify_strips_quotes() {
        let f = write_temp(b"hello world");
        verify_checksum(f.path(), &format!("\"{HELLO_MD5}\""))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verify_fails_on_mismatch() {
        let f = write_temp(b"hello world");
        let err = verify_checksum(f.path(), "00000000000000000000000000000000")
            .await
            .unwrap_err();
        match err {
            DownloadError::ChecksumMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, "00000000000000000000000000000000");
                assert_eq!(actual, HELLO_MD5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn verify_skips_multipart_etag() {
        let f = write_temp(b"hello world");
        // Multipart ETags can never match a plain MD5; skipping means Ok.
        verify_checksum(f.path(), "\"abc123-42\"").await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = compute_md5(Path::new("/nonexistent/file")).await.unwrap_err();
        assert!(matches!(err, DownloadError::Io(_)));
    }
}
