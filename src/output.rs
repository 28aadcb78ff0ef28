//! Human- and machine-readable output formatting.
//!
//! Every user-facing message has two renditions: a plain one for terminals
//! and a single-line JSON document for scripting.

use std::time::Duration;

/// Formats a byte count with a binary-unit suffix.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Formats a duration as whole seconds, minutes, or hours.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Summary printed after a download run.
pub fn format_success(
    downloaded: usize,
    total_bytes: u64,
    elapsed: Duration,
    skipped: usize,
    failed: usize,
    json: bool,
) -> String {
    if json {
        serde_json::json!({
            "status": if failed == 0 { "success" } else { "partial" },
            "downloaded": downloaded,
            "skipped": skipped,
            "failed": failed,
            "bytes": total_bytes,
            "elapsed_seconds": elapsed.as_secs(),
        })
        .to_string()
    } else {
        let mut line = format!(
            "Downloaded {downloaded} files ({}) in {}",
            format_size(total_bytes),
            format_duration(elapsed)
        );
        if skipped > 0 {
            line.push_str(&format!(", {skipped} skipped"));
        }
        if failed > 0 {
            line.push_str(&format!(", {failed} FAILED"));
        }
        line
    }
}

/// An error rendered for the user, with its exit-code category name.
pub fn format_error(category: &str, message: &str, json: bool) -> String {
    if json {
        serde_json::json!({
            "status": "error",
            "error": category,
            "message": message,
        })
        .to_string()
    } else {
        format!("Error: {message}")
    }
}

/// Directory-style listing of one prefix level.
pub fn format_list(prefix: &str, folders: &[String], files: &[String], json: bool) -> String {
    if json {
        return serde_json::json!({
            "prefix": prefix,
            "folders": folders,
            "files": files,
        })
        .to_string();
    }

    let location = if prefix.is_empty() { "/" } else { prefix };
    let mut out = format!("Contents of {location}:\n");
    for folder in folders {
        out.push_str(&format!("  {folder}/\n"));
    }
    for file in files {
        out.push_str(&format!("  {file}\n"));
    }
    if folders.is_empty() && files.is_empty() {
        out.push_str("  (empty)\n");
    }
    out
}
