//! Interactive bucket browser, used when no path is given on the command
//! line.

use crate::download::relative_key_path;
use crate::error::DownloadError;
use crate::orchestrator::Downloader;
use crate::output::format_size;
use crate::progress::ProgressTracker;
use std::fmt::Write as _;
use tokio::io::{AsyncBufReadExt, BufReader};

/// One parsed menu command.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    /// Enter the n-th listed folder (1-based).
    Enter(usize),
    /// Download the n-th listed file (1-based).
    Download(usize),
    /// Download everything under the current prefix.
    All,
    /// Go up one level.
    Back,
    Quit,
    Invalid,
}

fn parse_command(input: &str, folder_count: usize, file_count: usize) -> Command {
    let input = input.trim();
    match input {
        "a" | "A" => return Command::All,
        "b" | "B" => return Command::Back,
        "q" | "Q" | "" => return Command::Quit,
        _ => {}
    }

    if let Some(rest) = input.strip_prefix(['d', 'D']) {
        return match rest.trim().parse::<usize>() {
            Ok(n) if n >= 1 && n <= file_count => Command::Download(n),
            _ => Command::Invalid,
        };
    }
    match input.parse::<usize>() {
        Ok(n) if n >= 1 && n <= folder_count => Command::Enter(n),
        _ => Command::Invalid,
    }
}

fn render_menu(bucket: &str, prefix: &str, folders: &[String], files: &[String]) -> String {
    let mut out = format!("\nLocation: s3://{bucket}/{prefix}\n");
    for (i, folder) in folders.iter().enumerate() {
        let _ = writeln!(out, "  {:>3}  {folder}/", i + 1);
    }
    for (i, file) in files.iter().enumerate() {
        let _ = writeln!(out, "  d{:>2}  {file}", i + 1);
    }
    if folders.is_empty() && files.is_empty() {
        out.push_str("  (empty)\n");
    }
    out.push_str(
        "\nEnter a number to open a folder, d<number> to download a file,\n\
         'a' to download everything here, 'b' to go back, 'q' to quit.\n> ",
    );
    out
}

/// Runs the browser loop until the user quits or picks a bulk download.
///
/// Returns the prefix to bulk-download when the user chose `a`, or `None`
/// when they quit. Single-file downloads (`d<n>`) run in place.
pub async fn browse(
    downloader: &Downloader,
    tracker: &ProgressTracker,
    start_prefix: &str,
) -> Result<Option<String>, DownloadError> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stack: Vec<String> = Vec::new();

    loop {
        let prefix = format!("{start_prefix}{}", stack.join(""));
        let (folders, files) = downloader.list_contents(&prefix).await?;

        print!(
            "{}",
            render_menu(downloader.bucket(), &prefix, &folders, &files)
        );
        use std::io::Write;
        let _ = std::io::stdout().flush();

        let line = match stdin.next_line().await? {
            Some(line) => line,
            None => return Ok(None),
        };

        match parse_command(&line, folders.len(), files.len()) {
            Command::Enter(n) => stack.push(format!("{}/", folders[n - 1])),
            Command::Download(n) => {
                let key = format!("{prefix}{}", files[n - 1]);
                // Fetch the descriptor so the download can be verified.
                let matches = downloader.list_all_objects(&key).await?;
                let Some(obj) = matches.into_iter().find(|o| o.key == key) else {
                    println!("File {key} no longer exists.");
                    continue;
                };

                let rel = relative_key_path(&obj.key, start_prefix);
                if tracker.is_complete(&rel) {
                    println!("{} already downloaded, skipping.", files[n - 1]);
                    continue;
                }

                println!("Downloading {} ({})...", files[n - 1], format_size(obj.size));
                let result = downloader
                    .download_file(&obj, start_prefix, tracker, true)
                    .await;
                match result.error {
                    None => println!("Done."),
                    Some(error) => println!("Download failed: {error}"),
                }
            }
            Command::All => return Ok(Some(prefix)),
            Command::Back => {
                if stack.pop().is_none() {
                    println!("Already at the top level.");
                }
            }
            Command::Quit => return Ok(None),
            Command::Invalid => println!("Unrecognized command: {}", line.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_within_bounds() {
        assert_eq!(parse_command("2", 3, 1), Command::Enter(2));
        assert_eq!(parse_command("4", 3, 1), Command::Invalid);
        assert_eq!(parse_command("d1", 3, 1), Command::Download(1));
        assert_eq!(parse_command("D 1", 3, 1), Command::Download(1));
        assert_eq!(parse_command("d2", 3, 1), Command::Invalid);
        assert_eq!(parse_command("a", 0, 0), Command::All);
        assert_eq!(parse_command("b", 0, 0), Command::Back);
        assert_eq!(parse_command("q", 0, 0), Command::Quit);
        assert_eq!(parse_command("", 0, 0), Command::Quit);
        assert_eq!(parse_command("xyz", 3, 3), Command::Invalid);
        assert_eq!(parse_command("0", 3, 3), Command::Invalid);
    }

    #[test]
    fn menu_numbers_folders_and_files() {
        let menu = render_menu(
            "bucket",
            "dois/",
            &["2024".into()],
            &["readme.txt".into()],
        );
        assert!(menu.contains("s3://bucket/dois/"));
        assert!(menu.contains("  1  2024/"));
        assert!(menu.contains("d 1  readme.txt"));

        let empty = render_menu("bucket", "", &[], &[]);
        assert!(empty.contains("(empty)"));
    }
}
