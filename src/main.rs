use clap::Parser;
use datacite_dl::auth::CredentialManager;
use datacite_dl::config::{self, FileConfig, Settings};
use datacite_dl::download::{parse_size, DownloadFilters, DownloadResult};
use datacite_dl::error::DownloadError;
use datacite_dl::orchestrator::{Downloader, MAX_WORKERS};
use datacite_dl::progress::ProgressTracker;
use datacite_dl::retry::RetryPolicy;
use datacite_dl::storage::DEFAULT_BUCKET;
use datacite_dl::{interactive, output};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const EXIT_SUCCESS: i32 = 0;
const EXIT_AUTH_FAILURE: i32 = 1;
const EXIT_NETWORK_ERROR: i32 = 2;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_PARTIAL_FAILURE: i32 = 4;
const EXIT_CANCELLED: i32 = 5;

/// Confirmation threshold for bulk downloads.
const CONFIRM_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "datacite-dl")]
#[command(about = "Download DataCite monthly data files from S3", long_about = None)]
#[command(version)]
struct Cli {
    /// Bucket path to download (e.g. "dois/2024/"). Omit for interactive
    /// browsing.
    path: Option<String>,

    /// DataCite account name
    #[arg(short, long, help_heading = "Authentication")]
    username: Option<String>,

    /// DataCite account password
    #[arg(short, long, help_heading = "Authentication")]
    password: Option<String>,

    /// Output directory for downloaded files
    #[arg(short, long, help_heading = "Output")]
    output: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human output
    #[arg(long, help_heading = "Output")]
    json: bool,

    /// Suppress progress bars and non-warning logs
    #[arg(short, long, help_heading = "Output")]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long, help_heading = "Output")]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long, value_name = "FILE", help_heading = "Output")]
    log_file: Option<PathBuf>,

    /// Download everything in the bucket
    #[arg(long, conflicts_with = "path", help_heading = "Download")]
    all: bool,

    /// List the contents of the path and exit
    #[arg(long, help_heading = "Download")]
    list: bool,

    /// Show what would be downloaded without fetching anything
    #[arg(long, help_heading = "Download")]
    dry_run: bool,

    /// Discard the checkpoint and start over
    #[arg(long, conflicts_with = "resume", help_heading = "Download")]
    fresh: bool,

    /// Resume from the checkpoint (the default)
    #[arg(long, help_heading = "Download")]
    resume: bool,

    /// Skip MD5 verification of downloaded files
    #[arg(long, help_heading = "Download")]
    skip_verify: bool,

    /// Answer yes to confirmation prompts
    #[arg(short = 'y', long, help_heading = "Download")]
    yes: bool,

    /// Only download files whose name matches a glob (repeatable)
    #[arg(long, value_name = "GLOB", help_heading = "Filtering")]
    include: Vec<String>,

    /// Skip files whose name matches a glob (repeatable)
    #[arg(long, value_name = "GLOB", help_heading = "Filtering")]
    exclude: Vec<String>,

    /// Skip files larger than this (e.g. "500MB", "1.5GB")
    #[arg(long, value_name = "SIZE", help_heading = "Filtering")]
    max_size: Option<String>,

    /// Retry attempts per file
    #[arg(long, help_heading = "Reliability")]
    retries: Option<u32>,

    /// Minutes between credential refreshes
    #[arg(long, value_name = "MINUTES", help_heading = "Reliability")]
    refresh_interval: Option<u64>,

    /// Concurrent download workers (capped at 32)
    #[arg(short, long, help_heading = "Performance")]
    workers: Option<usize>,

    /// Override the S3 bucket name
    #[arg(long, help_heading = "Advanced")]
    bucket: Option<String>,
}

fn init_logging(cli: &Cli) -> Result<(), DownloadError> {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("datacite_dl={level}")));

    match &cli.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn resolve_settings(cli: &Cli) -> Result<Settings, DownloadError> {
    let file = FileConfig::discover()?;

    let username = config::resolve(
        cli.username.clone(),
        config::env_var(config::ENV_USERNAME),
        file.username,
        String::new(),
    );
    let password = config::resolve(
        cli.password.clone(),
        config::env_var(config::ENV_PASSWORD),
        file.password,
        String::new(),
    );
    if username.is_empty() || password.is_empty() {
        return Err(DownloadError::Authentication(format!(
            "username and password are required (flags, {}/{}, or the config file)",
            config::ENV_USERNAME,
            config::ENV_PASSWORD
        )));
    }

    let env_refresh = config::env_var(config::ENV_REFRESH_INTERVAL)
        .map(|v| {
            v.parse::<u64>().map_err(|_| {
                DownloadError::InvalidArgument(format!(
                    "{} must be a number of minutes, got `{v}`",
                    config::ENV_REFRESH_INTERVAL
                ))
            })
        })
        .transpose()?;
    let refresh_minutes = config::resolve(
        cli.refresh_interval,
        env_refresh,
        file.refresh_interval,
        config::DEFAULT_REFRESH_MINUTES,
    );

    let max_size = cli.max_size.as_deref().map(parse_size).transpose()?;

    Ok(Settings {
        username,
        password,
        output_dir: config::resolve(
            cli.output.clone(),
            None,
            file.output_dir,
            PathBuf::from("."),
        ),
        bucket: config::resolve(
            cli.bucket.clone(),
            None,
            file.bucket,
            DEFAULT_BUCKET.to_string(),
        ),
        retries: config::resolve(cli.retries, None, file.retries, 3),
        refresh_interval: Duration::from_secs(refresh_minutes * 60),
        workers: config::resolve(cli.workers, None, file.workers, 4).clamp(1, MAX_WORKERS),
        skip_verify: cli.skip_verify,
        fresh: cli.fresh,
        include: cli.include.clone(),
        exclude: cli.exclude.clone(),
        max_size,
        assume_yes: cli.yes,
    })
}

fn error_exit_code(err: &DownloadError) -> i32 {
    match err {
        DownloadError::Authentication(_) => EXIT_AUTH_FAILURE,
        _ => EXIT_NETWORK_ERROR,
    }
}

fn error_category(code: i32) -> &'static str {
    match code {
        EXIT_AUTH_FAILURE => "auth_failure",
        EXIT_NOT_FOUND => "not_found",
        EXIT_PARTIAL_FAILURE => "partial_failure",
        EXIT_CANCELLED => "cancelled",
        _ => "network_error",
    }
}

fn fail(err: &DownloadError, json: bool) -> i32 {
    let code = error_exit_code(err);
    eprintln!(
        "{}",
        output::format_error(error_category(code), &err.to_string(), json)
    );
    code
}

/// Normalizes the command-line path into a listing prefix. A path that does
/// not name an exact object is treated as a folder.
async fn resolve_prefix(downloader: &Downloader, path: &str) -> Result<String, DownloadError> {
    let path = path.trim_start_matches('/');
    if path.is_empty() || path.ends_with('/') {
        return Ok(path.to_string());
    }
    let matches = downloader.list_all_objects(path).await?;
    if matches.iter().any(|o| o.key == path) {
        Ok(path.to_string())
    } else {
        Ok(format!("{path}/"))
    }
}

fn confirm_large_download(total_bytes: u64, count: usize, settings_yes: bool, quiet: bool) -> bool {
    if total_bytes < CONFIRM_BYTES || settings_yes || quiet || !std::io::stdin().is_terminal() {
        return true;
    }
    print!(
        "About to download {count} files ({}). Continue? [y/N] ",
        output::format_size(total_bytes)
    );
    use std::io::Write;
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

async fn run(cli: Cli) -> i32 {
    let settings = match resolve_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => return fail(&e, cli.json),
    };

    let manager = Arc::new(
        CredentialManager::with_intervals(
            &settings.username,
            &settings.password,
            settings.refresh_interval,
            datacite_dl::auth::DEFAULT_CREDENTIAL_LIFETIME,
        ),
    );
    // Authenticate up front so credential problems surface before any
    // listing or download work.
    if let Err(e) = manager.ensure_fresh().await {
        return fail(&e, cli.json);
    }

    let policy = RetryPolicy::new(settings.retries);
    let downloader = Downloader::new(
        Arc::clone(&manager),
        settings.bucket.clone(),
        settings.output_dir.clone(),
        policy,
        settings.skip_verify,
    );

    let prefix = if cli.all {
        String::new()
    } else {
        match &cli.path {
            Some(path) => match resolve_prefix(&downloader, path).await {
                Ok(prefix) => prefix,
                Err(e) => return fail(&e, cli.json),
            },
            None => String::new(),
        }
    };

    if cli.list {
        return match downloader.list_contents(&prefix).await {
            Ok((folders, files)) => {
                println!(
                    "{}",
                    output::format_list(&prefix, &folders, &files, cli.json)
                );
                EXIT_SUCCESS
            }
            Err(e) => fail(&e, cli.json),
        };
    }

    let tracker = match ProgressTracker::load(&settings.output_dir) {
        Ok(tracker) => Arc::new(tracker),
        Err(e) => return fail(&e, cli.json),
    };
    if settings.fresh {
        if let Err(e) = tracker.clear() {
            return fail(&e, cli.json);
        }
        info!("Checkpoint cleared, starting fresh");
    } else if cli.resume {
        let stats = tracker.stats();
        info!("Resuming: {} files already completed", stats.files_completed);
    }

    // No path and no --all: browse interactively, unless scripting output
    // was requested.
    let prefix = if cli.path.is_none() && !cli.all {
        if cli.json {
            let e = DownloadError::InvalidArgument(
                "--json requires a path or --all; interactive mode is not scriptable".to_string(),
            );
            return fail(&e, cli.json);
        }
        if !std::io::stdin().is_terminal() {
            let e = DownloadError::InvalidArgument(
                "no path given and stdin is not a terminal; pass a path or --all".to_string(),
            );
            return fail(&e, cli.json);
        }
        match interactive::browse(&downloader, tracker.as_ref(), &prefix).await {
            Ok(Some(chosen)) => chosen,
            Ok(None) => return EXIT_SUCCESS,
            Err(e) => return fail(&e, cli.json),
        }
    } else {
        prefix
    };

    let filters = match DownloadFilters::new(&settings.include, &settings.exclude, settings.max_size)
    {
        Ok(filters) => filters,
        Err(e) => return fail(&e, cli.json),
    };

    let (objects, skipped) = match downloader
        .build_download_list(&prefix, &filters, tracker.as_ref())
        .await
    {
        Ok(listing) => listing,
        Err(e) => return fail(&e, cli.json),
    };

    if objects.is_empty() {
        if skipped > 0 {
            // Everything was already downloaded or filtered out.
            let line = output::format_success(0, 0, Duration::ZERO, skipped, 0, cli.json);
            println!("{line}");
            return EXIT_SUCCESS;
        }
        eprintln!(
            "{}",
            output::format_error(
                error_category(EXIT_NOT_FOUND),
                &format!("no files found under `{prefix}`"),
                cli.json
            )
        );
        return EXIT_NOT_FOUND;
    }

    let total_bytes: u64 = objects.iter().map(|o| o.size).sum();

    if cli.dry_run {
        if cli.json {
            let keys: Vec<&str> = objects.iter().map(|o| o.key.as_str()).collect();
            println!(
                "{}",
                serde_json::json!({
                    "status": "dry_run",
                    "files": keys,
                    "skipped": skipped,
                    "bytes": total_bytes,
                })
            );
        } else {
            for obj in &objects {
                println!("{}  {}", output::format_size(obj.size), obj.key);
            }
            println!(
                "Would download {} files ({}), {skipped} skipped",
                objects.len(),
                output::format_size(total_bytes)
            );
        }
        return EXIT_SUCCESS;
    }

    if !confirm_large_download(total_bytes, objects.len(), settings.assume_yes, cli.quiet) {
        println!("Aborted.");
        return EXIT_CANCELLED;
    }

    let show_progress = !cli.quiet && !cli.json && std::io::stderr().is_terminal();
    let started = Instant::now();

    let results: Vec<DownloadResult> = tokio::select! {
        results = async {
            if settings.workers == 1 {
                downloader
                    .download_sequential(&objects, &prefix, tracker.as_ref(), show_progress)
                    .await
            } else {
                downloader
                    .download_parallel(
                        &objects,
                        &prefix,
                        Arc::clone(&tracker),
                        settings.workers,
                        show_progress,
                    )
                    .await
            }
        } => results,
        _ = tokio::signal::ctrl_c() => {
            // Completed files are already checkpointed; a rerun resumes.
            eprintln!(
                "{}",
                output::format_error(
                    error_category(EXIT_CANCELLED),
                    "interrupted, partial progress saved",
                    cli.json
                )
            );
            return EXIT_CANCELLED;
        }
    };

    let failed = results.iter().filter(|r| !r.success).count();
    let downloaded = results.len() - failed;
    let downloaded_bytes: u64 = results
        .iter()
        .filter(|r| r.success)
        .map(|r| r.size)
        .sum();

    println!(
        "{}",
        output::format_success(
            downloaded,
            downloaded_bytes,
            started.elapsed(),
            skipped,
            failed,
            cli.json
        )
    );

    if failed > 0 {
        for result in results.iter().filter(|r| !r.success) {
            if let Some(error) = &result.error {
                eprintln!("  {}: {error}", result.key);
            }
        }
        return EXIT_PARTIAL_FAILURE;
    }
    EXIT_SUCCESS
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("Error: {e}");
        std::process::exit(EXIT_NETWORK_ERROR);
    }
    let code = run(cli).await;
    std::process::exit(code);
}
