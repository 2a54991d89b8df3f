use std::path::PathBuf;

use clap::{Parser, Subcommand};

use dust_core::commands::{info, restore, sync};
use dust_core::config::{ChunkerConfig, DEFAULT_MAX_CHUNK_KB};
use dust_core::manifest::{VersionQuery, VersionStatus};
use dust_core::remote::http::HttpRemote;

#[derive(Parser)]
#[command(
    name = "dust",
    version,
    about = "Encrypted, deduplicated, versioned single-file backups on permanent storage",
    after_help = "\
Environment variables:
  DUST_PASSPHRASE   Encryption passphrase (skips interactive prompt)
  DUST_GATEWAY      Remote gateway base URL
  DUST_TOKEN        Bearer token for the gateway"
)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk, encrypt, and upload a file, recording a new version
    Upload {
        /// File to back up
        file: PathBuf,

        /// Passphrase (falls back to $DUST_PASSPHRASE, then a prompt)
        passphrase: Option<String>,

        /// Maximum chunk size in KiB before encryption
        #[arg(default_value_t = DEFAULT_MAX_CHUNK_KB)]
        chunk_kb: u32,

        /// Gateway base URL (falls back to $DUST_GATEWAY)
        #[arg(long)]
        gateway: Option<String>,
    },

    /// Reconstruct a version of a file from its manifest
    Restore {
        /// Manifest path (.sync.dust or legacy .dust)
        manifest: PathBuf,

        /// Version number, or "latest"
        #[arg(default_value = "latest")]
        version: String,

        /// Passphrase (falls back to $DUST_PASSPHRASE, then a prompt)
        passphrase: Option<String>,

        /// Gateway base URL (falls back to $DUST_GATEWAY)
        #[arg(long)]
        gateway: Option<String>,

        /// Directory for the restored file (default: next to the manifest)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// List the versions recorded in a manifest
    Versions {
        /// Manifest path
        manifest: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Upload {
            file,
            passphrase,
            chunk_kb,
            gateway,
        } => run_upload(file, passphrase, chunk_kb, gateway),
        Commands::Restore {
            manifest,
            version,
            passphrase,
            gateway,
            output_dir,
        } => run_restore(manifest, version, passphrase, gateway, output_dir),
        Commands::Versions { manifest } => run_versions(manifest),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn get_passphrase(arg: Option<String>) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(pass) = arg {
        return Ok(pass);
    }
    if let Ok(pass) = std::env::var("DUST_PASSPHRASE") {
        if !pass.is_empty() {
            return Ok(pass);
        }
    }
    Ok(rpassword::prompt_password("Enter passphrase: ")?)
}

fn get_remote(arg: Option<String>) -> Result<HttpRemote, Box<dyn std::error::Error>> {
    let gateway = arg
        .or_else(|| std::env::var("DUST_GATEWAY").ok().filter(|g| !g.is_empty()))
        .ok_or("no gateway configured; pass --gateway or set DUST_GATEWAY")?;
    let token = std::env::var("DUST_TOKEN").ok().filter(|t| !t.is_empty());
    Ok(HttpRemote::new(&gateway, token.as_deref()))
}

fn run_upload(
    file: PathBuf,
    passphrase: Option<String>,
    chunk_kb: u32,
    gateway: Option<String>,
) -> CliResult {
    let passphrase = get_passphrase(passphrase)?;
    let remote = get_remote(gateway)?;

    let mut request = sync::SyncRequest::new(&file, &passphrase);
    request.chunker = ChunkerConfig::from_max_kb(chunk_kb)?;

    let outcome = sync::run(&request, &remote)?;

    if outcome.up_to_date {
        println!(
            "Already up to date (version {}, {} chunks).",
            outcome.version, outcome.chunks_total
        );
        return Ok(());
    }
    println!(
        "Version {} completed: {} chunks ({} uploaded, {} deduplicated, {} resumed), {} uploaded.",
        outcome.version,
        outcome.chunks_total,
        outcome.chunks_uploaded,
        outcome.chunks_deduplicated,
        outcome.chunks_resumed,
        format_bytes(outcome.bytes_uploaded),
    );
    Ok(())
}

fn run_restore(
    manifest: PathBuf,
    version: String,
    passphrase: Option<String>,
    gateway: Option<String>,
    output_dir: Option<PathBuf>,
) -> CliResult {
    let query = if version.eq_ignore_ascii_case("latest") {
        VersionQuery::Latest
    } else {
        let n: u32 = version
            .parse()
            .map_err(|_| format!("invalid version '{version}': expected a number or \"latest\""))?;
        VersionQuery::Number(n)
    };

    let passphrase = get_passphrase(passphrase)?;
    let remote = get_remote(gateway)?;

    let mut request = restore::RestoreRequest::new(&manifest, &passphrase);
    request.version = query;
    request.output_dir = output_dir.as_deref();

    let outcome = restore::run(&request, &remote)?;

    println!(
        "Restored version {} to {} ({} chunks, {}).",
        outcome.version,
        outcome.output.display(),
        outcome.chunks,
        format_bytes(outcome.bytes_written),
    );
    if !outcome.file_hash_verified {
        eprintln!("Warning: restored file hash does not match the recorded hash.");
    }
    Ok(())
}

fn run_versions(manifest: PathBuf) -> CliResult {
    let summary = info::run(&manifest)?;

    println!(
        "{} — {} pool entries",
        summary.filename, summary.pool_entries
    );
    for v in &summary.versions {
        let status = match v.status {
            VersionStatus::Completed => "completed",
            VersionStatus::Pending => "pending",
        };
        println!(
            "  v{:<4} {}  {:>10}  {:>9}  {}/{} chunks",
            v.version,
            v.timestamp.format("%Y-%m-%d %H:%M:%S"),
            status,
            format_bytes(v.total_size),
            v.chunks_assigned,
            v.chunks_total,
        );
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
