use std::net::TcpListener;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use parapet_core::config::{AgentConfig, ChunkerConfig};
use parapet_core::repo::Repository;
use parapet_core::{agent, gc, reliability, HealthStatus};
use parapet_types::ParapetError;

#[derive(Parser)]
#[command(name = "parapet-agent", version, about = "parapet repository agent")]
struct Cli {
    /// Repository root directory
    #[arg(short, long)]
    repo: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository
    Init {
        /// Rolling-hash window in bytes
        #[arg(long)]
        window: Option<u32>,

        /// Minimum chunk size in bytes
        #[arg(long)]
        min_size: Option<u32>,

        /// Average (power-of-two) chunk size in bytes
        #[arg(long)]
        avg_size: Option<u32>,

        /// Maximum chunk size in bytes
        #[arg(long)]
        max_size: Option<u32>,
    },

    /// Serve the RPC dispatcher over a transport
    Serve {
        /// Speak the protocol on stdin/stdout (for transport wrappers)
        #[arg(long, conflicts_with = "listen")]
        stdio: bool,

        /// Accept TCP connections on this address, one at a time
        #[arg(long)]
        listen: Option<String>,

        /// Read-only RPC worker count
        #[arg(long, default_value_t = 4)]
        readers: usize,
    },

    /// Expire old versions and sweep unreferenced blocks
    Gc {
        #[arg(long)]
        retention_days: u32,

        /// Only report what would be removed
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Cross-check the catalog against the block store, verify a sample of
    /// stored records, and report host health
    Audit {
        /// Number of random versions to structurally verify
        #[arg(long, default_value_t = reliability::DEFAULT_RECORD_SAMPLE)]
        sample: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        error!("{e}");
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(err: &ParapetError) -> i32 {
    match err {
        ParapetError::Config(_) | ParapetError::UnsupportedVersion(_) => 2,
        ParapetError::Transport(_) | ParapetError::RetryExhausted { .. } => 3,
        ParapetError::AuthFailure
        | ParapetError::MalformedRecord(_)
        | ParapetError::HashMismatch { .. }
        | ParapetError::IntegrityViolation(_) => 4,
        ParapetError::CatalogConflict(_) => 5,
        _ => 1,
    }
}

fn run(cli: &Cli) -> parapet_types::Result<()> {
    match &cli.command {
        Commands::Init {
            window,
            min_size,
            avg_size,
            max_size,
        } => {
            let defaults = ChunkerConfig::default();
            let chunker = ChunkerConfig {
                window: window.unwrap_or(defaults.window),
                min_size: min_size.unwrap_or(defaults.min_size),
                avg_size: avg_size.unwrap_or(defaults.avg_size),
                max_size: max_size.unwrap_or(defaults.max_size),
            };
            Repository::init(&cli.repo, chunker)?;
            println!("Repository initialized at: {}", cli.repo.display());
            Ok(())
        }

        Commands::Serve {
            stdio,
            listen,
            readers,
        } => {
            let config = AgentConfig {
                reader_pool: (*readers).max(1),
            };
            if *stdio {
                let repo = Repository::open(&cli.repo)?;
                return agent::serve(repo, &config, std::io::stdin(), std::io::stdout());
            }
            let addr = listen.as_deref().ok_or_else(|| {
                ParapetError::Config("serve requires --stdio or --listen <addr>".into())
            })?;
            serve_tcp(&cli.repo, &config, addr)
        }

        Commands::Gc {
            retention_days,
            dry_run,
        } => {
            let mut repo = Repository::open(&cli.repo)?;
            let stats = gc::run(&mut repo.catalog, &repo.store, *retention_days, *dry_run)?;
            if *dry_run {
                println!(
                    "Dry run: would expire {} versions, free {} blocks ({} bytes)",
                    stats.expired_versions, stats.freed_blocks, stats.freed_bytes,
                );
            } else {
                println!(
                    "Expired {} versions, freed {} blocks ({} bytes)",
                    stats.expired_versions, stats.freed_blocks, stats.freed_bytes,
                );
            }
            Ok(())
        }

        Commands::Audit { sample } => {
            let repo = Repository::open(&cli.repo)?;

            // Host health first: a critically full or corrupt host taints
            // everything below.
            let health = reliability::health_check(&cli.repo, repo.catalog.integrity_check()?);
            match health.disk_status {
                HealthStatus::Unknown => {
                    println!("Disk: usage unavailable on this platform");
                }
                status => println!(
                    "Disk: {:.1}% used, {} free ({status:?})",
                    health.disk_used_percent,
                    format_bytes(health.disk_free_bytes),
                ),
            }
            for error in &health.catalog_errors {
                println!("CATALOG INTEGRITY: {error}");
            }
            if !health.catalog_ok {
                return Err(ParapetError::IntegrityViolation(format!(
                    "catalog failed its integrity check ({} problem(s))",
                    health.catalog_errors.len()
                )));
            }

            let report = gc::audit(&repo.catalog, &repo.store)?;
            for hash in &report.orphan_blocks {
                println!("orphan block (reclaimable): {}", hash.to_hex());
            }
            for (hash, stored, actual) in &report.refcount_drift {
                println!(
                    "refcount drift: {} stored={stored} actual={actual}",
                    hash.to_hex()
                );
            }
            for hash in &report.missing_blocks {
                println!("MISSING BLOCK: {}", hash.to_hex());
            }
            let clean = report.is_clean();
            report.into_result()?;

            // Structural scan of sampled versions: every referenced block
            // present, sized as recorded, carrying a known codec flag.
            let records = reliability::verify_records(&repo.catalog, &repo.store, *sample)?;
            for failure in &records.failures {
                println!(
                    "RECORD CHECK FAILED: '{}' version {}: {}",
                    failure.path, failure.version_id, failure.detail
                );
            }
            println!(
                "Record checks: {}/{} sampled versions ok",
                records.versions_ok, records.sampled
            );
            records.into_result()?;

            if clean {
                println!("Audit clean.");
            }
            Ok(())
        }
    }
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

/// Accept connections one at a time, each with a freshly opened repository.
/// A dropped connection releases everything at the next safe point; the next
/// client gets a clean agent.
fn serve_tcp(repo_root: &std::path::Path, config: &AgentConfig, addr: &str) -> parapet_types::Result<()> {
    let listener = TcpListener::bind(addr)
        .map_err(|e| ParapetError::Config(format!("cannot listen on {addr}: {e}")))?;
    info!("listening on {addr}");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("connection from {peer}");

        let repo = Repository::open(repo_root)?;
        let reader = stream.try_clone()?;
        match agent::serve(repo, config, reader, stream) {
            Ok(()) => info!("connection from {peer} closed"),
            Err(e) => error!("connection from {peer} failed: {e}"),
        }
    }
    Ok(())
}
