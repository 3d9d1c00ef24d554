mod config;
mod watch;

use std::collections::HashSet;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use zeroize::Zeroizing;

use parapet_core::client::{delta, restore, verify, Connection};
use parapet_core::crypto::{SealKey, Sealer, SALT_LEN};
use parapet_core::HealthStatus;
use parapet_types::{Action, ParapetError, Result, VersionId};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "parapet", version, about = "Continuous, versioned, encrypted backups",
    after_help = "\
Configuration file lookup order:
  1. --config <path>     (explicit flag)
  2. $PARAPET_CONFIG     (environment variable)
  3. ./parapet.yaml      (working directory)

Environment variables:
  PARAPET_CONFIG       Path to configuration file
  PARAPET_PASSPHRASE   Repository passphrase (skips interactive prompt)")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Commit files or directories as new versions
    Backup {
        /// Paths to back up, relative to source_root
        paths: Vec<String>,
    },

    /// Watch the source tree and commit changes continuously
    Watch,

    /// List files known to the repository
    List {
        /// Only paths under this prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// List all versions of one path
    Versions { path: String },

    /// Restore one version of a path
    Restore {
        path: String,

        /// Version to restore (default: newest non-deleted version)
        #[arg(long)]
        version_id: Option<i64>,

        /// Output file (default: the path's basename in the working directory)
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Remove a single version from history
    DeleteVersion {
        #[arg(long)]
        version_id: i64,
    },

    /// Expire old versions and free unreferenced blocks
    Gc {
        /// Retention horizon in days (default from config)
        #[arg(long)]
        retention_days: Option<u32>,

        /// Only show what would be removed
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Restore a random sample of versions to verify they are recoverable
    Verify {
        /// Number of versions to test
        #[arg(long, default_value_t = verify::DEFAULT_RESTORE_SAMPLE)]
        sample: usize,
    },

    /// Show repository aggregates and agent health
    Stats,

    /// Generate a minimal configuration file
    Config {
        #[arg(short, long, default_value = "parapet.yaml")]
        dest: String,
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

    if let Commands::Config { dest } = &cli.command {
        if let Err(e) = generate_config(dest) {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
        return;
    }

    let config_path = match config::resolve_config_path(cli.config.as_deref()) {
        Some(p) => p,
        None => {
            eprintln!("Error: no configuration file found.");
            eprintln!("Run `parapet config` to generate a starter config file.");
            std::process::exit(2);
        }
    };
    let config = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(&cli, &config) {
        eprintln!("Error: {e}");
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

fn generate_config(dest: &str) -> Result<()> {
    let path = Path::new(dest);
    if path.exists() {
        return Err(ParapetError::Config(format!("file already exists: {dest}")));
    }
    std::fs::write(path, config::minimal_config_template())?;
    println!("Config written to: {dest}");
    Ok(())
}

fn connect(config: &CliConfig) -> Result<Connection> {
    let stream = TcpStream::connect(&config.agent_addr).map_err(|e| {
        ParapetError::Transport(format!("cannot reach agent at {}: {e}", config.agent_addr))
    })?;
    let reader = stream.try_clone().map_err(|e| {
        ParapetError::Transport(format!("cannot split connection: {e}"))
    })?;
    Connection::establish(reader, stream, config.client.clone())
}

fn get_passphrase(config: &CliConfig) -> Result<Zeroizing<String>> {
    if let Some(ref p) = config.passphrase {
        return Ok(Zeroizing::new(p.clone()));
    }
    if let Some(ref cmd) = config.passcommand {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .map_err(|e| ParapetError::Config(format!("passcommand failed to run: {e}")))?;
        if !output.status.success() {
            return Err(ParapetError::Config(format!(
                "passcommand failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let pass = String::from_utf8(output.stdout)
            .map_err(|_| ParapetError::Config("passcommand output is not UTF-8".into()))?;
        return Ok(Zeroizing::new(pass.trim().to_string()));
    }
    if let Ok(pass) = std::env::var("PARAPET_PASSPHRASE") {
        if !pass.is_empty() {
            return Ok(Zeroizing::new(pass));
        }
    }
    let pass = rpassword::prompt_password("Enter passphrase: ")
        .map_err(|e| ParapetError::Config(format!("cannot prompt for passphrase: {e}")))?;
    Ok(Zeroizing::new(pass))
}

/// Derive the seal key from the passphrase and the parameters the agent
/// announced in its hello frame.
fn make_sealer(conn: &Connection, config: &CliConfig) -> Result<Sealer> {
    let manifest = conn.manifest();
    if manifest.kdf_salt.len() != SALT_LEN {
        return Err(ParapetError::Config(format!(
            "agent announced a {}-byte salt, expected {SALT_LEN}",
            manifest.kdf_salt.len()
        )));
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&manifest.kdf_salt);
    let iterations = manifest.kdf_iterations;

    let passphrase = get_passphrase(config)?;
    let key = SealKey::derive(passphrase.as_bytes(), &salt, iterations)?;
    Ok(Sealer::new(&key))
}

fn source_root(config: &CliConfig) -> Result<PathBuf> {
    match &config.source_root {
        Some(root) => Ok(PathBuf::from(root)),
        None => Err(ParapetError::Config(
            "source_root is not set in the configuration".into(),
        )),
    }
}

fn run(cli: &Cli, config: &CliConfig) -> Result<()> {
    match &cli.command {
        Commands::Backup { paths } => {
            let conn = connect(config)?;
            let sealer = make_sealer(&conn, config)?;
            run_backup(&conn, &sealer, config, paths)
        }
        Commands::Watch => {
            let conn = connect(config)?;
            let sealer = make_sealer(&conn, config)?;
            watch::run(&conn, &sealer, config, &source_root(config)?)
        }
        Commands::List { prefix } => {
            let conn = connect(config)?;
            let files = conn.list_files(prefix.as_deref())?;
            if files.is_empty() {
                println!("No files recorded.");
                return Ok(());
            }
            for file in files {
                println!(
                    "{:>10}  {:<8}  {}",
                    format_bytes(file.current_size),
                    file.last_action,
                    file.path,
                );
            }
            Ok(())
        }
        Commands::Versions { path } => {
            let conn = connect(config)?;
            let versions = conn.list_versions(path)?;
            if versions.is_empty() {
                println!("No versions for '{path}'.");
                return Ok(());
            }
            for v in versions {
                let hash = v
                    .content_hash
                    .map(|h| h.to_hex()[..16].to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>6}  {}  {:<8}  {:>10}  {}",
                    v.version_id,
                    format_timestamp(v.timestamp_us),
                    v.action,
                    format_bytes(v.plain_size),
                    hash,
                );
            }
            Ok(())
        }
        Commands::Restore {
            path,
            version_id,
            dest,
        } => {
            let conn = connect(config)?;
            let sealer = make_sealer(&conn, config)?;
            run_restore(&conn, &sealer, path, *version_id, dest.as_deref())
        }
        Commands::DeleteVersion { version_id } => {
            let conn = connect(config)?;
            conn.delete_version(VersionId(*version_id))?;
            println!("Deleted version {version_id}.");
            Ok(())
        }
        Commands::Gc {
            retention_days,
            dry_run,
        } => {
            let conn = connect(config)?;
            let days = retention_days.unwrap_or(config.retention_days);
            let result = conn.gc(days, *dry_run)?;
            if *dry_run {
                println!(
                    "Dry run: would expire {} versions and free {} blocks ({})",
                    result.expired_versions,
                    result.freed_blocks,
                    format_bytes(result.freed_bytes),
                );
            } else {
                println!(
                    "Expired {} versions, freed {} blocks ({})",
                    result.expired_versions,
                    result.freed_blocks,
                    format_bytes(result.freed_bytes),
                );
            }
            Ok(())
        }
        Commands::Verify { sample } => {
            let conn = connect(config)?;
            let sealer = make_sealer(&conn, config)?;
            let stats = verify::run_sampled_restore_tests(&conn, &sealer, *sample)?;
            for failure in &stats.failures {
                println!(
                    "FAILED: '{}' version {}: {}",
                    failure.path, failure.version_id, failure.error
                );
            }
            if stats.ok > 0 {
                println!(
                    "Verified {}/{} sampled restores ({} ms average)",
                    stats.ok,
                    stats.total,
                    stats.total_time_ms / stats.ok,
                );
            } else if stats.total == 0 {
                println!("Nothing to verify.");
            }
            stats.into_result().map(|_| ())
        }
        Commands::Stats => {
            let conn = connect(config)?;
            let (stats, health) = conn.stats_full()?;
            println!("Files:          {}", stats.file_count);
            println!("Versions:       {}", stats.version_count);
            println!("Chunks:         {}", stats.chunk_count);
            println!("Logical size:   {}", format_bytes(stats.total_plain_bytes));
            println!("Stored size:    {}", format_bytes(stats.total_stored_bytes));
            if stats.total_stored_bytes > 0 {
                let ratio = stats.total_plain_bytes as f64 / stats.total_stored_bytes as f64;
                println!("Dedup ratio:    {ratio:.2}x");
            }
            match health.disk_status {
                HealthStatus::Unknown => println!("Agent disk:     unavailable"),
                status => println!(
                    "Agent disk:     {:.1}% used, {} free ({status:?})",
                    health.disk_used_percent,
                    format_bytes(health.disk_free_bytes),
                ),
            }
            if health.catalog_ok {
                println!("Catalog:        integrity ok");
            } else {
                for error in &health.catalog_errors {
                    println!("Catalog:        INTEGRITY ERROR: {error}");
                }
                return Err(ParapetError::IntegrityViolation(format!(
                    "agent catalog failed its integrity check ({} problem(s))",
                    health.catalog_errors.len()
                )));
            }
            Ok(())
        }
        Commands::Config { .. } => unreachable!(),
    }
}

fn run_backup(
    conn: &Connection,
    sealer: &Sealer,
    config: &CliConfig,
    paths: &[String],
) -> Result<()> {
    let root = source_root(config)?;
    let known: HashSet<String> = conn
        .list_files(None)?
        .into_iter()
        .filter(|f| f.last_action != Action::Deleted)
        .map(|f| f.path)
        .collect();

    let mut files = Vec::new();
    let targets: Vec<String> = if paths.is_empty() {
        vec![String::new()]
    } else {
        paths.to_vec()
    };
    for target in &targets {
        collect_files(&root, Path::new(target), &mut files)?;
    }
    if files.is_empty() {
        println!("Nothing to back up.");
        return Ok(());
    }

    let mut committed = 0u64;
    let mut uploaded_bytes = 0u64;
    for rel in &files {
        let action = if known.contains(rel) {
            Action::Modified
        } else {
            Action::Created
        };
        let (_, stats) = delta::commit_file(conn, sealer, rel, &root.join(rel), action)?;
        committed += 1;
        uploaded_bytes += stats.bytes_uploaded;
    }
    println!(
        "Committed {committed} file(s), transferred {}",
        format_bytes(uploaded_bytes),
    );
    Ok(())
}

/// Gather repository-relative paths of all regular files under `target`.
fn collect_files(root: &Path, target: &Path, out: &mut Vec<String>) -> Result<()> {
    let absolute = root.join(target);
    let meta = std::fs::metadata(&absolute).map_err(|e| {
        ParapetError::Config(format!("cannot stat '{}': {e}", absolute.display()))
    })?;
    if meta.is_file() {
        out.push(to_repo_path(target));
        return Ok(());
    }
    let mut entries: Vec<_> = std::fs::read_dir(&absolute)?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let file_type = entry.file_type()?;
        let child = target.join(entry.file_name());
        if file_type.is_dir() {
            collect_files(root, &child, out)?;
        } else if file_type.is_file() {
            out.push(to_repo_path(&child));
        }
        // Symlinks and specials are the watcher collaborator's concern.
    }
    Ok(())
}

fn to_repo_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn run_restore(
    conn: &Connection,
    sealer: &Sealer,
    path: &str,
    version_id: Option<i64>,
    dest: Option<&Path>,
) -> Result<()> {
    let version_id = match version_id {
        Some(id) => VersionId(id),
        None => {
            let versions = conn.list_versions(path)?;
            versions
                .iter()
                .rev()
                .find(|v| v.action != Action::Deleted)
                .map(|v| v.version_id)
                .ok_or_else(|| {
                    ParapetError::NotFound(format!("no restorable version of '{path}'"))
                })?
        }
    };

    let dest = match dest {
        Some(d) => d.to_path_buf(),
        None => {
            let basename = path.rsplit('/').next().unwrap_or(path);
            PathBuf::from(basename)
        }
    };
    let mut out = std::fs::File::create(&dest)?;
    let stats = restore::restore_to_writer(conn, sealer, path, version_id, &mut out)?;
    println!(
        "Restored '{path}' version {version_id} to '{}' ({})",
        dest.display(),
        format_bytes(stats.bytes),
    );
    Ok(())
}

fn format_timestamp(timestamp_us: i64) -> String {
    match chrono::DateTime::from_timestamp_micros(timestamp_us) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => timestamp_us.to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(12), "12 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MiB");
    }

    #[test]
    fn timestamp_formatting() {
        // 2024-01-01T00:00:00Z
        assert_eq!(format_timestamp(1_704_067_200_000_000), "2024-01-01 00:00:00");
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    }
}
