//! cfs: manage and mount chunked, encrypted remote file trees.
//!
//! Subcommands:
//!   newkey   - generate a fresh key file
//!   scan     - walk a plaintext tree and update the local database
//!   upload   - scan, push missing chunks, replace the remote database
//!   clean    - trash chunks no longer referenced by the database
//!   mount    - serve the read-only plaintext view via FUSE

mod config;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use cfs_crypto::KeySchedule;
use cfs_store::{CloudStore, DiskStore, DriveApi, ObjectStore};

use config::CfsConfig;

// ── CLI structure ─────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cfs",
    version,
    about = "chunkfuse: read-only mounts of chunked, encrypted remote storage"
)]
struct Cli {
    /// Path to the cfs.toml configuration file
    #[arg(long, short = 'c', env = "CFS_CONFIG", default_value = "cfs.toml", global = true)]
    config: PathBuf,

    /// Verbose logging (debug level)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum Module {
    /// Remote cloud storage (Drive-style API)
    Drive,
    /// A local directory
    Local,
}

#[derive(Debug, Clone, clap::Args)]
struct StorageArgs {
    /// Storage driver
    #[arg(long, value_enum)]
    module: Option<Module>,

    /// Folder id for 'drive' (the alias root works too); target directory
    /// for 'local'
    #[arg(long)]
    dest: Option<String>,

    /// OAuth token file for 'drive'
    #[arg(long)]
    token: Option<PathBuf>,

    /// Override the drive API base URL
    #[arg(long)]
    api_base: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new key file (refuses to overwrite)
    Newkey {
        /// Path for the new key file
        #[arg(long, default_value = "cfs.key")]
        key: PathBuf,
    },

    /// Scan a plaintext tree and update the local database
    Scan {
        /// Path to the key file
        #[arg(long)]
        key: Option<PathBuf>,
        /// Path to the local database (overwritten on change)
        #[arg(long)]
        db: Option<PathBuf>,
        /// The plaintext tree to scan
        #[arg(long)]
        dir: PathBuf,
    },

    /// Scan, upload missing chunks and replace the remote database
    Upload {
        #[arg(long)]
        key: Option<PathBuf>,
        #[arg(long)]
        db: Option<PathBuf>,
        /// The plaintext tree to upload
        #[arg(long)]
        dir: PathBuf,
        #[command(flatten)]
        storage: StorageArgs,
        /// Name of the database object in the chunk folder
        #[arg(long)]
        db_file_name: Option<String>,
        /// Upload and replace the database even when nothing changed
        #[arg(long)]
        force: bool,
    },

    /// Trash chunks the database no longer references (destructive!)
    Clean {
        #[arg(long)]
        key: Option<PathBuf>,
        #[arg(long)]
        db: Option<PathBuf>,
        #[command(flatten)]
        storage: StorageArgs,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Mount the read-only plaintext view
    Mount {
        #[arg(long)]
        key: Option<PathBuf>,
        /// Mountpoint directory
        #[arg(long)]
        dir: PathBuf,
        #[command(flatten)]
        storage: StorageArgs,
        #[arg(long)]
        db_file_name: Option<String>,
        /// Listing cache file; speeds up mount start ('' disables)
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Database refresh throttle in seconds
        #[arg(long)]
        interval: Option<u64>,
        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let cfg = CfsConfig::load(&cli.config)?;

    match cli.command {
        Commands::Newkey { key } => cmd_newkey(&key),
        Commands::Scan { key, db, dir } => cmd_scan(&cfg, key, db, &dir),
        Commands::Upload {
            key,
            db,
            dir,
            storage,
            db_file_name,
            force,
        } => cmd_upload(&cfg, key, db, &dir, storage, db_file_name, force).await,
        Commands::Clean {
            key,
            db,
            storage,
            yes,
        } => cmd_clean(&cfg, key, db, storage, yes).await,
        Commands::Mount {
            key,
            dir,
            storage,
            db_file_name,
            cache,
            interval,
            allow_other,
        } => cmd_mount(&cfg, key, &dir, storage, db_file_name, cache, interval, allow_other).await,
    }
}

fn init_logging(debug: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

// ── Flag/config resolution ────────────────────────────────────────────────

fn resolve_key(cfg: &CfsConfig, flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| cfg.key.clone())
        .unwrap_or_else(|| PathBuf::from("cfs.key"))
}

fn resolve_db(cfg: &CfsConfig, flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| cfg.db.clone())
        .unwrap_or_else(|| PathBuf::from("cfs.db"))
}

fn resolve_db_file_name(cfg: &CfsConfig, flag: Option<String>) -> String {
    flag.or_else(|| cfg.storage.db_file_name.clone())
        .unwrap_or_else(|| "index.db".to_string())
}

/// Build the object-store driver from flags and config.
///
/// `cache` only applies to the drive module; the local driver lists fast
/// enough without one.
fn build_store(
    cfg: &CfsConfig,
    storage: &StorageArgs,
    cache: Option<PathBuf>,
) -> Result<Arc<dyn ObjectStore>> {
    let module = storage.module.or_else(|| {
        match cfg.storage.module.as_deref() {
            Some("drive") => Some(Module::Drive),
            Some("local") => Some(Module::Local),
            _ => None,
        }
    });

    let dest = storage
        .dest
        .clone()
        .or_else(|| cfg.storage.dest.clone())
        .context("no storage destination: use --dest or set storage.dest in the config")?;

    match module {
        Some(Module::Local) => Ok(Arc::new(DiskStore::new(dest))),
        Some(Module::Drive) => {
            let token = storage
                .token
                .clone()
                .or_else(|| cfg.storage.token.clone())
                .unwrap_or_else(|| PathBuf::from("token.json"));
            let api_base = storage
                .api_base
                .clone()
                .or_else(|| cfg.storage.api_base.clone());

            let api = DriveApi::from_token_file(&token, api_base.as_deref())
                .with_context(|| format!("loading token file: {}", token.display()))?;

            // An empty cache path disables the listing cache.
            let cache = cache
                .or_else(|| cfg.mount.cache.clone())
                .filter(|p| !p.as_os_str().is_empty());
            Ok(Arc::new(CloudStore::new(api, dest, cache)))
        }
        None => bail!("no storage module: use --module drive|local or set storage.module"),
    }
}

// ── Commands ──────────────────────────────────────────────────────────────

fn cmd_newkey(key: &Path) -> Result<()> {
    cfs_crypto::generate_keyfile(key)
        .with_context(|| format!("generating key file: {}", key.display()))?;
    println!("Key file written: {}", key.display());
    println!("Keep it safe — without it every chunk and the database are unreadable.");
    Ok(())
}

fn cmd_scan(cfg: &CfsConfig, key: Option<PathBuf>, db: Option<PathBuf>, dir: &Path) -> Result<()> {
    let key_path = resolve_key(cfg, key);
    let db_path = resolve_db(cfg, db);

    let keys = KeySchedule::load(&key_path)?;
    let changed = cfs_sync::refresh_db(&keys, &db_path, dir)?;

    if changed {
        println!("Database updated: {}", db_path.display());
    } else {
        println!("No changes.");
    }
    Ok(())
}

async fn cmd_upload(
    cfg: &CfsConfig,
    key: Option<PathBuf>,
    db: Option<PathBuf>,
    dir: &Path,
    storage: StorageArgs,
    db_file_name: Option<String>,
    force: bool,
) -> Result<()> {
    let key_path = resolve_key(cfg, key);
    let db_path = resolve_db(cfg, db);
    let db_object_name = resolve_db_file_name(cfg, db_file_name);

    let keys = KeySchedule::load(&key_path)?;
    let store = build_store(cfg, &storage, None)?;

    let report = cfs_sync::upload_tree(
        store.as_ref(),
        &keys,
        &db_path,
        dir,
        &db_object_name,
        force,
    )
    .await?;

    if !report.changed && !force {
        println!("Nothing changed, nothing uploaded.");
    } else {
        println!("Uploaded {} chunks; database replaced.", report.uploaded_chunks);
    }
    Ok(())
}

async fn cmd_clean(
    cfg: &CfsConfig,
    key: Option<PathBuf>,
    db: Option<PathBuf>,
    storage: StorageArgs,
    yes: bool,
) -> Result<()> {
    let key_path = resolve_key(cfg, key);
    let db_path = resolve_db(cfg, db);

    println!("ATTENTION: this process deletes data from the store!");
    if !yes && !confirm()? {
        return Ok(());
    }

    let keys = KeySchedule::load(&key_path)?;
    let db = cfs_crypto::db_from_file(&db_path, &keys.db_key())?;
    if db.is_empty() {
        bail!(
            "database {} is empty — run scan first so live chunks are known",
            db_path.display()
        );
    }

    let store = build_store(cfg, &storage, None)?;
    let report = cfs_sync::find_orphans(store.as_ref(), &keys, &db).await?;

    println!("--------------------------------------");
    println!(
        "total     {} objects with {} bytes",
        report.total_objects, report.total_bytes
    );
    println!(
        "remove    {} chunks with {} bytes",
        report.orphans.len(),
        report.orphan_bytes
    );
    println!(
        "remaining {} objects with {} bytes",
        report.total_objects - report.orphans.len(),
        report.total_bytes - report.orphan_bytes
    );

    if report.orphans.is_empty() {
        println!("Nothing to clean.");
        return Ok(());
    }
    if !yes && !confirm()? {
        return Ok(());
    }

    cfs_sync::trash_orphans(store.as_ref(), &report.orphans).await?;
    println!("Trashed {} chunks.", report.orphans.len());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_mount(
    cfg: &CfsConfig,
    key: Option<PathBuf>,
    dir: &Path,
    storage: StorageArgs,
    db_file_name: Option<String>,
    cache: Option<PathBuf>,
    interval: Option<u64>,
    allow_other: bool,
) -> Result<()> {
    let key_path = resolve_key(cfg, key);
    let db_object_name = resolve_db_file_name(cfg, db_file_name);
    let interval = interval.or(cfg.mount.interval).unwrap_or(0);
    let allow_other = allow_other || cfg.mount.allow_other.unwrap_or(false);

    let keys = KeySchedule::load(&key_path)?;
    let store = build_store(cfg, &storage, cache)?;

    println!("Mounting on {} (read-only)", dir.display());
    println!("Unmount with: fusermount3 -u {}", dir.display());

    cfs_fuse::mount(cfs_fuse::MountConfig {
        store,
        keys,
        db_object_name,
        interval,
        mountpoint: dir.to_path_buf(),
        allow_other,
    })
    .await
}

/// y/N prompt on stdin; anything but yes aborts.
fn confirm() -> Result<bool> {
    print!("(y/N): ");
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();

    Ok(answer == "y" || answer == "yes")
}
