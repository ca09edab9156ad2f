//! tiercache CLI
//!
//! Drives a tiered cache from the command line.
//!
//! # Commands
//!
//! ```text
//! tiercache soak     concurrent put/get workload, prints a statistics snapshot
//! tiercache inspect  reopens a persistent cache and prints tier diagnostics
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::{Cache, CacheConfiguration, Element, EvictionPolicy, MemoryCapacity};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - tiered memory and disk object cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a concurrent put/get workload against one cache
    Soak {
        /// Cache configuration as JSON; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Cache name
        #[arg(long, default_value = "soak")]
        name: String,

        /// Memory capacity in elements
        #[arg(long, default_value = "1000")]
        entries: usize,

        /// Memory eviction policy (LRU, LFU, FIFO)
        #[arg(long)]
        policy: Option<EvictionPolicy>,

        /// Worker threads
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Operations per thread
        #[arg(long, default_value = "100000")]
        ops: usize,

        /// Distinct keys touched by the workload
        #[arg(long, default_value = "5000")]
        key_space: u64,

        /// Percentage of operations that are puts
        #[arg(long, default_value = "30")]
        put_percent: u64,

        /// Disk store directory
        #[arg(long, env = "TIERCACHE_DISK_PATH")]
        disk_path: Option<PathBuf>,

        /// Keep the disk store after exit
        #[arg(long)]
        persistent: bool,
    },

    /// Reopen a persistent cache and report what it holds
    Inspect {
        /// Cache name (names the data and index files)
        #[arg(long)]
        name: String,

        /// Directory holding the cache files
        #[arg(long, env = "TIERCACHE_DISK_PATH")]
        disk_path: PathBuf,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    match args.command {
        Command::Soak {
            config,
            name,
            entries,
            policy,
            threads,
            ops,
            key_space,
            put_percent,
            disk_path,
            persistent,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => CacheConfiguration::new(name, entries),
            };
            if let Some(policy) = policy {
                config.eviction_policy = policy;
            }
            if disk_path.is_some() {
                config.disk_store_path = disk_path;
            }
            config.disk_persistent |= persistent;
            run_soak(config, threads, ops, key_space, put_percent)
        }
        Command::Inspect { name, disk_path } => run_inspect(name, disk_path),
    }
}

fn load_config(path: &Path) -> anyhow::Result<CacheConfiguration> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

// =============================================================================
// Soak
// =============================================================================

fn run_soak(
    config: CacheConfiguration,
    threads: usize,
    ops: usize,
    key_space: u64,
    put_percent: u64,
) -> anyhow::Result<()> {
    if threads == 0 || key_space == 0 {
        bail!("threads and key_space must be at least 1");
    }
    info!(
        cache = %config.name,
        threads,
        ops,
        key_space,
        policy = %config.eviction_policy,
        "starting soak"
    );

    let cache: Arc<Cache<String, String>> = Arc::new(Cache::new(config)?);
    cache.initialise()?;

    let start = Instant::now();
    let workers: Vec<_> = (0..threads)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || soak_worker(&cache, worker as u64, ops, key_space, put_percent))
        })
        .collect();
    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => bail!("soak worker panicked"),
        }
    }
    let elapsed = start.elapsed();

    let total_ops = (threads * ops) as f64;
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        ops_per_sec = total_ops / elapsed.as_secs_f64().max(f64::EPSILON),
        "soak finished"
    );

    let report = json!({
        "elapsed_ms": elapsed.as_millis() as u64,
        "statistics": cache.statistics()?,
        "disk": cache.disk_stats()?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    cache.dispose()?;
    Ok(())
}

fn soak_worker(
    cache: &Cache<String, String>,
    seed: u64,
    ops: usize,
    key_space: u64,
    put_percent: u64,
) -> tiercache::Result<()> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    for op in 0..ops {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let key = format!("key-{}", state % key_space);
        if state % 100 < put_percent {
            cache.put(Element::new(key, format!("value-{seed}-{op}")))?;
        } else {
            cache.get(&key)?;
        }
    }
    Ok(())
}

// =============================================================================
// Inspect
// =============================================================================

fn run_inspect(name: String, disk_path: PathBuf) -> anyhow::Result<()> {
    if !disk_path.is_dir() {
        bail!("{} is not a directory", disk_path.display());
    }
    let config = CacheConfiguration {
        name,
        memory_capacity: MemoryCapacity::Entries(0),
        disk_persistent: true,
        disk_store_path: Some(disk_path),
        disk_expiry_thread_interval_secs: 0,
        ..Default::default()
    };
    let cache: Cache<String, String> = Cache::new(config)?;
    cache.initialise()?;

    let disk = cache.disk_stats()?;
    if disk.as_ref().is_some_and(|d| d.entries == 0) {
        warn!("no elements recovered; the index may have been missing or stale");
    }
    let report = json!({
        "name": cache.name(),
        "size": cache.get_size()?,
        "memory_store_size": cache.get_memory_store_size()?,
        "disk_store_size": cache.get_disk_store_size()?,
        "disk": disk,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    cache.dispose()?;
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout stays machine-readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
