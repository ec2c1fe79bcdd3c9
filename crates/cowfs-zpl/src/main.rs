//! cowfs-stress: runs a concurrent namespace and data workload against an
//! in-memory mount, optionally crashing and replaying the intent log at the end.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cowfs_zpl::memstore::MemoryObjectStore;
use cowfs_zpl::types::{Cred, FileKind, IoFlags};
use cowfs_zpl::zil::MemoryIntentLog;
use cowfs_zpl::{Collaborators, CreateAttrs, Mount, NodeRef, ZplConfig, ZplError};

#[derive(Parser, Debug)]
#[command(name = "cowfs-stress", about = "Concurrent workload driver for the CowFS POSIX layer")]
struct Cli {
    /// Mount configuration file (TOML or JSON)
    #[arg(short, long, env = "COWFS_CONFIG")]
    config: Option<PathBuf>,

    /// Worker threads
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Operations per worker
    #[arg(short, long, default_value_t = 10_000)]
    ops: u64,

    /// Names in the shared directory the workers race on
    #[arg(long, default_value_t = 32)]
    names: usize,

    /// Largest single write in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    max_write: usize,

    /// Random seed; worker i uses seed + i
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Crash after the workload and remount from the durable images
    #[arg(long)]
    crash: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Default)]
struct Counters {
    ops: AtomicU64,
    /// Failures a racing workload expects, such as a name removed by another worker.
    raced: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn raced(err: &ZplError) -> bool {
    matches!(
        err,
        ZplError::NotFound | ZplError::Exists | ZplError::NotEmpty | ZplError::IsDirectory | ZplError::NotDirectory
    )
}

fn tally<T>(counters: &Counters, res: cowfs_zpl::Result<T>) -> Result<Option<T>> {
    counters.ops.fetch_add(1, Ordering::Relaxed);
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if raced(&e) => {
            counters.raced.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn worker(mount: &Mount, shared: &NodeRef, worker_id: usize, cli: &Cli, counters: &Counters) -> Result<()> {
    let cred = Cred::root();
    let mut rng = StdRng::seed_from_u64(cli.seed + worker_id as u64);
    let private = mount
        .mkdir(&mount.root()?, format!("w{}", worker_id).as_bytes(), &CreateAttrs::with_mode(0o755), &cred)
        .context("creating worker directory")?;
    let name = |i: usize| format!("n{}", i).into_bytes();

    for _ in 0..cli.ops {
        let pick = name(rng.gen_range(0..cli.names));
        match rng.gen_range(0..10) {
            0 => {
                let res = mount.create(shared, &pick, FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred);
                tally(counters, res)?;
            }
            1 | 2 => {
                if let Some(node) = tally(counters, mount.lookup(shared, &pick, &cred))? {
                    if node.kind() != FileKind::Regular {
                        continue;
                    }
                    let len = rng.gen_range(1..=cli.max_write);
                    let data = vec![worker_id as u8; len];
                    let offset = rng.gen_range(0..4 * cli.max_write as i64);
                    let flags = if rng.gen_bool(0.05) {
                        IoFlags::WRITE | IoFlags::DSYNC
                    } else {
                        IoFlags::WRITE
                    };
                    if let Some(w) = tally(counters, mount.write(&node, offset, &data, flags, &cred))? {
                        counters.bytes_written.fetch_add(w.written as u64, Ordering::Relaxed);
                    }
                }
            }
            3 | 4 => {
                if let Some(node) = tally(counters, mount.lookup(shared, &pick, &cred))? {
                    if node.kind() != FileKind::Regular {
                        continue;
                    }
                    let offset = rng.gen_range(0..4 * cli.max_write as i64);
                    if let Some(data) = tally(counters, mount.read(&node, offset, cli.max_write, IoFlags::READ))? {
                        counters.bytes_read.fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                }
            }
            5 => {
                let to = name(rng.gen_range(0..cli.names));
                tally(counters, mount.rename(shared, &pick, shared, &to, &cred))?;
            }
            6 => {
                // Moves between the shared and the private directory exercise
                // cross-directory lock ordering.
                let res = if rng.gen_bool(0.5) {
                    mount.rename(shared, &pick, &private, &pick, &cred)
                } else {
                    mount.rename(&private, &pick, shared, &pick, &cred)
                };
                tally(counters, res)?;
            }
            7 => {
                tally(counters, mount.remove(shared, &pick, &cred))?;
            }
            8 => {
                let mut offset = 0;
                loop {
                    let Some(out) = tally(counters, mount.readdir(shared, offset, 4096, false, &cred))? else {
                        break;
                    };
                    if out.eof {
                        break;
                    }
                    offset = out.offset;
                }
            }
            _ => {
                if let Some(node) = tally(counters, mount.lookup(shared, &pick, &cred))? {
                    if node.kind() == FileKind::Regular {
                        let size = rng.gen_range(0..2 * cli.max_write as u64);
                        tally(counters, mount.truncate(&node, size, &cred))?;
                    }
                }
            }
        }
    }
    debug!(worker_id, "worker done");
    Ok(())
}

/// Walks the tree from the root and returns the number of entries seen.
fn walk(mount: &Mount, dir: &NodeRef, cred: &Cred) -> Result<u64> {
    let mut seen = 0;
    let mut offset = 0;
    loop {
        let out = mount.readdir(dir, offset, 64 * 1024, false, cred)?;
        for entry in out.entries.iter().filter(|e| e.name != b"." && e.name != b"..") {
            seen += 1;
            let child = mount.lookup(dir, &entry.name, cred)?;
            if child.is_dir() {
                seen += walk(mount, &child, cred)?;
            } else if child.kind() == FileKind::Regular {
                let data = mount.read(&child, 0, child.size() as usize, IoFlags::READ)?;
                if data.len() as u64 != child.size() {
                    bail!("short read of {:?}: {} of {}", entry.name, data.len(), child.size());
                }
            }
        }
        if out.eof {
            return Ok(seen);
        }
        offset = out.offset;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => ZplConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => ZplConfig::default(),
    };
    info!(threads = cli.threads, ops = cli.ops, names = cli.names, "cowfs-stress starting");

    let store = Arc::new(MemoryObjectStore::default());
    let log = Arc::new(MemoryIntentLog::new());
    let mount = Mount::format(store.clone(), log.clone(), config.clone(), Collaborators::default())?;
    let cred = Cred::root();
    let shared = mount.mkdir(&mount.root()?, b"shared", &CreateAttrs::with_mode(0o777), &cred)?;

    let counters = Counters::default();
    let started = Instant::now();
    std::thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = (0..cli.threads)
            .map(|i| {
                let (mount, shared, cli, counters) = (&mount, &shared, &cli, &counters);
                s.spawn(move || worker(mount, shared, i, cli, counters))
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(res) => res?,
                Err(_) => bail!("worker panicked"),
            }
        }
        Ok(())
    })?;
    let elapsed = started.elapsed();
    mount.drain_releases();

    let ops = counters.ops.load(Ordering::Relaxed);
    info!(
        ops,
        raced = counters.raced.load(Ordering::Relaxed),
        bytes_written = counters.bytes_written.load(Ordering::Relaxed),
        bytes_read = counters.bytes_read.load(Ordering::Relaxed),
        elapsed_ms = elapsed.as_millis() as u64,
        ops_per_sec = (ops as f64 / elapsed.as_secs_f64().max(1e-9)) as u64,
        "workload finished"
    );
    if mount.dirent_locks_held() != 0 {
        bail!("{} directory entry locks leaked", mount.dirent_locks_held());
    }
    let entries = walk(&mount, &mount.root()?, &cred)?;
    info!(entries, "tree verified");
    println!("{}", serde_json::to_string_pretty(&mount.stats())?);

    if cli.crash {
        let store = Arc::new(store.crash_image());
        let log = Arc::new(log.crash_image());
        drop((shared, mount));
        let mount = Mount::open(store, log, config, Collaborators::default()).context("remount after crash")?;
        let stats = mount.stats();
        let entries = walk(&mount, &mount.root()?, &cred)?;
        if mount.unlinked_count()? != 0 {
            warn!(unlinked = mount.unlinked_count()?, "unlinked set not empty after replay");
        }
        info!(replayed = stats.records_replayed, entries, "remounted after crash");
        mount.unmount()?;
    }
    Ok(())
}
