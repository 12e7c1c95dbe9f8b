use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::{Builder, Env};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use nvthreads::consts::PAGE_SIZE;
use nvthreads::{CommitPolicy, Engine, EngineConfig};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Policy {
    Eager,
    Deferred,
}

/// Многопоточная нагрузка: каждый поток под общим мьютексом пишет счётчик в свою страницу.
#[derive(Parser, Debug)]
#[command(name = "nvthreads_bench", about = "nvthreads checkpoint workload")]
struct Args {
    /// Engine root (a fresh temp dir by default)
    #[arg(long)]
    path: Option<PathBuf>,
    #[arg(long, default_value_t = 4)]
    threads: usize,
    #[arg(long, default_value_t = 1000)]
    iters: usize,
    /// Bytes written per critical section
    #[arg(long, default_value_t = 64)]
    write_bytes: usize,
    #[arg(long, value_enum, default_value_t = Policy::Eager)]
    policy: Policy,
    #[arg(long, default_value_t = false)]
    no_fsync: bool,
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();
    let args = Args::parse();

    let root = args.path.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("nvthreads-bench-{}", std::process::id()))
    });
    let write_bytes = args.write_bytes.clamp(1, PAGE_SIZE);
    let cfg = EngineConfig::from_env()
        .with_region_pages(args.threads.max(1) + 1)
        .with_log_fsync(!args.no_fsync)
        .with_commit_policy(match args.policy {
            Policy::Eager => CommitPolicy::Eager,
            Policy::Deferred => CommitPolicy::Deferred,
        });
    let engine = Engine::open(&root, cfg).with_context(|| format!("open {}", root.display()))?;
    let mutex = engine.mutex_init();

    let start = Instant::now();
    let mut ids = Vec::with_capacity(args.threads);
    for t in 0..args.threads {
        let e = Arc::clone(&engine);
        let iters = args.iters;
        ids.push(engine.spawn(move || {
            let base = t * PAGE_SIZE;
            let mut buf = vec![0u8; write_bytes];
            for i in 0..iters {
                buf.fill((i % 251) as u8);
                if e.mutex_lock(mutex).is_err() {
                    return 1;
                }
                let res = e.write(base, &buf);
                if e.mutex_unlock(mutex).is_err() || res.is_err() {
                    return 1;
                }
            }
            0
        })?);
    }
    let mut failures = 0usize;
    for id in ids {
        failures += engine.join(id)?;
    }
    let elapsed = start.elapsed();
    engine.nvcheckpoint()?;

    let snap = engine.metrics();
    let ops = (args.threads * args.iters) as f64;
    if args.json {
        let v = serde_json::json!({
            "threads": args.threads,
            "iters": args.iters,
            "elapsed_ms": elapsed.as_millis() as u64,
            "ops_per_sec": ops / elapsed.as_secs_f64().max(1e-9),
            "failures": failures,
            "metrics": snap,
            "avg_pages_per_commit": snap.avg_pages_per_commit(),
            "fast_page_ratio": snap.fast_page_ratio(),
        });
        println!("{}", serde_json::to_string_pretty(&v)?);
    } else {
        println!(
            "{} thread(s) x {} iter(s): {:.1} ms, {:.0} critical sections/s, {} failure(s)",
            args.threads,
            args.iters,
            elapsed.as_secs_f64() * 1000.0,
            ops / elapsed.as_secs_f64().max(1e-9),
            failures
        );
        println!(
            "commits={} cached={} coalesced={} faults={} log_bytes={} avg_pages/commit={:.2}",
            snap.commits,
            snap.cached_commits,
            snap.coalesced_closes,
            snap.faults,
            snap.log_bytes,
            snap.avg_pages_per_commit()
        );
        println!(
            "serial={:.1} ms diff_calc={:.1} ms diff_log={:.1} ms",
            snap.serial_ns as f64 / 1e6,
            snap.diff_calculation_ns as f64 / 1e6,
            snap.diff_logging_ns as f64 / 1e6
        );
    }

    engine.close()?;
    if args.path.is_none() {
        drop(engine);
        let _ = std::fs::remove_dir_all(&root);
    }
    Ok(())
}
