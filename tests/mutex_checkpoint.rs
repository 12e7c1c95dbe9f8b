// tests/mutex_checkpoint.rs
//
// Поток A пачкает страницу и отпускает мьютекс; поток B захватывает тот же мьютекс.
// Checkpoint с диффом страницы устойчив до того, как lock() в B вернёт управление.
// Для CommitPolicy::Deferred коммит откладывается на unlock и выполняется при lock.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

use nvthreads::consts::PAGE_SIZE;
use nvthreads::plog::{log_path, scan_log};
use nvthreads::{CommitPolicy, Engine, EngineConfig};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("nvt-test-{prefix}-{pid}-{t}-{n}"))
}

fn run(policy: CommitPolicy) -> Result<(u64, u64)> {
    let root = unique_root("mutex");
    let cfg = EngineConfig::default()
        .with_region_pages(4)
        .with_log_compact_bytes(0)
        .with_commit_policy(policy);
    let e = Engine::open(&root, cfg)?;
    let m = e.mutex_init();

    let (tx, rx) = mpsc::channel();
    let ea = e.clone();
    let a = e.spawn(move || {
        ea.mutex_lock(m).unwrap();
        ea.write(2 * PAGE_SIZE + 7, b"from-A").unwrap();
        ea.mutex_unlock(m).unwrap();
        let committed_after_unlock = ea.committed_epoch();
        tx.send(()).unwrap();
        committed_after_unlock as usize
    })?;
    rx.recv()?;
    let committed_after_unlock = e.join(a)? as u64;

    // B: после lock эпоха с диффом страницы 2 уже в логе.
    e.mutex_lock(m)?;
    let scan = scan_log(&log_path(&root))?;
    assert_eq!(e.committed_epoch(), 1);
    assert_eq!(scan.epochs.len(), 1);
    assert_eq!(scan.epochs[0].diffs[0].page_id, 2);
    e.mutex_unlock(m)?;
    e.mutex_destroy(m)?;

    let cached = e.metrics().cached_commits;
    drop(e);
    let _ = std::fs::remove_dir_all(&root);
    Ok((committed_after_unlock, cached))
}

#[test]
fn eager_unlock_commits_before_release() -> Result<()> {
    let (committed, cached) = run(CommitPolicy::Eager)?;
    assert_eq!(committed, 1);
    assert_eq!(cached, 0);
    Ok(())
}

#[test]
fn deferred_unlock_commits_at_next_lock() -> Result<()> {
    let (committed, cached) = run(CommitPolicy::Deferred)?;
    assert_eq!(committed, 0);
    assert_eq!(cached, 1);
    Ok(())
}

#[test]
fn unlock_without_dirty_pages_does_not_commit() -> Result<()> {
    let root = unique_root("mutex-clean");
    let cfg = EngineConfig::default()
        .with_region_pages(2)
        .with_log_compact_bytes(0);
    let e = Engine::open(&root, cfg)?;
    let m = e.mutex_init();
    for _ in 0..3 {
        e.mutex_lock(m)?;
        e.mutex_unlock(m)?;
    }
    let s = e.metrics();
    assert_eq!(s.commits, 0);
    assert_eq!(s.transactions, 3);
    assert!(e.mutex_destroy(999).is_err());
    drop(e);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn deferred_commit_is_flushed_by_next_lock() -> Result<()> {
    let root = unique_root("mutex-deferred");
    let cfg = EngineConfig::default()
        .with_region_pages(2)
        .with_log_compact_bytes(0)
        .with_commit_policy(CommitPolicy::Deferred);
    let e = Engine::open(&root, cfg)?;
    let m = e.mutex_init();

    e.mutex_lock(m)?;
    e.write(16, b"cached")?;
    e.mutex_unlock(m)?;
    assert_eq!(e.committed_epoch(), 0);
    assert_eq!(e.metrics().commits, 0);

    e.mutex_lock(m)?;
    assert_eq!(e.committed_epoch(), 1);
    assert_eq!(e.metrics().commits, 1);
    e.mutex_unlock(m)?;
    // повторный unlock без записей — ни коммита, ни кэша
    assert_eq!(e.metrics().cached_commits, 1);

    drop(e);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
