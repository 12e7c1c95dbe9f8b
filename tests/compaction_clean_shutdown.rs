// tests/compaction_clean_shutdown.rs
//
// Компактация: образ региона поглощает эпохи, лог усекается; восстановление
// по образу + хвосту лога даёт то же содержимое. Чистое завершение не считается крахом.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use nvthreads::consts::PAGE_SIZE;
use nvthreads::image::image_path;
use nvthreads::plog::{log_path, scan_log};
use nvthreads::{reconstruct, Engine, EngineConfig};

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

const PAGES: usize = 4;

fn cfg(compact_bytes: u64) -> EngineConfig {
    EngineConfig::default()
        .with_region_pages(PAGES)
        .with_log_compact_bytes(compact_bytes)
}

fn stamp(e: &Engine, round: u8) -> Result<()> {
    for p in 0..PAGES {
        e.write(p * PAGE_SIZE + round as usize, &[round; 32])?;
    }
    e.nvcheckpoint()?;
    Ok(())
}

fn snapshot(e: &Engine) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; PAGES * PAGE_SIZE];
    e.read(0, &mut buf)?;
    Ok(buf)
}

#[test]
fn compaction_then_crash_recovers_everything() -> Result<()> {
    let root = unique_root("compact");

    let e = Engine::open(&root, cfg(512))?;
    e.nvmalloc(100, "table")?;
    for round in 1..=6u8 {
        stamp(&e, round)?;
    }
    let s = e.metrics();
    assert!(s.compactions > 0);
    assert!(image_path(&root).exists());
    let expected = snapshot(&e)?;
    e.simulate_crash();

    let rec = reconstruct(&root, PAGE_SIZE, PAGES)?;
    assert_eq!(rec.epoch, 6);
    assert!(rec.image_epoch > 0);
    assert!(rec.pages == expected);
    assert!(rec.allocs.get("table").is_some());

    let e = Engine::open(&root, cfg(512))?;
    assert!(e.is_crashed());
    assert!(snapshot(&e)? == expected);
    assert!(e.named("table").is_some());
    assert_eq!(e.open_epoch(), 7);
    drop(e);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn clean_shutdown_is_not_a_crash() -> Result<()> {
    let root = unique_root("clean");

    let e = Engine::open(&root, cfg(0))?;
    stamp(&e, 1)?;
    e.write(3 * PAGE_SIZE, b"flushed by close")?;
    let expected = snapshot(&e)?;
    e.close()?;
    // повторное закрытие — no-op
    e.close()?;
    drop(e);

    // close() сворачивает лог в образ и оставляет только SHUTDOWN
    let scan = scan_log(&log_path(&root))?;
    assert!(scan.epochs.is_empty());
    assert!(scan.clean_tail);
    assert_eq!(scan.shutdown_epoch, Some(2));
    assert!(image_path(&root).exists());

    let e = Engine::open(&root, cfg(0))?;
    assert!(!e.is_crashed());
    assert!(snapshot(&e)? == expected);
    assert_eq!(e.committed_epoch(), 2);
    assert_eq!(e.open_epoch(), 3);
    drop(e);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
