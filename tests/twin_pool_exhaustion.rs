// tests/twin_pool_exhaustion.rs
//
// Пул twin'ов на одну страницу: запись во вторую страницу без явного checkpoint
// вызывает неявный (ранний) checkpoint, а не ошибку записи — в том числе когда
// twin освобождает чужой checkpoint.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use nvthreads::consts::PAGE_SIZE;
use nvthreads::plog::{log_path, scan_log};
use nvthreads::{Engine, EngineConfig};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("nvt-test-{prefix}-{pid}-{t}"))
}

fn one_twin_cfg() -> EngineConfig {
    EngineConfig::default()
        .with_region_pages(4)
        .with_twin_pool_pages(1)
        .with_log_compact_bytes(0)
}

#[test]
fn second_twin_forces_early_checkpoint() -> Result<()> {
    let root = unique_root("twin-pool");
    let e = Engine::open(&root, one_twin_cfg())?;

    e.write(5, &[1, 2, 3])?;
    assert_eq!(e.live_twins(), 1);
    assert_eq!(e.metrics().commits, 0);

    e.write(PAGE_SIZE + 5, &[4, 5, 6])?;
    let m = e.metrics();
    assert_eq!(m.early_checkpoints, 1);
    assert_eq!(m.commits, 1);
    assert_eq!(e.live_twins(), 1);

    // Ранний checkpoint содержит только первую страницу.
    let scan = scan_log(&log_path(&root))?;
    assert_eq!(scan.epochs.len(), 1);
    assert_eq!(scan.epochs[0].diffs.len(), 1);
    assert_eq!(scan.epochs[0].diffs[0].page_id, 0);

    e.nvcheckpoint()?;
    let scan = scan_log(&log_path(&root))?;
    assert_eq!(scan.epochs.len(), 2);
    assert_eq!(scan.epochs[1].diffs[0].page_id, 1);

    // Запись, пересекающая границу страниц, тоже проходит через ранний checkpoint.
    e.write(3 * PAGE_SIZE - 2, &[7, 7, 7, 7])?;
    assert_eq!(e.metrics().early_checkpoints, 2);
    let mut b = [0u8; 4];
    e.read(3 * PAGE_SIZE - 2, &mut b)?;
    assert_eq!(b, [7, 7, 7, 7]);

    drop(e);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn writes_survive_concurrent_checkpoints() -> Result<()> {
    const ROUNDS: usize = 500;
    let root = unique_root("twin-race");
    let e = Engine::open(&root, one_twin_cfg())?;
    let failed = AtomicUsize::new(0);
    let write = |offset: usize, i: usize| {
        if let Err(err) = e.write(offset, &[i as u8]) {
            eprintln!("write at {offset}: {err:#}");
            failed.fetch_add(1, Ordering::Relaxed);
        }
    };

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..ROUNDS {
                write(10, i);
                if e.nvcheckpoint().is_err() {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        s.spawn(|| {
            for i in 0..ROUNDS {
                write(PAGE_SIZE + 10, i);
            }
        });
    });
    assert_eq!(failed.load(Ordering::Relaxed), 0);

    e.nvcheckpoint()?;
    assert_eq!(e.live_twins(), 0);
    e.close()?;
    drop(e);

    let e = Engine::open(&root, one_twin_cfg())?;
    let last = (ROUNDS - 1) as u8;
    let mut b = [0u8; 1];
    e.read(10, &mut b)?;
    assert_eq!(b[0], last);
    e.read(PAGE_SIZE + 10, &mut b)?;
    assert_eq!(b[0], last);
    drop(e);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
