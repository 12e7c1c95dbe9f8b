// tests/barrier_checkpoint.rs
//
// Два потока пишут разные страницы и встречаются на барьере (count=2):
// ровно один checkpoint покрывает обе страницы.

use anyhow::Result;
use std::path::PathBuf;

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

#[test]
fn barrier_commits_once_for_all_participants() -> Result<()> {
    let root = unique_root("barrier");
    let cfg = EngineConfig::default()
        .with_region_pages(4)
        .with_log_compact_bytes(0);
    let e = Engine::open(&root, cfg)?;
    let barrier = e.barrier_init(2)?;

    let mut ids = Vec::new();
    for page in [1usize, 2] {
        let e2 = e.clone();
        ids.push(e.spawn(move || {
            e2.fill(page * PAGE_SIZE + 100, 32, page as u8).unwrap();
            let serial = e2.barrier_wait(barrier).unwrap();
            // после барьера эпоха уже устойчива
            assert!(e2.committed_epoch() >= 1);
            serial as usize
        })?);
    }
    let mut serial = 0;
    for id in ids {
        serial += e.join(id)?;
    }
    assert_eq!(serial, 1, "exactly one serial thread");

    let m = e.metrics();
    assert_eq!(m.commits, 1);
    assert_eq!(m.logged_pages, 2);

    let scan = scan_log(&log_path(&root))?;
    assert_eq!(scan.epochs.len(), 1);
    let mut pages: Vec<u64> = scan.epochs[0].diffs.iter().map(|d| d.page_id).collect();
    pages.sort_unstable();
    assert_eq!(pages, vec![1, 2]);

    e.barrier_destroy(barrier)?;
    assert!(e.barrier_wait(barrier).is_err());
    drop(e);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
