// tests/named_alloc_recover.rs
//
// Именованная аллокация переживает крах, только если её эпоха закоммичена.
// После восстановления новая аллокация не перекрывает восстановленную.

use anyhow::Result;
use std::path::PathBuf;

use nvthreads::{Engine, EngineConfig};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("nvt-test-{prefix}-{pid}-{t}"))
}

fn cfg() -> EngineConfig {
    EngineConfig::default()
        .with_region_pages(4)
        .with_log_compact_bytes(0)
}

#[test]
fn committed_allocations_survive_crash() -> Result<()> {
    let root = unique_root("named");

    {
        let e = Engine::open(&root, cfg())?;
        let counter = e.nvmalloc(64, "counter")?;
        e.write(counter.offset, &42u64.to_le_bytes())?;
        e.nvcheckpoint()?;

        // та же пара имя/размер — тот же диапазон
        assert_eq!(e.nvmalloc(32, "counter")?, counter);
        assert!(e.nvmalloc(128, "counter").is_err());
        assert!(e.nvmalloc(8, "").is_err());

        let lost = e.nvmalloc(16, "scratch")?;
        e.write(lost.offset, b"gone")?;
        e.simulate_crash();
    }

    let e = Engine::open(&root, cfg())?;
    assert!(e.is_crashed());
    assert_eq!(e.recovery_report().named_allocations, 1);
    assert!(e.named("scratch").is_none());

    let counter = e.named("counter").expect("counter survives");
    assert_eq!(counter.size, 64);
    let mut buf = [0u8; 8];
    let addr = e.nvrecover(&mut buf, "counter").expect("recoverable");
    assert_eq!(u64::from_le_bytes(buf), 42);
    assert_eq!(e.addr_of(counter.offset), Some(addr));
    assert!(e.nvrecover(&mut buf, "scratch").is_none());

    let fresh = e.nvmalloc(256, "fresh")?;
    let overlaps = fresh.offset < counter.offset + counter.size
        && counter.offset < fresh.offset + fresh.size;
    assert!(!overlaps, "fresh {:?} overlaps {:?}", fresh, counter);

    drop(e);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
