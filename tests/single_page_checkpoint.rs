// tests/single_page_checkpoint.rs
//
// Одна страница, один поток: запись [10,20) = 0xFF, явный checkpoint, затем «крах»
// (движок брошен без close) и восстановление при следующем открытии.

use anyhow::Result;
use std::path::PathBuf;

use nvthreads::consts::PAGE_SIZE;
use nvthreads::diff::DiffBody;
use nvthreads::plog::{log_path, scan_log};
use nvthreads::{CloseOutcome, Engine, EngineConfig};

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
        .with_region_pages(1)
        .with_log_compact_bytes(0)
}

#[test]
fn single_page_survives_crash() -> Result<()> {
    let root = unique_root("single-page");

    let e = Engine::open(&root, cfg())?;
    assert!(!e.is_crashed());
    e.fill(10, 10, 0xFF)?;
    assert_eq!(e.nvcheckpoint()?, CloseOutcome::Closed(1));

    // В логе ровно одна эпоха с одним диффом: (10, 10, 0xFF × 10).
    let scan = scan_log(&log_path(&root))?;
    assert_eq!(scan.epochs.len(), 1);
    let epoch = &scan.epochs[0];
    assert_eq!(epoch.epoch, 1);
    assert_eq!(epoch.diffs.len(), 1);
    let d = &epoch.diffs[0];
    assert_eq!(d.page_id, 0);
    match &d.body {
        DiffBody::Ranges(rs) => {
            assert_eq!(rs.len(), 1);
            assert_eq!(rs[0].offset, 10);
            assert_eq!(rs[0].bytes, vec![0xFF; 10]);
        }
        DiffBody::WholePage(_) => panic!("expected a range diff"),
    }

    e.simulate_crash();

    let e = Engine::open(&root, cfg())?;
    assert!(e.is_crashed());
    assert_eq!(e.recovery_report().recovered_epoch, 1);
    let mut page = vec![0u8; PAGE_SIZE];
    e.read(0, &mut page)?;
    assert!(page[10..20].iter().all(|&b| b == 0xFF));
    assert!(page[..10].iter().all(|&b| b == 0));
    assert!(page[20..].iter().all(|&b| b == 0));

    // Следующая эпоха нумеруется после восстановленной.
    assert_eq!(e.open_epoch(), 2);
    drop(e);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn uncommitted_write_is_lost_on_crash() -> Result<()> {
    let root = unique_root("single-page-lost");

    let e = Engine::open(&root, cfg())?;
    e.write(0, b"kept")?;
    e.nvcheckpoint()?;
    e.write(0, b"lost")?;
    e.simulate_crash();

    let e = Engine::open(&root, cfg())?;
    assert!(e.is_crashed());
    let mut b = [0u8; 4];
    e.read(0, &mut b)?;
    assert_eq!(&b, b"kept");
    drop(e);

    // Чистое закрытие: следующий запуск не видит краха.
    let e = Engine::open(&root, cfg())?;
    assert!(!e.is_crashed());
    e.read(0, &mut b)?;
    assert_eq!(&b, b"kept");
    drop(e);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
