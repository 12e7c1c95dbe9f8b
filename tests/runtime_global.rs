// tests/runtime_global.rs
//
// Глобальный runtime: поведение до инициализации, init, повторный init, shutdown,
// запись по указателю из nvmalloc и её восстановление.
// Состояние процессное (и обработчик SIGSEGV один), поэтому всё в одном тесте.

#![cfg(target_os = "linux")]

use anyhow::Result;
use std::path::PathBuf;

use nvthreads::consts::PAGE_SIZE;
use nvthreads::runtime;
use nvthreads::{reconstruct, CloseOutcome, Engine, EngineConfig, TrapMode};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("nvt-test-{prefix}-{pid}-{t}"))
}

#[test]
fn global_runtime_lifecycle() -> Result<()> {
    let root = unique_root("runtime");
    let cfg = EngineConfig::default()
        .with_region_pages(4)
        .with_log_compact_bytes(0);

    // до инициализации
    assert!(!runtime::is_initialized());
    assert!(runtime::global().is_none());
    assert_eq!(runtime::getpid(), 0);
    assert_eq!(runtime::pthread_self(), 0);
    runtime::mutex_lock(1)?;
    runtime::mutex_unlock(1)?;
    assert!(!runtime::barrier_wait(1)?);
    let early = runtime::malloc(64);
    assert!(!early.is_null());
    // SAFETY: 64 байта bootstrap-памяти.
    unsafe {
        *early = 1;
        assert_eq!(*early, 1);
    }

    // программный режим в конфиге: глобальный движок всё равно ловит записи аппаратно
    let e = runtime::init_global(&root, cfg.clone())?;
    assert_eq!(e.config().trap_mode, TrapMode::Hardware);
    assert!(runtime::is_initialized());
    assert!(runtime::init_global(&root, cfg.clone()).is_err());
    assert!(runtime::getpid() > 0);

    let p = runtime::malloc(128) as usize;
    let base = e.addr_of(0).expect("region base");
    assert!(p >= base && p < base + e.region_len());

    let m = e.mutex_init();
    runtime::mutex_lock(m)?;
    e.write(0, b"global")?;
    runtime::mutex_unlock(m)?;
    assert_eq!(e.committed_epoch(), 1);

    // запись по сырому указателю попадает в checkpoint
    let cell = runtime::nvmalloc(8, "cell");
    assert!(!cell.is_null());
    let off = cell as usize - base;
    // SAFETY: 8 байт именованной аллокации внутри региона; первая запись ловится обработчиком.
    unsafe {
        std::ptr::write_volatile(cell, 0x42);
    }
    assert_eq!(e.nvcheckpoint()?, CloseOutcome::Closed(2));

    // так регион увидит восстановление после краха в этой точке
    let rec = reconstruct(&root, PAGE_SIZE, 4)?;
    assert_eq!(rec.epoch, 2);
    assert_eq!(rec.pages[off], 0x42);
    assert_eq!(rec.allocs.get("cell").map(|a| a.offset as usize), Some(off));
    drop(e);

    runtime::shutdown_global()?;
    assert!(!runtime::is_initialized());
    runtime::shutdown_global()?;

    let e = Engine::open(&root, cfg)?;
    let mut b = [0u8; 1];
    assert!(e.nvrecover(&mut b, "cell").is_some());
    assert_eq!(b[0], 0x42);
    drop(e);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
