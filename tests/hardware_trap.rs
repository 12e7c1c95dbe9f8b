// tests/hardware_trap.rs
//
// Аппаратный режим: обычная запись по указателю в read-only страницу ловится SIGSEGV,
// страница получает twin, и checkpoint пишет её дифф в лог.
// Обработчик один на процесс, поэтому тест один на бинарник.

#![cfg(target_os = "linux")]

use anyhow::Result;
use std::path::PathBuf;

use nvthreads::consts::PAGE_SIZE;
use nvthreads::diff::DiffBody;
use nvthreads::plog::{log_path, scan_log};
use nvthreads::{CloseOutcome, Engine, EngineConfig, TrapMode};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("nvt-test-{prefix}-{pid}-{t}"))
}

#[test]
fn pointer_writes_are_trapped_and_logged() -> Result<()> {
    let root = unique_root("hwtrap");
    let cfg = EngineConfig::default()
        .with_region_pages(4)
        .with_log_compact_bytes(0)
        .with_trap_mode(TrapMode::Hardware);
    let e = Engine::open(&root, cfg)?;
    // поток регистрируется до первой ловушки
    let _ = e.current_thread();

    let addr = e.addr_of(PAGE_SIZE + 100).expect("inside region");
    // SAFETY: адрес внутри региона движка; первая запись ловится обработчиком,
    // который делает страницу writable и перезапускает инструкцию.
    unsafe {
        std::ptr::write_volatile(addr as *mut u8, 0xAB);
        std::ptr::write_volatile((addr + 1) as *mut u8, 0xCD);
    }
    let s = e.metrics();
    assert_eq!(s.faults, 1);
    assert_eq!(e.live_twins(), 1);

    assert_eq!(e.nvcheckpoint()?, CloseOutcome::Closed(1));
    let scan = scan_log(&log_path(&root))?;
    assert_eq!(scan.epochs.len(), 1);
    let d = &scan.epochs[0].diffs[0];
    assert_eq!(d.page_id, 1);
    match &d.body {
        DiffBody::Ranges(r) => {
            assert_eq!(r.len(), 1);
            assert_eq!(r[0].offset, 100);
            assert_eq!(r[0].bytes, vec![0xAB, 0xCD]);
        }
        DiffBody::WholePage(_) => panic!("expected a range diff"),
    }

    // после checkpoint страница снова read-only: следующая запись — новая ловушка
    unsafe {
        std::ptr::write_volatile(addr as *mut u8, 0x01);
    }
    assert_eq!(e.metrics().faults, 2);

    e.close()?;
    drop(e);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
