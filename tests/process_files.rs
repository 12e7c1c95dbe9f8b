// tests/process_files.rs
//
// Process-файлы stats/metadata: живут, пока движок открыт, удаляются при чистом
// завершении; чужие (оставшиеся от упавшего процесса) помечают запуск как crashed.

use anyhow::Result;
use std::path::PathBuf;

use nvthreads::stats::{metadata_file_path, read_metadata, read_stats_slots, stats_file_path};
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
fn process_files_follow_engine_lifetime() -> Result<()> {
    let root = unique_root("procfiles");
    let cfg = EngineConfig::default()
        .with_region_pages(2)
        .with_log_compact_bytes(0);
    let pid = std::process::id();

    let e = Engine::open(&root, cfg.clone())?;
    e.nvmalloc(32, "slot")?;
    e.write(0, b"x")?;
    e.nvcheckpoint()?;

    let stats = stats_file_path(&root, pid);
    let meta = metadata_file_path(&root, pid);
    assert!(stats.exists() && meta.exists());
    let m = read_metadata(&meta)?.expect("metadata published");
    assert_eq!(m.pid, pid);
    assert_eq!(m.open_epoch, 2);
    assert_eq!(m.named_allocations, 1);
    assert!(!read_stats_slots(&stats)?.is_empty());

    e.close()?;
    assert!(!stats.exists() && !meta.exists());
    drop(e);

    // файлы "другого" процесса, не завершившегося чисто
    let foreign = pid.wrapping_add(1);
    std::fs::write(stats_file_path(&root, foreign), b"")?;
    std::fs::write(metadata_file_path(&root, foreign), b"")?;

    let e = Engine::open(&root, cfg)?;
    assert!(e.is_crashed());
    assert!(!stats_file_path(&root, foreign).exists());
    assert!(!metadata_file_path(&root, foreign).exists());
    drop(e);

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
