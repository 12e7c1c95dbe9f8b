use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use nvthreads::consts::PAGE_SIZE;
use nvthreads::lock::try_acquire_shared_lock;
use nvthreads::meta::read_meta;
use nvthreads::reconstruct;

/// Восстановить образ региона в файл. Корень не меняется.
pub fn exec(path: PathBuf, out: PathBuf) -> Result<()> {
    let _lock = try_acquire_shared_lock(&path)?;
    let m = read_meta(&path)?;
    let rec = reconstruct(&path, PAGE_SIZE, m.region_pages as usize)?;
    fs::write(&out, &rec.pages).with_context(|| format!("write {}", out.display()))?;
    println!(
        "recovered epoch {} (image epoch {}, {} epoch(s) replayed, {} torn byte(s) ignored) -> {}",
        rec.epoch,
        rec.image_epoch,
        rec.applied_epochs,
        rec.scan.torn_bytes,
        out.display()
    );
    for a in rec.allocs.records() {
        println!("  '{}' offset={} size={}", a.name, a.offset, a.size);
    }
    Ok(())
}
