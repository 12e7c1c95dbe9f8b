use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use nvthreads::consts::PAGE_SIZE;
use nvthreads::image::compact;
use nvthreads::lock::try_acquire_exclusive_lock;
use nvthreads::meta::read_meta;
use nvthreads::metrics::Metrics;
use nvthreads::plog::LogWriter;

/// Компактация без открытия движка: флаг clean_shutdown в meta не трогается,
/// так что следующий запуск приложения по-прежнему увидит крах.
pub fn exec(path: PathBuf) -> Result<()> {
    let _lock = try_acquire_exclusive_lock(&path)
        .with_context(|| format!("engine at {} is running", path.display()))?;
    let m = read_meta(&path)?;
    let metrics = Arc::new(Metrics::new(true));
    let mut w = LogWriter::open(&path, PAGE_SIZE as u32, m.instance_id, 0, true, metrics.clone())?;
    let rep = compact(&path, m.region_pages as usize, &mut w, &metrics)?;
    println!(
        "compacted {}: image at epoch {}, log {} -> {} byte(s)",
        path.display(),
        rep.epoch,
        rep.log_bytes_before,
        w.len()
    );
    Ok(())
}
