//! Recovery Procedure.
//!
//! - reconstruct(): чистая функция над файлами корня: образ (если есть) + закоммиченные
//!   эпохи лога после эпохи образа -> страницы, таблица именованных аллокаций, эпоха.
//!   Ничего не пишет, поэтому повторный вызов даёт тот же результат.
//! - restore(): при открытии движка: reconstruct, копия в регион, усечение torn tail,
//!   решение "был ли крах".
//!
//! Признаки краха (любой):
//! - meta.clean_shutdown == false;
//! - последняя валидная запись лога не SHUTDOWN или после неё есть хвост;
//! - в корне остались process-файлы другого pid.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::path::Path;

use crate::alloc::NamedTable;
use crate::image::read_image;
use crate::meta::EngineMeta;
use crate::metrics::Metrics;
use crate::plog::{log_path, scan_log, LogScan};
use crate::region::Region;

#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub pages: Vec<u8>,
    /// Последняя эпоха, вошедшая в образ (образ + лог).
    pub epoch: u64,
    pub image_epoch: u64,
    pub applied_epochs: usize,
    pub allocs: NamedTable,
    pub scan: LogScan,
}

/// Восстановить содержимое региона по файлам в `root`.
pub fn reconstruct(root: &Path, page_size: usize, region_pages: usize) -> Result<Reconstruction> {
    let mut pages = vec![0u8; region_pages * page_size];
    let mut allocs = NamedTable::new();
    let mut image_epoch = 0u64;

    if let Some(img) = read_image(root)? {
        if img.page_size as usize != page_size {
            return Err(anyhow!(
                "image page size {} does not match {}",
                img.page_size,
                page_size
            ));
        }
        if img.page_count as usize > region_pages {
            return Err(anyhow!(
                "image has {} pages, region has only {}",
                img.page_count,
                region_pages
            ));
        }
        pages[..img.pages.len()].copy_from_slice(&img.pages);
        for a in img.allocs {
            allocs.insert(a);
        }
        image_epoch = img.epoch;
        debug!("recovery: image at epoch {} loaded", image_epoch);
    }

    let path = log_path(root);
    let scan = scan_log(&path).with_context(|| format!("scan log {}", path.display()))?;
    if scan.file_len > 0 && scan.page_size as usize != page_size {
        return Err(anyhow!(
            "log page size {} does not match {}",
            scan.page_size,
            page_size
        ));
    }

    let applied_epochs = scan.replay_onto(&mut pages, image_epoch)?;
    for a in scan.allocs_after(image_epoch) {
        allocs.insert(a.clone());
    }
    let epoch = image_epoch.max(scan.last_epoch);

    Ok(Reconstruction {
        pages,
        epoch,
        image_epoch,
        applied_epochs,
        allocs,
        scan,
    })
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RecoveryReport {
    pub crashed: bool,
    pub recovered_epoch: u64,
    pub image_epoch: u64,
    pub applied_epochs: usize,
    pub torn_bytes: u64,
    pub named_allocations: usize,
}

/// Восстановить регион при открытии движка. Возвращает отчёт и таблицу аллокаций.
pub fn restore(
    root: &Path,
    region: &Region,
    meta: &EngineMeta,
    stale_process_files: bool,
    metrics: &Metrics,
) -> Result<(RecoveryReport, NamedTable)> {
    let rec = reconstruct(root, crate::consts::PAGE_SIZE, region.page_count())?;
    region
        .write_raw(0, &rec.pages)
        .context("copy reconstructed image into region")?;

    if rec.scan.torn_bytes > 0 {
        let path = log_path(root);
        let f = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("open log {} for tail truncation", path.display()))?;
        f.set_len(rec.scan.valid_len)
            .with_context(|| format!("truncate torn tail of {}", path.display()))?;
        f.sync_all()?;
        metrics.record_log_truncation();
        warn!(
            "recovery: torn log tail of {} byte(s) discarded (log {} -> {})",
            rec.scan.torn_bytes, rec.scan.file_len, rec.scan.valid_len
        );
    }

    let crashed = !meta.clean_shutdown || !rec.scan.clean_tail || stale_process_files;
    let report = RecoveryReport {
        crashed,
        recovered_epoch: rec.epoch,
        image_epoch: rec.image_epoch,
        applied_epochs: rec.applied_epochs,
        torn_bytes: rec.scan.torn_bytes,
        named_allocations: rec.allocs.len(),
    };
    if crashed {
        info!(
            "recovery: prior run did not shut down cleanly; region restored to epoch {} \
             (image epoch {}, {} epoch(s) replayed, {} named allocation(s))",
            report.recovered_epoch,
            report.image_epoch,
            report.applied_epochs,
            report.named_allocations
        );
    } else {
        debug!(
            "recovery: clean start at epoch {} ({} named allocation(s))",
            report.recovered_epoch, report.named_allocations
        );
    }
    Ok((report, rec.allocs))
}
