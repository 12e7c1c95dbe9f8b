//! Region Image (region.img) — компактный снимок закоммиченного региона на эпоху E.
//!
//! Формат (LE):
//!   [magic8 "NVTIMG01"][page_size u32][page_count u32][epoch u64][alloc_count u32][crc32 u32]
//!   alloc_count × { [len u32][ALLOC payload] }
//!   page_count × PAGE_SIZE байт страниц
//! crc32 (crc32fast) — по заголовку без поля crc, таблице аллокаций и страницам.
//!
//! Политика:
//! - Запись атомарная: tmp + rename + fsync каталога.
//! - После записи образа лог усекается до заголовка; при крахе между этими шагами
//!   реплей применяет только эпохи > E, так что повтор безопасен.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use log::info;
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::alloc::AllocRecord;
use crate::consts::{IMAGE_FILE, PAGE_SIZE};
use crate::meta::fsync_dir;
use crate::metrics::Metrics;
use crate::plog::LogWriter;

const IMAGE_MAGIC: &[u8; 8] = b"NVTIMG01";
const IMAGE_HDR_SIZE: usize = 32;
const IMAGE_OFF_CRC: usize = 28;

#[derive(Debug, Clone)]
pub struct RegionImage {
    pub page_size: u32,
    pub page_count: u32,
    pub epoch: u64,
    pub allocs: Vec<AllocRecord>,
    pub pages: Vec<u8>,
}

pub fn image_path(root: &Path) -> PathBuf {
    root.join(IMAGE_FILE)
}

fn build_header(page_count: u32, epoch: u64, alloc_count: u32) -> [u8; IMAGE_HDR_SIZE] {
    let mut h = [0u8; IMAGE_HDR_SIZE];
    h[..8].copy_from_slice(IMAGE_MAGIC);
    LittleEndian::write_u32(&mut h[8..12], PAGE_SIZE as u32);
    LittleEndian::write_u32(&mut h[12..16], page_count);
    LittleEndian::write_u64(&mut h[16..24], epoch);
    LittleEndian::write_u32(&mut h[24..28], alloc_count);
    h
}

/// Записать образ (tmp+rename).
pub fn write_image(root: &Path, epoch: u64, pages: &[u8], allocs: &[AllocRecord]) -> Result<()> {
    if pages.len() % PAGE_SIZE != 0 {
        return Err(anyhow!(
            "image length {} is not a multiple of page size {}",
            pages.len(),
            PAGE_SIZE
        ));
    }
    let page_count = (pages.len() / PAGE_SIZE) as u32;
    let mut hdr = build_header(page_count, epoch, allocs.len() as u32);

    let table: Vec<Vec<u8>> = allocs.iter().map(|a| a.encode()).collect();
    let mut crc = Crc32::new();
    crc.update(&hdr[..IMAGE_OFF_CRC]);
    let mut len_buf = [0u8; 4];
    for entry in &table {
        LittleEndian::write_u32(&mut len_buf, entry.len() as u32);
        crc.update(&len_buf);
        crc.update(entry);
    }
    crc.update(pages);
    LittleEndian::write_u32(&mut hdr[IMAGE_OFF_CRC..IMAGE_OFF_CRC + 4], crc.finalize());

    let path = image_path(root);
    let tmp = root.join(format!("{}.tmp", IMAGE_FILE));
    let _ = fs::remove_file(&tmp);
    {
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open image tmp {}", tmp.display()))?;
        let mut w = BufWriter::new(f);
        w.write_all(&hdr)?;
        for entry in &table {
            LittleEndian::write_u32(&mut len_buf, entry.len() as u32);
            w.write_all(&len_buf)?;
            w.write_all(entry)?;
        }
        w.write_all(pages)?;
        let f = w
            .into_inner()
            .map_err(|e| anyhow!("flush image {}: {}", tmp.display(), e.error()))?;
        f.sync_all()
            .with_context(|| format!("fsync image tmp {}", tmp.display()))?;
    }
    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    let _ = fsync_dir(&path);
    Ok(())
}

/// Прочитать образ, если он есть.
pub fn read_image(root: &Path) -> Result<Option<RegionImage>> {
    let path = image_path(root);
    if !path.exists() {
        return Ok(None);
    }
    let f = File::open(&path).with_context(|| format!("open image {}", path.display()))?;
    // SAFETY: файл меняется только через tmp+rename, отображённый inode не переписывается.
    let map = unsafe { Mmap::map(&f) }.with_context(|| format!("mmap image {}", path.display()))?;
    let buf: &[u8] = &map;

    if buf.len() < IMAGE_HDR_SIZE || &buf[..8] != IMAGE_MAGIC {
        return Err(anyhow!("bad image header in {}", path.display()));
    }
    let page_size = LittleEndian::read_u32(&buf[8..12]);
    let page_count = LittleEndian::read_u32(&buf[12..16]);
    let epoch = LittleEndian::read_u64(&buf[16..24]);
    let alloc_count = LittleEndian::read_u32(&buf[24..28]) as usize;
    let stored_crc = LittleEndian::read_u32(&buf[IMAGE_OFF_CRC..IMAGE_OFF_CRC + 4]);
    if page_size as usize != PAGE_SIZE {
        return Err(anyhow!(
            "image {} has page size {}, engine uses {}",
            path.display(),
            page_size,
            PAGE_SIZE
        ));
    }

    let mut crc = Crc32::new();
    crc.update(&buf[..IMAGE_OFF_CRC]);

    let mut pos = IMAGE_HDR_SIZE;
    let mut allocs = Vec::with_capacity(alloc_count.min(1 << 16));
    for i in 0..alloc_count {
        if pos + 4 > buf.len() {
            return Err(anyhow!("image {}: alloc entry {} truncated", path.display(), i));
        }
        let n = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
        if pos + 4 + n > buf.len() {
            return Err(anyhow!("image {}: alloc entry {} truncated", path.display(), i));
        }
        crc.update(&buf[pos..pos + 4 + n]);
        allocs.push(
            AllocRecord::decode(&buf[pos + 4..pos + 4 + n])
                .with_context(|| format!("image {}: alloc entry {}", path.display(), i))?,
        );
        pos += 4 + n;
    }

    let pages_len = page_count as usize * PAGE_SIZE;
    if buf.len() != pos + pages_len {
        return Err(anyhow!(
            "image {}: expected {} page bytes, found {}",
            path.display(),
            pages_len,
            buf.len() - pos
        ));
    }
    crc.update(&buf[pos..]);
    let calc = crc.finalize();
    if calc != stored_crc {
        return Err(anyhow!(
            "image {}: CRC mismatch (stored={}, calc={})",
            path.display(),
            stored_crc,
            calc
        ));
    }

    Ok(Some(RegionImage {
        page_size,
        page_count,
        epoch,
        allocs,
        pages: buf[pos..].to_vec(),
    }))
}

/// Итог компактации.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub epoch: u64,
    pub log_bytes_before: u64,
}

/// Свернуть образ + лог в новый образ и усечь лог. Вызывается под замком писателя лога.
pub fn compact(root: &Path, region_pages: usize, writer: &mut LogWriter, metrics: &Metrics) -> Result<CompactionReport> {
    let before = writer.len();
    let rec = crate::recovery::reconstruct(root, PAGE_SIZE, region_pages)
        .with_context(|| format!("reconstruct region for compaction in {}", root.display()))?;
    write_image(root, rec.epoch, &rec.pages, &rec.allocs.records())?;
    writer.truncate_to_header()?;
    metrics.record_compaction();
    info!(
        "compaction: image at epoch {} written, log {} -> {} bytes",
        rec.epoch,
        before,
        writer.len()
    );
    Ok(CompactionReport {
        epoch: rec.epoch,
        log_bytes_before: before,
    })
}
