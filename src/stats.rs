//! Process-файлы: stats-<pid>.shm и metadata-<pid>.shm.
//!
//! - Фиксированный размер (PROCESS_FILE_PAGES страниц), отображаются через memmap2::MmapRaw,
//!   поэтому внешние инструменты могут читать их, пока процесс жив.
//! - stats: [magic8 "NVTSTAT1"][slot_count u32][reserved u32][slots u64 × slot_count]
//! - metadata: [magic8 "NVTMETA0"][pid u32][reserved u32][thread_index u64][open_epoch u64]
//!   [named_allocations u64]
//! - Удаляются при чистом завершении; файлы чужого pid при открытии — слабый признак краха.

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use memmap2::MmapRaw;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::consts::{
    METADATA_FILE_PREFIX, PAGE_SIZE, PROCESS_FILE_EXT, PROCESS_FILE_PAGES, STATS_FILE_PREFIX,
};
use crate::metrics::MetricsSnapshot;

const STATS_MAGIC: &[u8; 8] = b"NVTSTAT1";
const METADATA_MAGIC: &[u8; 8] = b"NVTMETA0";
const STATS_SLOTS_OFF: usize = 16;

pub fn stats_file_path(root: &Path, pid: u32) -> PathBuf {
    root.join(format!("{}{}.{}", STATS_FILE_PREFIX, pid, PROCESS_FILE_EXT))
}

pub fn metadata_file_path(root: &Path, pid: u32) -> PathBuf {
    root.join(format!("{}{}.{}", METADATA_FILE_PREFIX, pid, PROCESS_FILE_EXT))
}

/// Содержимое metadata-файла.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ProcessMetadata {
    pub pid: u32,
    pub thread_index: u64,
    pub open_epoch: u64,
    pub named_allocations: u64,
}

struct Mapped {
    path: PathBuf,
    map: MmapRaw,
}

impl Mapped {
    fn create(path: PathBuf) -> Result<Self> {
        let f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("create process file {}", path.display()))?;
        f.set_len((PROCESS_FILE_PAGES * PAGE_SIZE) as u64)
            .with_context(|| format!("size process file {}", path.display()))?;
        let map = MmapRaw::map_raw(&f).with_context(|| format!("mmap {}", path.display()))?;
        Ok(Self { path, map })
    }

    fn write(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.map.len());
        // SAFETY: диапазон внутри отображения; запись сериализуется замком владельца.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
    }
}

pub struct ProcessFiles {
    pid: u32,
    stats: Mapped,
    metadata: Mapped,
}

impl ProcessFiles {
    pub fn create(root: &Path, pid: u32) -> Result<Self> {
        let stats = Mapped::create(stats_file_path(root, pid))?;
        let metadata = Mapped::create(metadata_file_path(root, pid))?;
        stats.write(0, STATS_MAGIC);
        metadata.write(0, METADATA_MAGIC);
        debug!("process files created for pid {}", pid);
        Ok(Self {
            pid,
            stats,
            metadata,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn publish_stats(&self, snap: &MetricsSnapshot) {
        let slots = snap.slots();
        let mut buf = vec![0u8; 8 + slots.len() * 8];
        LittleEndian::write_u32(&mut buf[0..4], slots.len() as u32);
        for (i, v) in slots.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[8 + i * 8..16 + i * 8], *v);
        }
        self.stats.write(8, &buf);
    }

    pub fn publish_metadata(&self, m: &ProcessMetadata) {
        let mut buf = [0u8; 32];
        LittleEndian::write_u32(&mut buf[0..4], m.pid);
        LittleEndian::write_u64(&mut buf[8..16], m.thread_index);
        LittleEndian::write_u64(&mut buf[16..24], m.open_epoch);
        LittleEndian::write_u64(&mut buf[24..32], m.named_allocations);
        self.metadata.write(8, &buf);
    }

    /// Удалить оба файла (чистое завершение).
    pub fn remove(self) -> Result<()> {
        let ProcessFiles {
            stats, metadata, ..
        } = self;
        for m in [stats, metadata] {
            let Mapped { path, map } = m;
            drop(map);
            fs::remove_file(&path)
                .with_context(|| format!("remove process file {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_pid(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(&format!(".{}", PROCESS_FILE_EXT))?;
    let pid = stem
        .strip_prefix(STATS_FILE_PREFIX)
        .or_else(|| stem.strip_prefix(METADATA_FILE_PREFIX))?;
    pid.parse().ok()
}

/// Process-файлы в корне, принадлежащие не `own_pid`.
pub fn stale_process_files(root: &Path, own_pid: u32) -> Result<Vec<(u32, PathBuf)>> {
    let mut out = Vec::new();
    let rd = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("read dir {}", root.display())),
    };
    for entry in rd {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(pid) = parse_pid(name) {
            if pid != own_pid {
                out.push((pid, entry.path()));
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Удалить чужие process-файлы. Возвращает их число.
pub fn remove_stale(root: &Path, own_pid: u32) -> Result<usize> {
    let stale = stale_process_files(root, own_pid)?;
    for (pid, path) in &stale {
        warn!(
            "stale process file of pid {} found: {} (previous run did not shut down cleanly)",
            pid,
            path.display()
        );
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(stale.len())
}

/// Прочитать metadata-файл (для nvtctl status).
pub fn read_metadata(path: &Path) -> Result<Option<ProcessMetadata>> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    if bytes.len() < 40 || &bytes[..8] != METADATA_MAGIC {
        return Ok(None);
    }
    Ok(Some(ProcessMetadata {
        pid: LittleEndian::read_u32(&bytes[8..12]),
        thread_index: LittleEndian::read_u64(&bytes[16..24]),
        open_epoch: LittleEndian::read_u64(&bytes[24..32]),
        named_allocations: LittleEndian::read_u64(&bytes[32..40]),
    }))
}

/// Прочитать слоты stats-файла.
pub fn read_stats_slots(path: &Path) -> Result<Vec<u64>> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    if bytes.len() < STATS_SLOTS_OFF || &bytes[..8] != STATS_MAGIC {
        return Ok(Vec::new());
    }
    let n = LittleEndian::read_u32(&bytes[8..12]) as usize;
    let n = n.min((bytes.len() - STATS_SLOTS_OFF) / 8);
    Ok((0..n)
        .map(|i| LittleEndian::read_u64(&bytes[STATS_SLOTS_OFF + i * 8..STATS_SLOTS_OFF + i * 8 + 8]))
        .collect())
}
