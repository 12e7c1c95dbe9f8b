// src/meta.rs — engine meta (v1)
//
// Формат <root>/nvmeta (LE):
// MAGIC8 = "NVTMETA1"
// u32 version         = 1
// u32 page_size       (== PAGE_SIZE)
// u64 region_pages
// u64 last_epoch      (последняя эпоха, известная на момент записи meta)
// u8  clean_shutdown  (1=clean, 0=unclean)
// u64 instance_id     (совпадает с instance_id в заголовке лога)
//
// Политика:
// - Атомарная запись: tmp+rename, затем fsync родительского каталога.
// - clean_shutdown=false выставляется сразу после открытия движка; true — только в Engine::close().
// - last_epoch — подсказка для инструментов; источником истины по эпохам остаются лог и образ.

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::consts::{META_FILE, PAGE_SIZE};

const META_MAGIC: &[u8; 8] = b"NVTMETA1";
pub const META_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMeta {
    pub version: u32,
    pub page_size: u32,
    pub region_pages: u64,
    pub last_epoch: u64,
    pub clean_shutdown: bool,
    pub instance_id: u64,
}

impl EngineMeta {
    pub fn new(region_pages: u64, instance_id: u64) -> Self {
        Self {
            version: META_VERSION,
            page_size: PAGE_SIZE as u32,
            region_pages,
            last_epoch: 0,
            clean_shutdown: true,
            instance_id,
        }
    }
}

#[inline]
pub fn meta_path(root: &Path) -> PathBuf {
    root.join(META_FILE)
}

#[cfg(unix)]
pub(crate) fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
pub(crate) fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

pub fn meta_exists(root: &Path) -> bool {
    meta_path(root).exists()
}

/// Перезаписать meta через tmp+rename (создаёт, если отсутствует).
pub fn write_meta(root: &Path, m: &EngineMeta) -> Result<()> {
    if m.page_size as usize != PAGE_SIZE {
        return Err(anyhow!(
            "page_size {} is not supported (engine page size is {})",
            m.page_size,
            PAGE_SIZE
        ));
    }

    let path = meta_path(root);
    let tmp = root.join(format!("{}.tmp", META_FILE));
    let _ = fs::remove_file(&tmp);

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .with_context(|| format!("open meta tmp {}", tmp.display()))?;

    write_meta_contents(&mut f, m)?;
    f.sync_all()?;

    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    let _ = fsync_dir(&path);
    Ok(())
}

fn write_meta_contents(f: &mut File, m: &EngineMeta) -> Result<()> {
    f.seek(SeekFrom::Start(0))?;
    f.write_all(META_MAGIC)?;
    f.write_u32::<LittleEndian>(m.version)?;
    f.write_u32::<LittleEndian>(m.page_size)?;
    f.write_u64::<LittleEndian>(m.region_pages)?;
    f.write_u64::<LittleEndian>(m.last_epoch)?;
    f.write_u8(if m.clean_shutdown { 1 } else { 0 })?;
    f.write_u64::<LittleEndian>(m.instance_id)?;
    Ok(())
}

/// Прочитать meta.
pub fn read_meta(root: &Path) -> Result<EngineMeta> {
    let path = meta_path(root);
    let mut f = OpenOptions::new()
        .read(true)
        .open(&path)
        .with_context(|| format!("open meta {}", path.display()))?;

    let mut magic = [0u8; 8];
    f.read_exact(&mut magic)?;
    if &magic != META_MAGIC {
        return Err(anyhow!(
            "bad meta magic at {} (expected {:?}, got {:?})",
            path.display(),
            META_MAGIC,
            magic
        ));
    }

    let version = f.read_u32::<LittleEndian>()?;
    if version != META_VERSION {
        return Err(anyhow!(
            "unsupported meta version {} at {} (expected {})",
            version,
            path.display(),
            META_VERSION
        ));
    }

    let page_size = f.read_u32::<LittleEndian>()?;
    let region_pages = f.read_u64::<LittleEndian>()?;
    let last_epoch = f.read_u64::<LittleEndian>()?;
    let clean_shutdown = f.read_u8()? != 0;
    let instance_id = f.read_u64::<LittleEndian>()?;

    Ok(EngineMeta {
        version,
        page_size,
        region_pages,
        last_epoch,
        clean_shutdown,
        instance_id,
    })
}

/// Пометить meta.clean_shutdown (только при изменении).
pub fn set_clean_shutdown(root: &Path, clean: bool) -> Result<()> {
    let mut m = read_meta(root)?;
    if m.clean_shutdown != clean {
        m.clean_shutdown = clean;
        write_meta(root, &m)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_roundtrip_and_flags() {
        let root = std::env::temp_dir().join(format!("nvt-meta-{}", nanos_for_test()));
        fs::create_dir_all(&root).unwrap();
        assert!(!meta_exists(&root));

        let mut m0 = EngineMeta::new(64, 0xAABBCCDD);
        m0.last_epoch = 17;
        m0.clean_shutdown = false;
        write_meta(&root, &m0).unwrap();
        assert!(meta_exists(&root));

        let m1 = read_meta(&root).unwrap();
        assert_eq!(m1, m0);

        set_clean_shutdown(&root, true).unwrap();
        assert!(read_meta(&root).unwrap().clean_shutdown);

        // неподдерживаемый размер страницы
        let mut bad = m1.clone();
        bad.page_size = 8192;
        assert!(write_meta(&root, &bad).is_err());

        let _ = fs::remove_dir_all(&root);
    }

    fn nanos_for_test() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    }
}
