//! LOCK — владение корнем движка.
//!
//! - Exclusive: открытый Engine (на всё время жизни) и nvtctl compact.
//!   Владелец пишет свой pid в файл, чтобы nvtctl status мог его показать.
//! - Shared: nvtctl recover/status — чтение корня без работающего движка.
//! - Замок advisory (fs2), снимается в Drop; содержимое файла не очищается,
//!   поэтому pid в нём — "последний владелец", а не признак живого процесса.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::consts::LOCK_FILE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

fn open(root: &Path) -> Result<File> {
    let path = lock_path(root);
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))
}

fn record_holder(file: &mut File) -> Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_data()?;
    Ok(())
}

/// Захватить корень без ожидания. Err — корень уже занят.
pub fn try_acquire_lock(root: &Path, mode: LockMode) -> Result<LockGuard> {
    let mut file = open(root)?;
    let path = lock_path(root);
    match mode {
        LockMode::Shared => FileExt::try_lock_shared(&file).with_context(|| {
            format!("engine root {} is owned by a running engine", root.display())
        })?,
        LockMode::Exclusive => {
            FileExt::try_lock_exclusive(&file).with_context(|| {
                let who = last_holder(root)
                    .map(|pid| format!(" (pid {})", pid))
                    .unwrap_or_default();
                format!("engine root {} is already in use{}", root.display(), who)
            })?;
            record_holder(&mut file)
                .with_context(|| format!("record lock holder in {}", path.display()))?;
        }
    }
    Ok(LockGuard { file, path, mode })
}

pub fn try_acquire_exclusive_lock(root: &Path) -> Result<LockGuard> {
    try_acquire_lock(root, LockMode::Exclusive)
}

pub fn try_acquire_shared_lock(root: &Path) -> Result<LockGuard> {
    try_acquire_lock(root, LockMode::Shared)
}

/// pid последнего эксклюзивного владельца (если записан).
pub fn last_holder(root: &Path) -> Option<u32> {
    let mut s = String::new();
    File::open(lock_path(root)).ok()?.read_to_string(&mut s).ok()?;
    s.trim().parse().ok()
}

/// Корень сейчас захвачен эксклюзивно (работает движок или compact).
pub fn is_locked(root: &Path) -> bool {
    if !lock_path(root).exists() {
        return false;
    }
    try_acquire_shared_lock(root).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "nvt-lock-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn exclusive_records_holder_and_excludes() {
        let root = temp_root();
        assert!(!is_locked(&root));
        {
            let g = try_acquire_exclusive_lock(&root).unwrap();
            assert_eq!(g.mode(), LockMode::Exclusive);
            assert_eq!(last_holder(&root), Some(std::process::id()));
            assert!(try_acquire_exclusive_lock(&root).is_err());
        }
        let s = try_acquire_shared_lock(&root).unwrap();
        assert_eq!(s.path(), lock_path(&root).as_path());
        drop(s);
        let _ = std::fs::remove_dir_all(&root);
    }
}
