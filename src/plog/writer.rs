//! plog/writer — LogWriter: единственный писатель лога (сериализуется координатором).
//!
//! - append_epoch пишет весь кортеж эпохи одним write_all и делает fsync (sync_data),
//!   прежде чем вернуть управление. Эпохи строго возрастают.
//! - При ошибке записи длина не сдвигается: следующий append перезапишет частичный хвост.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::alloc::AllocRecord;
use crate::diff::DiffRecord;
use crate::meta::fsync_dir;
use crate::metrics::{Metrics, TimerKind};

use super::encode::write_record;
use super::{
    chain_token, encode_commit_payload, log_path, read_log_header, write_log_header,
    LOG_HDR_SIZE, LOG_REC_ALLOC, LOG_REC_BEGIN, LOG_REC_COMMIT, LOG_REC_DIFF, LOG_REC_SHUTDOWN,
};

/// Итог append_epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendStats {
    pub epoch: u64,
    /// Записей до COMMIT (BEGIN + ALLOC* + DIFF*).
    pub records: u32,
    pub bytes: u64,
    pub token: u32,
}

pub struct LogWriter {
    path: PathBuf,
    file: File,
    len: u64,
    last_durable_epoch: u64,
    instance_id: u64,
    fsync: bool,
    metrics: Arc<Metrics>,
}

impl LogWriter {
    /// Открыть (или создать) лог в `root`. `last_epoch` — последняя эпоха, уже
    /// учтённая восстановлением: новые эпохи должны быть строго больше.
    pub fn open(
        root: &Path,
        page_size: u32,
        instance_id: u64,
        last_epoch: u64,
        fsync: bool,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let path = log_path(root);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open log {}", path.display()))?;

        let mut len = file.metadata()?.len();
        let mut instance = instance_id;
        if len < LOG_HDR_SIZE as u64 {
            debug!("log: writing fresh header to {}", path.display());
            file.set_len(0)?;
            write_log_header(&mut file, page_size, instance_id)?;
            file.sync_all()
                .with_context(|| format!("fsync new log {}", path.display()))?;
            let _ = fsync_dir(&path);
            len = LOG_HDR_SIZE as u64;
        } else {
            let hdr = read_log_header(&mut file)
                .with_context(|| format!("read log header {}", path.display()))?;
            if hdr.page_size != page_size {
                return Err(anyhow!(
                    "log {} has page_size {}, engine uses {}",
                    path.display(),
                    hdr.page_size,
                    page_size
                ));
            }
            if hdr.instance_id != instance_id {
                warn!(
                    "log {}: instance_id {:#x} differs from meta {:#x}",
                    path.display(),
                    hdr.instance_id,
                    instance_id
                );
                instance = hdr.instance_id;
            }
        }

        Ok(Self {
            path,
            file,
            len,
            last_durable_epoch: last_epoch,
            instance_id: instance,
            fsync,
            metrics,
        })
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len <= LOG_HDR_SIZE as u64
    }

    #[inline]
    pub fn last_durable_epoch(&self) -> u64 {
        self.last_durable_epoch
    }

    #[inline]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Подменить дескриптор лога, вернуть прежний (тесты отказов записи).
    #[cfg(test)]
    pub(crate) fn replace_file(&mut self, file: File) -> File {
        std::mem::replace(&mut self.file, file)
    }

    /// Записать кортеж эпохи и дождаться устойчивости.
    pub fn append_epoch(
        &mut self,
        epoch: u64,
        allocs: &[AllocRecord],
        diffs: &[DiffRecord],
    ) -> Result<AppendStats> {
        if epoch <= self.last_durable_epoch {
            return Err(anyhow!(
                "log append out of order: epoch {} <= last durable epoch {}",
                epoch,
                self.last_durable_epoch
            ));
        }
        let metrics = self.metrics.clone();
        let _t = metrics.timer(TimerKind::DiffLogging);

        let mut buf: Vec<u8> = Vec::new();
        let mut token = 0u32;
        let mut records = 0u32;

        let crc = write_record(&mut buf, LOG_REC_BEGIN, epoch, 0, &[])?;
        token = chain_token(token, crc);
        records += 1;

        for a in allocs {
            let crc = write_record(&mut buf, LOG_REC_ALLOC, epoch, 0, &a.encode())?;
            token = chain_token(token, crc);
            records += 1;
        }
        for d in diffs {
            debug_assert_eq!(d.epoch, epoch);
            let crc = write_record(&mut buf, LOG_REC_DIFF, epoch, d.page_id, &d.encode())?;
            token = chain_token(token, crc);
            records += 1;
        }
        write_record(
            &mut buf,
            LOG_REC_COMMIT,
            epoch,
            0,
            &encode_commit_payload(records, token),
        )?;

        self.write_durable(&buf)
            .with_context(|| format!("append epoch {} to {}", epoch, self.path.display()))?;
        self.last_durable_epoch = epoch;

        debug!(
            "log: epoch {} appended ({} record(s), {} byte(s), token={:#010x})",
            epoch,
            records,
            buf.len(),
            token
        );
        Ok(AppendStats {
            epoch,
            records,
            bytes: buf.len() as u64,
            token,
        })
    }

    /// Маркер чистого завершения (последняя закоммиченная эпоха).
    pub fn append_shutdown(&mut self, epoch: u64) -> Result<()> {
        let mut buf = Vec::new();
        write_record(&mut buf, LOG_REC_SHUTDOWN, epoch, 0, &[])?;
        self.write_durable(&buf)
            .with_context(|| format!("append shutdown marker to {}", self.path.display()))
    }

    fn write_durable(&mut self, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(buf)?;
        if self.fsync {
            self.file.sync_data()?;
            self.metrics.record_log_fsync();
        }
        self.len += buf.len() as u64;
        self.metrics.record_log_append(buf.len());
        Ok(())
    }

    /// Усечь до заголовка (после того как образ региона поглотил все эпохи).
    pub fn truncate_to_header(&mut self) -> Result<()> {
        self.truncate_to(LOG_HDR_SIZE as u64)
    }

    /// Усечь до `len` (torn tail / компактация).
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        if len < LOG_HDR_SIZE as u64 || len > self.len {
            return Err(anyhow!(
                "bad log truncation length {} (header {}, current {})",
                len,
                LOG_HDR_SIZE,
                self.len
            ));
        }
        if len == self.len {
            return Ok(());
        }
        self.file
            .set_len(len)
            .with_context(|| format!("truncate log {} to {}", self.path.display(), len))?;
        self.file.sync_all()?;
        debug!("log: truncated {} -> {}", self.len, len);
        self.len = len;
        self.metrics.record_log_truncation();
        Ok(())
    }
}
