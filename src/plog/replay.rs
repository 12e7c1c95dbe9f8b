//! plog/replay — сканирование лога и применение закоммиченных эпох.
//!
//! Валидный префикс — последовательность кортежей BEGIN(e) .. COMMIT(e) с верным маркером
//! и строго возрастающими e, плюс SHUTDOWN-записи между ними. Префикс обрывается на:
//! - частичном хвосте или CRC mismatch;
//! - кортеже без COMMIT, с неверным count/token или с записью чужой эпохи;
//! - эпохе, не превышающей предыдущую;
//! - неразбираемом ALLOC/DIFF payload.
//! Всё после valid_len — torn tail: его записи никогда не применяются.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fs::OpenOptions;
use std::path::Path;

use crate::alloc::AllocRecord;
use crate::diff::DiffRecord;

use super::reader::{LogCursor, LogRecord};
use super::{
    chain_token, decode_commit_payload, read_log_header, type_name, LOG_HDR_SIZE, LOG_REC_ALLOC,
    LOG_REC_BEGIN, LOG_REC_COMMIT, LOG_REC_DIFF, LOG_REC_SHUTDOWN,
};

#[derive(Debug, Clone)]
pub struct CommittedEpoch {
    pub epoch: u64,
    pub allocs: Vec<AllocRecord>,
    pub diffs: Vec<DiffRecord>,
    /// Смещение BEGIN и конец COMMIT в файле.
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone)]
pub struct LogScan {
    pub instance_id: u64,
    pub page_size: u32,
    pub epochs: Vec<CommittedEpoch>,
    /// Конец последнего валидного COMMIT/SHUTDOWN (или заголовка).
    pub valid_len: u64,
    pub file_len: u64,
    pub torn_bytes: u64,
    /// Лог пуст или последняя валидная запись — SHUTDOWN, и хвоста нет.
    pub clean_tail: bool,
    pub last_epoch: u64,
    pub shutdown_epoch: Option<u64>,
}

impl LogScan {
    /// Применить эпохи > from_epoch к образу региона. Возвращает число применённых эпох.
    pub fn replay_onto(&self, image: &mut [u8], from_epoch: u64) -> Result<usize> {
        let page_size = self.page_size as usize;
        let mut applied = 0usize;
        for e in self.epochs.iter().filter(|e| e.epoch > from_epoch) {
            for d in &e.diffs {
                let start = d.page_id as usize * page_size;
                let end = start + page_size;
                if end > image.len() {
                    return Err(anyhow!(
                        "epoch {}: diff for page {} is outside the region ({} bytes)",
                        e.epoch,
                        d.page_id,
                        image.len()
                    ));
                }
                d.apply(&mut image[start..end]);
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Именованные аллокации из эпох > from_epoch, в порядке лога.
    pub fn allocs_after(&self, from_epoch: u64) -> impl Iterator<Item = &AllocRecord> {
        self.epochs
            .iter()
            .filter(move |e| e.epoch > from_epoch)
            .flat_map(|e| e.allocs.iter())
    }
}

/// Следующий целый кадр; битый или частичный хвост — конец валидного префикса.
fn next(cur: &mut LogCursor) -> Option<LogRecord> {
    match cur.next_record() {
        Ok(rec) => rec,
        Err(e) => {
            debug!("log scan: stop at {}: {:#}", cur.pos(), e);
            None
        }
    }
}

/// Прочитать кортеж эпохи, начинающийся с BEGIN. None — кортеж неполный или битый.
fn read_tuple(cur: &mut LogCursor, begin: LogRecord, page_size: usize) -> Option<CommittedEpoch> {
    let epoch = begin.epoch;
    let mut token = chain_token(0, begin.crc);
    let mut count = 1u32;
    let mut allocs = Vec::new();
    let mut diffs = Vec::new();

    loop {
        let rec = next(cur)?;
        if rec.epoch != epoch {
            debug!(
                "log scan: {} at {} carries epoch {} inside tuple of epoch {}",
                type_name(rec.rec_type),
                rec.pos,
                rec.epoch,
                epoch
            );
            return None;
        }
        match rec.rec_type {
            LOG_REC_COMMIT => {
                let (c, t) = decode_commit_payload(&rec.payload)?;
                if c != count || t != token {
                    debug!(
                        "log scan: bad marker for epoch {} (count {}/{}, token {:#x}/{:#x})",
                        epoch, c, count, t, token
                    );
                    return None;
                }
                return Some(CommittedEpoch {
                    epoch,
                    allocs,
                    diffs,
                    start: begin.pos,
                    end: rec.end(),
                });
            }
            LOG_REC_ALLOC => match AllocRecord::decode(&rec.payload) {
                Ok(a) => allocs.push(a),
                Err(e) => {
                    debug!("log scan: bad ALLOC at {}: {:#}", rec.pos, e);
                    return None;
                }
            },
            LOG_REC_DIFF => match DiffRecord::decode(rec.page_id, epoch, &rec.payload, page_size) {
                Ok(d) => diffs.push(d),
                Err(e) => {
                    debug!("log scan: bad DIFF at {}: {:#}", rec.pos, e);
                    return None;
                }
            },
            LOG_REC_BEGIN | LOG_REC_SHUTDOWN => return None,
            other => {
                debug!("log scan: skip unknown record type {} at {}", other, rec.pos);
            }
        }
        token = chain_token(token, rec.crc);
        count += 1;
    }
}

/// Просканировать лог. Отсутствующий файл — пустой скан.
pub fn scan_log(path: &Path) -> Result<LogScan> {
    let mut scan = LogScan {
        instance_id: 0,
        page_size: crate::consts::PAGE_SIZE as u32,
        epochs: Vec::new(),
        valid_len: LOG_HDR_SIZE as u64,
        file_len: 0,
        torn_bytes: 0,
        clean_tail: true,
        last_epoch: 0,
        shutdown_epoch: None,
    };
    if !path.exists() {
        scan.valid_len = 0;
        return Ok(scan);
    }

    let mut f = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))?;
    let len = f.metadata()?.len();
    scan.file_len = len;
    if len < LOG_HDR_SIZE as u64 {
        // Заголовок не успел записаться — лог пустой.
        scan.valid_len = 0;
        scan.torn_bytes = len;
        scan.clean_tail = len == 0;
        return Ok(scan);
    }
    let hdr = read_log_header(&mut f).with_context(|| format!("read log header {}", path.display()))?;
    scan.instance_id = hdr.instance_id;
    scan.page_size = hdr.page_size;

    let mut cur = LogCursor::new(f, LOG_HDR_SIZE as u64)?;
    let mut last_was_shutdown = false;
    let mut any_record = false;

    while let Some(rec) = next(&mut cur) {
        match rec.rec_type {
            LOG_REC_SHUTDOWN => {
                scan.shutdown_epoch = Some(rec.epoch);
                last_was_shutdown = true;
                any_record = true;
                scan.valid_len = rec.end();
            }
            LOG_REC_BEGIN => {
                if rec.epoch <= scan.last_epoch {
                    warn!(
                        "log scan: epoch {} at {} does not increase (last {}), stop",
                        rec.epoch, rec.pos, scan.last_epoch
                    );
                    break;
                }
                match read_tuple(&mut cur, rec, hdr.page_size as usize) {
                    Some(t) => {
                        scan.last_epoch = t.epoch;
                        scan.valid_len = t.end;
                        last_was_shutdown = false;
                        any_record = true;
                        scan.epochs.push(t);
                    }
                    None => break,
                }
            }
            other => {
                debug!(
                    "log scan: stray {} record at {}, stop",
                    type_name(other),
                    rec.pos
                );
                break;
            }
        }
    }

    scan.torn_bytes = len - scan.valid_len;
    scan.clean_tail = scan.torn_bytes == 0 && (!any_record || last_was_shutdown);
    Ok(scan)
}
