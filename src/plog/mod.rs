//! Persistent Log (NVTLOG01) — журнал эпох.
//!
//! Разделение:
//! - encode.rs — заголовок записи + CRC, запись кадра в буфер.
//! - reader.rs — LogCursor: кадры по порядку с проверкой CRC (частичный хвост = конец).
//! - writer.rs — LogWriter: append_epoch (BEGIN, ALLOC*, DIFF*, COMMIT одним write + fsync),
//!   SHUTDOWN, усечения.
//! - replay.rs — scan_log: валидный префикс закоммиченных эпох, torn tail, применение к образу.
//!
//! Формат файла <root>/nvlog-000001.log:
//!   header 24 байта: [magic8 "NVTLOG01"][page_size u32][version u32][instance_id u64]
//!   далее записи: [type u8][flags u8][reserved u16][epoch u64][page_id u64][len u32][crc32c u32][payload]
//!   CRC32C — по header[0..24) + payload.
//!
//! Кортеж эпохи: BEGIN(e) ALLOC(e)* DIFF(e)* COMMIT(e).
//! COMMIT payload: [record_count u32][token u32], token = CRC32C-цепочка по CRC всех записей
//! кортежа до COMMIT (BEGIN, ALLOC*, DIFF*). Эпоха без валидного COMMIT не применяется.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::consts::LOG_FILE;

pub const LOG_MAGIC: &[u8; 8] = b"NVTLOG01";
pub const LOG_VERSION: u32 = 1;
pub const LOG_HDR_SIZE: usize = 24;

const LOG_HDR_OFF_PAGE_SIZE: usize = 8;
const LOG_HDR_OFF_VERSION: usize = 12;
const LOG_HDR_OFF_INSTANCE: usize = 16;

// Record header: 28 байт (CRC на смещении 24..28)
pub const LOG_REC_HDR_SIZE: usize = 28;

pub const LOG_REC_OFF_TYPE: usize = 0;
pub const LOG_REC_OFF_FLAGS: usize = 1;
pub const LOG_REC_OFF_RESERVED: usize = 2;
pub const LOG_REC_OFF_EPOCH: usize = 4;
pub const LOG_REC_OFF_PAGE_ID: usize = 12;
pub const LOG_REC_OFF_LEN: usize = 20;
pub const LOG_REC_OFF_CRC32: usize = 24;

// Типы записей
pub const LOG_REC_BEGIN: u8 = 1;
pub const LOG_REC_DIFF: u8 = 2;
pub const LOG_REC_ALLOC: u8 = 3;
pub const LOG_REC_COMMIT: u8 = 4;
pub const LOG_REC_SHUTDOWN: u8 = 5;

pub const COMMIT_PAYLOAD_SIZE: usize = 8;

/// Инкрементальный CRC32C по двум срезам без аллокаций.
#[inline]
pub fn crc32c_of_parts(head_without_crc: &[u8], payload: &[u8]) -> u32 {
    let c = crc32c::crc32c_append(0, head_without_crc);
    crc32c::crc32c_append(c, payload)
}

/// Дописать CRC записи к токену маркера.
#[inline]
pub fn chain_token(token: u32, record_crc: u32) -> u32 {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, record_crc);
    crc32c::crc32c_append(token, &b)
}

pub fn encode_commit_payload(record_count: u32, token: u32) -> [u8; COMMIT_PAYLOAD_SIZE] {
    let mut p = [0u8; COMMIT_PAYLOAD_SIZE];
    LittleEndian::write_u32(&mut p[0..4], record_count);
    LittleEndian::write_u32(&mut p[4..8], token);
    p
}

pub fn decode_commit_payload(p: &[u8]) -> Option<(u32, u32)> {
    if p.len() != COMMIT_PAYLOAD_SIZE {
        return None;
    }
    Some((LittleEndian::read_u32(&p[0..4]), LittleEndian::read_u32(&p[4..8])))
}

/// Случайный instance_id (пишется в заголовок лога и в meta).
pub fn generate_instance_id() -> u64 {
    use rand::RngCore;
    let mut buf = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    LittleEndian::read_u64(&buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub page_size: u32,
    pub version: u32,
    pub instance_id: u64,
}

pub fn write_log_header(f: &mut File, page_size: u32, instance_id: u64) -> Result<()> {
    let mut hdr = [0u8; LOG_HDR_SIZE];
    hdr[..8].copy_from_slice(LOG_MAGIC);
    LittleEndian::write_u32(&mut hdr[LOG_HDR_OFF_PAGE_SIZE..LOG_HDR_OFF_PAGE_SIZE + 4], page_size);
    LittleEndian::write_u32(&mut hdr[LOG_HDR_OFF_VERSION..LOG_HDR_OFF_VERSION + 4], LOG_VERSION);
    LittleEndian::write_u64(&mut hdr[LOG_HDR_OFF_INSTANCE..LOG_HDR_OFF_INSTANCE + 8], instance_id);
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&hdr)?;
    Ok(())
}

pub fn read_log_header(f: &mut File) -> Result<LogHeader> {
    if f.metadata()?.len() < LOG_HDR_SIZE as u64 {
        return Err(anyhow!("log too small (< header)"));
    }
    let mut hdr = [0u8; LOG_HDR_SIZE];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut hdr)?;
    if &hdr[..8] != LOG_MAGIC {
        return Err(anyhow!("bad log magic"));
    }
    let version = LittleEndian::read_u32(&hdr[LOG_HDR_OFF_VERSION..LOG_HDR_OFF_VERSION + 4]);
    if version != LOG_VERSION {
        return Err(anyhow!("unsupported log version {}", version));
    }
    Ok(LogHeader {
        page_size: LittleEndian::read_u32(&hdr[LOG_HDR_OFF_PAGE_SIZE..LOG_HDR_OFF_PAGE_SIZE + 4]),
        version,
        instance_id: LittleEndian::read_u64(&hdr[LOG_HDR_OFF_INSTANCE..LOG_HDR_OFF_INSTANCE + 8]),
    })
}

/// Прочитать заголовок по пути (для CLI).
pub fn read_log_header_at(path: &Path) -> Result<LogHeader> {
    let mut f = File::open(path).with_context(|| format!("open log {}", path.display()))?;
    read_log_header(&mut f).with_context(|| format!("read log header {}", path.display()))
}

pub fn log_path(root: &Path) -> PathBuf {
    root.join(LOG_FILE)
}

pub fn type_name(rec_type: u8) -> &'static str {
    match rec_type {
        LOG_REC_BEGIN => "BEGIN",
        LOG_REC_DIFF => "DIFF",
        LOG_REC_ALLOC => "ALLOC",
        LOG_REC_COMMIT => "COMMIT",
        LOG_REC_SHUTDOWN => "SHUTDOWN",
        _ => "UNKNOWN",
    }
}

pub mod encode;
pub mod reader;
pub mod replay;
pub mod writer;

pub use replay::{scan_log, CommittedEpoch, LogScan};
pub use writer::{AppendStats, LogWriter};
