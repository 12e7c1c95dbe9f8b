//! plog/reader — курсор по кадрам лога.
//!
//! LogCursor держит файл, текущую позицию и длину файла на момент открытия.
//! next_record():
//! - Ok(Some(rec)) — кадр целый и CRC сошёлся, позиция сдвинута за него;
//! - Ok(None)      — частичный хвост (заголовок или payload не умещаются);
//! - Err           — CRC mismatch или ошибка чтения; позиция не меняется.
//!
//! Длина payload проверяется по длине файла до выделения буфера, поэтому битое
//! поле len в хвосте даёт Ok(None), а не огромную аллокацию.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use super::{
    crc32c_of_parts, LOG_REC_HDR_SIZE, LOG_REC_OFF_CRC32, LOG_REC_OFF_EPOCH, LOG_REC_OFF_FLAGS,
    LOG_REC_OFF_LEN, LOG_REC_OFF_PAGE_ID, LOG_REC_OFF_TYPE,
};

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub rec_type: u8,
    pub flags: u8,
    pub epoch: u64,
    pub page_id: u64,
    pub payload: Vec<u8>,
    pub crc: u32,
    /// Смещение заголовка в файле.
    pub pos: u64,
}

impl LogRecord {
    /// Смещение сразу за кадром.
    pub fn end(&self) -> u64 {
        self.pos + (LOG_REC_HDR_SIZE + self.payload.len()) as u64
    }
}

pub struct LogCursor {
    file: File,
    pos: u64,
    len: u64,
}

impl LogCursor {
    /// Курсор с позиции `start` (обычно LOG_HDR_SIZE).
    pub fn new(file: File, start: u64) -> Result<Self> {
        let len = file.metadata().context("stat log file")?.len();
        Ok(Self {
            file,
            pos: start,
            len,
        })
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    #[inline]
    pub fn file_len(&self) -> u64 {
        self.len
    }

    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        let pos = self.pos;
        if pos + LOG_REC_HDR_SIZE as u64 > self.len {
            return Ok(None);
        }

        let mut hdr = [0u8; LOG_REC_HDR_SIZE];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file
            .read_exact(&mut hdr)
            .with_context(|| format!("read log record header at {}", pos))?;

        let payload_len = LittleEndian::read_u32(&hdr[LOG_REC_OFF_LEN..LOG_REC_OFF_LEN + 4]) as u64;
        let end = pos + LOG_REC_HDR_SIZE as u64 + payload_len;
        if end > self.len {
            return Ok(None);
        }
        let mut payload = vec![0u8; payload_len as usize];
        self.file
            .read_exact(&mut payload)
            .with_context(|| format!("read log record payload at {}", pos))?;

        let stored = LittleEndian::read_u32(&hdr[LOG_REC_OFF_CRC32..LOG_REC_OFF_CRC32 + 4]);
        let calc = crc32c_of_parts(&hdr[..LOG_REC_OFF_CRC32], &payload);
        if stored != calc {
            return Err(anyhow!(
                "log record at {}: crc mismatch (stored {:#010x}, computed {:#010x})",
                pos,
                stored,
                calc
            ));
        }

        self.pos = end;
        Ok(Some(LogRecord {
            rec_type: hdr[LOG_REC_OFF_TYPE],
            flags: hdr[LOG_REC_OFF_FLAGS],
            epoch: LittleEndian::read_u64(&hdr[LOG_REC_OFF_EPOCH..LOG_REC_OFF_EPOCH + 8]),
            page_id: LittleEndian::read_u64(&hdr[LOG_REC_OFF_PAGE_ID..LOG_REC_OFF_PAGE_ID + 8]),
            payload,
            crc: stored,
            pos,
        }))
    }
}
