//! plog/encode — заголовок записи (28 байт) с CRC32C и запись кадра в writer.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::io::Write;

use super::{
    crc32c_of_parts, LOG_REC_HDR_SIZE, LOG_REC_OFF_CRC32, LOG_REC_OFF_EPOCH, LOG_REC_OFF_FLAGS,
    LOG_REC_OFF_LEN, LOG_REC_OFF_PAGE_ID, LOG_REC_OFF_RESERVED, LOG_REC_OFF_TYPE,
};

/// Заголовок записи с заполненным CRC (по header[0..24) + payload).
pub fn build_hdr_with_crc(
    rec_type: u8,
    epoch: u64,
    page_id: u64,
    payload: &[u8],
) -> [u8; LOG_REC_HDR_SIZE] {
    let mut hdr = [0u8; LOG_REC_HDR_SIZE];
    hdr[LOG_REC_OFF_TYPE] = rec_type;
    hdr[LOG_REC_OFF_FLAGS] = 0;
    LittleEndian::write_u16(&mut hdr[LOG_REC_OFF_RESERVED..LOG_REC_OFF_RESERVED + 2], 0);
    LittleEndian::write_u64(&mut hdr[LOG_REC_OFF_EPOCH..LOG_REC_OFF_EPOCH + 8], epoch);
    LittleEndian::write_u64(&mut hdr[LOG_REC_OFF_PAGE_ID..LOG_REC_OFF_PAGE_ID + 8], page_id);
    LittleEndian::write_u32(
        &mut hdr[LOG_REC_OFF_LEN..LOG_REC_OFF_LEN + 4],
        payload.len() as u32,
    );
    let crc = crc32c_of_parts(&hdr[..LOG_REC_OFF_CRC32], payload);
    LittleEndian::write_u32(&mut hdr[LOG_REC_OFF_CRC32..LOG_REC_OFF_CRC32 + 4], crc);
    hdr
}

/// Записать [header][payload] по текущей позиции writer'а. Возвращает CRC записи.
pub fn write_record<W: Write>(
    writer: &mut W,
    rec_type: u8,
    epoch: u64,
    page_id: u64,
    payload: &[u8],
) -> Result<u32> {
    if payload.len() > u32::MAX as usize {
        return Err(anyhow!(
            "payload too large for log record: {} bytes (max {})",
            payload.len(),
            u32::MAX
        ));
    }
    let hdr = build_hdr_with_crc(rec_type, epoch, page_id, payload);
    writer.write_all(&hdr)?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    Ok(LittleEndian::read_u32(&hdr[LOG_REC_OFF_CRC32..LOG_REC_OFF_CRC32 + 4]))
}
