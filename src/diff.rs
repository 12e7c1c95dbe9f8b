//! Diff Engine: сравнение живой страницы с её twin.
//!
//! - Сравнение по словам u64, внутри отличающегося слова — уточнение по байтам.
//! - Изменённые диапазоны, разделённые не более чем `gap` неизменёнными байтами, сливаются.
//! - Если закодированный размер диапазонов превышает `whole_page_threshold`,
//!   страница логируется целиком ("fast page"); иначе диапазонами ("slow page").
//!
//! Payload (LE):
//!   [kind u8][reserved u8][reserved u16][count u32]
//!   count × { [offset u32][len u32][bytes] }
//! kind = 1 — диапазоны, kind = 2 — целая страница (один диапазон 0..len).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

pub const DIFF_KIND_RANGES: u8 = 1;
pub const DIFF_KIND_WHOLE_PAGE: u8 = 2;

const DIFF_HDR_SIZE: usize = 8;
const DIFF_RANGE_HDR_SIZE: usize = 8;
const WORD: usize = std::mem::size_of::<u64>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffPolicy {
    /// Максимум неизменённых байт между двумя диапазонами, которые ещё сливаются.
    pub gap: usize,
    /// Порог (в байтах payload), выше которого страница пишется целиком.
    pub whole_page_threshold: usize,
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self {
            gap: 16,
            whole_page_threshold: crate::consts::PAGE_SIZE / 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRange {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

impl DiffRange {
    #[inline]
    pub fn end(&self) -> usize {
        self.offset as usize + self.bytes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffBody {
    Ranges(Vec<DiffRange>),
    WholePage(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub page_id: u64,
    pub epoch: u64,
    pub body: DiffBody,
}

/// Посчитать дифф `live` относительно `twin`.
pub fn compute(page_id: u64, epoch: u64, twin: &[u8], live: &[u8], policy: &DiffPolicy) -> DiffRecord {
    debug_assert_eq!(twin.len(), live.len());
    let n = twin.len().min(live.len());

    // Полуинтервалы [start, end) изменённых байт (после слияния по gap).
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let push_byte = |i: usize, spans: &mut Vec<(usize, usize)>| match spans.last_mut() {
        Some(last) if i - last.1 <= policy.gap => last.1 = i + 1,
        _ => spans.push((i, i + 1)),
    };

    let mut off = 0usize;
    while off + WORD <= n {
        let a = LittleEndian::read_u64(&twin[off..off + WORD]);
        let b = LittleEndian::read_u64(&live[off..off + WORD]);
        if a != b {
            for i in off..off + WORD {
                if twin[i] != live[i] {
                    push_byte(i, &mut spans);
                }
            }
        }
        off += WORD;
    }
    for i in off..n {
        if twin[i] != live[i] {
            push_byte(i, &mut spans);
        }
    }

    let encoded: usize = DIFF_HDR_SIZE
        + spans
            .iter()
            .map(|(s, e)| DIFF_RANGE_HDR_SIZE + (e - s))
            .sum::<usize>();

    let body = if !spans.is_empty() && encoded > policy.whole_page_threshold {
        DiffBody::WholePage(live[..n].to_vec())
    } else {
        DiffBody::Ranges(
            spans
                .into_iter()
                .map(|(s, e)| DiffRange {
                    offset: s as u32,
                    bytes: live[s..e].to_vec(),
                })
                .collect(),
        )
    };

    DiffRecord {
        page_id,
        epoch,
        body,
    }
}

impl DiffRecord {
    pub fn is_empty(&self) -> bool {
        match &self.body {
            DiffBody::Ranges(r) => r.is_empty(),
            DiffBody::WholePage(_) => false,
        }
    }

    pub fn is_whole_page(&self) -> bool {
        matches!(self.body, DiffBody::WholePage(_))
    }

    /// Число байт новых данных в записи (без заголовков).
    pub fn changed_bytes(&self) -> usize {
        match &self.body {
            DiffBody::Ranges(r) => r.iter().map(|x| x.bytes.len()).sum(),
            DiffBody::WholePage(p) => p.len(),
        }
    }

    /// Применить запись к образу страницы.
    pub fn apply(&self, page: &mut [u8]) {
        match &self.body {
            DiffBody::Ranges(ranges) => {
                for r in ranges {
                    let start = r.offset as usize;
                    page[start..start + r.bytes.len()].copy_from_slice(&r.bytes);
                }
            }
            DiffBody::WholePage(p) => {
                let n = p.len().min(page.len());
                page[..n].copy_from_slice(&p[..n]);
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        match &self.body {
            DiffBody::Ranges(r) => {
                DIFF_HDR_SIZE
                    + r.iter()
                        .map(|x| DIFF_RANGE_HDR_SIZE + x.bytes.len())
                        .sum::<usize>()
            }
            DiffBody::WholePage(p) => DIFF_HDR_SIZE + DIFF_RANGE_HDR_SIZE + p.len(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        let (kind, count) = match &self.body {
            DiffBody::Ranges(r) => (DIFF_KIND_RANGES, r.len() as u32),
            DiffBody::WholePage(_) => (DIFF_KIND_WHOLE_PAGE, 1u32),
        };
        out[0] = kind;
        LittleEndian::write_u32(&mut out[4..8], count);

        let mut pos = DIFF_HDR_SIZE;
        let mut put = |offset: u32, bytes: &[u8], out: &mut [u8]| {
            LittleEndian::write_u32(&mut out[pos..pos + 4], offset);
            LittleEndian::write_u32(&mut out[pos + 4..pos + 8], bytes.len() as u32);
            pos += DIFF_RANGE_HDR_SIZE;
            out[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        match &self.body {
            DiffBody::Ranges(r) => {
                for x in r {
                    put(x.offset, &x.bytes, &mut out);
                }
            }
            DiffBody::WholePage(p) => put(0, p, &mut out),
        }
        out
    }

    /// Разобрать payload DIFF-записи. `page_size` ограничивает диапазоны.
    pub fn decode(page_id: u64, epoch: u64, payload: &[u8], page_size: usize) -> Result<Self> {
        if payload.len() < DIFF_HDR_SIZE {
            return Err(anyhow!(
                "diff payload too short for page {} (len={})",
                page_id,
                payload.len()
            ));
        }
        let kind = payload[0];
        let count = LittleEndian::read_u32(&payload[4..8]) as usize;

        let mut ranges = Vec::with_capacity(count.min(page_size));
        let mut pos = DIFF_HDR_SIZE;
        let mut prev_end = 0usize;
        for i in 0..count {
            if pos + DIFF_RANGE_HDR_SIZE > payload.len() {
                return Err(anyhow!("diff range header {} truncated (page {})", i, page_id));
            }
            let offset = LittleEndian::read_u32(&payload[pos..pos + 4]) as usize;
            let len = LittleEndian::read_u32(&payload[pos + 4..pos + 8]) as usize;
            pos += DIFF_RANGE_HDR_SIZE;
            if pos + len > payload.len() {
                return Err(anyhow!("diff range {} bytes truncated (page {})", i, page_id));
            }
            if offset < prev_end || offset + len > page_size {
                return Err(anyhow!(
                    "diff range {} out of order or out of page: off={} len={} (page {})",
                    i,
                    offset,
                    len,
                    page_id
                ));
            }
            prev_end = offset + len;
            ranges.push(DiffRange {
                offset: offset as u32,
                bytes: payload[pos..pos + len].to_vec(),
            });
            pos += len;
        }
        if pos != payload.len() {
            return Err(anyhow!(
                "diff payload has {} trailing bytes (page {})",
                payload.len() - pos,
                page_id
            ));
        }

        let body = match kind {
            DIFF_KIND_RANGES => DiffBody::Ranges(ranges),
            DIFF_KIND_WHOLE_PAGE => {
                let mut it = ranges.into_iter();
                match (it.next(), it.next()) {
                    (Some(r), None) if r.offset == 0 => DiffBody::WholePage(r.bytes),
                    _ => {
                        return Err(anyhow!(
                            "whole-page diff must carry exactly one range at 0 (page {})",
                            page_id
                        ))
                    }
                }
            }
            other => return Err(anyhow!("unknown diff kind {} (page {})", other, page_id)),
        };

        Ok(Self {
            page_id,
            epoch,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::PAGE_SIZE;

    fn policy(gap: usize, threshold: usize) -> DiffPolicy {
        DiffPolicy {
            gap,
            whole_page_threshold: threshold,
        }
    }

    #[test]
    fn identical_pages_give_empty_diff() {
        let a = vec![7u8; PAGE_SIZE];
        let d = compute(3, 1, &a, &a, &DiffPolicy::default());
        assert!(d.is_empty());
        assert_eq!(d.changed_bytes(), 0);
    }

    #[test]
    fn single_range() {
        let twin = vec![0u8; PAGE_SIZE];
        let mut live = twin.clone();
        live[10..20].fill(0xFF);
        let d = compute(0, 1, &twin, &live, &DiffPolicy::default());
        assert_eq!(
            d.body,
            DiffBody::Ranges(vec![DiffRange {
                offset: 10,
                bytes: vec![0xFF; 10]
            }])
        );
    }

    #[test]
    fn gap_coalescing() {
        let twin = vec![0u8; PAGE_SIZE];
        let mut live = twin.clone();
        live[0] = 1;
        live[5] = 1; // 4 неизменённых байта между
        live[100] = 1;

        let d = compute(0, 1, &twin, &live, &policy(4, PAGE_SIZE));
        match &d.body {
            DiffBody::Ranges(r) => {
                assert_eq!(r.len(), 2);
                assert_eq!((r[0].offset, r[0].bytes.len()), (0, 6));
                assert_eq!((r[1].offset, r[1].bytes.len()), (100, 1));
            }
            other => panic!("unexpected body {:?}", other),
        }

        let d = compute(0, 1, &twin, &live, &policy(3, PAGE_SIZE));
        match &d.body {
            DiffBody::Ranges(r) => assert_eq!(r.len(), 3),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn whole_page_threshold() {
        let twin = vec![0u8; PAGE_SIZE];
        let mut live = twin.clone();
        live[..PAGE_SIZE * 3 / 4].fill(9);
        let d = compute(1, 2, &twin, &live, &DiffPolicy::default());
        assert!(d.is_whole_page());

        let mut out = twin.clone();
        d.apply(&mut out);
        assert_eq!(out, live);
    }

    #[test]
    fn encode_decode_and_reject_garbage() {
        let twin = vec![0u8; PAGE_SIZE];
        let mut live = twin.clone();
        live[4090..4096].fill(3);
        live[7] = 1;
        let d = compute(9, 4, &twin, &live, &DiffPolicy::default());
        let bytes = d.encode();
        assert_eq!(bytes.len(), d.encoded_len());
        let back = DiffRecord::decode(9, 4, &bytes, PAGE_SIZE).unwrap();
        assert_eq!(back, d);

        // обрезанный payload
        assert!(DiffRecord::decode(9, 4, &bytes[..bytes.len() - 1], PAGE_SIZE).is_err());
        // неизвестный kind
        let mut bad = bytes.clone();
        bad[0] = 77;
        assert!(DiffRecord::decode(9, 4, &bad, PAGE_SIZE).is_err());
        // диапазон за пределами страницы
        assert!(DiffRecord::decode(9, 4, &bytes, 4000).is_err());
    }
}
