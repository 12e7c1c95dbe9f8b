//! Именованные персистентные аллокации и тонкий first-fit heap поверх страниц региона.
//!
//! - AllocRecord (name, offset, size) пишется ALLOC-записью внутри эпохи, в которой создан;
//!   после краха восстанавливается ровно тогда, когда восстановлена эта эпоха.
//! - Heap не персистентен сам по себе: после рестарта резервируются только диапазоны
//!   именованных аллокаций, остальное пространство снова свободно.
//!
//! Payload ALLOC (LE): [offset u64][size u64][name_len u32][name utf-8]

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

/// Выравнивание всех выдаваемых блоков.
pub const HEAP_ALIGN: usize = 16;

const ALLOC_HDR_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocRecord {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

impl AllocRecord {
    pub fn encode(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut out = vec![0u8; ALLOC_HDR_SIZE + name.len()];
        LittleEndian::write_u64(&mut out[0..8], self.offset);
        LittleEndian::write_u64(&mut out[8..16], self.size);
        LittleEndian::write_u32(&mut out[16..20], name.len() as u32);
        out[ALLOC_HDR_SIZE..].copy_from_slice(name);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < ALLOC_HDR_SIZE {
            return Err(anyhow!("alloc payload too short ({} bytes)", payload.len()));
        }
        let offset = LittleEndian::read_u64(&payload[0..8]);
        let size = LittleEndian::read_u64(&payload[8..16]);
        let name_len = LittleEndian::read_u32(&payload[16..20]) as usize;
        if ALLOC_HDR_SIZE + name_len != payload.len() {
            return Err(anyhow!(
                "alloc payload length mismatch (name_len={}, payload={})",
                name_len,
                payload.len()
            ));
        }
        let name = std::str::from_utf8(&payload[ALLOC_HDR_SIZE..])
            .map_err(|e| anyhow!("alloc name is not utf-8: {}", e))?
            .to_string();
        Ok(Self { name, offset, size })
    }
}

/// Таблица именованных аллокаций (имя -> запись). Повторное имя перекрывает старое.
#[derive(Debug, Clone, Default)]
pub struct NamedTable {
    map: HashMap<String, AllocRecord>,
}

impl NamedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rec: AllocRecord) -> Option<AllocRecord> {
        self.map.insert(rec.name.clone(), rec)
    }

    pub fn get(&self, name: &str) -> Option<&AllocRecord> {
        self.map.get(name)
    }

    /// Запись, диапазон которой содержит `offset`.
    pub fn covering(&self, offset: u64) -> Option<&AllocRecord> {
        self.map
            .values()
            .find(|r| offset >= r.offset && offset < r.offset + r.size.max(1))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Записи, отсортированные по offset.
    pub fn records(&self) -> Vec<AllocRecord> {
        let mut v: Vec<AllocRecord> = self.map.values().cloned().collect();
        v.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.name.cmp(&b.name)));
        v
    }
}

impl FromIterator<AllocRecord> for NamedTable {
    fn from_iter<I: IntoIterator<Item = AllocRecord>>(iter: I) -> Self {
        let mut t = NamedTable::new();
        for r in iter {
            t.insert(r);
        }
        t
    }
}

#[inline]
fn align_up(n: usize) -> usize {
    (n + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)
}

/// First-fit heap поверх [0, limit) смещений региона.
#[derive(Debug)]
pub struct Heap {
    limit: usize,
    cursor: usize,
    /// offset -> size свободных блоков (сливаются с соседями при free).
    free: BTreeMap<usize, usize>,
    /// offset -> size выданных блоков.
    live: HashMap<usize, usize>,
}

impl Heap {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            cursor: 0,
            free: BTreeMap::new(),
            live: HashMap::new(),
        }
    }

    /// Heap, в котором заняты диапазоны именованных аллокаций.
    pub fn with_reserved(limit: usize, named: &NamedTable) -> Self {
        let mut h = Self::new(limit);
        for r in named.records() {
            h.reserve(r.offset as usize, r.size as usize);
        }
        h
    }

    fn reserve(&mut self, offset: usize, size: usize) {
        let end = align_up(offset + size.max(1));
        if offset > self.cursor {
            self.free.insert(self.cursor, offset - self.cursor);
        }
        self.cursor = self.cursor.max(end);
        self.live.insert(offset, end - offset);
    }

    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let need = align_up(size.max(1));

        let hit = self
            .free
            .iter()
            .find(|(_, &len)| len >= need)
            .map(|(&off, &len)| (off, len));
        if let Some((off, len)) = hit {
            self.free.remove(&off);
            if len > need {
                self.free.insert(off + need, len - need);
            }
            self.live.insert(off, need);
            return Some(off);
        }

        let off = self.cursor;
        let end = off.checked_add(need)?;
        if end > self.limit {
            return None;
        }
        self.cursor = end;
        self.live.insert(off, need);
        Some(off)
    }

    /// Освободить блок; возвращает его размер либо None для неизвестного offset.
    pub fn free(&mut self, offset: usize) -> Option<usize> {
        let size = self.live.remove(&offset)?;
        let mut start = offset;
        let mut len = size;

        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                start = prev_off;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + size)) {
            self.free.remove(&(offset + size));
            len += next_len;
        }

        if start + len == self.cursor {
            self.cursor = start;
        } else {
            self.free.insert(start, len);
        }
        Some(size)
    }

    pub fn usable_size(&self, offset: usize) -> Option<usize> {
        self.live.get(&offset).copied()
    }

    pub fn in_use(&self) -> usize {
        self.live.values().sum()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
