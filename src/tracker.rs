//! Page Access Tracker: read-only страницы, первая запись -> twin + dirty + writable.
//!
//! Состояние:
//! - PageDescriptor на каждую страницу: флаг writable (атомарный) и замок с
//!   {dirty, epoch, owner, twin, frozen}. Взаимное исключение — в пределах страницы.
//! - DirtySet открытой эпохи: номер эпохи, страницы, писатели, новые аллокации.
//!   Замок берётся коротко: только чтобы дописать страницу или забрать набор целиком.
//!
//! Порядок замков: дескриптор -> dirty set. freeze() забирает dirty set и отпускает его
//! до того, как трогать дескрипторы.
//!
//! Жизненный цикл страницы в эпохе e:
//!   RO --fault--> twin, dirty(e), RW --freeze--> RO --collect(e)--> дифф, twin в пул.
//! Если страницу снова пишут до collect(e), дифф эпохи e считается на fault'е и
//! откладывается в `frozen` — новая запись не попадает в закрывающуюся эпоху.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::alloc::AllocRecord;
use crate::consts::PAGE_SIZE;
use crate::diff::{self, DiffPolicy, DiffRecord};
use crate::metrics::Metrics;
use crate::region::{Protection, Region};
use crate::trap::FaultAction;
use crate::twin::{Twin, TwinPool, TwinPoolExhausted};

#[derive(Debug)]
pub enum TrackerError {
    TwinPoolExhausted(TwinPoolExhausted),
    Protection { page_id: u64, message: String },
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::TwinPoolExhausted(e) => write!(f, "{}", e),
            TrackerError::Protection { page_id, message } => {
                write!(f, "protection change failed for page {}: {}", page_id, message)
            }
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<TwinPoolExhausted> for TrackerError {
    fn from(e: TwinPoolExhausted) -> Self {
        TrackerError::TwinPoolExhausted(e)
    }
}

#[derive(Default)]
struct PageState {
    dirty: bool,
    epoch: u64,
    owner: Option<u64>,
    twin: Option<Twin>,
    frozen: Option<DiffRecord>,
}

struct PageDescriptor {
    writable: AtomicBool,
    state: Mutex<PageState>,
}

struct DirtySet {
    open_epoch: u64,
    pages: Vec<u64>,
    writers: HashSet<u64>,
    allocs: Vec<AllocRecord>,
}

/// Набор закрывающейся эпохи, забранный freeze().
#[derive(Debug)]
pub struct FrozenEpoch {
    pub epoch: u64,
    pub pages: Vec<u64>,
    pub allocs: Vec<AllocRecord>,
    pub writers: HashSet<u64>,
}

impl FrozenEpoch {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.allocs.is_empty()
    }
}

pub struct Tracker {
    region: Arc<Region>,
    twins: Arc<TwinPool>,
    pages: Vec<PageDescriptor>,
    dirty: Mutex<DirtySet>,
    policy: DiffPolicy,
    metrics: Arc<Metrics>,
}

impl Tracker {
    /// `open_epoch` — номер первой эпохи, в которую будут копиться записи.
    pub fn new(
        region: Arc<Region>,
        twins: Arc<TwinPool>,
        policy: DiffPolicy,
        open_epoch: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let pages = (0..region.page_count())
            .map(|_| PageDescriptor {
                writable: AtomicBool::new(true),
                state: Mutex::new(PageState::default()),
            })
            .collect();
        Self {
            region,
            twins,
            pages,
            dirty: Mutex::new(DirtySet {
                open_epoch,
                pages: Vec::new(),
                writers: HashSet::new(),
                allocs: Vec::new(),
            }),
            policy,
            metrics,
        }
    }

    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn open_epoch(&self) -> u64 {
        self.dirty.lock().unwrap().open_epoch
    }

    /// Перевести все чистые страницы в read-only.
    pub fn protect_region(&self) -> Result<(), TrackerError> {
        for desc in &self.pages {
            let st = desc.state.lock().unwrap();
            if !st.dirty {
                desc.writable.store(false, Ordering::Release);
            }
        }
        let mut run_start: Option<u64> = None;
        for i in 0..=self.pages.len() {
            let clean = i < self.pages.len() && !self.pages[i].writable.load(Ordering::Acquire);
            match (clean, run_start) {
                (true, None) => run_start = Some(i as u64),
                (false, Some(s)) => {
                    self.protect(s, i - s as usize, Protection::ReadOnly)?;
                    run_start = None;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn protect(&self, first: u64, pages: usize, prot: Protection) -> Result<(), TrackerError> {
        self.region
            .protect_range(first, pages, prot)
            .map_err(|e| TrackerError::Protection {
                page_id: first,
                message: format!("{:#}", e),
            })
    }

    pub fn is_writable(&self, page_id: u64) -> bool {
        self.pages
            .get(page_id as usize)
            .map(|d| d.writable.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Первый писатель страницы в текущей эпохе.
    pub fn owner(&self, page_id: u64) -> Option<u64> {
        let desc = self.pages.get(page_id as usize)?;
        desc.state.lock().unwrap().owner
    }

    /// Ловушка по адресу (аппаратный путь и синтетические тесты).
    pub fn on_fault(&self, addr: usize, thread: u64) -> Result<FaultAction, TrackerError> {
        match self.region.page_of(addr) {
            Some(page) => self.fault_page(page, thread),
            None => {
                self.metrics.record_forwarded_fault();
                Ok(FaultAction::Forward)
            }
        }
    }

    /// Ловушка по номеру страницы (программный путь записи).
    pub fn fault_page(&self, page_id: u64, thread: u64) -> Result<FaultAction, TrackerError> {
        let Some(desc) = self.pages.get(page_id as usize) else {
            self.metrics.record_forwarded_fault();
            return Ok(FaultAction::Forward);
        };
        let mut st = desc.state.lock().unwrap();
        if desc.writable.load(Ordering::Acquire) {
            self.metrics.record_spurious_fault();
            return Ok(FaultAction::Spurious);
        }

        // Страница ещё числится в закрывающейся эпохе: фиксируем её дифф до новой записи.
        if st.dirty {
            if let Some(twin) = st.twin.take() {
                // SAFETY: страница read-only и замок дескриптора у нас.
                let live = unsafe { self.region.page_slice(page_id) };
                let d = diff::compute(page_id, st.epoch, twin.bytes(), live, &self.policy);
                debug!(
                    "tracker: page {} refaulted before close of epoch {}, diff stashed",
                    page_id, st.epoch
                );
                st.frozen = Some(d);
                self.twins.release(twin);
            }
            st.dirty = false;
            st.owner = None;
        }

        // SAFETY: см. выше.
        let live = unsafe { self.region.page_slice(page_id) };
        let twin = self.twins.capture(page_id, live)?;
        if let Err(e) = self.protect(page_id, 1, Protection::ReadWrite) {
            self.twins.release(twin);
            return Err(e);
        }

        st.twin = Some(twin);
        st.dirty = true;
        st.owner = Some(thread);
        {
            let mut ds = self.dirty.lock().unwrap();
            st.epoch = ds.open_epoch;
            ds.pages.push(page_id);
            ds.writers.insert(thread);
        }
        desc.writable.store(true, Ordering::Release);

        self.metrics.record_fault();
        self.metrics.record_dirty_page();
        Ok(FaultAction::Handled)
    }

    /// Записать байты в страницу, если она writable. false — сначала нужен fault.
    pub fn write_page_bytes(&self, page_id: u64, offset_in_page: usize, bytes: &[u8]) -> bool {
        debug_assert!(offset_in_page + bytes.len() <= PAGE_SIZE);
        let Some(desc) = self.pages.get(page_id as usize) else {
            return false;
        };
        let _st = desc.state.lock().unwrap();
        if !desc.writable.load(Ordering::Acquire) {
            return false;
        }
        let at = page_id as usize * PAGE_SIZE + offset_in_page;
        self.region.write_raw(at, bytes).is_ok()
    }

    /// Зарегистрировать новую именованную аллокацию в открытой эпохе.
    pub fn record_alloc(&self, rec: AllocRecord, thread: u64) {
        let mut ds = self.dirty.lock().unwrap();
        ds.allocs.push(rec);
        ds.writers.insert(thread);
    }

    /// Пачкал ли поток страницы (или создавал аллокации) в открытой эпохе.
    pub fn has_dirty_by(&self, thread: u64) -> bool {
        self.dirty.lock().unwrap().writers.contains(&thread)
    }

    /// Есть ли что коммитить в открытой эпохе.
    pub fn has_pending(&self) -> bool {
        let ds = self.dirty.lock().unwrap();
        !ds.pages.is_empty() || !ds.allocs.is_empty()
    }

    /// Закрыть открытую эпоху для новых записей: забрать набор, сдвинуть эпоху,
    /// вернуть страницы набора в read-only.
    pub fn freeze(&self) -> Result<FrozenEpoch, TrackerError> {
        let frozen = {
            let mut ds = self.dirty.lock().unwrap();
            let epoch = ds.open_epoch;
            ds.open_epoch += 1;
            FrozenEpoch {
                epoch,
                pages: std::mem::take(&mut ds.pages),
                allocs: std::mem::take(&mut ds.allocs),
                writers: std::mem::take(&mut ds.writers),
            }
        };

        for &p in &frozen.pages {
            let desc = &self.pages[p as usize];
            let _st = desc.state.lock().unwrap();
            desc.writable.store(false, Ordering::Release);
            self.protect(p, 1, Protection::ReadOnly)?;
        }
        debug!(
            "tracker: froze epoch {} ({} page(s), {} alloc(s))",
            frozen.epoch,
            frozen.pages.len(),
            frozen.allocs.len()
        );
        Ok(frozen)
    }

    /// Дифф страницы за эпоху `closing_epoch`; twin возвращается в пул.
    pub fn collect(&self, page_id: u64, closing_epoch: u64) -> Option<DiffRecord> {
        let desc = self.pages.get(page_id as usize)?;
        let mut st = desc.state.lock().unwrap();

        if let Some(d) = st.frozen.take() {
            if d.epoch == closing_epoch {
                return Some(d);
            }
            st.frozen = Some(d);
        }

        if st.dirty && st.epoch == closing_epoch {
            let twin = st.twin.take()?;
            // SAFETY: страница read-only после freeze, замок дескриптора у нас.
            let live = unsafe { self.region.page_slice(page_id) };
            let d = diff::compute(page_id, closing_epoch, twin.bytes(), live, &self.policy);
            self.twins.release(twin);
            st.dirty = false;
            st.owner = None;
            return Some(d);
        }
        None
    }

    /// Число живых twin'ов (для тестов и статуса).
    pub fn live_twins(&self) -> usize {
        self.twins.live()
    }

    /// Ёмкость пула twin'ов (0 — без ограничения).
    pub fn twin_capacity(&self) -> usize {
        self.twins.capacity()
    }
}
