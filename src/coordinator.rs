//! Checkpoint Coordinator — когда закрывать эпоху и как.
//!
//! Коалессация (по образцу group-commit):
//! - ticket = открытая эпоха на момент запроса;
//! - committed >= ticket — эпоху уже закрыл кто-то другой (Coalesced);
//! - идёт закрытие — ждём на cv и перепроверяем;
//! - иначе закрываем сами, если есть что коммитить.
//!
//! Последовательность закрытия (state-замок не держится):
//!   freeze -> collect диффов (twin'ы в пул) -> append_epoch (fsync) -> committed = e
//!   -> компактация по порогу -> notify_all.
//!
//! Неудачный append: эпоха уже заморожена и её twin'ы отданы, поэтому её кортеж
//! остаётся в очереди unlogged. Следующее закрытие сначала дописывает очередь по порядку
//! и только потом свою эпоху — лог никогда не содержит e+1 без e.
//!
//! CommitPolicy::Deferred: коммит на unlock только помечается (Cached) и выполняется
//! при следующем захвате замка, барьере, cond_wait, выходе потока или явном checkpoint.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use crate::alloc::AllocRecord;
use crate::config::CommitPolicy;
use crate::diff::DiffRecord;
use crate::image::compact;
use crate::metrics::{Metrics, TimerKind};
use crate::plog::LogWriter;
use crate::tracker::Tracker;

/// Что запросило закрытие эпохи.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    MutexUnlock,
    CondWait,
    Barrier,
    ThreadExit,
    Explicit,
    TwinPoolExhausted,
    CachedFlush,
    Shutdown,
}

impl Trigger {
    /// Событие синхронизации приложения (считается в transactions).
    fn is_sync_event(self) -> bool {
        matches!(
            self,
            Trigger::MutexUnlock | Trigger::CondWait | Trigger::Barrier | Trigger::ThreadExit
        )
    }

    /// Коммит нужен, только если запросивший поток сам что-то пачкал.
    fn requester_scoped(self) -> bool {
        matches!(self, Trigger::MutexUnlock | Trigger::CondWait)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trigger::MutexUnlock => "mutex-unlock",
            Trigger::CondWait => "cond-wait",
            Trigger::Barrier => "barrier",
            Trigger::ThreadExit => "thread-exit",
            Trigger::Explicit => "explicit",
            Trigger::TwinPoolExhausted => "twin-pool-exhausted",
            Trigger::CachedFlush => "cached-flush",
            Trigger::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Эпоха закрыта этим вызовом.
    Closed(u64),
    /// Эпоху запроса уже закрыл другой поток.
    Coalesced(u64),
    /// Коммитить нечего.
    Clean,
    /// Коммит отложен (CommitPolicy::Deferred).
    Cached,
}

impl CloseOutcome {
    pub fn closed_epoch(&self) -> Option<u64> {
        match self {
            CloseOutcome::Closed(e) => Some(*e),
            _ => None,
        }
    }
}

/// Замороженная эпоха, ещё не попавшая в лог.
struct UnloggedEpoch {
    epoch: u64,
    allocs: Vec<AllocRecord>,
    diffs: Vec<DiffRecord>,
}

struct CloseState {
    closing: bool,
    committed: u64,
    cached: bool,
}

pub struct Coordinator {
    root: PathBuf,
    tracker: Arc<Tracker>,
    writer: Mutex<LogWriter>,
    unlogged: Mutex<VecDeque<UnloggedEpoch>>,
    state: Mutex<CloseState>,
    cv: Condvar,
    policy: CommitPolicy,
    compact_bytes: u64,
    metrics: Arc<Metrics>,
}

impl Coordinator {
    pub fn new(
        root: &Path,
        tracker: Arc<Tracker>,
        writer: LogWriter,
        policy: CommitPolicy,
        compact_bytes: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let committed = writer.last_durable_epoch();
        Self {
            root: root.to_path_buf(),
            tracker,
            writer: Mutex::new(writer),
            unlogged: Mutex::new(VecDeque::new()),
            state: Mutex::new(CloseState {
                closing: false,
                committed,
                cached: false,
            }),
            cv: Condvar::new(),
            policy,
            compact_bytes,
            metrics,
        }
    }

    /// Последняя устойчиво закоммиченная эпоха.
    pub fn committed_epoch(&self) -> u64 {
        self.state.lock().unwrap().committed
    }

    pub fn has_cached(&self) -> bool {
        self.state.lock().unwrap().cached
    }

    pub fn log_len(&self) -> u64 {
        self.writer.lock().unwrap().len()
    }

    /// Число замороженных эпох, которые ещё предстоит дописать в лог.
    pub fn unlogged_epochs(&self) -> usize {
        self.unlogged.lock().unwrap().len()
    }

    /// Пул twin'ов полон, но ни открытая, ни закрывающаяся эпоха их не держит.
    pub fn twins_stuck(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        while st.closing {
            st = self.cv.wait(st).unwrap();
        }
        let cap = self.tracker.twin_capacity();
        cap != 0 && !self.tracker.has_pending() && self.tracker.live_twins() >= cap
    }

    /// Запросить закрытие открытой эпохи.
    pub fn request_close(&self, trigger: Trigger, requester: u64) -> Result<CloseOutcome> {
        if trigger.is_sync_event() {
            self.metrics.record_transaction();
        }
        let mut st = self.state.lock().unwrap();
        let ticket = self.tracker.open_epoch();
        loop {
            if st.committed >= ticket {
                self.metrics.record_coalesced_close();
                return Ok(CloseOutcome::Coalesced(st.committed));
            }
            if !st.closing {
                break;
            }
            st = self.cv.wait(st).unwrap();
        }

        let retry = self.unlogged_epochs() > 0;
        let needed = retry
            || match trigger {
                Trigger::CachedFlush => st.cached && self.tracker.has_pending(),
                t if t.requester_scoped() => self.tracker.has_dirty_by(requester),
                _ => self.tracker.has_pending(),
            };
        if !needed {
            if trigger == Trigger::CachedFlush {
                st.cached = false;
            }
            return Ok(CloseOutcome::Clean);
        }
        if !retry && trigger == Trigger::MutexUnlock && self.policy == CommitPolicy::Deferred {
            if !st.cached {
                debug!("coordinator: commit of thread {} cached at unlock", requester);
                st.cached = true;
                self.metrics.record_cached_commit();
            }
            return Ok(CloseOutcome::Cached);
        }

        st.closing = true;
        drop(st);

        let res = self.close_epoch(trigger);

        let mut st = self.state.lock().unwrap();
        st.closing = false;
        let out = match res {
            Ok(Some(epoch)) => {
                st.committed = st.committed.max(epoch);
                st.cached = false;
                Ok(CloseOutcome::Closed(epoch))
            }
            Ok(None) => Ok(CloseOutcome::Clean),
            Err(e) => {
                // часть очереди могла успеть лечь в лог
                let durable = self.writer.lock().unwrap().last_durable_epoch();
                st.committed = st.committed.max(durable);
                Err(e)
            }
        };
        self.cv.notify_all();
        out
    }

    /// Выполнить отложенный коммит, если он есть.
    pub fn flush_cached(&self, requester: u64) -> Result<CloseOutcome> {
        if !self.has_cached() {
            return Ok(CloseOutcome::Clean);
        }
        self.request_close(Trigger::CachedFlush, requester)
    }

    fn close_epoch(&self, trigger: Trigger) -> Result<Option<u64>> {
        let _serial = self.metrics.timer(TimerKind::Serial);

        let mut unlogged = self.unlogged.lock().unwrap();
        if !unlogged.is_empty() {
            warn!(
                "coordinator: re-appending {} epoch(s) left unlogged by a failed commit",
                unlogged.len()
            );
        }
        if self.tracker.has_pending() {
            let frozen = self.freeze_and_collect(trigger)?;
            unlogged.push_back(frozen);
        }

        let mut w = self.writer.lock().unwrap();
        let mut last = None;
        while let Some(u) = unlogged.front() {
            let stats = w
                .append_epoch(u.epoch, &u.allocs, &u.diffs)
                .with_context(|| format!("commit epoch {} ({})", u.epoch, trigger))?;
            self.metrics.record_commit(u.diffs.len());
            debug!(
                "coordinator: epoch {} closed by {} ({} page(s), {} alloc(s), {} byte(s))",
                u.epoch,
                trigger,
                u.diffs.len(),
                u.allocs.len(),
                stats.bytes
            );
            last = Some(u.epoch);
            unlogged.pop_front();
        }

        if last.is_some() && self.compact_bytes > 0 && w.len() > self.compact_bytes {
            let region_pages = self.tracker.region().page_count();
            let rep = compact(&self.root, region_pages, &mut w, &self.metrics)?;
            info!(
                "coordinator: log compacted at epoch {} ({} byte(s) absorbed)",
                rep.epoch, rep.log_bytes_before
            );
        }
        Ok(last)
    }

    /// Заморозить открытую эпоху и собрать её диффы (twin'ы возвращаются в пул).
    fn freeze_and_collect(&self, trigger: Trigger) -> Result<UnloggedEpoch> {
        let frozen = self
            .tracker
            .freeze()
            .with_context(|| format!("freeze epoch for {} checkpoint", trigger))?;
        let epoch = frozen.epoch;

        let _t = self.metrics.timer(TimerKind::DiffCalculation);
        let mut diffs: Vec<DiffRecord> = Vec::with_capacity(frozen.pages.len());
        let mut pages = frozen.pages;
        pages.sort_unstable();
        pages.dedup();
        for p in pages {
            let Some(d) = self.tracker.collect(p, epoch) else {
                continue;
            };
            if d.is_empty() {
                self.metrics.record_empty_diff();
                continue;
            }
            if d.is_whole_page() {
                self.metrics.record_fast_page(d.changed_bytes());
            } else {
                self.metrics.record_slow_page(d.changed_bytes());
            }
            diffs.push(d);
        }
        Ok(UnloggedEpoch {
            epoch,
            allocs: frozen.allocs,
            diffs,
        })
    }

    /// Компактация вне закрытия эпохи (shutdown, nvtctl).
    pub fn compact_now(&self) -> Result<()> {
        let mut w = self.writer.lock().unwrap();
        let region_pages = self.tracker.region().page_count();
        compact(&self.root, region_pages, &mut w, &self.metrics)?;
        Ok(())
    }

    /// Записать маркер чистого завершения.
    pub fn write_shutdown_marker(&self) -> Result<u64> {
        let epoch = self.committed_epoch();
        self.writer.lock().unwrap().append_shutdown(epoch)?;
        Ok(epoch)
    }
}
