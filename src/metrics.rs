//! Метрики движка.
//!
//! Потокобезопасные атомарные счётчики и таймеры для подсистем:
//! - Page Access Tracker (faults, twins, dirty pages)
//! - Diff Engine (slow/fast pages, байты диффов)
//! - Persistent Log (appends, fsync, truncations, compactions)
//! - Checkpoint Coordinator (commits, coalesced/cached/early closes)
//!
//! В отличие от глобальных static-счётчиков, Metrics — обычный объект, который
//! передаётся компонентам по Arc. Выключенные метрики (enabled=false) ничего не считают.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct Metrics {
    enabled: bool,

    // ----- Tracker -----
    faults: AtomicU64,
    spurious_faults: AtomicU64,
    forwarded_faults: AtomicU64,
    twin_pages: AtomicU64,
    dirty_pages: AtomicU64,

    // ----- Diff -----
    slow_pages: AtomicU64,
    fast_pages: AtomicU64,
    empty_diffs: AtomicU64,
    diff_bytes: AtomicU64,

    // ----- Log -----
    log_appends: AtomicU64,
    log_bytes: AtomicU64,
    log_fsyncs: AtomicU64,
    log_truncations: AtomicU64,
    compactions: AtomicU64,

    // ----- Coordinator -----
    commits: AtomicU64,
    transactions: AtomicU64,
    logged_pages: AtomicU64,
    early_checkpoints: AtomicU64,
    coalesced_closes: AtomicU64,
    cached_commits: AtomicU64,

    // ----- Timers (ns) -----
    serial_ns: AtomicU64,
    diff_calculation_ns: AtomicU64,
    diff_logging_ns: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub faults: u64,
    pub spurious_faults: u64,
    pub forwarded_faults: u64,
    pub twin_pages: u64,
    pub dirty_pages: u64,

    pub slow_pages: u64,
    pub fast_pages: u64,
    pub empty_diffs: u64,
    pub diff_bytes: u64,

    pub log_appends: u64,
    pub log_bytes: u64,
    pub log_fsyncs: u64,
    pub log_truncations: u64,
    pub compactions: u64,

    pub commits: u64,
    pub transactions: u64,
    pub logged_pages: u64,
    pub early_checkpoints: u64,
    pub coalesced_closes: u64,
    pub cached_commits: u64,

    pub serial_ns: u64,
    pub diff_calculation_ns: u64,
    pub diff_logging_ns: u64,
}

impl MetricsSnapshot {
    /// Среднее число страниц на коммит.
    pub fn avg_pages_per_commit(&self) -> f64 {
        if self.commits == 0 {
            0.0
        } else {
            self.logged_pages as f64 / self.commits as f64
        }
    }

    /// Доля страниц, залогированных целиком.
    pub fn fast_page_ratio(&self) -> f64 {
        let total = self.fast_pages + self.slow_pages;
        if total == 0 {
            0.0
        } else {
            self.fast_pages as f64 / total as f64
        }
    }

    /// Значения в фиксированном порядке (для слотов stats-файла).
    pub fn slots(&self) -> [u64; 23] {
        [
            self.faults,
            self.spurious_faults,
            self.forwarded_faults,
            self.twin_pages,
            self.dirty_pages,
            self.slow_pages,
            self.fast_pages,
            self.empty_diffs,
            self.diff_bytes,
            self.log_appends,
            self.log_bytes,
            self.log_fsyncs,
            self.log_truncations,
            self.compactions,
            self.commits,
            self.transactions,
            self.logged_pages,
            self.early_checkpoints,
            self.coalesced_closes,
            self.cached_commits,
            self.serial_ns,
            self.diff_calculation_ns,
            self.diff_logging_ns,
        ]
    }
}

/// Какой таймер пополнять.
#[derive(Debug, Clone, Copy)]
pub enum TimerKind {
    Serial,
    DiffCalculation,
    DiffLogging,
}

/// Замер времени; значение добавляется к таймеру при Drop.
pub struct TimerGuard<'a> {
    metrics: &'a Metrics,
    kind: TimerKind,
    start: Option<Instant>,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        if let Some(start) = self.start {
            let ns = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
            self.metrics.timer_slot(self.kind).fetch_add(ns, Ordering::Relaxed);
        }
    }
}

#[inline]
fn bump(enabled: bool, c: &AtomicU64, by: u64) {
    if enabled {
        c.fetch_add(by, Ordering::Relaxed);
    }
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn timer_slot(&self, kind: TimerKind) -> &AtomicU64 {
        match kind {
            TimerKind::Serial => &self.serial_ns,
            TimerKind::DiffCalculation => &self.diff_calculation_ns,
            TimerKind::DiffLogging => &self.diff_logging_ns,
        }
    }

    /// Начать замер. При выключенных метриках — пустой guard.
    pub fn timer(&self, kind: TimerKind) -> TimerGuard<'_> {
        TimerGuard {
            metrics: self,
            kind,
            start: if self.enabled { Some(Instant::now()) } else { None },
        }
    }

    // ----- Recorders (Tracker) -----
    pub fn record_fault(&self) {
        bump(self.enabled, &self.faults, 1);
    }
    pub fn record_spurious_fault(&self) {
        bump(self.enabled, &self.spurious_faults, 1);
    }
    pub fn record_forwarded_fault(&self) {
        bump(self.enabled, &self.forwarded_faults, 1);
    }
    pub fn record_twin_page(&self) {
        bump(self.enabled, &self.twin_pages, 1);
    }
    pub fn record_dirty_page(&self) {
        bump(self.enabled, &self.dirty_pages, 1);
    }

    // ----- Recorders (Diff) -----
    pub fn record_slow_page(&self, bytes: usize) {
        bump(self.enabled, &self.slow_pages, 1);
        bump(self.enabled, &self.diff_bytes, bytes as u64);
    }
    pub fn record_fast_page(&self, bytes: usize) {
        bump(self.enabled, &self.fast_pages, 1);
        bump(self.enabled, &self.diff_bytes, bytes as u64);
    }
    pub fn record_empty_diff(&self) {
        bump(self.enabled, &self.empty_diffs, 1);
    }

    // ----- Recorders (Log) -----
    pub fn record_log_append(&self, bytes: usize) {
        bump(self.enabled, &self.log_appends, 1);
        bump(self.enabled, &self.log_bytes, bytes as u64);
    }
    pub fn record_log_fsync(&self) {
        bump(self.enabled, &self.log_fsyncs, 1);
    }
    pub fn record_log_truncation(&self) {
        bump(self.enabled, &self.log_truncations, 1);
    }
    pub fn record_compaction(&self) {
        bump(self.enabled, &self.compactions, 1);
    }

    // ----- Recorders (Coordinator) -----
    pub fn record_commit(&self, pages: usize) {
        bump(self.enabled, &self.commits, 1);
        bump(self.enabled, &self.logged_pages, pages as u64);
    }
    pub fn record_transaction(&self) {
        bump(self.enabled, &self.transactions, 1);
    }
    pub fn record_early_checkpoint(&self) {
        bump(self.enabled, &self.early_checkpoints, 1);
    }
    pub fn record_coalesced_close(&self) {
        bump(self.enabled, &self.coalesced_closes, 1);
    }
    pub fn record_cached_commit(&self) {
        bump(self.enabled, &self.cached_commits, 1);
    }

    // ----- Snapshot / Reset -----
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            spurious_faults: self.spurious_faults.load(Ordering::Relaxed),
            forwarded_faults: self.forwarded_faults.load(Ordering::Relaxed),
            twin_pages: self.twin_pages.load(Ordering::Relaxed),
            dirty_pages: self.dirty_pages.load(Ordering::Relaxed),

            slow_pages: self.slow_pages.load(Ordering::Relaxed),
            fast_pages: self.fast_pages.load(Ordering::Relaxed),
            empty_diffs: self.empty_diffs.load(Ordering::Relaxed),
            diff_bytes: self.diff_bytes.load(Ordering::Relaxed),

            log_appends: self.log_appends.load(Ordering::Relaxed),
            log_bytes: self.log_bytes.load(Ordering::Relaxed),
            log_fsyncs: self.log_fsyncs.load(Ordering::Relaxed),
            log_truncations: self.log_truncations.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),

            commits: self.commits.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            logged_pages: self.logged_pages.load(Ordering::Relaxed),
            early_checkpoints: self.early_checkpoints.load(Ordering::Relaxed),
            coalesced_closes: self.coalesced_closes.load(Ordering::Relaxed),
            cached_commits: self.cached_commits.load(Ordering::Relaxed),

            serial_ns: self.serial_ns.load(Ordering::Relaxed),
            diff_calculation_ns: self.diff_calculation_ns.load(Ordering::Relaxed),
            diff_logging_ns: self.diff_logging_ns.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for c in [
            &self.faults,
            &self.spurious_faults,
            &self.forwarded_faults,
            &self.twin_pages,
            &self.dirty_pages,
            &self.slow_pages,
            &self.fast_pages,
            &self.empty_diffs,
            &self.diff_bytes,
            &self.log_appends,
            &self.log_bytes,
            &self.log_fsyncs,
            &self.log_truncations,
            &self.compactions,
            &self.commits,
            &self.transactions,
            &self.logged_pages,
            &self.early_checkpoints,
            &self.coalesced_closes,
            &self.cached_commits,
            &self.serial_ns,
            &self.diff_calculation_ns,
            &self.diff_logging_ns,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_metrics_stay_zero() {
        let m = Metrics::new(false);
        m.record_fault();
        m.record_commit(3);
        {
            let _t = m.timer(TimerKind::Serial);
        }
        let s = m.snapshot();
        assert_eq!(s.faults, 0);
        assert_eq!(s.commits, 0);
        assert_eq!(s.serial_ns, 0);
    }

    #[test]
    fn counters_and_ratios() {
        let m = Metrics::new(true);
        m.record_commit(4);
        m.record_commit(2);
        m.record_fast_page(4096);
        m.record_slow_page(10);
        m.record_slow_page(10);
        m.record_slow_page(10);
        let s = m.snapshot();
        assert_eq!(s.commits, 2);
        assert_eq!(s.logged_pages, 6);
        assert!((s.avg_pages_per_commit() - 3.0).abs() < 1e-9);
        assert!((s.fast_page_ratio() - 0.25).abs() < 1e-9);
        assert_eq!(s.diff_bytes, 4096 + 30);

        m.reset();
        assert_eq!(m.snapshot().commits, 0);
    }
}
