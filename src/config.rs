//! Centralized configuration and builder for the engine.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - EngineConfig::from_env() reads NVT_* variables; EngineBuilder starts from env and
//!   allows programmatic overrides (tests usually start from `EngineBuilder::from_default()`).
//!
//! Defaults:
//! - region_pages = 1024 (4 MiB region)
//! - twin_pool_pages = 256 (0 = unbounded)
//! - diff_gap_bytes = 16, whole_page_pct = 50
//! - log_fsync = true, log_compact_bytes = 8 MiB
//! - commit_policy = eager, trap_mode = soft, metrics_enabled = true

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::consts::PAGE_SIZE;
use crate::diff::DiffPolicy;

/// Когда unlock мьютекса превращается в чекпоинт.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Коммит на каждом unlock, если освобождающий поток пачкал страницы.
    Eager,
    /// Коммит при unlock кэшируется и сливается со следующим реальным коммитом.
    /// Принудительно выполняется перед возвратом из следующего lock/barrier/cond_wait/exit.
    Deferred,
}

impl CommitPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Some(CommitPolicy::Eager),
            "deferred" | "lazy" | "cached" => Some(CommitPolicy::Deferred),
            _ => None,
        }
    }
}

/// Как доставляются "первые записи" в read-only страницы.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapMode {
    /// Только через API движка (Engine::write/fill/...). Без mprotect и сигналов.
    Software,
    /// mprotect + SIGSEGV-обработчик: отслеживаются и записи через сырые указатели.
    Hardware,
}

impl TrapMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soft" | "software" => Some(TrapMode::Software),
            "hw" | "hard" | "hardware" => Some(TrapMode::Hardware),
            _ => None,
        }
    }
}

/// Top-level configuration of an engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of PAGE_SIZE pages in the persistent region.
    /// Env: NVT_REGION_PAGES (default 1024). Existing roots keep the value from meta.
    pub region_pages: usize,

    /// Twin pool capacity in pages; 0 disables the limit.
    /// Env: NVT_TWIN_POOL_PAGES (default 256)
    pub twin_pool_pages: usize,

    /// Unchanged bytes between two changed ranges that are still merged into one range.
    /// Env: NVT_DIFF_GAP (default 16)
    pub diff_gap_bytes: usize,

    /// Encoded ranges larger than this share of the page are logged as a whole page.
    /// Env: NVT_WHOLE_PAGE_PCT (default 50, clamped to 1..=100)
    pub whole_page_pct: u8,

    /// fsync the log at every epoch close. Disable only for benches.
    /// Env: NVT_LOG_FSYNC (default true; "0|false|off|no" => false)
    pub log_fsync: bool,

    /// Compact (image + truncate) once the log grows beyond this many bytes; 0 = only at close().
    /// Env: NVT_LOG_COMPACT_BYTES (default 8 MiB)
    pub log_compact_bytes: u64,

    /// Env: NVT_COMMIT_POLICY = eager|deferred (default eager)
    pub commit_policy: CommitPolicy,

    /// Env: NVT_TRAP = soft|hw (default soft)
    pub trap_mode: TrapMode,

    /// Env: NVT_METRICS (default true)
    pub metrics_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            region_pages: 1024,
            twin_pool_pages: 256,
            diff_gap_bytes: 16,
            whole_page_pct: 50,
            log_fsync: true,
            log_compact_bytes: 8 * 1024 * 1024,
            commit_policy: CommitPolicy::Eager,
            trap_mode: TrapMode::Software,
            metrics_enabled: true,
        }
    }
}

fn env_flag(v: &str) -> bool {
    let s = v.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "yes" || s == "on"
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("NVT_REGION_PAGES") {
            if let Ok(n) = v.trim().parse::<usize>() {
                if n > 0 {
                    cfg.region_pages = n;
                }
            }
        }

        if let Ok(v) = std::env::var("NVT_TWIN_POOL_PAGES") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.twin_pool_pages = n;
            }
        }

        if let Ok(v) = std::env::var("NVT_DIFF_GAP") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.diff_gap_bytes = n;
            }
        }

        if let Ok(v) = std::env::var("NVT_WHOLE_PAGE_PCT") {
            if let Ok(n) = v.trim().parse::<u8>() {
                cfg.whole_page_pct = n.clamp(1, 100);
            }
        }

        if let Ok(v) = std::env::var("NVT_LOG_FSYNC") {
            cfg.log_fsync = env_flag(&v);
        }

        if let Ok(v) = std::env::var("NVT_LOG_COMPACT_BYTES") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.log_compact_bytes = n;
            }
        }

        if let Ok(v) = std::env::var("NVT_COMMIT_POLICY") {
            if let Some(p) = CommitPolicy::parse(&v) {
                cfg.commit_policy = p;
            }
        }

        if let Ok(v) = std::env::var("NVT_TRAP") {
            if let Some(m) = TrapMode::parse(&v) {
                cfg.trap_mode = m;
            }
        }

        if let Ok(v) = std::env::var("NVT_METRICS") {
            cfg.metrics_enabled = env_flag(&v);
        }

        cfg
    }

    pub fn with_region_pages(mut self, pages: usize) -> Self {
        self.region_pages = pages;
        self
    }

    pub fn with_twin_pool_pages(mut self, pages: usize) -> Self {
        self.twin_pool_pages = pages;
        self
    }

    pub fn with_diff_gap_bytes(mut self, gap: usize) -> Self {
        self.diff_gap_bytes = gap;
        self
    }

    pub fn with_whole_page_pct(mut self, pct: u8) -> Self {
        self.whole_page_pct = pct.clamp(1, 100);
        self
    }

    pub fn with_log_fsync(mut self, on: bool) -> Self {
        self.log_fsync = on;
        self
    }

    pub fn with_log_compact_bytes(mut self, bytes: u64) -> Self {
        self.log_compact_bytes = bytes;
        self
    }

    pub fn with_commit_policy(mut self, p: CommitPolicy) -> Self {
        self.commit_policy = p;
        self
    }

    pub fn with_trap_mode(mut self, m: TrapMode) -> Self {
        self.trap_mode = m;
        self
    }

    pub fn with_metrics(mut self, on: bool) -> Self {
        self.metrics_enabled = on;
        self
    }

    /// Политика Diff Engine, производная от конфигурации.
    pub fn diff_policy(&self) -> DiffPolicy {
        let pct = self.whole_page_pct.clamp(1, 100) as usize;
        DiffPolicy {
            gap: self.diff_gap_bytes,
            whole_page_threshold: PAGE_SIZE * pct / 100,
        }
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineConfig {{ \
             region_pages: {}, \
             twin_pool_pages: {}, \
             diff_gap_bytes: {}, \
             whole_page_pct: {}, \
             log_fsync: {}, \
             log_compact_bytes: {}, \
             commit_policy: {:?}, \
             trap_mode: {:?}, \
             metrics_enabled: {} \
             }}",
            self.region_pages,
            if self.twin_pool_pages == 0 {
                "unbounded".to_string()
            } else {
                self.twin_pool_pages.to_string()
            },
            self.diff_gap_bytes,
            self.whole_page_pct,
            self.log_fsync,
            self.log_compact_bytes,
            self.commit_policy,
            self.trap_mode,
            self.metrics_enabled,
        )
    }
}

/// Lightweight builder that produces an EngineConfig and opens the engine.
#[derive(Clone, Debug)]
pub struct EngineBuilder {
    cfg: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        // Start from env to preserve runtime behavior, then allow overrides.
        Self {
            cfg: EngineConfig::from_env(),
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: EngineConfig::default(),
        }
    }

    pub fn region_pages(mut self, pages: usize) -> Self {
        self.cfg.region_pages = pages;
        self
    }

    pub fn twin_pool_pages(mut self, pages: usize) -> Self {
        self.cfg.twin_pool_pages = pages;
        self
    }

    pub fn diff_gap_bytes(mut self, gap: usize) -> Self {
        self.cfg.diff_gap_bytes = gap;
        self
    }

    pub fn whole_page_pct(mut self, pct: u8) -> Self {
        self.cfg.whole_page_pct = pct.clamp(1, 100);
        self
    }

    pub fn log_fsync(mut self, on: bool) -> Self {
        self.cfg.log_fsync = on;
        self
    }

    pub fn log_compact_bytes(mut self, bytes: u64) -> Self {
        self.cfg.log_compact_bytes = bytes;
        self
    }

    pub fn commit_policy(mut self, p: CommitPolicy) -> Self {
        self.cfg.commit_policy = p;
        self
    }

    pub fn trap_mode(mut self, m: TrapMode) -> Self {
        self.cfg.trap_mode = m;
        self
    }

    pub fn metrics(mut self, on: bool) -> Self {
        self.cfg.metrics_enabled = on;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> EngineConfig {
        self.cfg
    }

    /// Finish the builder and open (or create) the engine at `root`.
    pub fn open(self, root: &Path) -> Result<Arc<crate::engine::Engine>> {
        crate::engine::Engine::open(root, self.cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parsing() {
        assert_eq!(CommitPolicy::parse("Eager"), Some(CommitPolicy::Eager));
        assert_eq!(CommitPolicy::parse(" deferred "), Some(CommitPolicy::Deferred));
        assert_eq!(CommitPolicy::parse("???"), None);
        assert_eq!(TrapMode::parse("hw"), Some(TrapMode::Hardware));
        assert_eq!(TrapMode::parse("soft"), Some(TrapMode::Software));
    }

    #[test]
    fn diff_policy_from_pct() {
        let cfg = EngineConfig::default().with_whole_page_pct(25).with_diff_gap_bytes(4);
        let p = cfg.diff_policy();
        assert_eq!(p.gap, 4);
        assert_eq!(p.whole_page_threshold, PAGE_SIZE / 4);

        // clamp
        let cfg = EngineConfig::default().with_whole_page_pct(0);
        assert_eq!(cfg.whole_page_pct, 1);
    }

    #[test]
    fn builder_from_default_ignores_env() {
        let cfg = EngineBuilder::from_default()
            .region_pages(8)
            .twin_pool_pages(1)
            .commit_policy(CommitPolicy::Deferred)
            .build();
        assert_eq!(cfg.region_pages, 8);
        assert_eq!(cfg.twin_pool_pages, 1);
        assert_eq!(cfg.commit_policy, CommitPolicy::Deferred);
        assert_eq!(cfg.trap_mode, TrapMode::Software);
        assert!(format!("{}", cfg).contains("twin_pool_pages: 1"));
    }
}
