//! Engine — контекст-объект одного экземпляра движка (Arc<Engine>).
//!
//! Открытие (Engine::open):
//! 1) LOCK (эксклюзивно), nvmeta (создать или прочитать), чужие process-файлы;
//! 2) Region + Recovery (образ + закоммиченные эпохи лога, усечение torn tail);
//! 3) meta.clean_shutdown = false; LogWriter; Tracker (открытая эпоха = восстановленная + 1);
//! 4) аппаратный режим: обработчик SIGSEGV; затем все страницы -> read-only;
//! 5) process-файлы stats/metadata.
//!
//! Закрытие (Engine::close, также из Drop): checkpoint -> компактация -> SHUTDOWN в лог
//! -> meta.clean_shutdown = true -> удаление process-файлов.
//!
//! Ошибка закрытия эпохи внутри синхронизации или записи фатальна (лог недоступен):
//! error! + abort. nvcheckpoint() возвращает ошибку вызывающему; незаписанная эпоха
//! остаётся у координатора и дописывается первой при следующем закрытии.
//!
//! Исчерпание пула twin'ов не ошибка записи: ранний checkpoint и повторный захват.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::alloc::{AllocRecord, Heap, NamedTable};
use crate::config::{EngineBuilder, EngineConfig, TrapMode};
use crate::consts::PAGE_SIZE;
use crate::coordinator::{CloseOutcome, Coordinator, Trigger};
use crate::lock::{try_acquire_exclusive_lock, LockGuard};
use crate::meta::{meta_exists, read_meta, write_meta, EngineMeta};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::plog::{generate_instance_id, LogWriter};
use crate::recovery::{restore, RecoveryReport};
use crate::region::Region;
use crate::registry::{OpStatus, Registry, SyncId, ThreadId};
use crate::signal;
use crate::stats::{remove_stale, ProcessFiles, ProcessMetadata};
use crate::trap::{FaultAction, TrapTarget};
use crate::tracker::{Tracker, TrackerError};
use crate::twin::TwinPool;

/// Сколько раз подряд пул может оказаться полным "ничьими" twin'ами, прежде чем запись
/// получит ошибку.
const TWIN_STALL_LIMIT: u32 = 8;

/// Именованная персистентная аллокация (смещение в регионе).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NvAlloc {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

impl From<&AllocRecord> for NvAlloc {
    fn from(r: &AllocRecord) -> Self {
        Self {
            name: r.name.clone(),
            offset: r.offset as usize,
            size: r.size as usize,
        }
    }
}

pub struct Engine {
    root: PathBuf,
    cfg: EngineConfig,
    region: Arc<Region>,
    tracker: Arc<Tracker>,
    coordinator: Coordinator,
    registry: Registry,
    heap: Mutex<Heap>,
    named: Mutex<NamedTable>,
    meta: Mutex<EngineMeta>,
    metrics: Arc<Metrics>,
    report: RecoveryReport,
    process_files: Mutex<Option<ProcessFiles>>,
    closed: AtomicBool,
    crashed: AtomicBool,
    _lock: LockGuard,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Открыть (или создать) движок в каталоге `root`.
    pub fn open(root: &Path, cfg: EngineConfig) -> Result<Arc<Self>> {
        fs::create_dir_all(root).with_context(|| format!("create engine root {}", root.display()))?;
        let lock = try_acquire_exclusive_lock(root)?;

        let mut meta = if meta_exists(root) {
            let m = read_meta(root)?;
            if m.region_pages as usize != cfg.region_pages {
                info!(
                    "engine: {} keeps region of {} page(s) (configured {})",
                    root.display(),
                    m.region_pages,
                    cfg.region_pages
                );
            }
            m
        } else {
            if cfg.region_pages == 0 {
                return Err(anyhow!("region_pages must be > 0"));
            }
            let m = EngineMeta::new(cfg.region_pages as u64, generate_instance_id());
            write_meta(root, &m)?;
            debug!("engine: new root {} ({} page(s))", root.display(), cfg.region_pages);
            m
        };
        let region_pages = meta.region_pages as usize;
        let own_pid = std::process::id();
        let stale = remove_stale(root, own_pid)? > 0;

        let metrics = Arc::new(Metrics::new(cfg.metrics_enabled));
        let hardware = cfg.trap_mode == TrapMode::Hardware;
        let region = Arc::new(Region::new(region_pages, hardware)?);

        let (report, named) = restore(root, &region, &meta, stale, &metrics)
            .with_context(|| format!("recover engine root {}", root.display()))?;

        meta.clean_shutdown = false;
        meta.last_epoch = report.recovered_epoch;
        write_meta(root, &meta)?;

        let writer = LogWriter::open(
            root,
            PAGE_SIZE as u32,
            meta.instance_id,
            report.recovered_epoch,
            cfg.log_fsync,
            metrics.clone(),
        )?;
        let twins = Arc::new(TwinPool::new(PAGE_SIZE, cfg.twin_pool_pages, metrics.clone()));
        let tracker = Arc::new(Tracker::new(
            region.clone(),
            twins,
            cfg.diff_policy(),
            report.recovered_epoch + 1,
            metrics.clone(),
        ));
        let coordinator = Coordinator::new(
            root,
            tracker.clone(),
            writer,
            cfg.commit_policy,
            cfg.log_compact_bytes,
            metrics.clone(),
        );
        let heap = Heap::with_reserved(region.len(), &named);
        let process_files = ProcessFiles::create(root, own_pid)?;

        let engine = Arc::new(Self {
            root: root.to_path_buf(),
            cfg,
            region,
            tracker,
            coordinator,
            registry: Registry::new(),
            heap: Mutex::new(heap),
            named: Mutex::new(named),
            meta: Mutex::new(meta),
            metrics,
            report,
            process_files: Mutex::new(Some(process_files)),
            closed: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            _lock: lock,
        });

        if hardware {
            let target: Weak<dyn TrapTarget> = Arc::downgrade(&engine) as Weak<dyn TrapTarget>;
            signal::install(target)?;
        }
        engine
            .tracker
            .protect_region()
            .context("protect persistent region")?;
        engine.publish();

        info!(
            "engine: opened {} ({} page(s), epoch {}, {:?} traps, crashed={})",
            engine.root.display(),
            engine.region.page_count(),
            engine.report.recovered_epoch,
            engine.cfg.trap_mode,
            engine.report.crashed
        );
        Ok(engine)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Этот запуск восстанавливался после краха.
    pub fn is_crashed(&self) -> bool {
        self.report.crashed
    }

    pub fn region_len(&self) -> usize {
        self.region.len()
    }

    /// Открытая (накапливающая записи) эпоха.
    pub fn open_epoch(&self) -> u64 {
        self.tracker.open_epoch()
    }

    /// Последняя устойчиво закоммиченная эпоха.
    pub fn committed_epoch(&self) -> u64 {
        self.coordinator.committed_epoch()
    }

    pub fn live_twins(&self) -> usize {
        self.tracker.live_twins()
    }

    // ---------------- persistent allocation ----------------

    /// Зарегистрировать именованную аллокацию. Имя, уже известное после восстановления,
    /// возвращает существующий диапазон, если он не меньше запрошенного.
    pub fn nvmalloc(&self, size: usize, name: &str) -> Result<NvAlloc> {
        if name.is_empty() {
            return Err(anyhow!("nvmalloc: empty name"));
        }
        let tid = self.current_thread();
        let mut named = self.named.lock().unwrap();
        if let Some(prev) = named.get(name) {
            if prev.size as usize >= size {
                return Ok(NvAlloc::from(prev));
            }
            return Err(anyhow!(
                "nvmalloc: '{}' already holds {} byte(s), {} requested",
                name,
                prev.size,
                size
            ));
        }
        let offset = self
            .heap
            .lock()
            .unwrap()
            .alloc(size)
            .ok_or_else(|| anyhow!("nvmalloc: region exhausted ({} byte(s) for '{}')", size, name))?;
        let rec = AllocRecord {
            name: name.to_string(),
            offset: offset as u64,
            size: size as u64,
        };
        self.tracker.record_alloc(rec.clone(), tid);
        let out = NvAlloc::from(&rec);
        named.insert(rec);
        debug!("nvmalloc: '{}' -> offset {} ({} byte(s))", name, offset, size);
        Ok(out)
    }

    /// Найти именованную аллокацию.
    pub fn named(&self, name: &str) -> Option<NvAlloc> {
        self.named.lock().unwrap().get(name).map(NvAlloc::from)
    }

    /// Скопировать содержимое аллокации `name` в `dest` (не больше её размера).
    /// Возвращает текущий адрес аллокации.
    pub fn nvrecover(&self, dest: &mut [u8], name: &str) -> Option<usize> {
        let a = self.named(name)?;
        let n = dest.len().min(a.size);
        if let Err(e) = self.region.read(a.offset, &mut dest[..n]) {
            warn!("nvrecover: '{}': {:#}", name, e);
            return None;
        }
        Some(self.region.base() + a.offset)
    }

    /// Принудительный checkpoint.
    pub fn nvcheckpoint(&self) -> Result<CloseOutcome> {
        let tid = self.current_thread();
        let out = self.coordinator.request_close(Trigger::Explicit, tid)?;
        self.after_close(out);
        Ok(out)
    }

    // ---------------- malloc family ----------------

    pub fn try_malloc(&self, size: usize) -> Option<usize> {
        self.heap.lock().unwrap().alloc(size)
    }

    /// Как malloc(3), но нехватка памяти завершает процесс.
    pub fn malloc(&self, size: usize) -> usize {
        match self.try_malloc(size) {
            Some(off) => off,
            None => crate::runtime::fatal_oom(self.current_thread()),
        }
    }

    pub fn calloc(&self, count: usize, size: usize) -> usize {
        let Some(total) = count.checked_mul(size) else {
            crate::runtime::fatal_oom(self.current_thread());
        };
        let off = self.malloc(total);
        if let Err(e) = self.fill(off, total, 0) {
            self.fatal(&e);
        }
        off
    }

    pub fn realloc(&self, offset: Option<usize>, size: usize) -> usize {
        let Some(old) = offset else {
            return self.malloc(size);
        };
        let old_size = self.malloc_usable_size(old).unwrap_or(0);
        let new = self.malloc(size);
        let n = old_size.min(size);
        if n > 0 {
            let mut buf = vec![0u8; n];
            let res = self
                .read(old, &mut buf)
                .and_then(|_| self.write(new, &buf));
            if let Err(e) = res {
                self.fatal(&e);
            }
        }
        self.free(old);
        new
    }

    /// Освободить блок malloc-семейства. Диапазоны именованных аллокаций не освобождаются:
    /// имя продолжает указывать на них после восстановления.
    pub fn free(&self, offset: usize) -> Option<usize> {
        if let Some(owner) = self.named.lock().unwrap().covering(offset as u64) {
            warn!(
                "free({}): offset belongs to named allocation '{}', ignored",
                offset, owner.name
            );
            return None;
        }
        self.heap.lock().unwrap().free(offset)
    }

    pub fn malloc_usable_size(&self, offset: usize) -> Option<usize> {
        self.heap.lock().unwrap().usable_size(offset)
    }

    /// Не поддерживается.
    pub fn memalign(&self, align: usize, size: usize) -> Option<usize> {
        debug!("memalign({}, {}) is not supported", align, size);
        None
    }

    // ---------------- region access ----------------

    /// Адрес байта региона (для аппаратного режима и внешнего кода).
    pub fn addr_of(&self, offset: usize) -> Option<usize> {
        (offset < self.region.len()).then(|| self.region.base() + offset)
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.region.read(offset, buf)
    }

    /// Записать байты через трекер (страница пачкается в открытой эпохе).
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|e| *e <= self.region.len())
            .ok_or_else(|| {
                anyhow!(
                    "write of {} byte(s) at {} is outside the region ({} bytes)",
                    bytes.len(),
                    offset,
                    self.region.len()
                )
            })?;
        let tid = self.current_thread();
        let mut pos = offset;
        while pos < end {
            let page = (pos / PAGE_SIZE) as u64;
            let in_page = pos % PAGE_SIZE;
            let n = (PAGE_SIZE - in_page).min(end - pos);
            let chunk = &bytes[pos - offset..pos - offset + n];
            while !self.tracker.write_page_bytes(page, in_page, chunk) {
                self.fault(page, tid)?;
            }
            pos += n;
        }
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.write(offset, &vec![byte; len])
    }

    fn fault(&self, page: u64, tid: ThreadId) -> Result<()> {
        let mut stalls = 0u32;
        loop {
            match self.tracker.fault_page(page, tid) {
                Ok(_) => return Ok(()),
                Err(TrackerError::TwinPoolExhausted(e)) => {
                    debug!("engine: {}, early checkpoint", e);
                    if !self.relieve_twin_pool(tid, &mut stalls) {
                        return Err(anyhow!("{} and no checkpoint releases a twin", e));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Ранний checkpoint при исчерпанном пуле twin'ов. true — захват можно повторить.
    ///
    /// Clean/Coalesced не означают, что twin'ов нет: их могло освободить чужое закрытие,
    /// пока этот поток ждал. Отказ — только если пул несколько раз подряд полон twin'ами,
    /// которые не принадлежат ни открытой, ни закрывающейся эпохе.
    fn relieve_twin_pool(&self, tid: ThreadId, stalls: &mut u32) -> bool {
        self.metrics.record_early_checkpoint();
        match self.close_or_abort(Trigger::TwinPoolExhausted, tid) {
            CloseOutcome::Closed(_) => *stalls = 0,
            _ => {
                if self.coordinator.twins_stuck() {
                    *stalls += 1;
                } else {
                    *stalls = 0;
                }
                std::thread::yield_now();
            }
        }
        *stalls < TWIN_STALL_LIMIT
    }

    // ---------------- threads ----------------

    /// id текущего потока (неизвестные потоки регистрируются).
    pub fn current_thread(&self) -> ThreadId {
        self.registry.threads.current()
    }

    pub fn live_threads(&self) -> usize {
        self.registry.threads.live()
    }

    /// Запустить поток; по возврату `f` выполняется thread_exit().
    pub fn spawn<F>(self: &Arc<Self>, f: F) -> Result<ThreadId>
    where
        F: FnOnce() -> usize + Send + 'static,
    {
        let id = self.registry.threads.allocate_id();
        let engine = Arc::clone(self);
        let h = std::thread::Builder::new()
            .name(format!("nvt-{}", id))
            .spawn(move || {
                engine.registry.threads.bind_current(id);
                let _exit = ExitGuard(&engine);
                f()
            })
            .with_context(|| format!("spawn thread {}", id))?;
        self.registry.threads.insert_handle(id, h);
        debug!("engine: thread {} spawned", id);
        Ok(id)
    }

    pub fn join(&self, id: ThreadId) -> Result<usize> {
        let h = self.registry.threads.take_handle(id)?;
        h.join().map_err(|_| anyhow!("thread {} panicked", id))
    }

    pub fn detach(&self, id: ThreadId) -> Result<()> {
        drop(self.registry.threads.take_handle(id)?);
        Ok(())
    }

    /// Выход потока: checkpoint, затем снятие регистрации.
    pub fn thread_exit(&self) {
        if let Some(tid) = self.registry.threads.lookup_current() {
            self.close_or_abort(Trigger::ThreadExit, tid);
            self.registry.threads.deregister_current();
            debug!("engine: thread {} exited", tid);
        }
    }

    pub fn cancel(&self, id: ThreadId) -> OpStatus {
        debug!("cancel of thread {} is not supported", id);
        OpStatus::Unsupported
    }

    pub fn kill(&self, id: ThreadId, sig: i32) -> OpStatus {
        debug!("kill of thread {} (signal {}) is not supported", id, sig);
        OpStatus::Unsupported
    }

    pub fn sched_yield(&self) {
        std::thread::yield_now();
    }

    // ---------------- mutexes ----------------

    pub fn mutex_init(&self) -> SyncId {
        self.registry.mutex_init()
    }

    pub fn mutex_lock(&self, id: SyncId) -> Result<()> {
        let m = self.registry.mutex(id)?;
        let tid = self.current_thread();
        m.lock(tid);
        self.flush_cached(tid);
        Ok(())
    }

    /// Не поддерживается: замок не берётся.
    pub fn mutex_trylock(&self, id: SyncId) -> Result<OpStatus> {
        self.registry.mutex(id)?;
        debug!("trylock of mutex {} is not supported", id);
        Ok(OpStatus::Unsupported)
    }

    /// Коммит изменений потока, затем освобождение.
    pub fn mutex_unlock(&self, id: SyncId) -> Result<()> {
        let m = self.registry.mutex(id)?;
        let tid = self.current_thread();
        if m.owner() != Some(tid) {
            return Err(anyhow!("thread {} does not hold mutex {}", tid, id));
        }
        self.close_or_abort(Trigger::MutexUnlock, tid);
        m.unlock(tid)
    }

    pub fn mutex_destroy(&self, id: SyncId) -> Result<()> {
        self.registry.mutex_destroy(id)
    }

    // ---------------- condition variables ----------------

    pub fn cond_init(&self) -> SyncId {
        self.registry.cond_init()
    }

    pub fn cond_wait(&self, cond: SyncId, mutex: SyncId) -> Result<()> {
        let c = self.registry.cond(cond)?;
        let m = self.registry.mutex(mutex)?;
        let tid = self.current_thread();
        if m.owner() != Some(tid) {
            return Err(anyhow!("thread {} waits on cond {} without mutex {}", tid, cond, mutex));
        }
        self.flush_cached(tid);
        self.close_or_abort(Trigger::CondWait, tid);
        c.wait(&m, tid)
    }

    pub fn cond_signal(&self, cond: SyncId) -> Result<()> {
        self.registry.cond(cond)?.signal();
        Ok(())
    }

    pub fn cond_broadcast(&self, cond: SyncId) -> Result<()> {
        self.registry.cond(cond)?.broadcast();
        Ok(())
    }

    pub fn cond_destroy(&self, cond: SyncId) -> Result<()> {
        self.registry.cond_destroy(cond)
    }

    // ---------------- barriers ----------------

    pub fn barrier_init(&self, count: usize) -> Result<SyncId> {
        self.registry.barrier_init(count)
    }

    /// true — этот поток последним пришёл к барьеру и выполнил checkpoint.
    pub fn barrier_wait(&self, id: SyncId) -> Result<bool> {
        let b = self.registry.barrier(id)?;
        let tid = self.current_thread();
        b.wait(|| {
            self.close_or_abort(Trigger::Barrier, tid);
            Ok(())
        })
    }

    pub fn barrier_destroy(&self, id: SyncId) -> Result<()> {
        self.registry.barrier_destroy(id)
    }

    // ---------------- checkpoint plumbing ----------------

    fn flush_cached(&self, tid: ThreadId) {
        match self.coordinator.flush_cached(tid) {
            Ok(out) => self.after_close(out),
            Err(e) => self.fatal(&e),
        }
    }

    fn close_or_abort(&self, trigger: Trigger, tid: ThreadId) -> CloseOutcome {
        match self.coordinator.request_close(trigger, tid) {
            Ok(out) => {
                self.after_close(out);
                out
            }
            Err(e) => self.fatal(&e),
        }
    }

    fn after_close(&self, out: CloseOutcome) {
        if out.closed_epoch().is_some() {
            self.publish();
        }
    }

    fn fatal(&self, e: &anyhow::Error) -> ! {
        error!("engine {}: unrecoverable checkpoint failure: {:#}", self.root.display(), e);
        std::process::abort();
    }

    /// Обновить process-файлы.
    fn publish(&self) {
        let guard = self.process_files.lock().unwrap();
        if let Some(pf) = guard.as_ref() {
            pf.publish_stats(&self.metrics.snapshot());
            pf.publish_metadata(&ProcessMetadata {
                pid: pf.pid(),
                thread_index: self.registry.threads.next_index(),
                open_epoch: self.tracker.open_epoch(),
                named_allocations: self.named.lock().unwrap().len() as u64,
            });
        }
    }

    // ---------------- shutdown ----------------

    /// Чистое завершение. Повторный вызов — no-op.
    pub fn close(&self) -> Result<()> {
        if self.crashed.load(Ordering::Acquire) || self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let tid = self.current_thread();
        self.coordinator
            .request_close(Trigger::Shutdown, tid)
            .context("final checkpoint")?;
        self.coordinator.compact_now().context("compaction at close")?;
        let epoch = self.coordinator.write_shutdown_marker()?;

        {
            let mut meta = self.meta.lock().unwrap();
            meta.last_epoch = epoch;
            meta.clean_shutdown = true;
            write_meta(&self.root, &meta)?;
        }
        if let Some(pf) = self.process_files.lock().unwrap().take() {
            pf.remove()?;
        }
        if self.region.is_hardware() {
            signal::uninstall();
        }
        info!(
            "engine: {} closed cleanly at epoch {}",
            self.root.display(),
            epoch
        );
        Ok(())
    }

    /// Для тестов: бросить движок без чистого завершения (как при крахе процесса).
    /// Незакоммиченные записи теряются; файлы остаются как есть.
    pub fn simulate_crash(self: Arc<Self>) {
        self.crashed.store(true, Ordering::Release);
        if self.region.is_hardware() {
            signal::uninstall();
        }
        if Arc::strong_count(&self) > 1 {
            warn!("simulate_crash: engine is still referenced elsewhere");
        }
        debug!("engine: {} abandoned (simulated crash)", self.root.display());
    }
}

/// thread_exit() и при нормальном возврате, и при панике в теле потока.
struct ExitGuard<'a>(&'a Engine);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            debug!("engine: thread body panicked, running exit checkpoint");
        }
        self.0.thread_exit();
    }
}

impl TrapTarget for Engine {
    fn on_trap(&self, addr: usize) -> FaultAction {
        if !self.region.contains(addr) {
            return FaultAction::Forward;
        }
        let tid = self.current_thread();
        let mut stalls = 0u32;
        loop {
            match self.tracker.on_fault(addr, tid) {
                Ok(action) => return action,
                Err(TrackerError::TwinPoolExhausted(e)) => {
                    if !self.relieve_twin_pool(tid, &mut stalls) {
                        error!("trap at {:#x}: {}", addr, e);
                        return FaultAction::Forward;
                    }
                }
                Err(e) => {
                    error!("trap at {:#x}: {}", addr, e);
                    return FaultAction::Forward;
                }
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.crashed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.close() {
            warn!("engine: close on drop failed: {:#}", e);
        }
    }
}
