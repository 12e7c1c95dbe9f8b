//! Процессный runtime: один глобальный движок для слоя перехвата (ffi, C-программы).
//!
//! - init_global / global / shutdown_global — явное время жизни вместо ambient-глобалов;
//! - глобальный движок всегда в TrapMode::Hardware: вызывающий получает сырые указатели
//!   в регион, и запись через них должна ловиться, иначе она не попадёт ни в один checkpoint;
//! - до инициализации: аллокации идут в анонимный shared mmap (bootstrap_alloc),
//!   синхронизация — no-op, getpid/pthread_self возвращают 0;
//! - нехватка памяти в malloc-семействе: "<id>: Out of memory!" и abort.

use anyhow::{anyhow, Result};
use log::{debug, error, info};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::{EngineConfig, TrapMode};
use crate::engine::Engine;
use crate::registry::SyncId;

static GLOBAL: Mutex<Option<Arc<Engine>>> = Mutex::new(None);

/// Открыть глобальный движок (аппаратные ловушки). Повторная инициализация — ошибка.
pub fn init_global(root: &Path, cfg: EngineConfig) -> Result<Arc<Engine>> {
    let mut g = GLOBAL.lock().unwrap();
    if g.is_some() {
        return Err(anyhow!("nvthreads runtime is already initialized"));
    }
    if cfg.trap_mode != TrapMode::Hardware {
        info!("runtime: {:?} trap mode replaced by Hardware for the global engine", cfg.trap_mode);
    }
    let e = Engine::open(root, cfg.with_trap_mode(TrapMode::Hardware))?;
    *g = Some(e.clone());
    Ok(e)
}

pub fn global() -> Option<Arc<Engine>> {
    GLOBAL.lock().unwrap().clone()
}

pub fn is_initialized() -> bool {
    GLOBAL.lock().unwrap().is_some()
}

/// Закрыть глобальный движок (чистое завершение). Без движка — no-op.
pub fn shutdown_global() -> Result<()> {
    let e = GLOBAL.lock().unwrap().take();
    match e {
        Some(e) => e.close(),
        None => Ok(()),
    }
}

/// Сообщить о нехватке памяти и завершить процесс.
pub fn fatal_oom(id: u64) -> ! {
    error!("{}: Out of memory!", id);
    eprintln!("{}: Out of memory!", id);
    std::process::abort();
}

/// Анонимный shared mmap для аллокаций до инициализации движка.
#[cfg(unix)]
pub fn bootstrap_alloc(size: usize) -> Option<*mut u8> {
    if size == 0 {
        return None;
    }
    // SAFETY: анонимное отображение без файла; результат проверяется на MAP_FAILED.
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        debug!("bootstrap_alloc({}) failed: {}", size, std::io::Error::last_os_error());
        return None;
    }
    Some(p as *mut u8)
}

#[cfg(not(unix))]
pub fn bootstrap_alloc(size: usize) -> Option<*mut u8> {
    if size == 0 {
        return None;
    }
    let layout = std::alloc::Layout::from_size_align(size, 16).ok()?;
    // SAFETY: ненулевой размер.
    let p = unsafe { std::alloc::alloc_zeroed(layout) };
    (!p.is_null()).then_some(p)
}

/// Адрес смещения для внешнего кода. Без аппаратных ловушек запись по нему
/// прошла бы мимо трекера, поэтому в программном режиме — null.
fn region_ptr(e: &Engine, offset: usize) -> *mut u8 {
    if e.config().trap_mode != TrapMode::Hardware {
        error!("runtime: engine in {:?} trap mode cannot hand out pointers", e.config().trap_mode);
        return std::ptr::null_mut();
    }
    e.addr_of(offset).map_or(std::ptr::null_mut(), |a| a as *mut u8)
}

/// malloc слоя перехвата: адрес в регионе движка или bootstrap-память до инициализации.
pub fn malloc(size: usize) -> *mut u8 {
    match global() {
        Some(e) => {
            let off = e.malloc(size);
            region_ptr(&e, off)
        }
        None => bootstrap_alloc(size).unwrap_or_else(|| fatal_oom(0)),
    }
}

/// Именованная аллокация глобального движка; null до инициализации или при ошибке.
pub fn nvmalloc(size: usize, name: &str) -> *mut u8 {
    let Some(e) = global() else {
        return std::ptr::null_mut();
    };
    match e.nvmalloc(size, name) {
        Ok(a) => region_ptr(&e, a.offset),
        Err(err) => {
            error!("nvmalloc({}, {}): {:#}", size, name, err);
            std::ptr::null_mut()
        }
    }
}

/// getpid(): id потока движка (0 до инициализации).
pub fn getpid() -> u64 {
    global().map_or(0, |e| e.current_thread())
}

/// pthread_self(): то же, что getpid().
pub fn pthread_self() -> u64 {
    getpid()
}

pub fn mutex_lock(id: SyncId) -> Result<()> {
    match global() {
        Some(e) => e.mutex_lock(id),
        None => Ok(()),
    }
}

pub fn mutex_unlock(id: SyncId) -> Result<()> {
    match global() {
        Some(e) => e.mutex_unlock(id),
        None => Ok(()),
    }
}

pub fn barrier_wait(id: SyncId) -> Result<bool> {
    match global() {
        Some(e) => e.barrier_wait(id),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_memory_is_usable() {
        let p = bootstrap_alloc(4096).unwrap();
        // SAFETY: 4096 байт только что отображены.
        unsafe {
            *p = 7;
            *p.add(4095) = 9;
            assert_eq!(*p, 7);
        }
        assert!(bootstrap_alloc(0).is_none());
    }
}
