//! Thread/Sync Registry.
//!
//! Потоки и объекты синхронизации адресуются id движка, а не OS-хэндлами:
//! - threads.rs — id потоков, ленивое присвоение, JoinHandle'ы;
//! - sync.rs    — MutexShadow, CondShadow, BarrierShadow.
//!
//! Связь с checkpoint'ами (unlock, cond_wait, барьер, выход потока) делает Engine.

pub mod sync;
pub mod threads;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub use sync::{BarrierShadow, CondShadow, MutexShadow};
pub use threads::{ThreadId, ThreadTable};

pub type SyncId = u64;

/// Итог операции, которую движок не поддерживает полностью.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Ok,
    Unsupported,
}

struct Table<T> {
    kind: &'static str,
    map: Mutex<HashMap<SyncId, Arc<T>>>,
}

impl<T> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            map: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, id: SyncId, v: T) {
        self.map.lock().unwrap().insert(id, Arc::new(v));
    }

    fn get(&self, id: SyncId) -> Result<Arc<T>> {
        self.map
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown {} {}", self.kind, id))
    }

    fn remove(&self, id: SyncId) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown {} {}", self.kind, id))
    }

    fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

pub struct Registry {
    pub threads: ThreadTable,
    next_sync: AtomicU64,
    mutexes: Table<MutexShadow>,
    conds: Table<CondShadow>,
    barriers: Table<BarrierShadow>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            threads: ThreadTable::new(),
            next_sync: AtomicU64::new(1),
            mutexes: Table::new("mutex"),
            conds: Table::new("condition variable"),
            barriers: Table::new("barrier"),
        }
    }

    fn next_id(&self) -> SyncId {
        self.next_sync.fetch_add(1, Ordering::Relaxed)
    }

    pub fn mutex_init(&self) -> SyncId {
        let id = self.next_id();
        self.mutexes.insert(id, MutexShadow::default());
        id
    }

    pub fn mutex(&self, id: SyncId) -> Result<Arc<MutexShadow>> {
        self.mutexes.get(id)
    }

    pub fn mutex_destroy(&self, id: SyncId) -> Result<()> {
        let m = self.mutexes.get(id)?;
        if let Some(owner) = m.owner() {
            return Err(anyhow!("mutex {} is still held by thread {}", id, owner));
        }
        self.mutexes.remove(id)
    }

    pub fn cond_init(&self) -> SyncId {
        let id = self.next_id();
        self.conds.insert(id, CondShadow::default());
        id
    }

    pub fn cond(&self, id: SyncId) -> Result<Arc<CondShadow>> {
        self.conds.get(id)
    }

    pub fn cond_destroy(&self, id: SyncId) -> Result<()> {
        self.conds.remove(id)
    }

    pub fn barrier_init(&self, count: usize) -> Result<SyncId> {
        let b = BarrierShadow::new(count)?;
        let id = self.next_id();
        self.barriers.insert(id, b);
        Ok(id)
    }

    pub fn barrier(&self, id: SyncId) -> Result<Arc<BarrierShadow>> {
        self.barriers.get(id)
    }

    pub fn barrier_destroy(&self, id: SyncId) -> Result<()> {
        self.barriers.remove(id)
    }

    /// (мьютексы, условные переменные, барьеры)
    pub fn object_counts(&self) -> (usize, usize, usize) {
        (self.mutexes.len(), self.conds.len(), self.barriers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_unknown_ids_fail() {
        let r = Registry::new();
        let m = r.mutex_init();
        let c = r.cond_init();
        let b = r.barrier_init(2).unwrap();
        assert!(m != c && c != b);
        assert_eq!(r.object_counts(), (1, 1, 1));

        let err = r.mutex(999).err().unwrap();
        assert!(format!("{}", err).contains("999"));

        r.mutex(m).unwrap().lock(1);
        assert!(r.mutex_destroy(m).is_err());
        r.mutex(m).unwrap().unlock(1).unwrap();
        r.mutex_destroy(m).unwrap();
        assert!(r.mutex(m).is_err());
        r.cond_destroy(c).unwrap();
        r.barrier_destroy(b).unwrap();
        assert_eq!(r.object_counts(), (0, 0, 0));
    }
}
