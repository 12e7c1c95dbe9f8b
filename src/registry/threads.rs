//! registry/threads — идентификаторы потоков движка.
//!
//! - id выдаются с 1 (0 зарезервирован за «нет потока», как getpid до инициализации);
//! - OS-потоки, не созданные через spawn (например, main), регистрируются лениво;
//! - JoinHandle хранится до join/detach.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

pub type ThreadId = u64;

pub struct ThreadTable {
    next_id: AtomicU64,
    by_os: Mutex<HashMap<std::thread::ThreadId, ThreadId>>,
    handles: Mutex<HashMap<ThreadId, JoinHandle<usize>>>,
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_os: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Зарезервировать id для потока, который ещё не запущен.
    pub fn allocate_id(&self) -> ThreadId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Привязать текущий OS-поток к id (вызывается внутри spawn'нутого потока).
    pub fn bind_current(&self, id: ThreadId) {
        self.by_os
            .lock()
            .unwrap()
            .insert(std::thread::current().id(), id);
    }

    /// id текущего потока; незнакомый поток регистрируется.
    pub fn current(&self) -> ThreadId {
        let os = std::thread::current().id();
        let mut map = self.by_os.lock().unwrap();
        if let Some(id) = map.get(&os) {
            return *id;
        }
        let id = self.allocate_id();
        map.insert(os, id);
        id
    }

    /// id текущего потока без регистрации.
    pub fn lookup_current(&self) -> Option<ThreadId> {
        self.by_os
            .lock()
            .unwrap()
            .get(&std::thread::current().id())
            .copied()
    }

    pub fn deregister_current(&self) -> Option<ThreadId> {
        self.by_os
            .lock()
            .unwrap()
            .remove(&std::thread::current().id())
    }

    /// Число зарегистрированных (живых) потоков.
    pub fn live(&self) -> usize {
        self.by_os.lock().unwrap().len()
    }

    /// Следующий id, который будет выдан (thread index в metadata-файле).
    pub fn next_index(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    pub fn insert_handle(&self, id: ThreadId, h: JoinHandle<usize>) {
        self.handles.lock().unwrap().insert(id, h);
    }

    pub fn take_handle(&self, id: ThreadId) -> Result<JoinHandle<usize>> {
        self.handles
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| anyhow!("unknown or already joined thread {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_registers_once() {
        let t = ThreadTable::new();
        assert_eq!(t.lookup_current(), None);
        let a = t.current();
        assert_eq!(t.current(), a);
        assert_eq!(t.live(), 1);
        assert_eq!(t.deregister_current(), Some(a));
        assert!(t.take_handle(a).is_err());
    }
}
