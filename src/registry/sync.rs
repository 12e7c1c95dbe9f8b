//! registry/sync — теневые объекты синхронизации.
//!
//! Сами примитивы реализованы поверх std::sync; движок перехватывает переходы
//! (unlock, wait, барьер), чтобы вставить checkpoint в нужный момент.

use anyhow::{anyhow, Result};
use std::sync::{Condvar, Mutex};

use super::threads::ThreadId;

/// Мьютекс с владельцем-потоком движка.
#[derive(Default)]
pub struct MutexShadow {
    owner: Mutex<Option<ThreadId>>,
    cv: Condvar,
}

impl MutexShadow {
    pub fn lock(&self, thread: ThreadId) {
        let mut owner = self.owner.lock().unwrap();
        while owner.is_some() {
            owner = self.cv.wait(owner).unwrap();
        }
        *owner = Some(thread);
    }

    pub fn unlock(&self, thread: ThreadId) -> Result<()> {
        let mut owner = self.owner.lock().unwrap();
        match *owner {
            Some(t) if t == thread => {
                *owner = None;
                self.cv.notify_one();
                Ok(())
            }
            Some(t) => Err(anyhow!("thread {} unlocks mutex owned by thread {}", thread, t)),
            None => Err(anyhow!("thread {} unlocks a mutex that is not locked", thread)),
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock().unwrap()
    }
}

/// Условная переменная: счётчик сигналов + Condvar.
#[derive(Default)]
pub struct CondShadow {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl CondShadow {
    /// Отпустить `mutex`, дождаться сигнала, снова захватить `mutex`.
    pub fn wait(&self, mutex: &MutexShadow, thread: ThreadId) -> Result<()> {
        let mut seq = self.seq.lock().unwrap();
        let start = *seq;
        mutex.unlock(thread)?;
        while *seq == start {
            seq = self.cv.wait(seq).unwrap();
        }
        drop(seq);
        mutex.lock(thread);
        Ok(())
    }

    pub fn signal(&self) {
        *self.seq.lock().unwrap() += 1;
        self.cv.notify_one();
    }

    pub fn broadcast(&self) {
        *self.seq.lock().unwrap() += 1;
        self.cv.notify_all();
    }
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// Барьер на `count` участников; последний пришедший выполняет действие лидера.
pub struct BarrierShadow {
    count: usize,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl BarrierShadow {
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(anyhow!("barrier count must be > 0"));
        }
        Ok(Self {
            count,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Ждать остальных. true — этот поток был последним (serial thread).
    /// `leader` выполняется до того, как кто-либо из участников пройдёт барьер.
    pub fn wait<F>(&self, leader: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut st = self.state.lock().unwrap();
        st.arrived += 1;
        if st.arrived == self.count {
            let res = leader();
            st.arrived = 0;
            st.generation = st.generation.wrapping_add(1);
            self.cv.notify_all();
            res.map(|_| true)
        } else {
            let gen = st.generation;
            while st.generation == gen {
                st = self.cv.wait(st).unwrap();
            }
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn unlock_by_non_owner_fails() {
        let m = MutexShadow::default();
        assert!(m.unlock(1).is_err());
        m.lock(1);
        assert_eq!(m.owner(), Some(1));
        assert!(m.unlock(2).is_err());
        m.unlock(1).unwrap();
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn barrier_runs_leader_once_per_generation() {
        let b = Arc::new(BarrierShadow::new(3).unwrap());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut hs = Vec::new();
        for _ in 0..3 {
            let b = b.clone();
            let runs = runs.clone();
            hs.push(std::thread::spawn(move || {
                b.wait(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
            }));
        }
        let serial: usize = hs.into_iter().map(|h| h.join().unwrap() as usize).sum();
        assert_eq!(serial, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(BarrierShadow::new(0).is_err());
    }

    #[test]
    fn cond_wait_reacquires_mutex() {
        let m = Arc::new(MutexShadow::default());
        let c = Arc::new(CondShadow::default());
        m.lock(1);
        let (m2, c2) = (m.clone(), c.clone());
        let h = std::thread::spawn(move || {
            // ждём, пока поток 1 отпустит мьютекс внутри wait
            m2.lock(2);
            c2.signal();
            m2.unlock(2).unwrap();
        });
        c.wait(&m, 1).unwrap();
        assert_eq!(m.owner(), Some(1));
        m.unlock(1).unwrap();
        h.join().unwrap();
    }
}
