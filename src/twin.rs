//! Twin Manager: пул буферов для копий страниц до первой записи в эпохе.
//!
//! - capture(page_id, src) копирует страницу в буфер из пула (или новый, если свободных нет).
//! - release(twin) возвращает буфер в пул для повторного использования.
//! - capacity ограничивает число одновременно живых twin'ов (0 = без ограничения).
//!   Переполнение — не ошибка записи: движок делает ранний чекпоинт и повторяет fault.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::metrics::Metrics;

/// Копия страницы, сделанная при переходе read-only -> writable.
pub struct Twin {
    page_id: u64,
    buf: Box<[u8]>,
}

impl Twin {
    #[inline]
    pub fn page_id(&self) -> u64 {
        self.page_id
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for Twin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Twin")
            .field("page_id", &self.page_id)
            .field("len", &self.buf.len())
            .finish()
    }
}

/// Пул исчерпан: все `capacity` twin'ов живы.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwinPoolExhausted {
    pub page_id: u64,
    pub capacity: usize,
}

impl fmt::Display for TwinPoolExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "twin pool exhausted (capacity {}) while capturing page {}",
            self.capacity, self.page_id
        )
    }
}

impl std::error::Error for TwinPoolExhausted {}

struct PoolState {
    free: Vec<Box<[u8]>>,
    live: usize,
}

pub struct TwinPool {
    page_size: usize,
    capacity: usize,
    state: Mutex<PoolState>,
    metrics: Arc<Metrics>,
}

impl TwinPool {
    pub fn new(page_size: usize, capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            page_size,
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                live: 0,
            }),
            metrics,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Число живых twin'ов.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn capture(&self, page_id: u64, src: &[u8]) -> Result<Twin, TwinPoolExhausted> {
        debug_assert_eq!(src.len(), self.page_size);
        let mut buf = {
            let mut st = self.state.lock().unwrap();
            if self.capacity != 0 && st.live >= self.capacity {
                return Err(TwinPoolExhausted {
                    page_id,
                    capacity: self.capacity,
                });
            }
            st.live += 1;
            st.free.pop()
        }
        .unwrap_or_else(|| vec![0u8; self.page_size].into_boxed_slice());

        buf.copy_from_slice(src);
        self.metrics.record_twin_page();
        Ok(Twin { page_id, buf })
    }

    pub fn release(&self, twin: Twin) {
        let mut st = self.state.lock().unwrap();
        st.live = st.live.saturating_sub(1);
        // Держим в запасе не больше, чем разрешено живых.
        if self.capacity == 0 || st.free.len() < self.capacity {
            st.free.push(twin.buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_and_recycling() {
        let pool = TwinPool::new(16, 2, Arc::new(Metrics::new(true)));
        let page = [5u8; 16];
        let a = pool.capture(0, &page).unwrap();
        let b = pool.capture(1, &page).unwrap();
        let err = pool.capture(2, &page).unwrap_err();
        assert_eq!(err.page_id, 2);
        assert_eq!(err.capacity, 2);
        assert_eq!(pool.live(), 2);

        assert_eq!(a.bytes(), &page);
        pool.release(a);
        let c = pool.capture(2, &[1u8; 16]).unwrap();
        assert_eq!(c.bytes(), &[1u8; 16]);
        assert_eq!(c.page_id(), 2);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn unbounded_pool() {
        let pool = TwinPool::new(8, 0, Arc::new(Metrics::new(false)));
        let twins: Vec<_> = (0..100).map(|i| pool.capture(i, &[0u8; 8]).unwrap()).collect();
        assert_eq!(pool.live(), 100);
        for t in twins {
            pool.release(t);
        }
        assert_eq!(pool.live(), 0);
    }
}
