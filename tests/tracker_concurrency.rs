// tests/tracker_concurrency.rs
//
// Одновременные ловушки на одной странице: ровно один twin и одна обработанная
// ловушка, остальные — spurious. Разные страницы обрабатываются независимо.

use std::sync::{Arc, Barrier};

use nvthreads::consts::PAGE_SIZE;
use nvthreads::diff::DiffPolicy;
use nvthreads::metrics::Metrics;
use nvthreads::region::Region;
use nvthreads::tracker::Tracker;
use nvthreads::trap::FaultAction;
use nvthreads::twin::TwinPool;

const THREADS: usize = 8;

fn tracker(pages: usize) -> (Arc<Tracker>, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new(true));
    let region = Arc::new(Region::new(pages, false).unwrap());
    let pool = Arc::new(TwinPool::new(PAGE_SIZE, 0, metrics.clone()));
    let t = Arc::new(Tracker::new(region, pool, DiffPolicy::default(), 1, metrics.clone()));
    t.protect_region().unwrap();
    (t, metrics)
}

#[test]
fn racing_faults_on_one_page_make_one_twin() {
    let (t, metrics) = tracker(4);
    let gate = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let t = t.clone();
            let gate = gate.clone();
            std::thread::spawn(move || {
                gate.wait();
                t.fault_page(2, i as u64 + 1).unwrap()
            })
        })
        .collect();
    let actions: Vec<FaultAction> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let handled = actions.iter().filter(|a| **a == FaultAction::Handled).count();
    let spurious = actions.iter().filter(|a| **a == FaultAction::Spurious).count();
    assert_eq!(handled, 1);
    assert_eq!(spurious, THREADS - 1);
    assert_eq!(t.live_twins(), 1);
    assert!(t.is_writable(2));
    assert!(t.owner(2).is_some());

    let s = metrics.snapshot();
    assert_eq!(s.faults, 1);
    assert_eq!(s.spurious_faults, (THREADS - 1) as u64);
}

#[test]
fn faults_on_distinct_pages_are_independent() {
    let (t, metrics) = tracker(THREADS);
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let t = t.clone();
            std::thread::spawn(move || {
                let page = i as u64;
                assert_eq!(t.fault_page(page, page + 1).unwrap(), FaultAction::Handled);
                assert!(t.write_page_bytes(page, 0, &[i as u8 + 1]));
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(t.live_twins(), THREADS);
    assert_eq!(metrics.snapshot().faults, THREADS as u64);
    for i in 0..THREADS as u64 {
        assert_eq!(t.owner(i), Some(i + 1));
        assert!(t.has_dirty_by(i + 1));
    }
    // адрес вне региона — не наш
    assert_eq!(t.on_fault(0, 1).unwrap(), FaultAction::Forward);
}
