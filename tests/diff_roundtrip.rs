// tests/diff_roundtrip.rs
//
// Свойство диффа: twin + дифф == живая страница, для случайных правок,
// в том числе после кодирования в payload лога и разбора обратно.

use nvthreads::consts::PAGE_SIZE;
use nvthreads::diff::{compute, DiffPolicy, DiffRecord};

fn mutate(rng: &mut oorandom::Rand32, page: &mut [u8]) {
    let edits = rng.rand_range(0..40);
    for _ in 0..edits {
        let start = rng.rand_range(0..PAGE_SIZE as u32) as usize;
        let len = (rng.rand_range(1..64) as usize).min(PAGE_SIZE - start);
        for b in &mut page[start..start + len] {
            *b = rng.rand_u32() as u8;
        }
    }
}

#[test]
fn twin_plus_diff_restores_live_page() {
    let mut rng = oorandom::Rand32::new(0x5eed);
    let policies = [
        DiffPolicy::default(),
        DiffPolicy {
            gap: 0,
            whole_page_threshold: PAGE_SIZE * 2,
        },
        DiffPolicy {
            gap: 64,
            whole_page_threshold: 256,
        },
    ];

    for iter in 0..200u64 {
        let mut twin = vec![0u8; PAGE_SIZE];
        for b in twin.iter_mut() {
            *b = rng.rand_u32() as u8;
        }
        let mut live = twin.clone();
        mutate(&mut rng, &mut live);

        let policy = &policies[iter as usize % policies.len()];
        let d = compute(iter, iter + 1, &twin, &live, policy);
        assert_eq!(d.is_empty(), twin == live);

        let mut restored = twin.clone();
        d.apply(&mut restored);
        assert!(restored == live, "iteration {} diverged", iter);

        let decoded = DiffRecord::decode(iter, iter + 1, &d.encode(), PAGE_SIZE).unwrap();
        assert_eq!(decoded, d);
    }
}

#[test]
fn decode_rejects_out_of_page_ranges() {
    let twin = vec![0u8; PAGE_SIZE];
    let mut live = twin.clone();
    live[PAGE_SIZE - 4..].copy_from_slice(&[1, 2, 3, 4]);
    let d = compute(3, 1, &twin, &live, &DiffPolicy::default());
    let payload = d.encode();
    assert!(DiffRecord::decode(3, 1, &payload, PAGE_SIZE).is_ok());
    assert!(DiffRecord::decode(3, 1, &payload, PAGE_SIZE / 2).is_err());
    assert!(DiffRecord::decode(3, 1, &payload[..payload.len() - 1], PAGE_SIZE).is_err());
}
