//! Many threads allocating and freeing random sizes from one pool.

use std::sync::Mutex;
use std::thread;

use arenabuf_core::{BackingStore, BufferPool, PoolConfig};

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 4_000;

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

fn random_size(rng: &mut XorShift64) -> usize {
    match rng.gen_range(0, 99) {
        0..=69 => rng.gen_range(1, 4096),
        70..=96 => rng.gen_range(4097, 65_536),
        _ => rng.gen_range(131_073, 300_000),
    }
}

fn pool(arenas: usize) -> BufferPool {
    let config = PoolConfig::default()
        .with_geometry(8192, 16)
        .with_arenas(arenas)
        .with_cache_sizes(32, 8);
    BufferPool::new(config).expect("valid config")
}

#[test]
fn allocations_drain_to_zero() {
    let pool = pool(2);

    thread::scope(|s| {
        for t in 0..THREADS {
            let pool = &pool;
            s.spawn(move || {
                let mut rng = XorShift64::new(0x9E37_79B9_7F4A_7C15 ^ (t as u64 + 1));
                let mut live = Vec::new();
                for _ in 0..OPS_PER_THREAD {
                    if live.is_empty() || rng.gen_range(0, 2) > 0 {
                        let size = random_size(&mut rng);
                        let alloc = pool.allocate(size, size).unwrap();
                        assert!(alloc.max_length() >= size);
                        live.push(alloc);
                    } else {
                        let i = rng.gen_range(0, live.len() - 1);
                        pool.free(live.swap_remove(i)).unwrap();
                    }
                }
                for alloc in live {
                    pool.free(alloc).unwrap();
                }
                pool.release_thread_cache();
            });
        }
    });

    let metrics = pool.metrics();
    assert_eq!(metrics.active_bytes, 0);
    assert_eq!(metrics.active_allocations(), 0);
    assert_eq!(metrics.thread_caches, 0);
    for arena in &metrics.arenas {
        assert_eq!(arena.huge_active_bytes, 0);
        assert!(arena.subpages.is_empty());
    }
}

#[test]
fn live_buffers_never_overlap() {
    let pool = pool(2);
    let all = Mutex::new(Vec::new());

    thread::scope(|s| {
        for t in 0..THREADS {
            let pool = &pool;
            let all = &all;
            s.spawn(move || {
                let mut rng = XorShift64::new(0xDEAD_BEEF ^ ((t as u64) << 8));
                let mut live = Vec::new();
                for _ in 0..500 {
                    let size = random_size(&mut rng);
                    let buf = pool.buffer(size).unwrap();
                    let tag = (t as u8).wrapping_mul(31).wrapping_add(size as u8);
                    buf.set_u8(0, tag).unwrap();
                    buf.set_u8(size - 1, tag).unwrap();
                    live.push((buf, tag, size));
                    if rng.gen_range(0, 3) == 0 {
                        let i = rng.gen_range(0, live.len() - 1);
                        let (buf, tag, size) = live.swap_remove(i);
                        assert_eq!(buf.get_u8(0).unwrap(), tag);
                        assert_eq!(buf.get_u8(size - 1).unwrap(), tag);
                        assert!(buf.release().unwrap());
                    }
                }
                all.lock().unwrap().push(live);
                pool.release_thread_cache();
            });
        }
    });

    // Everything still held, from every thread, at once.
    let held: Vec<_> = all.into_inner().unwrap().into_iter().flatten().collect();
    let mut ranges: Vec<_> = held
        .iter()
        .map(|(buf, _, _)| buf.address_range().unwrap())
        .collect();
    ranges.sort_by_key(|r| r.start);
    for pair in ranges.windows(2) {
        assert!(pair[0].end <= pair[1].start, "{pair:?} overlap");
    }
    for (buf, tag, size) in &held {
        assert_eq!(buf.get_u8(0).unwrap(), *tag);
        assert_eq!(buf.get_u8(size - 1).unwrap(), *tag);
        assert!(buf.release().unwrap());
    }
    pool.release_thread_cache();
    assert_eq!(pool.metrics().active_bytes, 0);
}
