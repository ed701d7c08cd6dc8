#![no_main]
use arenabuf_core::{BackingStore, BufferPool, PoolConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte record is one operation on a small pool.
    let config = PoolConfig::default()
        .with_geometry(4096, 16)
        .with_arenas(2)
        .with_cache_sizes(4, 2);
    let Ok(pool) = BufferPool::new(config) else {
        return;
    };
    let mut live = Vec::new();

    for op in data.chunks_exact(4) {
        let size = usize::from(u16::from_le_bytes([op[1], op[2]])) * 8;
        let slot = usize::from(op[3]);
        match op[0] % 6 {
            0 | 1 => {
                if let Ok(buf) = pool.buffer(size) {
                    let _ = buf.set_u8(0, op[3]);
                    live.push(buf);
                }
            }
            2 if !live.is_empty() => {
                let buf = live.swap_remove(slot % live.len());
                // Must never panic, even on already released buffers.
                let _ = buf.release();
            }
            3 if !live.is_empty() => {
                let buf = &live[slot % live.len()];
                let _ = buf.retain();
            }
            4 if !live.is_empty() => {
                let buf = &live[slot % live.len()];
                if let Ok(view) = buf.retained_slice(0, size.min(buf.capacity())) {
                    let _ = view.get_u8(0);
                    let _ = view.release();
                }
            }
            5 if !live.is_empty() => {
                let buf = &live[slot % live.len()];
                let _ = buf.set_capacity(size);
            }
            _ => {}
        }
    }

    for buf in live {
        while buf.is_live() {
            if buf.release().is_err() {
                break;
            }
        }
    }
    pool.release_thread_cache();
    assert_eq!(pool.metrics().active_bytes, 0);
});
