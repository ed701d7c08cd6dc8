//! Open-addressed `u64 -> u64` map used by chunks to find runs by page.
//!
//! Keys and values are interleaved in one flat array. Probing is linear with
//! a fixed limit of `floor(ln(array length))` slots. When a key cannot be
//! placed within the limit the array doubles and every entry is rehashed.
//! Slot key 0 marks an empty slot, so key 0 itself lives in a dedicated
//! side slot.

const INITIAL_SLOTS: usize = 32;

/// Linear-probed integer map.
#[derive(Debug, Clone)]
pub struct RunMap {
    array: Vec<u64>,
    mask: usize,
    max_probe: usize,
    zero_val: Option<u64>,
    len: usize,
}

impl Default for RunMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMap {
    #[must_use]
    pub fn new() -> Self {
        let mut map = Self {
            array: vec![0; INITIAL_SLOTS],
            mask: 0,
            max_probe: 0,
            zero_val: None,
            len: 0,
        };
        map.compute_mask_and_probe();
        map
    }

    /// Number of keys present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or replace. Returns the previous value.
    pub fn put(&mut self, key: u64, value: u64) -> Option<u64> {
        let prev = self.put0(key, value);
        if prev.is_none() {
            self.len += 1;
        }
        prev
    }

    fn put0(&mut self, key: u64, value: u64) -> Option<u64> {
        if key == 0 {
            return self.zero_val.replace(value);
        }
        loop {
            let mut index = self.index(key);
            let mut i = 0;
            while i < self.max_probe {
                let existing = self.array[index];
                if existing == key || existing == 0 {
                    let mut prev = (existing != 0).then(|| self.array[index + 1]);
                    self.array[index] = key;
                    self.array[index + 1] = value;
                    // A removal may have left a hole before an older copy of
                    // this key; clear the older copy.
                    while i < self.max_probe {
                        index = (index + 2) & self.mask;
                        if self.array[index] == key {
                            self.array[index] = 0;
                            prev = Some(self.array[index + 1]);
                            break;
                        }
                        i += 1;
                    }
                    return prev;
                }
                index = (index + 2) & self.mask;
                i += 1;
            }
            self.expand();
        }
    }

    /// Remove `key`. Returns the value it held.
    pub fn remove(&mut self, key: u64) -> Option<u64> {
        let removed = if key == 0 {
            self.zero_val.take()
        } else {
            let mut index = self.index(key);
            let mut removed = None;
            for _ in 0..self.max_probe {
                if self.array[index] == key {
                    self.array[index] = 0;
                    removed = Some(self.array[index + 1]);
                    break;
                }
                index = (index + 2) & self.mask;
            }
            removed
        };
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    #[must_use]
    pub fn get(&self, key: u64) -> Option<u64> {
        if key == 0 {
            return self.zero_val;
        }
        let mut index = self.index(key);
        for _ in 0..self.max_probe {
            if self.array[index] == key {
                return Some(self.array[index + 1]);
            }
            index = (index + 2) & self.mask;
        }
        None
    }

    #[must_use]
    pub fn contains_key(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// Slots in the backing array (two per entry).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.array.len() / 2
    }

    fn index(&self, key: u64) -> usize {
        // murmur3 64-bit finalizer.
        let mut k = key;
        k ^= k >> 33;
        k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
        k ^= k >> 33;
        k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        k ^= k >> 33;
        (k as usize) & self.mask
    }

    fn expand(&mut self) {
        let new_len = self.array.len() * 2;
        let prev = std::mem::replace(&mut self.array, vec![0; new_len]);
        self.compute_mask_and_probe();
        for pair in prev.chunks_exact(2) {
            if pair[0] != 0 {
                self.put0(pair[0], pair[1]);
            }
        }
    }

    fn compute_mask_and_probe(&mut self) {
        let length = self.array.len();
        self.mask = (length - 1) & !1;
        self.max_probe = (length as f64).ln() as usize;
    }
}
