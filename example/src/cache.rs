//! Cache with a bookkeeping leak that only shows up when asked for.

use std::collections::HashMap;

pub struct DataCache {
    entries: HashMap<String, CacheEntry>,
    max_size: usize,
    /// Leak a copy of every key looked up.
    leak_keys: bool,
}

struct CacheEntry {
    data: Vec<u8>,
    hits: u32,
}

impl DataCache {
    pub fn new(leak_keys: bool) -> Self {
        Self {
            entries: HashMap::new(),
            max_size: 128,
            leak_keys,
        }
    }

    #[inline(never)]
    pub fn get(&mut self, key: &str) -> Option<&[u8]> {
        if self.leak_keys {
            // Lost on purpose: nothing keeps a pointer to the copy.
            std::mem::forget(key.to_string());
        }
        let entry = self.entries.get_mut(key)?;
        entry.hits += 1;
        Some(&entry.data)
    }

    #[inline(never)]
    pub fn put(&mut self, key: String, data: Vec<u8>) {
        if self.entries.len() >= self.max_size {
            self.evict_one();
        }
        self.entries.insert(key, CacheEntry { data, hits: 0 });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries = HashMap::new();
    }

    #[inline(never)]
    fn evict_one(&mut self) {
        if let Some(evict_key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.hits)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&evict_key);
        }
    }
}
