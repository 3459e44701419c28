//! A toy key/value cache on top of the allocator. The cache owns the key to
//! pointer mapping, the allocator decides what gets evicted and tells the
//! cache through the callback.

use std::{collections::HashMap, ptr::NonNull};

use memalloc::{Config, MemAlloc};

struct Cache {
    allocator: MemAlloc,
    items: HashMap<String, (NonNull<u8>, usize)>,
}

impl Cache {
    fn new(config: Config) -> Result<Self, memalloc::ArenaError> {
        Ok(Self {
            allocator: MemAlloc::with_config(config)?,
            items: HashMap::new(),
        })
    }

    fn set(&mut self, key: &str, value: &[u8]) -> bool {
        if let Some((old, _)) = self.items.remove(key) {
            if self.allocator.realloc_inplace(old, value.len()) {
                self.store(key, old, value);
                return true;
            }
            self.allocator.free(old);
        }

        let items = &mut self.items;
        let Some(ptr) = self.allocator.allocate_or_evict(value.len(), true, |evicted| {
            items.retain(|_, (ptr, _)| *ptr != evicted);
        }) else {
            return false;
        };
        self.store(key, ptr, value);
        true
    }

    fn store(&mut self, key: &str, ptr: NonNull<u8>, value: &[u8]) {
        unsafe { ptr.as_ptr().copy_from_nonoverlapping(value.as_ptr(), value.len()) };
        self.allocator.touch(ptr);
        self.items.insert(key.to_owned(), (ptr, value.len()));
    }

    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let (ptr, len) = *self.items.get(key)?;
        self.allocator.touch(ptr);
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec())
    }
}

fn main() {
    let config = Config::new(64 * 1024, 4096);
    let mut cache = Cache::new(config).expect("failed to reserve the arena");

    for i in 0..200 {
        let value = vec![b'a' + (i % 26) as u8; 700];
        cache.set(&format!("key-{i}"), &value);
        // Keep the first key hot.
        cache.get("key-0");
    }

    let stats = cache.allocator.stats();
    println!("items cached: {}", cache.items.len());
    println!("evictions:    {}", stats.evictions);
    println!("used bytes:   {} / {}", stats.used_bytes, stats.total_size);
    println!("key-0 still cached: {}", cache.get("key-0").is_some());
    println!("key-1 still cached: {}", cache.get("key-1").is_some());

    cache.allocator.verify().expect("allocator corrupted");
}
