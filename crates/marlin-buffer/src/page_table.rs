//! Extendible hash table, used as the buffer pool's page table.

use log::debug;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A fixed-capacity bucket of key-value pairs.
struct Bucket<K, V> {
    /// Maximum number of items this bucket holds.
    capacity: usize,
    /// Items and the bucket's local depth, guarded together.
    inner: Mutex<BucketInner<K, V>>,
}

struct BucketInner<K, V> {
    /// Number of hash bits distinguishing this bucket.
    local_depth: usize,
    /// Stored pairs; keys are unique.
    items: Vec<(K, V)>,
}

impl<K: PartialEq + Clone, V: Clone> Bucket<K, V> {
    fn new(capacity: usize, local_depth: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(BucketInner {
                local_depth,
                items: Vec::with_capacity(capacity),
            }),
        }
    }

    fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        inner
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        match inner.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                inner.items.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Stores the pair, overwriting an existing key (last write wins).
    /// Returns false when the bucket is full and the key is absent.
    fn try_insert(&self, key: &K, value: &V) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.items.iter().position(|(k, _)| k == key) {
            inner.items[pos].1 = value.clone();
            return true;
        }
        if inner.items.len() < self.capacity {
            inner.items.push((key.clone(), value.clone()));
            return true;
        }
        false
    }

    fn local_depth(&self) -> usize {
        self.inner.lock().local_depth
    }
}

/// In-memory hash table using extendible hashing.
///
/// The directory holds `2^global_depth` slots, each a shared reference to a
/// bucket; a bucket with `local_depth` bits is shared by every slot whose
/// low `local_depth` hash bits agree. Overflow splits the bucket, doubling
/// the directory when the bucket was already at global depth. The directory
/// never shrinks.
///
/// Directory mutations hold the directory lock; bucket-local operations
/// hold only the bucket's own lock.
pub struct ExtendibleHashTable<K, V> {
    /// Fixed item capacity of each bucket.
    bucket_capacity: usize,
    /// Directory state.
    dir: Mutex<Directory<K, V>>,
}

struct Directory<K, V> {
    /// One slot per low-bit pattern; length is always 2^global_depth.
    slots: Vec<Arc<Bucket<K, V>>>,
    /// Number of hash bits the directory currently uses.
    global_depth: usize,
    /// Number of distinct buckets.
    num_buckets: usize,
}

impl<K, V> Directory<K, V> {
    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }
}

impl<K: Hash + Eq + Clone, V: Clone> ExtendibleHashTable<K, V> {
    /// Creates a table with a single empty bucket and global depth 0.
    pub fn new(bucket_capacity: usize) -> Self {
        assert!(bucket_capacity > 0, "bucket capacity must be positive");
        Self {
            bucket_capacity,
            dir: Mutex::new(Directory {
                slots: vec![Arc::new(Bucket::new(bucket_capacity, 0))],
                global_depth: 0,
                num_buckets: 1,
            }),
        }
    }

    fn hash_of(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Resolves the bucket responsible for `key`, holding the directory
    /// lock only long enough to clone the reference.
    fn route(&self, key: &K) -> Arc<Bucket<K, V>> {
        let dir = self.dir.lock();
        let index = Self::hash_of(key) as usize & dir.mask();
        Arc::clone(&dir.slots[index])
    }

    /// Looks up the value associated with `key`.
    pub fn find(&self, key: &K) -> Option<V> {
        self.route(key).find(key)
    }

    /// Removes `key`. Returns true if it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.route(key).remove(key)
    }

    /// Inserts a key-value pair, splitting buckets as needed.
    ///
    /// Duplicate keys are not expected from callers; if one arrives, the
    /// last write wins. The directory lock is held across the bucket
    /// insert so a concurrent split cannot strand the pair in a bucket
    /// the directory no longer routes this key to.
    pub fn insert(&self, key: K, value: V) {
        loop {
            {
                let dir = self.dir.lock();
                let index = Self::hash_of(&key) as usize & dir.mask();
                if dir.slots[index].try_insert(&key, &value) {
                    return;
                }
            }
            self.split_bucket(&key);
        }
    }

    /// Splits the bucket responsible for `key` once, then reinserts its
    /// drained items. The caller's retry loop handles the triggering pair.
    fn split_bucket(&self, key: &K) {
        let drained: Vec<(K, V)> = {
            let mut dir = self.dir.lock();
            let index = Self::hash_of(key) as usize & dir.mask();
            let bucket = Arc::clone(&dir.slots[index]);
            let mut inner = bucket.inner.lock();

            // Re-check under the directory lock; another thread may have
            // split this bucket between our failed insert and now.
            if inner.items.len() < bucket.capacity {
                return;
            }

            if inner.local_depth == dir.global_depth {
                // Double the directory: append a copy of every slot so
                // slot i + old_len aliases slot i.
                let len = dir.slots.len();
                dir.slots.extend_from_within(0..len);
                dir.global_depth += 1;
                debug!(
                    "extendible hash directory doubled to depth {}",
                    dir.global_depth
                );
            }

            inner.local_depth += 1;

            // All slots referring to the overflowing bucket, in index order.
            let shared: Vec<usize> = dir
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| Arc::ptr_eq(slot, &bucket))
                .map(|(i, _)| i)
                .collect();

            // Slots where the newly significant hash bit is set move to a
            // fresh bucket; in the sorted list that is every second index.
            let new_bucket = Arc::new(Bucket::new(self.bucket_capacity, inner.local_depth));
            for (position, &i) in shared.iter().enumerate() {
                if position % 2 == 1 {
                    dir.slots[i] = Arc::clone(&new_bucket);
                }
            }
            dir.num_buckets += 1;

            std::mem::take(&mut inner.items)
        };

        // Rehash outside the directory lock. May recurse into further
        // splits, bounded by the hash bit width.
        for (k, v) in drained {
            self.insert(k, v);
        }
    }

    /// Returns the directory's global depth.
    pub fn global_depth(&self) -> usize {
        self.dir.lock().global_depth
    }

    /// Returns the local depth of the bucket at `bucket_index`.
    ///
    /// Panics when the index is outside the directory.
    pub fn local_depth(&self, bucket_index: usize) -> usize {
        let dir = self.dir.lock();
        dir.slots[bucket_index].local_depth()
    }

    /// Returns the number of distinct buckets.
    pub fn num_buckets(&self) -> usize {
        self.dir.lock().num_buckets
    }

    /// Returns the directory length (2^global_depth).
    pub fn dir_len(&self) -> usize {
        self.dir.lock().slots.len()
    }

    /// True when two directory slots reference the same bucket.
    #[cfg(test)]
    fn buckets_shared(&self, i: usize, j: usize) -> bool {
        let dir = self.dir.lock();
        Arc::ptr_eq(&dir.slots[i], &dir.slots[j])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_table_initial_state() {
        let table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(4);
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.num_buckets(), 1);
        assert_eq!(table.local_depth(0), 0);
        assert_eq!(table.dir_len(), 1);
    }

    #[test]
    fn test_hash_table_insert_find() {
        let table = ExtendibleHashTable::new(4);

        table.insert(1, "a");
        table.insert(2, "b");

        assert_eq!(table.find(&1), Some("a"));
        assert_eq!(table.find(&2), Some("b"));
        assert_eq!(table.find(&3), None);
    }

    #[test]
    fn test_hash_table_duplicate_key_last_write_wins() {
        let table = ExtendibleHashTable::new(4);

        table.insert(7, 100);
        table.insert(7, 200);

        assert_eq!(table.find(&7), Some(200));
    }

    #[test]
    fn test_hash_table_remove() {
        let table = ExtendibleHashTable::new(4);

        table.insert(1, "a");
        assert!(table.remove(&1));
        assert_eq!(table.find(&1), None);

        // Second remove is a no-op
        assert!(!table.remove(&1));
    }

    #[test]
    fn test_hash_table_split_chain() {
        let table = ExtendibleHashTable::new(2);

        for key in 0..100i32 {
            table.insert(key, key * 10);
        }

        // Every key survives the split cascade
        for key in 0..100i32 {
            assert_eq!(table.find(&key), Some(key * 10), "key {}", key);
        }

        assert!(table.global_depth() > 0);
        assert!(table.num_buckets() > 1);
    }

    #[test]
    fn test_hash_table_directory_invariants() {
        let table = ExtendibleHashTable::new(2);

        for key in 0..64i32 {
            table.insert(key, key);
        }

        let global = table.global_depth();
        let dir_len = table.dir_len();

        // Directory length is a power of two equal to 2^global_depth
        assert_eq!(dir_len, 1 << global);

        // Every bucket's local depth is bounded by the global depth, and
        // two slots share a bucket iff their low local-depth bits agree.
        for i in 0..dir_len {
            let local = table.local_depth(i);
            assert!(local <= global);
            for j in 0..dir_len {
                let expect_shared =
                    (i & ((1 << local) - 1)) == (j & ((1 << local) - 1));
                assert_eq!(
                    table.buckets_shared(i, j),
                    expect_shared,
                    "slots {} and {}",
                    i,
                    j
                );
            }
        }
    }

    #[test]
    fn test_hash_table_directory_never_shrinks() {
        let table = ExtendibleHashTable::new(2);

        for key in 0..32i32 {
            table.insert(key, key);
        }
        let depth_after_inserts = table.global_depth();
        let buckets_after_inserts = table.num_buckets();

        for key in 0..32i32 {
            assert!(table.remove(&key));
        }

        assert_eq!(table.global_depth(), depth_after_inserts);
        assert_eq!(table.num_buckets(), buckets_after_inserts);
    }

    #[test]
    fn test_hash_table_many_entries_single_bucket_capacity() {
        // Capacity-1 buckets force a split on nearly every insert
        let table = ExtendibleHashTable::new(1);

        for key in 0..32i32 {
            table.insert(key, key + 1000);
        }
        for key in 0..32i32 {
            assert_eq!(table.find(&key), Some(key + 1000));
        }
    }

    #[test]
    fn test_hash_table_concurrent_inserts() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(ExtendibleHashTable::new(4));
        let mut handles = Vec::new();

        for t in 0..4i32 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for i in 0..64 {
                    table.insert(t * 1000 + i, i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..4i32 {
            for i in 0..64 {
                assert_eq!(table.find(&(t * 1000 + i)), Some(i));
            }
        }
    }
}
