//! Maps a non-zero 32-bit key to a bag of 32-bit values.
//!
//! Conceptually an optimized `map<u32, vec<u32>>`: the bags live as
//! contiguous blocks inside a slab, each laid out as the key, a packed
//! capacity/size word, then the values. A full bag first tries to grow in
//! place by taking the free block that follows it; only when the
//! neighboring space is claimed does it relocate.

use super::store::Store;
use super::{StoreError, StoreResult};

use std::collections::BTreeMap;

/// Initial value capacity of a fresh bag.
const INITIAL_CAPACITY: u32 = 6;

/// Slots for the key copy and the packed capacity/size word.
const METADATA_SIZE: u32 = 2;

/// Size and capacity are packed into 16 bits each.
const MAX_BAG_SIZE: u32 = 0xffff;

#[derive(Default)]
pub struct IndexMap {
    store: Store<u32, 24>,

    /// key -> slab location of its bag
    index: BTreeMap<u32, u32>,
}

fn pack(capacity: u32, size: u32) -> u32 {
    debug_assert!(capacity <= MAX_BAG_SIZE && size <= capacity);
    (capacity << 16) | size
}

fn next_capacity(capacity: u32) -> u32 {
    // keep allocations aligned to 4 slots after the metadata
    (((capacity + capacity / 2 + 4) & !3) + 2).min(MAX_BAG_SIZE)
}

impl IndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.index.keys().copied()
    }

    /// Appends `value` to the bag of `key`, creating the bag on first use.
    pub fn add(&mut self, key: u32, value: u32) -> StoreResult<()> {
        debug_assert!(key != 0, "key 0 is reserved");

        let storage_key = match self.index.get(&key) {
            Some(&storage_key) => storage_key,
            None => {
                let storage_key = self.allocate_bag(key, INITIAL_CAPACITY, 0)?;
                self.index.insert(key, storage_key);
                storage_key
            }
        };

        let bag = self.store.get(storage_key)?;
        debug_assert_eq!(bag[0], key);
        let capacity = bag[1] >> 16;
        let size = bag[1] & MAX_BAG_SIZE;

        if size < capacity {
            let bag = self.store.get_mut(storage_key)?;
            bag[1] = pack(capacity, size + 1);
            bag[(METADATA_SIZE + size) as usize] = value;
            return Ok(());
        }

        if size == MAX_BAG_SIZE {
            return Err(StoreError::CapacityExceeded(format!(
                "bag for key {key:#010x} is at the {MAX_BAG_SIZE}-element limit"
            )));
        }

        let available = self
            .store
            .available_after(storage_key, capacity + METADATA_SIZE);
        if available != 0 {
            // grow in place into the following free block
            let mut new_capacity = next_capacity(capacity);
            if new_capacity - capacity >= available {
                new_capacity = capacity + available;
            }
            if available - (new_capacity - capacity) <= INITIAL_CAPACITY + METADATA_SIZE {
                // the leftover would be too small to ever hold a bag
                new_capacity = capacity + available;
            }
            let new_capacity = new_capacity.min(MAX_BAG_SIZE);

            self.store.extend(
                storage_key,
                capacity + METADATA_SIZE,
                new_capacity + METADATA_SIZE,
            )?;

            let bag = self.store.get_mut(storage_key)?;
            bag[1] = pack(new_capacity, size + 1);
            bag[(METADATA_SIZE + size) as usize] = value;
            return Ok(());
        }

        // the neighboring space is claimed; relocate the bag
        self.reallocate_bag(key, storage_key, capacity, size)?;

        self.add(key, value)
    }

    /// The values recorded under `key`, in insertion order except where
    /// `remove_value` swapped an element into a hole.
    pub fn values(&self, key: u32) -> StoreResult<&[u32]> {
        let storage_key = match self.index.get(&key) {
            Some(&storage_key) => storage_key,
            None => return Ok(&[]),
        };

        let bag = self.store.get(storage_key)?;
        debug_assert_eq!(bag[0], key);
        let size = bag[1] & MAX_BAG_SIZE;
        Ok(&bag[METADATA_SIZE as usize..(METADATA_SIZE + size) as usize])
    }

    /// Drops the whole bag of `key`.
    pub fn remove_key(&mut self, key: u32) -> StoreResult<()> {
        let storage_key = match self.index.remove(&key) {
            Some(storage_key) => storage_key,
            None => return Ok(()),
        };

        let bag = self.store.get_mut(storage_key)?;
        debug_assert_eq!(bag[0], key);
        let capacity = bag[1] >> 16;
        bag[0] = 0;
        bag[1] = 0;

        self.store.deallocate(storage_key, capacity + METADATA_SIZE)
    }

    /// Removes one occurrence of `value` from the bag of `key`. The victim
    /// is swapped with the last element; bag order is not preserved.
    pub fn remove_value(&mut self, key: u32, value: u32) -> StoreResult<()> {
        let storage_key = match self.index.get(&key) {
            Some(&storage_key) => storage_key,
            None => return Ok(()),
        };

        let bag = self.store.get_mut(storage_key)?;
        debug_assert_eq!(bag[0], key);
        let capacity = bag[1] >> 16;
        let size = bag[1] & MAX_BAG_SIZE;

        let values = &mut bag[METADATA_SIZE as usize..(METADATA_SIZE + size) as usize];
        if let Some(position) = values.iter().position(|&held| held == value) {
            values[position] = values[size as usize - 1];
            bag[1] = pack(capacity, size - 1);
        }
        Ok(())
    }

    fn allocate_bag(&mut self, key: u32, capacity: u32, size: u32) -> StoreResult<u32> {
        let storage_key = self.store.allocate(capacity + METADATA_SIZE)?;
        let bag = self.store.get_mut(storage_key)?;
        bag[0] = key;
        bag[1] = pack(capacity, size);
        Ok(storage_key)
    }

    fn reallocate_bag(
        &mut self,
        key: u32,
        old_storage_key: u32,
        old_capacity: u32,
        size: u32,
    ) -> StoreResult<()> {
        let new_capacity = next_capacity(old_capacity);
        let values: Vec<u32> = {
            let bag = self.store.get(old_storage_key)?;
            bag[METADATA_SIZE as usize..(METADATA_SIZE + size) as usize].to_vec()
        };

        let new_storage_key = self.allocate_bag(key, new_capacity, size)?;
        let bag = self.store.get_mut(new_storage_key)?;
        bag[METADATA_SIZE as usize..(METADATA_SIZE + size) as usize].copy_from_slice(&values);

        let old_bag = self.store.get_mut(old_storage_key)?;
        old_bag[0] = 0;
        old_bag[1] = 0;
        self.store
            .deallocate(old_storage_key, old_capacity + METADATA_SIZE)?;

        self.index.insert(key, new_storage_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_has_no_values() {
        let map = IndexMap::new();
        assert!(map.values(42).unwrap().is_empty());
        assert_eq!(map.key_count(), 0);
    }

    #[test]
    fn values_accumulate_under_their_key() {
        let mut map = IndexMap::new();
        map.add(3, 100).unwrap();
        map.add(3, 101).unwrap();
        map.add(5, 200).unwrap();

        assert_eq!(map.values(3).unwrap(), &[100, 101]);
        assert_eq!(map.values(5).unwrap(), &[200]);
        assert_eq!(map.key_count(), 2);
    }

    #[test]
    fn bags_grow_past_their_initial_capacity() {
        let mut map = IndexMap::new();
        for value in 0..100 {
            map.add(7, value).unwrap();
        }

        let values = map.values(7).unwrap();
        assert_eq!(values.len(), 100);
        for (position, &value) in values.iter().enumerate() {
            assert_eq!(value, position as u32);
        }
    }

    #[test]
    fn interleaved_keys_force_relocation() {
        let mut map = IndexMap::new();
        // alternate between two keys so each bag's neighbor space is taken
        for value in 0..50 {
            map.add(11, value).unwrap();
            map.add(13, value + 1000).unwrap();
        }

        assert_eq!(map.values(11).unwrap().len(), 50);
        assert_eq!(map.values(13).unwrap().len(), 50);
        assert_eq!(map.values(11).unwrap()[49], 49);
        assert_eq!(map.values(13).unwrap()[49], 1049);
    }

    #[test]
    fn remove_value_swaps_with_the_last_element() {
        let mut map = IndexMap::new();
        for value in [10, 20, 30, 40] {
            map.add(9, value).unwrap();
        }

        map.remove_value(9, 20).unwrap();
        let mut values = map.values(9).unwrap().to_vec();
        values.sort_unstable();
        assert_eq!(values, vec![10, 30, 40]);

        // removing something absent is a no-op
        map.remove_value(9, 999).unwrap();
        assert_eq!(map.values(9).unwrap().len(), 3);
    }

    #[test]
    fn remove_key_releases_the_bag() {
        let mut map = IndexMap::new();
        map.add(21, 1).unwrap();
        map.add(22, 2).unwrap();

        map.remove_key(21).unwrap();
        assert!(map.values(21).unwrap().is_empty());
        assert_eq!(map.key_count(), 1);

        // the freed space is reused
        map.add(23, 3).unwrap();
        assert_eq!(map.values(23).unwrap(), &[3]);
    }

    #[test]
    fn keys_iterates_live_bags() {
        let mut map = IndexMap::new();
        map.add(4, 1).unwrap();
        map.add(2, 1).unwrap();
        let keys: Vec<u32> = map.keys().collect();
        assert_eq!(keys, vec![2, 4]);
    }
}
