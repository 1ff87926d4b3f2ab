//! Interning table mapping byte strings to stable 32-bit keys.
//!
//! Conceptually a map from string to key and back. Strings live
//! NUL-terminated in a byte slab, so the key doubles as the slab address;
//! the hash index in front of the slab is derived data and is rebuilt from
//! the NUL-separated slab contents on deserialization.

use super::serialization::{Extractor, Insertor, ObjectHeader, OBJECT_HEADER_SIZE};
use super::store::Store;
use super::{KeyMap, StoreError, StoreResult};

use std::collections::HashMap;

pub type StringKey = u32;

pub const INVALID_KEY: StringKey = 0;

const SERIAL_TAG: &str = "ftags::Strings";

#[derive(Default)]
pub struct StringTable {
    store: Store<u8, 24>,
    index: HashMap<String, StringKey>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for `value`, or [`INVALID_KEY`] when it was never interned.
    pub fn get_key(&self, value: &str) -> StringKey {
        self.index.get(value).copied().unwrap_or(INVALID_KEY)
    }

    /// Interns `value`, returning the existing key when it is already
    /// present. Keys are never zero and never change for the lifetime of
    /// the table.
    pub fn add_key(&mut self, value: &str) -> StoreResult<StringKey> {
        let current = self.get_key(value);
        if current != INVALID_KEY {
            return Ok(current);
        }
        self.insert_string(value)
    }

    /// Constant-time projection from a key back to the string.
    pub fn get_string(&self, key: StringKey) -> Option<&str> {
        let bytes = self.store.get(key).ok()?;
        if bytes.is_empty() {
            return None;
        }
        let end = bytes.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&bytes[..end]).ok()
    }

    /// Frees the slab bytes and drops the index entry. There is no
    /// reference count at this level; callers needing shared ownership
    /// wrap this table.
    pub fn remove_key(&mut self, value: &str) -> StoreResult<()> {
        let key = match self.index.remove(value) {
            Some(key) => key,
            None => return Ok(()),
        };

        let size = value.len() as u32 + 1;
        let bytes = self.store.get_mut(key)?;
        for slot in &mut bytes[..size as usize] {
            *slot = 0;
        }
        self.store.deallocate(key, size)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn for_each<F>(&self, mut func: F)
    where
        F: FnMut(&str, StringKey),
    {
        for (value, &key) in &self.index {
            func(value, key);
        }
    }

    /// Ensures every string of `other` is present in `self` and returns the
    /// mapping from `other`'s keys to the corresponding keys here, dense
    /// enough to relocate every record of `other`.
    pub fn merge_from(&mut self, other: &StringTable) -> StoreResult<KeyMap> {
        let mut mapping = KeyMap::with_capacity(other.index.len());
        for (value, &other_key) in &other.index {
            let own_key = match self.index.get(value.as_str()) {
                Some(&existing) => existing,
                None => self.insert_string(value)?,
            };
            mapping.insert(other_key, own_key);
        }
        Ok(mapping)
    }

    pub fn serialized_size(&self) -> u64 {
        OBJECT_HEADER_SIZE + self.store.serialized_size()
    }

    pub fn serialize(&self, insertor: &mut Insertor) -> StoreResult<()> {
        let header = ObjectHeader::new(SERIAL_TAG, self.store.serialized_size());
        insertor.put_header(&header)?;
        self.store.serialize(insertor)
    }

    pub fn deserialize(extractor: &mut Extractor) -> StoreResult<Self> {
        extractor.expect_header(SERIAL_TAG)?;
        let store = Store::deserialize(extractor)?;

        // rescan the live runs for NUL-separated strings
        let mut runs: Vec<(u32, Vec<u8>)> = Vec::new();
        store.for_each_allocated_run(|key, bytes| runs.push((key, bytes.to_vec())));

        let mut index = HashMap::new();
        for (run_key, bytes) in runs {
            let mut start = 0usize;
            for (position, &byte) in bytes.iter().enumerate() {
                if byte == 0 {
                    let value = std::str::from_utf8(&bytes[start..position]).map_err(|_| {
                        StoreError::DeserializationMismatch(
                            "interned string is not UTF-8".into(),
                        )
                    })?;
                    index.insert(value.to_owned(), run_key + start as u32);
                    start = position + 1;
                }
            }
            if start != bytes.len() {
                return Err(StoreError::DeserializationMismatch(
                    "interned string run is not NUL-terminated".into(),
                ));
            }
        }

        Ok(Self { store, index })
    }

    fn insert_string(&mut self, value: &str) -> StoreResult<StringKey> {
        // one extra byte for the NUL terminator
        let size = value.len() as u32 + 1;
        let key = self.store.allocate(size)?;

        let bytes = self.store.get_mut(key)?;
        bytes[..value.len()].copy_from_slice(value.as_bytes());
        bytes[value.len()] = 0;

        self.index.insert(value.to_owned(), key);
        Ok(key)
    }
}
