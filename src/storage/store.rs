//! Segmented slab allocator.
//!
//! A [`Store`] hands out contiguous runs of `T` identified by a 32-bit key
//! that packs `(segment_index << BITS) | offset_in_segment`. The store only
//! guarantees that live allocations do not overlap; it does not remember
//! allocation sizes, it only manages the free blocks between them. Callers
//! keep the size alongside the key, the way the record-span headers do.
//!
//! Free space is tracked in two mirrored views: a size-ordered index for
//! best-fit allocation and an address-ordered index for adjacency checks,
//! coalescing and serialization. Every mutation updates both.

use super::serialization::{
    key_map_serialized_size, Extractor, Insertor, ObjectHeader, OBJECT_HEADER_SIZE,
};
use super::{StoreError, StoreResult};

use std::collections::{BTreeMap, BTreeSet};

/// Fixed-width item that can live in a [`Store`].
///
/// The encoded form is what serialization writes, so it must be canonical:
/// two equal items encode to identical bytes.
pub trait Storable: Copy + Default {
    const ENCODED_SIZE: usize;

    fn encode(&self, out: &mut [u8]);
    fn decode(data: &[u8]) -> Self;
}

impl Storable for u8 {
    const ENCODED_SIZE: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = *self;
    }

    fn decode(data: &[u8]) -> Self {
        data[0]
    }
}

impl Storable for u32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(data: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&data[..4]);
        u32::from_le_bytes(raw)
    }
}

/// Segmented arena of `T` with best-fit allocation and coalescing free lists.
pub struct Store<T: Storable, const BITS: u32 = 24> {
    /// Segments of up to `1 << BITS` slots. Slots are materialized lazily up
    /// to the high-water mark of each segment; every allocated slot is
    /// materialized, so indexing an allocated run never goes out of bounds.
    segments: Vec<Vec<T>>,

    /// size -> keys of free blocks with that size
    free_by_size: BTreeMap<u32, BTreeSet<u32>>,

    /// key -> size of the free block starting there
    free_by_addr: BTreeMap<u32, u32>,
}

impl<T: Storable, const BITS: u32> Default for Store<T, BITS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Storable, const BITS: u32> Store<T, BITS> {
    pub const MAX_SEGMENT_SIZE: u32 = 1 << BITS;
    pub const MAX_SEGMENT_COUNT: u32 = 1 << (32 - BITS);
    pub const OFFSET_MASK: u32 = (1 << BITS) - 1;

    /// The low offsets are reserved so that key 0 is unambiguously invalid
    /// and off-by-one scans below a key cannot underflow.
    pub const FIRST_KEY: u32 = 4;
    pub const MAX_CONTIGUOUS_ALLOCATION: u32 = (1 << BITS) - Self::FIRST_KEY;

    const SERIAL_TAG: &'static str = "ftags::Store";

    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            free_by_size: BTreeMap::new(),
            free_by_addr: BTreeMap::new(),
        }
    }

    fn segment_index(key: u32) -> u32 {
        key >> BITS
    }

    fn offset_in_segment(key: u32) -> u32 {
        key & Self::OFFSET_MASK
    }

    fn make_key(segment_index: u32, offset_in_segment: u32) -> u32 {
        debug_assert!(segment_index < Self::MAX_SEGMENT_COUNT);
        debug_assert!(offset_in_segment < Self::MAX_SEGMENT_SIZE);
        (segment_index << BITS) | offset_in_segment
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Allocates `size` contiguous slots and returns the key of the first.
    ///
    /// Picks the smallest free block that fits and returns the leftover to
    /// the free list; appends a fresh segment when nothing fits.
    pub fn allocate(&mut self, size: u32) -> StoreResult<u32> {
        debug_assert!(size != 0, "zero-sized allocation");
        if size == 0 {
            return Err(StoreError::InvalidKey(0));
        }
        if size > Self::MAX_CONTIGUOUS_ALLOCATION {
            return Err(StoreError::CapacityExceeded(format!(
                "cannot allocate {} contiguous slots (limit {})",
                size,
                Self::MAX_CONTIGUOUS_ALLOCATION
            )));
        }

        loop {
            let best_fit = self
                .free_by_size
                .range(size..)
                .find_map(|(&block_size, keys)| {
                    keys.iter().next().map(|&key| (block_size, key))
                });

            match best_fit {
                Some((block_size, key)) => {
                    self.forget_free_block(key, block_size);
                    if block_size != size {
                        self.record_free_block(key + size, block_size - size);
                    }
                    self.materialize(
                        Self::segment_index(key),
                        Self::offset_in_segment(key) + size,
                    );
                    return Ok(key);
                }
                None => self.add_segment()?,
            }
        }
    }

    /// Projects a key onto the slots from its offset to the end of the
    /// materialized part of its segment. Key 0 is the empty sentinel.
    pub fn get(&self, key: u32) -> StoreResult<&[T]> {
        if key == 0 {
            return Ok(&[]);
        }

        let segment = self
            .segments
            .get(Self::segment_index(key) as usize)
            .ok_or(StoreError::InvalidKey(key))?;
        let offset = Self::offset_in_segment(key) as usize;
        if offset > segment.len() {
            return Err(StoreError::InvalidKey(key));
        }
        Ok(&segment[offset..])
    }

    pub fn get_mut(&mut self, key: u32) -> StoreResult<&mut [T]> {
        if key == 0 {
            return Ok(&mut []);
        }

        let segment = self
            .segments
            .get_mut(Self::segment_index(key) as usize)
            .ok_or(StoreError::InvalidKey(key))?;
        let offset = Self::offset_in_segment(key) as usize;
        if offset > segment.len() {
            return Err(StoreError::InvalidKey(key));
        }
        Ok(&mut segment[offset..])
    }

    /// Returns `size` slots starting at `key` to the free list, merging with
    /// the previous and following blocks when they are free and adjacent.
    pub fn deallocate(&mut self, key: u32, size: u32) -> StoreResult<()> {
        if key == 0 || size == 0 {
            return Err(StoreError::InvalidKey(key));
        }

        let segment_index = Self::segment_index(key);
        let offset = Self::offset_in_segment(key);
        debug_assert!((segment_index as usize) < self.segments.len());
        debug_assert!(offset + size <= Self::MAX_SEGMENT_SIZE);
        debug_assert!(
            self.free_by_addr.range(key..key + size).next().is_none(),
            "double free at {key:#010x}"
        );

        let mut merged_key = key;
        let mut merged_size = size;

        let previous = self
            .free_by_addr
            .range(..key)
            .next_back()
            .map(|(&prev_key, &prev_size)| (prev_key, prev_size));
        if let Some((prev_key, prev_size)) = previous {
            if Self::segment_index(prev_key) == segment_index
                && Self::offset_in_segment(prev_key) + prev_size == offset
            {
                self.forget_free_block(prev_key, prev_size);
                merged_key = prev_key;
                merged_size += prev_size;
            }
        }

        // a block starting right past the end of the segment cannot exist
        // (offsets below FIRST_KEY are never free-listed), so no segment
        // check is needed for the follower
        if let Some(&next_size) = self.free_by_addr.get(&(key + size)) {
            self.forget_free_block(key + size, next_size);
            merged_size += next_size;
        }

        self.record_free_block(merged_key, merged_size);
        Ok(())
    }

    /// Number of free slots immediately following the block of `size` slots
    /// at `key`, or 0 when the next slot is allocated.
    pub fn available_after(&self, key: u32, size: u32) -> u32 {
        if key == 0 {
            return 0;
        }
        self.free_by_addr.get(&(key + size)).copied().unwrap_or(0)
    }

    /// Grows the block at `key` from `old_size` to `new_size` slots without
    /// moving it. Fails with `NotExtendable` when the following slots are
    /// not free; the caller falls back to allocate-and-copy.
    pub fn extend(&mut self, key: u32, old_size: u32, new_size: u32) -> StoreResult<()> {
        if key == 0 {
            return Err(StoreError::InvalidKey(0));
        }
        debug_assert!(new_size > old_size, "extend must grow the block");
        if new_size <= old_size {
            return Err(StoreError::NotExtendable);
        }

        let candidate = key + old_size;
        let available = match self.free_by_addr.get(&candidate) {
            Some(&available) => available,
            None => return Err(StoreError::NotExtendable),
        };

        let increase = new_size - old_size;
        if available < increase {
            return Err(StoreError::NotExtendable);
        }

        self.forget_free_block(candidate, available);
        if available != increase {
            self.record_free_block(key + new_size, available - increase);
        }
        self.materialize(
            Self::segment_index(key),
            Self::offset_in_segment(key) + new_size,
        );
        Ok(())
    }

    /// Visits every maximal allocated run in segment order: the gaps between
    /// free blocks, from `FIRST_KEY` to the end of each segment. The run
    /// slices borrow from the store, so callers may collect references.
    pub fn for_each_allocated_run<'s, F>(&'s self, mut func: F)
    where
        F: FnMut(u32, &'s [T]),
    {
        for (index, segment) in self.segments.iter().enumerate() {
            let segment_index = index as u32;
            let base = Self::make_key(segment_index, 0);
            let mut cursor = Self::FIRST_KEY;

            for (&free_key, &free_size) in
                self.free_by_addr.range(base..=(base | Self::OFFSET_MASK))
            {
                let free_offset = Self::offset_in_segment(free_key);
                if free_offset > cursor {
                    func(
                        Self::make_key(segment_index, cursor),
                        &segment[cursor as usize..free_offset as usize],
                    );
                }
                cursor = free_offset + free_size;
            }

            if cursor < Self::MAX_SEGMENT_SIZE {
                func(
                    Self::make_key(segment_index, cursor),
                    &segment[cursor as usize..],
                );
            }
        }
    }

    pub fn count_used_slots(&self) -> usize {
        let mut count = 0usize;
        self.for_each_allocated_run(|_key, run| count += run.len());
        count
    }

    /// Checks that the two free-list views agree and that no two free blocks
    /// are address-adjacent in the same segment.
    pub fn validate_free_lists(&self) {
        let mirrored: usize = self.free_by_size.values().map(|keys| keys.len()).sum();
        assert_eq!(mirrored, self.free_by_addr.len());

        for (&key, &size) in &self.free_by_addr {
            let sizes = self.free_by_size.get(&size);
            assert!(sizes.is_some_and(|keys| keys.contains(&key)));
        }

        let mut previous: Option<(u32, u32)> = None;
        for (&key, &size) in &self.free_by_addr {
            if let Some((prev_key, prev_size)) = previous {
                if Self::segment_index(prev_key) == Self::segment_index(key) {
                    assert!(
                        Self::offset_in_segment(prev_key) + prev_size
                            < Self::offset_in_segment(key),
                        "adjacent free blocks not coalesced"
                    );
                }
            }
            previous = Some((key, size));
        }
    }

    pub fn serialized_size(&self) -> u64 {
        let mut total = OBJECT_HEADER_SIZE + 8 + 8;
        if !self.segments.is_empty() {
            let full_slots = (self.segments.len() as u64 - 1) * Self::MAX_SEGMENT_SIZE as u64;
            let slots = full_slots + self.used_in_last_segment() as u64;
            total += slots * T::ENCODED_SIZE as u64;
            total += key_map_serialized_size(&self.free_by_addr);
        }
        total
    }

    /// Writes every live slot plus the address-ordered free map. The
    /// size-ordered index is derived data and is rebuilt on load.
    pub fn serialize(&self, insertor: &mut Insertor) -> StoreResult<()> {
        let header = ObjectHeader::new(
            Self::SERIAL_TAG,
            self.serialized_size() - OBJECT_HEADER_SIZE,
        );
        insertor.put_header(&header)?;

        insertor.put_u64(self.segments.len() as u64)?;
        insertor.put_u64(self.used_in_last_segment() as u64)?;

        if self.segments.is_empty() {
            return Ok(());
        }

        let last = self.segments.len() - 1;
        for segment in &self.segments[..last] {
            write_items(insertor, segment, Self::MAX_SEGMENT_SIZE as usize)?;
        }
        write_items(
            insertor,
            &self.segments[last],
            self.used_in_last_segment() as usize,
        )?;

        insertor.put_key_map(&self.free_by_addr)
    }

    pub fn deserialize(extractor: &mut Extractor) -> StoreResult<Self> {
        extractor.expect_header(Self::SERIAL_TAG)?;

        let segment_count = extractor.get_u64()? as usize;
        let used_in_last = extractor.get_u64()?;

        let mut store = Self::new();

        if segment_count == 0 {
            if used_in_last != 0 {
                return Err(StoreError::DeserializationMismatch(
                    "empty store with a non-empty last segment".into(),
                ));
            }
            return Ok(store);
        }

        if segment_count > Self::MAX_SEGMENT_COUNT as usize
            || used_in_last > Self::MAX_SEGMENT_SIZE as u64
        {
            return Err(StoreError::DeserializationMismatch(format!(
                "store shape out of range: {segment_count} segments, {used_in_last} used"
            )));
        }

        for _ in 0..segment_count - 1 {
            store
                .segments
                .push(read_items(extractor, Self::MAX_SEGMENT_SIZE as usize)?);
        }
        store
            .segments
            .push(read_items(extractor, used_in_last as usize)?);

        let free_map = extractor.get_key_map()?;
        for (&key, &size) in &free_map {
            let in_range = Self::offset_in_segment(key) >= Self::FIRST_KEY
                && (Self::segment_index(key) as usize) < segment_count
                && size > 0
                && size <= Self::MAX_CONTIGUOUS_ALLOCATION
                && Self::offset_in_segment(key) + size <= Self::MAX_SEGMENT_SIZE;
            if !in_range {
                return Err(StoreError::DeserializationMismatch(format!(
                    "free block {key:#010x}+{size} out of range"
                )));
            }
        }

        for (&key, &size) in &free_map {
            store
                .free_by_size
                .entry(size)
                .or_default()
                .insert(key);
        }
        store.free_by_addr = free_map;

        Ok(store)
    }

    fn add_segment(&mut self) -> StoreResult<()> {
        let segments_in_use = self.segments.len() as u32;
        if segments_in_use >= Self::MAX_SEGMENT_COUNT {
            return Err(StoreError::CapacityExceeded(format!(
                "segment limit of {} reached",
                Self::MAX_SEGMENT_COUNT
            )));
        }

        self.segments.push(Vec::new());
        self.record_free_block(
            Self::make_key(segments_in_use, Self::FIRST_KEY),
            Self::MAX_CONTIGUOUS_ALLOCATION,
        );
        Ok(())
    }

    fn materialize(&mut self, segment_index: u32, length: u32) {
        let segment = &mut self.segments[segment_index as usize];
        if segment.len() < length as usize {
            segment.resize(length as usize, T::default());
        }
    }

    /// Slots used in the last segment: everything below the free block that
    /// reaches the segment end, or the whole segment if none does.
    fn used_in_last_segment(&self) -> u32 {
        if self.segments.is_empty() {
            return 0;
        }

        let last = self.segments.len() as u32 - 1;
        let base = Self::make_key(last, 0);
        if let Some((&key, &size)) = self
            .free_by_addr
            .range(base..=(base | Self::OFFSET_MASK))
            .next_back()
        {
            let offset = Self::offset_in_segment(key);
            if offset + size == Self::MAX_SEGMENT_SIZE {
                return offset;
            }
        }
        Self::MAX_SEGMENT_SIZE
    }

    fn record_free_block(&mut self, key: u32, size: u32) {
        debug_assert!(Self::offset_in_segment(key) >= Self::FIRST_KEY);
        debug_assert!(size <= Self::MAX_CONTIGUOUS_ALLOCATION);
        self.free_by_size.entry(size).or_default().insert(key);
        self.free_by_addr.insert(key, size);
    }

    fn forget_free_block(&mut self, key: u32, size: u32) {
        if let Some(keys) = self.free_by_size.get_mut(&size) {
            keys.remove(&key);
            if keys.is_empty() {
                self.free_by_size.remove(&size);
            }
        }
        self.free_by_addr.remove(&key);
    }
}

fn write_items<T: Storable>(
    insertor: &mut Insertor,
    items: &[T],
    count: usize,
) -> StoreResult<()> {
    let mut buffer = vec![0u8; count * T::ENCODED_SIZE];
    let live = items.len().min(count);
    for (index, item) in items[..live].iter().enumerate() {
        item.encode(&mut buffer[index * T::ENCODED_SIZE..(index + 1) * T::ENCODED_SIZE]);
    }
    let default_item = T::default();
    for index in live..count {
        default_item.encode(&mut buffer[index * T::ENCODED_SIZE..(index + 1) * T::ENCODED_SIZE]);
    }
    insertor.put_bytes(&buffer)
}

fn read_items<T: Storable>(extractor: &mut Extractor, count: usize) -> StoreResult<Vec<T>> {
    let mut buffer = vec![0u8; count * T::ENCODED_SIZE];
    extractor.get_bytes(&mut buffer)?;
    let mut items = Vec::with_capacity(count);
    for index in 0..count {
        items.push(T::decode(
            &buffer[index * T::ENCODED_SIZE..(index + 1) * T::ENCODED_SIZE],
        ));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::serialization::{BufferSink, BufferSource};
    use proptest::prelude::*;

    type SmallStore = Store<u8, 5>;

    fn fill(store: &mut SmallStore, key: u32, size: u32, value: u8) {
        let slots = store.get_mut(key).unwrap();
        for slot in &mut slots[..size as usize] {
            *slot = value;
        }
    }

    #[test]
    fn first_allocation_starts_at_reserved_offset() {
        let mut store = SmallStore::new();
        let key = store.allocate(8).unwrap();
        assert_eq!(key, 4);
        assert!(store.get(key).unwrap().len() >= 8);
    }

    #[test]
    fn key_zero_is_the_empty_sentinel() {
        let store = SmallStore::new();
        assert!(store.get(0).unwrap().is_empty());
    }

    #[test]
    fn best_fit_reuses_freed_block() {
        // segment-bits = 5 leaves 28 user slots per segment
        let mut store = SmallStore::new();

        assert_eq!(store.allocate(8).unwrap(), 4);
        assert_eq!(store.allocate(16).unwrap(), 12);
        assert_eq!(store.allocate(4).unwrap(), 28);

        store.deallocate(12, 16).unwrap();

        assert_eq!(store.allocate(4).unwrap(), 12);
        assert_eq!(store.allocate(8).unwrap(), 16);
        store.validate_free_lists();
    }

    #[test]
    fn allocation_spills_into_new_segment() {
        let mut store = SmallStore::new();
        assert_eq!(store.allocate(28).unwrap(), 4);
        // second segment starts at (1 << 5) | 4
        assert_eq!(store.allocate(10).unwrap(), 36);
        assert_eq!(store.segment_count(), 2);
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let mut store = SmallStore::new();
        assert!(matches!(
            store.allocate(29),
            Err(StoreError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn deallocate_coalesces_with_both_neighbors() {
        let mut store = SmallStore::new();
        let a = store.allocate(4).unwrap();
        let b = store.allocate(4).unwrap();
        let c = store.allocate(4).unwrap();
        let _guard = store.allocate(4).unwrap();

        store.deallocate(a, 4).unwrap();
        store.deallocate(c, 4).unwrap();
        store.deallocate(b, 4).unwrap();
        store.validate_free_lists();

        // the three blocks merged into one; a fresh 12-slot run fits there
        assert_eq!(store.allocate(12).unwrap(), a);
    }

    #[test]
    fn available_after_sees_the_following_free_block() {
        let mut store = SmallStore::new();
        let a = store.allocate(8).unwrap();
        let b = store.allocate(8).unwrap();
        let _tail = store.allocate(12).unwrap();

        assert_eq!(store.available_after(a, 8), 0);
        store.deallocate(b, 8).unwrap();
        assert_eq!(store.available_after(a, 8), 8);
    }

    #[test]
    fn extend_consumes_following_free_space() {
        let mut store = SmallStore::new();
        let a = store.allocate(8).unwrap();
        let b = store.allocate(8).unwrap();
        let tail = store.allocate(12).unwrap();

        store.deallocate(b, 8).unwrap();
        store.extend(a, 8, 12).unwrap();
        store.validate_free_lists();

        // the leftover shrank to 4 slots right after the extended block
        assert_eq!(store.available_after(a, 12), 4);
        assert!(matches!(
            store.extend(tail, 12, 16),
            Err(StoreError::NotExtendable)
        ));
    }

    #[test]
    fn extend_without_free_neighbor_fails() {
        let mut store = SmallStore::new();
        let a = store.allocate(8).unwrap();
        let _b = store.allocate(8).unwrap();
        assert!(matches!(
            store.extend(a, 8, 10),
            Err(StoreError::NotExtendable)
        ));
    }

    #[test]
    fn allocated_runs_cover_live_blocks_only() {
        let mut store = SmallStore::new();
        let a = store.allocate(6).unwrap();
        let b = store.allocate(6).unwrap();
        let c = store.allocate(6).unwrap();
        fill(&mut store, a, 6, 1);
        fill(&mut store, b, 6, 2);
        fill(&mut store, c, 6, 3);

        store.deallocate(b, 6).unwrap();

        let mut runs = Vec::new();
        store.for_each_allocated_run(|key, items| runs.push((key, items.to_vec())));

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], (a, vec![1; 6]));
        assert_eq!(runs[1].0, c);
        assert_eq!(&runs[1].1[..6], &[3; 6]);
        assert_eq!(store.count_used_slots(), runs[0].1.len() + runs[1].1.len());
    }

    #[test]
    fn serialization_round_trips_contents_and_free_lists() {
        let mut store = SmallStore::new();
        let a = store.allocate(6).unwrap();
        let b = store.allocate(10).unwrap();
        let c = store.allocate(28).unwrap();
        fill(&mut store, a, 6, 0xaa);
        fill(&mut store, b, 10, 0xbb);
        fill(&mut store, c, 28, 0xcc);
        store.deallocate(b, 10).unwrap();

        let mut sink = BufferSink::with_expected_size(store.serialized_size());
        store.serialize(&mut Insertor::new(&mut sink)).unwrap();
        let bytes = sink.into_bytes();

        let mut source = BufferSource::new(&bytes);
        let restored = SmallStore::deserialize(&mut Extractor::new(&mut source)).unwrap();
        source.assert_drained();
        restored.validate_free_lists();

        assert_eq!(&restored.get(a).unwrap()[..6], &[0xaa; 6]);
        assert_eq!(&restored.get(c).unwrap()[..28], &[0xcc; 28]);
        assert_eq!(restored.count_used_slots(), store.count_used_slots());

        // the freed hole is found again by a best-fit allocation
        let mut restored = restored;
        assert_eq!(restored.allocate(10).unwrap(), b);
    }

    #[test]
    fn every_segment_in_the_key_space_is_usable() {
        // segment-bits = 30 leaves 2 index bits: exactly 4 segments
        let mut store: Store<u8, 30> = Store::new();
        for _ in 0..4 {
            store.add_segment().unwrap();
        }
        assert_eq!(store.segment_count(), 4);

        // only the segment past the key space is refused
        assert!(matches!(
            store.add_segment(),
            Err(StoreError::CapacityExceeded(_))
        ));
        assert_eq!(store.segment_count(), 4);
    }

    #[test]
    fn deserialize_rejects_an_impossible_segment_count() {
        let mut sink = BufferSink::new();
        {
            let mut insertor = Insertor::new(&mut sink);
            insertor
                .put_header(&ObjectHeader::new("ftags::Store", 16))
                .unwrap();
            // one segment past the 4 the key space can address
            insertor.put_u64(5).unwrap();
            insertor.put_u64(0).unwrap();
        }
        let bytes = sink.into_bytes();

        let mut source = BufferSource::new(&bytes);
        let result: StoreResult<Store<u8, 30>> =
            Store::deserialize(&mut Extractor::new(&mut source));
        assert!(matches!(
            result,
            Err(StoreError::DeserializationMismatch(_))
        ));
    }

    #[test]
    fn empty_store_round_trips() {
        let store = SmallStore::new();
        let mut sink = BufferSink::with_expected_size(store.serialized_size());
        store.serialize(&mut Insertor::new(&mut sink)).unwrap();
        let bytes = sink.into_bytes();

        let mut source = BufferSource::new(&bytes);
        let restored = SmallStore::deserialize(&mut Extractor::new(&mut source)).unwrap();
        assert_eq!(restored.segment_count(), 0);
        assert_eq!(restored.count_used_slots(), 0);
    }

    proptest! {
        #[test]
        fn free_lists_stay_consistent(sizes in prop::collection::vec(1u32..12, 1..24),
                                      drops in prop::collection::vec(any::<prop::sample::Index>(), 0..12)) {
            let mut store: Store<u8, 8> = Store::new();
            let mut live: Vec<(u32, u32)> = Vec::new();

            for size in sizes {
                let key = store.allocate(size).unwrap();
                for slot in &mut store.get_mut(key).unwrap()[..size as usize] {
                    *slot = (key & 0xff) as u8;
                }
                live.push((key, size));
            }

            for index in drops {
                if live.is_empty() {
                    break;
                }
                let (key, size) = live.remove(index.index(live.len()));
                store.deallocate(key, size).unwrap();
                store.validate_free_lists();
            }

            let mut sink = BufferSink::with_expected_size(store.serialized_size());
            store.serialize(&mut Insertor::new(&mut sink)).unwrap();
            let bytes = sink.into_bytes();

            let mut source = BufferSource::new(&bytes);
            let restored: Store<u8, 8> =
                Store::deserialize(&mut Extractor::new(&mut source)).unwrap();
            source.assert_drained();
            restored.validate_free_lists();

            // every key issued before serialization still resolves to the
            // same bytes afterwards
            for &(key, size) in &live {
                let before = &store.get(key).unwrap()[..size as usize];
                let after = &restored.get(key).unwrap()[..size as usize];
                prop_assert_eq!(before, after);
            }
            prop_assert_eq!(store.count_used_slots(), restored.count_used_slots());
        }
    }
}
