//! Deduplicating owner of all record storage in a project.
//!
//! Spans are content-addressed: inserting a run of records whose bytes
//! already exist bumps the reference count of the existing span instead of
//! storing a second copy. Two multimap indices route queries: symbol key to
//! the spans mentioning it, and file key to the spans of that file.

use crate::storage::index_map::IndexMap;
use crate::storage::serialization::{Extractor, Insertor, ObjectHeader, OBJECT_HEADER_SIZE};
use crate::storage::store::Store;
use crate::storage::string_table::StringKey;
use crate::storage::{StoreError, StoreResult};

use super::record::Record;
use super::record_span::{RecordSpan, SpanKey};

use std::collections::{BTreeSet, HashMap};

const SERIAL_TAG: &str = "ftags::SpanMgr";

/// Spans of up to 2^24 - 4 records; see the size limit on allocation.
type SpanStore = Store<RecordSpan, 20>;
type RecordStore = Store<Record, 24>;
type SymbolOrderStore = Store<u32, 24>;

#[derive(Default)]
pub struct RecordSpanManager {
    // persistent
    span_store: SpanStore,
    record_store: RecordStore,

    // transient, rebuilt on load
    symbol_order_store: SymbolOrderStore,
    dedup_cache: HashMap<u64, Vec<SpanKey>>,
    symbol_index: IndexMap,
    file_index: IndexMap,
}

impl RecordSpanManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a run of records, all from the same file.
    ///
    /// When a span with the same content hash and identical records exists,
    /// its reference count is bumped and its key returned. Otherwise the
    /// records are copied into the record slab, a symbol-order permutation
    /// is built, and the new span is registered in the dedup cache and both
    /// query indices.
    pub fn add_span(&mut self, records: &[Record]) -> StoreResult<SpanKey> {
        debug_assert!(!records.is_empty(), "a span holds at least one record");
        if records.is_empty() {
            return Err(StoreError::InvalidKey(0));
        }

        let hash = RecordSpan::compute_hash(records);

        let candidates: Vec<SpanKey> = self
            .dedup_cache
            .get(&hash)
            .cloned()
            .unwrap_or_default();
        for candidate in candidates {
            let span = self.get_span(candidate)?;
            if span.len() as usize == records.len() && self.span_records(&span)? == records {
                self.span_store.get_mut(candidate)?[0].add_ref();
                return Ok(candidate);
            }
        }

        let size = records.len() as u32;

        let record_key = self.record_store.allocate(size)?;
        self.record_store.get_mut(record_key)?[..records.len()].copy_from_slice(records);

        let order = RecordSpan::build_symbol_order(records);
        let order_key = self.symbol_order_store.allocate(size)?;
        self.symbol_order_store.get_mut(order_key)?[..order.len()].copy_from_slice(&order);

        let mut span = RecordSpan::new(record_key, size, hash, order_key);
        span.add_ref();

        let span_key = self.span_store.allocate(1)?;
        self.span_store.get_mut(span_key)?[0] = span;

        self.dedup_cache.entry(hash).or_default().push(span_key);
        self.index_span(span_key, records)?;

        Ok(span_key)
    }

    /// Drops one reference; at zero the span leaves every index and its
    /// record and permutation runs return to their slabs.
    pub fn release_span(&mut self, span_key: SpanKey) -> StoreResult<()> {
        let span = self.get_span(span_key)?;
        if !span.is_live() {
            return Err(StoreError::InvalidKey(span_key));
        }

        let remaining = self.span_store.get_mut(span_key)?[0].release();
        if remaining > 0 {
            return Ok(());
        }

        let records: Vec<Record> = self.span_records(&span)?.to_vec();

        if let Some(candidates) = self.dedup_cache.get_mut(&span.hash()) {
            candidates.retain(|&key| key != span_key);
            if candidates.is_empty() {
                self.dedup_cache.remove(&span.hash());
            }
        }

        let mut symbols = BTreeSet::new();
        for record in &records {
            symbols.insert(record.symbol_name_key);
        }
        for symbol_key in symbols {
            self.symbol_index.remove_value(symbol_key, span_key)?;
            if self.symbol_index.values(symbol_key)?.is_empty() {
                self.symbol_index.remove_key(symbol_key)?;
            }
        }

        let file_key = RecordSpan::file_key_of(&records);
        self.file_index.remove_value(file_key, span_key)?;
        if self.file_index.values(file_key)?.is_empty() {
            self.file_index.remove_key(file_key)?;
        }

        // zero the slots so stale records cannot shadow live ones
        for slot in &mut self.record_store.get_mut(span.record_key())?[..span.len() as usize] {
            *slot = Record::default();
        }
        self.record_store.deallocate(span.record_key(), span.len())?;
        self.symbol_order_store
            .deallocate(span.symbol_order_key(), span.len())?;

        self.span_store.get_mut(span_key)?[0] = RecordSpan::default();
        self.span_store.deallocate(span_key, 1)
    }

    pub fn get_span(&self, span_key: SpanKey) -> StoreResult<RecordSpan> {
        let slots = self.span_store.get(span_key)?;
        match slots.first() {
            Some(span) if span.record_key() != 0 => Ok(*span),
            _ => Err(StoreError::InvalidKey(span_key)),
        }
    }

    /// The record run of a span.
    pub fn span_records(&self, span: &RecordSpan) -> StoreResult<&[Record]> {
        let records = self.record_store.get(span.record_key())?;
        Ok(&records[..span.len() as usize])
    }

    fn symbol_order(&self, span: &RecordSpan) -> StoreResult<&[u32]> {
        let order = self.symbol_order_store.get(span.symbol_order_key())?;
        Ok(&order[..span.len() as usize])
    }

    /// Records with `symbol_key` passing `predicate`, gathered through the
    /// symbol index and each span's symbol-order binary search.
    pub fn filter_records_with_symbol<F>(
        &self,
        symbol_key: StringKey,
        mut predicate: F,
    ) -> StoreResult<Vec<&Record>>
    where
        F: FnMut(&Record) -> bool,
    {
        let mut results = Vec::new();
        if symbol_key == 0 {
            return Ok(results);
        }

        for &span_key in self.symbol_index.values(symbol_key)? {
            let span = self.get_span(span_key)?;
            let records = self.span_records(&span)?;
            let order = self.symbol_order(&span)?;
            for &position in RecordSpan::symbol_positions(records, order, symbol_key) {
                let record = &records[position as usize];
                if predicate(record) {
                    results.push(record);
                }
            }
        }

        Ok(results)
    }

    /// Records located in the file `file_key`, filtered by `predicate`.
    pub fn filter_records_from_file<F>(
        &self,
        file_key: StringKey,
        mut predicate: F,
    ) -> StoreResult<Vec<&Record>>
    where
        F: FnMut(&Record) -> bool,
    {
        let mut results = Vec::new();
        if file_key == 0 {
            return Ok(results);
        }

        for &span_key in self.file_index.values(file_key)? {
            let span = self.get_span(span_key)?;
            for record in self.span_records(&span)? {
                if predicate(record) {
                    results.push(record);
                }
            }
        }

        Ok(results)
    }

    /// Records closest to `(line, column)` in `file_key`: on the same line
    /// at or before the column, or failing that on the nearest preceding
    /// line. Multiple records at the winning location (a declaration and a
    /// definition at the same point) are all returned.
    pub fn find_closest_record(
        &self,
        file_key: StringKey,
        line: u32,
        column: u32,
    ) -> StoreResult<Vec<&Record>> {
        let mut best: Option<(u32, u32)> = None;
        let mut matches: Vec<&Record> = Vec::new();

        if file_key == 0 {
            return Ok(matches);
        }

        for &span_key in self.file_index.values(file_key)? {
            let span = self.get_span(span_key)?;
            for record in self.span_records(&span)? {
                let record_line = record.location.line();
                let record_column = record.location.column();

                let candidate =
                    record_line < line || (record_line == line && record_column <= column);
                if !candidate {
                    continue;
                }

                let position = (record_line, record_column);
                match best {
                    Some(current) if position < current => {}
                    Some(current) if position == current => matches.push(record),
                    _ => {
                        best = Some(position);
                        matches.clear();
                        matches.push(record);
                    }
                }
            }
        }

        Ok(matches)
    }

    /// Visits every live record in storage order. Slots freed by span
    /// release are zeroed and skipped.
    pub fn for_each_record<'s, F>(&'s self, mut func: F)
    where
        F: FnMut(&'s Record),
    {
        self.record_store.for_each_allocated_run(|_key, records| {
            for record in records {
                if record.symbol_name_key != 0 {
                    func(record);
                }
            }
        });
    }

    pub fn record_count(&self) -> usize {
        self.record_store.count_used_slots()
    }

    pub fn span_count(&self) -> usize {
        self.span_store.count_used_slots()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbol_index.key_count()
    }

    pub fn indexed_file_count(&self) -> usize {
        self.file_index.key_count()
    }

    /// Human-readable span statistics for the statistics command.
    pub fn statistics_remarks(&self) -> Vec<String> {
        let span_count = self.span_count();
        let mut shared_spans = 0usize;
        let mut total_references = 0u64;
        self.for_each_span(|_key, span| {
            total_references += span.reference_count() as u64;
            if span.reference_count() > 1 {
                shared_spans += 1;
            }
        });

        vec![
            format!("Indexed {} record spans", span_count),
            format!("Indexed {} records", self.record_count()),
            format!("Indexed {} distinct symbols", self.symbol_count()),
            format!(
                "{} spans are shared between translation units ({} references total)",
                shared_spans, total_references
            ),
        ]
    }

    /// Reference-count distribution of the live spans.
    pub fn analyze_spans(&self) -> Vec<String> {
        let mut distribution: std::collections::BTreeMap<u32, usize> =
            std::collections::BTreeMap::new();
        self.for_each_span(|_key, span| {
            *distribution.entry(span.reference_count()).or_default() += 1;
        });

        let mut remarks = vec!["Record span sharing:".to_string()];
        for (references, count) in distribution {
            remarks.push(format!(
                "  {:>8} spans held by {} translation units",
                count, references
            ));
        }
        remarks
    }

    fn for_each_span<F>(&self, mut func: F)
    where
        F: FnMut(SpanKey, &RecordSpan),
    {
        self.span_store.for_each_allocated_run(|run_key, spans| {
            for (offset, span) in spans.iter().enumerate() {
                if span.is_live() {
                    func(run_key + offset as u32, span);
                }
            }
        });
    }

    pub fn serialized_size(&self) -> u64 {
        OBJECT_HEADER_SIZE + self.span_store.serialized_size() + self.record_store.serialized_size()
    }

    /// Writes the span and record slabs. The dedup cache, the query indices
    /// and the symbol-order permutations are all derived from the slabs and
    /// are rebuilt on load.
    pub fn serialize(&self, insertor: &mut Insertor) -> StoreResult<()> {
        let header = ObjectHeader::new(SERIAL_TAG, self.serialized_size() - OBJECT_HEADER_SIZE);
        insertor.put_header(&header)?;
        self.span_store.serialize(insertor)?;
        self.record_store.serialize(insertor)
    }

    pub fn deserialize(extractor: &mut Extractor) -> StoreResult<Self> {
        extractor.expect_header(SERIAL_TAG)?;

        let mut manager = Self {
            span_store: Store::deserialize(extractor)?,
            record_store: Store::deserialize(extractor)?,
            ..Self::default()
        };

        let mut live_spans: Vec<(SpanKey, RecordSpan)> = Vec::new();
        manager.span_store.for_each_allocated_run(|run_key, spans| {
            for (offset, span) in spans.iter().enumerate() {
                if span.is_live() {
                    live_spans.push((run_key + offset as u32, *span));
                }
            }
        });

        for (span_key, span) in live_spans {
            let records: Vec<Record> = manager.span_records(&span)?.to_vec();

            if RecordSpan::compute_hash(&records) != span.hash() {
                return Err(StoreError::DeserializationMismatch(format!(
                    "span {span_key:#010x} content does not match its stored hash"
                )));
            }

            // the persisted permutation key is stale; re-sort into a fresh slab
            let order = RecordSpan::build_symbol_order(&records);
            let order_key = manager.symbol_order_store.allocate(span.len())?;
            manager.symbol_order_store.get_mut(order_key)?[..order.len()]
                .copy_from_slice(&order);
            manager.span_store.get_mut(span_key)?[0].set_symbol_order_key(order_key);

            manager
                .dedup_cache
                .entry(span.hash())
                .or_default()
                .push(span_key);
            manager.index_span(span_key, &records)?;
        }

        Ok(manager)
    }

    fn index_span(&mut self, span_key: SpanKey, records: &[Record]) -> StoreResult<()> {
        let mut symbols = BTreeSet::new();
        for record in records {
            symbols.insert(record.symbol_name_key);
        }
        for symbol_key in symbols {
            self.symbol_index.add(symbol_key, span_key)?;
        }

        self.file_index
            .add(RecordSpan::file_key_of(records), span_key)
    }
}
