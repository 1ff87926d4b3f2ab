//! A record span is a contiguous run of records from the same source file.
//!
//! An include file that includes nothing else contributes one span to every
//! translation unit that pulls it in; a file with an include in the middle
//! contributes at least three. Spans are the unit of deduplication: the
//! manager shares identical spans across translation units by reference
//! count, so a header parsed ten thousand times is stored once.

use crate::storage::store::Storable;
use crate::storage::string_table::StringKey;

use super::record::Record;

pub type SpanKey = u32;

/// Seed for the span content hash.
const HASH_SEED: u64 = 0x0acc_edd6_2cf0_b9bf;
const HASH_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Span header: fixed-size bookkeeping for one record run. The records and
/// the symbol-order permutation live in their own slabs; the header only
/// holds their keys, which keeps it small and lets the permutation be
/// rebuilt without touching the persistent layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordSpan {
    record_key: u32,
    size: u32,
    reference_count: u32,
    hash: u64,
    symbol_order_key: u32,
}

impl RecordSpan {
    pub fn new(record_key: u32, size: u32, hash: u64, symbol_order_key: u32) -> Self {
        Self {
            record_key,
            size,
            reference_count: 0,
            hash,
            symbol_order_key,
        }
    }

    pub fn record_key(&self) -> u32 {
        self.record_key
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn symbol_order_key(&self) -> u32 {
        self.symbol_order_key
    }

    pub fn set_symbol_order_key(&mut self, key: u32) {
        self.symbol_order_key = key;
    }

    pub fn add_ref(&mut self) {
        self.reference_count += 1;
    }

    /// Drops one reference and returns the remaining count.
    pub fn release(&mut self) -> u32 {
        debug_assert!(self.reference_count > 0, "release of a dead span");
        self.reference_count = self.reference_count.saturating_sub(1);
        self.reference_count
    }

    /// A live span holds at least one reference; a zeroed header is a dead
    /// slot inside the span slab.
    pub fn is_live(&self) -> bool {
        self.record_key != 0 && self.reference_count > 0
    }

    /// Seeded FNV-1a over the canonical record encodings.
    pub fn compute_hash(records: &[Record]) -> u64 {
        let mut hash = HASH_SEED;
        let mut encoded = [0u8; Record::ENCODED_SIZE];
        for record in records {
            record.encode(&mut encoded);
            for &byte in &encoded {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(HASH_PRIME);
            }
        }
        hash
    }

    /// Permutation of `0..len` ordering the records by ascending symbol
    /// key, then symbol type; ties keep insertion order.
    pub fn build_symbol_order(records: &[Record]) -> Vec<u32> {
        let mut order: Vec<u32> = (0..records.len() as u32).collect();
        order.sort_by_key(|&position| {
            let record = &records[position as usize];
            (record.symbol_name_key, record.attributes.type_raw())
        });
        order
    }

    /// Positions (into the record run) of the records with `symbol_key`,
    /// found by binary search over the symbol-order permutation.
    pub fn symbol_positions<'a>(
        records: &[Record],
        order: &'a [u32],
        symbol_key: StringKey,
    ) -> &'a [u32] {
        let lower = order
            .partition_point(|&position| records[position as usize].symbol_name_key < symbol_key);
        let upper = order
            .partition_point(|&position| records[position as usize].symbol_name_key <= symbol_key);
        &order[lower..upper]
    }

    /// Common file of the span; every member record shares it.
    pub fn file_key_of(records: &[Record]) -> StringKey {
        debug_assert!(records
            .windows(2)
            .all(|pair| pair[0].location.file_name_key == pair[1].location.file_name_key));
        records
            .first()
            .map(|record| record.location.file_name_key)
            .unwrap_or(0)
    }
}

impl Storable for RecordSpan {
    const ENCODED_SIZE: usize = 24;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.record_key.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.reference_count.to_le_bytes());
        out[12..20].copy_from_slice(&self.hash.to_le_bytes());
        out[20..24].copy_from_slice(&self.symbol_order_key.to_le_bytes());
    }

    fn decode(data: &[u8]) -> Self {
        let u32_at = |offset: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[offset..offset + 4]);
            u32::from_le_bytes(raw)
        };
        let mut hash_raw = [0u8; 8];
        hash_raw.copy_from_slice(&data[12..20]);

        Self {
            record_key: u32_at(0),
            size: u32_at(4),
            reference_count: u32_at(8),
            hash: u64::from_le_bytes(hash_raw),
            symbol_order_key: u32_at(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record::{Attributes, Location, SymbolType};

    fn record(symbol: StringKey, file: StringKey, line: u32, symbol_type: SymbolType) -> Record {
        Record {
            symbol_name_key: symbol,
            namespace_key: 0,
            location: Location::new(file, line, 1),
            definition: Location::default(),
            attributes: Attributes::new(symbol_type),
        }
    }

    #[test]
    fn hash_depends_on_content() {
        let records_a = vec![record(1, 9, 10, SymbolType::FunctionDeclaration)];
        let records_b = vec![record(1, 9, 10, SymbolType::FunctionDeclaration)];
        let records_c = vec![record(2, 9, 10, SymbolType::FunctionDeclaration)];

        assert_eq!(
            RecordSpan::compute_hash(&records_a),
            RecordSpan::compute_hash(&records_b)
        );
        assert_ne!(
            RecordSpan::compute_hash(&records_a),
            RecordSpan::compute_hash(&records_c)
        );
    }

    #[test]
    fn symbol_order_sorts_by_key_then_type() {
        let records = vec![
            record(30, 9, 1, SymbolType::VariableReference),
            record(10, 9, 2, SymbolType::FunctionDeclaration),
            record(30, 9, 3, SymbolType::FunctionCallExpression),
            record(10, 9, 4, SymbolType::FunctionDeclaration),
        ];

        let order = RecordSpan::build_symbol_order(&records);
        let symbols: Vec<u32> = order
            .iter()
            .map(|&position| records[position as usize].symbol_name_key)
            .collect();
        assert_eq!(symbols, vec![10, 10, 30, 30]);

        // equal (symbol, type) pairs keep insertion order
        assert_eq!(&order[..2], &[1, 3]);
        // FunctionCallExpression (103) sorts after VariableReference (50)
        assert_eq!(&order[2..], &[0, 2]);
    }

    #[test]
    fn symbol_positions_finds_the_contiguous_range() {
        let records = vec![
            record(5, 9, 1, SymbolType::FunctionDeclaration),
            record(7, 9, 2, SymbolType::VariableDeclaration),
            record(5, 9, 3, SymbolType::FunctionCallExpression),
            record(9, 9, 4, SymbolType::ClassDeclaration),
        ];
        let order = RecordSpan::build_symbol_order(&records);

        let positions = RecordSpan::symbol_positions(&records, &order, 5);
        let mut lines: Vec<u32> = positions
            .iter()
            .map(|&position| records[position as usize].location.line())
            .collect();
        lines.sort_unstable();
        assert_eq!(lines, vec![1, 3]);

        assert!(RecordSpan::symbol_positions(&records, &order, 6).is_empty());
    }

    #[test]
    fn header_encoding_round_trips() {
        let mut span = RecordSpan::new(0x0123_4567, 42, 0xfeed_beef_dead_cafe, 0x89ab);
        span.add_ref();
        span.add_ref();

        let mut encoded = [0u8; RecordSpan::ENCODED_SIZE];
        span.encode(&mut encoded);
        let decoded = RecordSpan::decode(&encoded);

        assert_eq!(decoded, span);
        assert_eq!(decoded.reference_count(), 2);
    }

    #[test]
    fn release_counts_down_to_zero() {
        let mut span = RecordSpan::new(4, 1, 0, 4);
        span.add_ref();
        span.add_ref();
        assert_eq!(span.release(), 1);
        assert_eq!(span.release(), 0);
        assert!(!span.is_live());
    }
}
