//! Self-contained projection of a query result.
//!
//! A cursor set copies the selected records and just the symbol and
//! file-name strings they reference into private tables, rewriting the
//! keys. The result serializes and ships over the wire without the project
//! it came from.

use crate::storage::serialization::{
    BufferSink, BufferSource, Extractor, Insertor, ObjectHeader, OBJECT_HEADER_SIZE,
};
use crate::storage::store::Storable;
use crate::storage::string_table::StringTable;
use crate::storage::{StoreError, StoreResult};

use super::record::{Cursor, CursorLocation, Record};

const SERIAL_TAG: &str = "ftags::Cursors";

#[derive(Default)]
pub struct CursorSet {
    records: Vec<Record>,
    symbol_table: StringTable,
    file_name_table: StringTable,
}

impl CursorSet {
    /// Copies `records`, re-interning each symbol name and file name into
    /// the set's private tables. Namespace keys do not travel; they are
    /// zeroed in the copies.
    pub fn from_records(
        records: &[&Record],
        symbol_table: &StringTable,
        file_name_table: &StringTable,
    ) -> StoreResult<Self> {
        let mut set = Self::default();
        set.records.reserve(records.len());

        for &record in records {
            let mut copy = *record;

            let symbol = symbol_table
                .get_string(record.symbol_name_key)
                .ok_or(StoreError::InvalidKey(record.symbol_name_key))?;
            copy.symbol_name_key = set.symbol_table.add_key(symbol)?;
            copy.namespace_key = 0;

            let file_name = file_name_table
                .get_string(record.location.file_name_key)
                .ok_or(StoreError::InvalidKey(record.location.file_name_key))?;
            copy.location.file_name_key = set.file_name_table.add_key(file_name)?;

            if record.definition.file_name_key != 0 {
                let definition_file = file_name_table
                    .get_string(record.definition.file_name_key)
                    .ok_or(StoreError::InvalidKey(record.definition.file_name_key))?;
                copy.definition.file_name_key = set.file_name_table.add_key(definition_file)?;
            }

            set.records.push(copy);
        }

        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Turns one stored record back into a display cursor.
    pub fn inflate_record(&self, record: &Record) -> Option<Cursor> {
        let symbol_name = self.symbol_table.get_string(record.symbol_name_key)?;
        let file_name = self
            .file_name_table
            .get_string(record.location.file_name_key)?;

        let definition = if record.definition.file_name_key != 0 {
            Some(CursorLocation {
                file_name: self
                    .file_name_table
                    .get_string(record.definition.file_name_key)?
                    .to_string(),
                line: record.definition.line(),
                column: record.definition.column(),
            })
        } else {
            None
        };

        Some(Cursor {
            symbol_name: symbol_name.to_string(),
            symbol_namespace: None,
            symbol_type: record.attributes.symbol_type(),
            location: CursorLocation {
                file_name: file_name.to_string(),
                line: record.location.line(),
                column: record.location.column(),
            },
            definition,
        })
    }

    pub fn serialized_size(&self) -> u64 {
        OBJECT_HEADER_SIZE
            + 8
            + self.records.len() as u64 * Record::ENCODED_SIZE as u64
            + self.symbol_table.serialized_size()
            + self.file_name_table.serialized_size()
    }

    pub fn serialize(&self, insertor: &mut Insertor) -> StoreResult<()> {
        let header = ObjectHeader::new(SERIAL_TAG, self.serialized_size() - OBJECT_HEADER_SIZE);
        insertor.put_header(&header)?;

        insertor.put_u64(self.records.len() as u64)?;
        let mut encoded = [0u8; Record::ENCODED_SIZE];
        for record in &self.records {
            record.encode(&mut encoded);
            insertor.put_bytes(&encoded)?;
        }

        self.symbol_table.serialize(insertor)?;
        self.file_name_table.serialize(insertor)
    }

    pub fn deserialize(extractor: &mut Extractor) -> StoreResult<Self> {
        extractor.expect_header(SERIAL_TAG)?;

        let record_count = extractor.get_u64()?;
        let mut records = Vec::with_capacity(record_count as usize);
        let mut encoded = [0u8; Record::ENCODED_SIZE];
        for _ in 0..record_count {
            extractor.get_bytes(&mut encoded)?;
            records.push(Record::decode(&encoded));
        }

        let symbol_table = StringTable::deserialize(extractor)?;
        let file_name_table = StringTable::deserialize(extractor)?;

        Ok(Self {
            records,
            symbol_table,
            file_name_table,
        })
    }

    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        let mut sink = BufferSink::with_expected_size(self.serialized_size());
        self.serialize(&mut Insertor::new(&mut sink))?;
        Ok(sink.into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let mut source = BufferSource::new(bytes);
        let set = Self::deserialize(&mut Extractor::new(&mut source))?;
        source.assert_drained();
        Ok(set)
    }
}
