//! One parsed translation unit: the ordered list of record spans produced
//! by splitting its cursor stream on file-name changes.

use crate::storage::serialization::{Extractor, Insertor};
use crate::storage::string_table::{StringKey, StringTable};
use crate::storage::{KeyMap, StoreError, StoreResult};

use super::record::{Attributes, Cursor, Location, Record};
use super::record_span::SpanKey;
use super::span_manager::RecordSpanManager;

/// Ordered span keys forming the cursor sequence of one parsed TU, plus the
/// key of its main file. Iterating the spans yields exactly the original
/// record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationUnit {
    file_name_key: StringKey,
    span_keys: Vec<SpanKey>,
}

impl TranslationUnit {
    pub fn new(file_name_key: StringKey) -> Self {
        Self {
            file_name_key,
            span_keys: Vec::new(),
        }
    }

    pub fn file_name_key(&self) -> StringKey {
        self.file_name_key
    }

    pub fn span_keys(&self) -> &[SpanKey] {
        &self.span_keys
    }

    pub fn record_count(&self, manager: &RecordSpanManager) -> StoreResult<usize> {
        let mut count = 0usize;
        for &span_key in &self.span_keys {
            count += manager.get_span(span_key)?.len() as usize;
        }
        Ok(count)
    }

    /// Records of this unit in stream order; `main_file_only` keeps only
    /// the records located in the unit's own file.
    pub fn get_records<'m>(
        &self,
        main_file_only: bool,
        manager: &'m RecordSpanManager,
    ) -> StoreResult<Vec<&'m Record>> {
        let mut records = Vec::new();
        for &span_key in &self.span_keys {
            let span = manager.get_span(span_key)?;
            for record in manager.span_records(&span)? {
                if !main_file_only || record.location.file_name_key == self.file_name_key {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    pub fn for_each_record<F>(&self, manager: &RecordSpanManager, mut func: F) -> StoreResult<()>
    where
        F: FnMut(&Record),
    {
        for &span_key in &self.span_keys {
            let span = manager.get_span(span_key)?;
            for record in manager.span_records(&span)? {
                func(record);
            }
        }
        Ok(())
    }

    /// Drops this unit's references on its spans; called before the unit is
    /// replaced or removed.
    pub fn release_spans(&self, manager: &mut RecordSpanManager) -> StoreResult<()> {
        for &span_key in &self.span_keys {
            manager.release_span(span_key)?;
        }
        Ok(())
    }

    /// Replays `other`'s record stream into `destination`, remapping every
    /// string key through the provided translations. Identical spans dedupe
    /// against whatever `destination` already holds.
    pub fn copy_records(
        other: &TranslationUnit,
        source: &RecordSpanManager,
        destination: &mut RecordSpanManager,
        symbol_map: &KeyMap,
        namespace_map: &KeyMap,
        file_name_map: &KeyMap,
        file_name_key: StringKey,
    ) -> StoreResult<TranslationUnit> {
        let mut unit = TranslationUnit::new(file_name_key);

        for &span_key in &other.span_keys {
            let span = source.get_span(span_key)?;
            let mut records: Vec<Record> = source.span_records(&span)?.to_vec();
            remap_records(&mut records, symbol_map, namespace_map, file_name_map)?;
            unit.span_keys.push(destination.add_span(&records)?);
        }

        Ok(unit)
    }

    pub fn serialized_size(&self) -> u64 {
        4 + 8 + self.span_keys.len() as u64 * 4
    }

    pub fn serialize(&self, insertor: &mut Insertor) -> StoreResult<()> {
        insertor.put_u32(self.file_name_key)?;
        insertor.put_u64(self.span_keys.len() as u64)?;
        for &span_key in &self.span_keys {
            insertor.put_u32(span_key)?;
        }
        Ok(())
    }

    pub fn deserialize(extractor: &mut Extractor) -> StoreResult<Self> {
        let file_name_key = extractor.get_u32()?;
        let span_count = extractor.get_u64()?;
        let mut span_keys = Vec::with_capacity(span_count as usize);
        for _ in 0..span_count {
            span_keys.push(extractor.get_u32()?);
        }
        Ok(Self {
            file_name_key,
            span_keys,
        })
    }
}

fn map_key(map: &KeyMap, key: StringKey) -> StoreResult<StringKey> {
    if key == 0 {
        return Ok(0);
    }
    map.get(&key).copied().ok_or(StoreError::InvalidKey(key))
}

fn remap_records(
    records: &mut [Record],
    symbol_map: &KeyMap,
    namespace_map: &KeyMap,
    file_name_map: &KeyMap,
) -> StoreResult<()> {
    for record in records {
        record.symbol_name_key = map_key(symbol_map, record.symbol_name_key)?;
        record.namespace_key = map_key(namespace_map, record.namespace_key)?;
        record.location.file_name_key = map_key(file_name_map, record.location.file_name_key)?;
        record.definition.file_name_key = map_key(file_name_map, record.definition.file_name_key)?;
    }
    Ok(())
}

/// Accumulates interned records for one translation unit, flushing a span
/// to the manager whenever the cursor stream switches files.
pub struct TranslationUnitBuilder<'a> {
    symbol_table: &'a mut StringTable,
    namespace_table: &'a mut StringTable,
    file_name_table: &'a mut StringTable,
    manager: &'a mut RecordSpanManager,
    unit: TranslationUnit,
    pending: Vec<Record>,
    current_file_key: StringKey,
}

impl<'a> TranslationUnitBuilder<'a> {
    pub fn new(
        symbol_table: &'a mut StringTable,
        namespace_table: &'a mut StringTable,
        file_name_table: &'a mut StringTable,
        manager: &'a mut RecordSpanManager,
        file_name_key: StringKey,
    ) -> Self {
        Self {
            symbol_table,
            namespace_table,
            file_name_table,
            manager,
            unit: TranslationUnit::new(file_name_key),
            pending: Vec::new(),
            current_file_key: 0,
        }
    }

    /// Interns the cursor's strings and appends the record, opening a new
    /// span when the file-name key changes.
    pub fn add_cursor(&mut self, cursor: &Cursor, attributes: Attributes) -> StoreResult<()> {
        let symbol_name_key = self.symbol_table.add_key(&cursor.symbol_name)?;
        let namespace_key = match &cursor.symbol_namespace {
            Some(namespace) => self.namespace_table.add_key(namespace)?,
            None => 0,
        };
        let file_name_key = self.file_name_table.add_key(&cursor.location.file_name)?;

        let mut attributes = attributes;
        attributes.set_symbol_type(cursor.symbol_type);

        let location = Location::new(file_name_key, cursor.location.line, cursor.location.column);
        let definition = match &cursor.definition {
            Some(site) => Location::new(
                self.file_name_table.add_key(&site.file_name)?,
                site.line,
                site.column,
            ),
            // a definition is its own definition site
            None if attributes.is_definition() => location,
            None => Location::default(),
        };

        if file_name_key != self.current_file_key && !self.pending.is_empty() {
            self.flush()?;
        }
        self.current_file_key = file_name_key;

        self.pending.push(Record {
            symbol_name_key,
            namespace_key,
            location,
            definition,
            attributes,
        });
        Ok(())
    }

    /// Flushes the trailing span and returns the finished unit.
    pub fn finish(mut self) -> StoreResult<TranslationUnit> {
        self.flush()?;
        Ok(self.unit)
    }

    fn flush(&mut self) -> StoreResult<()> {
        if !self.pending.is_empty() {
            let span_key = self.manager.add_span(&self.pending)?;
            self.unit.span_keys.push(span_key);
            self.pending.clear();
        }
        Ok(())
    }
}
