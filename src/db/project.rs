//! The project database: the three interning tables, the record-span
//! manager, the translation units and the query surface over them.

use crate::storage::serialization::{
    string_serialized_size, BufferSink, BufferSource, Extractor, Insertor, ObjectHeader,
    StreamSink, StreamSource, OBJECT_HEADER_SIZE,
};
use crate::storage::string_table::{StringKey, StringTable};
use crate::storage::{StoreError, StoreResult};

use super::cursor_set::CursorSet;
use super::record::{Cursor, CursorLocation, Record, SymbolType};
use super::span_manager::RecordSpanManager;
use super::statistics::Sample;
use super::translation_unit::{TranslationUnit, TranslationUnitBuilder};

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tracing::debug;

const SERIAL_TAG: &str = "ftags::ProjectDb";

pub struct ProjectDb {
    name: String,
    root: String,

    file_name_table: StringTable,
    symbol_table: StringTable,
    namespace_table: StringTable,

    span_manager: RecordSpanManager,

    translation_units: Vec<TranslationUnit>,

    /// main-file key -> position in `translation_units`
    file_index: HashMap<StringKey, usize>,
}

impl ProjectDb {
    pub fn new(name: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            file_name_table: StringTable::new(),
            symbol_table: StringTable::new(),
            namespace_table: StringTable::new(),
            span_manager: RecordSpanManager::new(),
            translation_units: Vec::new(),
            file_index: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn translation_unit_count(&self) -> usize {
        self.translation_units.len()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbol_table.len()
    }

    pub fn file_count(&self) -> usize {
        self.file_name_table.len()
    }

    pub fn record_count(&self) -> usize {
        self.span_manager.record_count()
    }

    pub fn span_manager(&self) -> &RecordSpanManager {
        &self.span_manager
    }

    /// Starts a translation unit for `main_file`. Feed it the parser's
    /// cursors, then install the finished unit with
    /// [`ProjectDb::add_translation_unit`].
    pub fn translation_unit_builder(
        &mut self,
        main_file: &str,
    ) -> StoreResult<TranslationUnitBuilder<'_>> {
        let file_name_key = self.file_name_table.add_key(main_file)?;
        Ok(TranslationUnitBuilder::new(
            &mut self.symbol_table,
            &mut self.namespace_table,
            &mut self.file_name_table,
            &mut self.span_manager,
            file_name_key,
        ))
    }

    /// Installs a finished unit. Re-indexing a file the project already
    /// holds releases the previous unit's spans first.
    pub fn add_translation_unit(&mut self, unit: TranslationUnit) -> StoreResult<()> {
        match self.file_index.get(&unit.file_name_key()) {
            Some(&position) => {
                let previous = std::mem::replace(&mut self.translation_units[position], unit);
                previous.release_spans(&mut self.span_manager)?;
            }
            None => {
                self.file_index
                    .insert(unit.file_name_key(), self.translation_units.len());
                self.translation_units.push(unit);
            }
        }
        Ok(())
    }

    pub fn remove_translation_unit(&mut self, file_name: &str) -> StoreResult<bool> {
        let file_name_key = self.file_name_table.get_key(file_name);
        if file_name_key == 0 {
            return Ok(false);
        }
        let position = match self.file_index.remove(&file_name_key) {
            Some(position) => position,
            None => return Ok(false),
        };

        let unit = self.translation_units.remove(position);
        unit.release_spans(&mut self.span_manager)?;

        // later units shifted down by one
        for index in self.file_index.values_mut() {
            if *index > position {
                *index -= 1;
            }
        }
        Ok(true)
    }

    pub fn is_file_indexed(&self, file_name: &str) -> bool {
        let key = self.file_name_table.get_key(file_name);
        key != 0 && self.file_index.contains_key(&key)
    }

    /*
     * Queries
     */

    pub fn find_symbol(&self, symbol_name: &str) -> StoreResult<Vec<&Record>> {
        self.filter_records_with_symbol(symbol_name, |_| true)
    }

    pub fn find_symbol_of_type(
        &self,
        symbol_name: &str,
        symbol_type: SymbolType,
    ) -> StoreResult<Vec<&Record>> {
        self.filter_records_with_symbol(symbol_name, |record| {
            record.attributes.symbol_type() == symbol_type
        })
    }

    pub fn find_definition(&self, symbol_name: &str) -> StoreResult<Vec<&Record>> {
        self.filter_records_with_symbol(symbol_name, |record| record.attributes.is_definition())
    }

    pub fn find_declaration(&self, symbol_name: &str) -> StoreResult<Vec<&Record>> {
        self.filter_records_with_symbol(symbol_name, |record| {
            record.attributes.is_declaration() && !record.attributes.is_definition()
        })
    }

    pub fn find_reference(&self, symbol_name: &str) -> StoreResult<Vec<&Record>> {
        self.filter_records_with_symbol(symbol_name, |record| record.attributes.is_reference())
    }

    /// Records closest to the position, the core of "identify the symbol
    /// under the cursor".
    pub fn identify_symbol(
        &self,
        file_name: &str,
        line: u32,
        column: u32,
    ) -> StoreResult<Vec<&Record>> {
        let file_name_key = self.file_name_table.get_key(file_name);
        self.span_manager
            .find_closest_record(file_name_key, line, column)
    }

    /// Each primary hit grouped with the records at its definition site.
    pub fn identify_symbol_extended(
        &self,
        file_name: &str,
        line: u32,
        column: u32,
    ) -> StoreResult<Vec<Vec<&Record>>> {
        let primaries = self.identify_symbol(file_name, line, column)?;

        let mut groups = Vec::with_capacity(primaries.len());
        for primary in primaries {
            let mut group = vec![primary];
            let at_definition = self.span_manager.find_closest_record(
                primary.definition.file_name_key,
                primary.definition.line(),
                primary.definition.column(),
            )?;
            for record in at_definition {
                if record.identity() != primary.identity() {
                    group.push(record);
                }
            }
            groups.push(group);
        }
        Ok(groups)
    }

    /// The full record stream of the unit whose main file is `file_name`,
    /// or `None` when that file was never indexed as a translation unit.
    pub fn dump_translation_unit(&self, file_name: &str) -> StoreResult<Option<Vec<&Record>>> {
        let file_name_key = self.file_name_table.get_key(file_name);
        let position = match self.file_index.get(&file_name_key) {
            Some(&position) => position,
            None => return Ok(None),
        };
        self.translation_units[position]
            .get_records(false, &self.span_manager)
            .map(Some)
    }

    pub fn get_functions(&self) -> Vec<&Record> {
        self.collect_records(|record| {
            matches!(
                record.attributes.symbol_type(),
                SymbolType::FunctionDeclaration | SymbolType::MethodDeclaration
            )
        })
    }

    pub fn get_classes(&self) -> Vec<&Record> {
        self.collect_records(|record| {
            record.attributes.symbol_type() == SymbolType::ClassDeclaration
        })
    }

    pub fn get_global_variables(&self) -> Vec<&Record> {
        self.collect_records(|record| {
            record.attributes.symbol_type() == SymbolType::VariableDeclaration
                && record.attributes.is_global()
        })
    }

    pub fn inflate_record(&self, record: &Record) -> Option<Cursor> {
        let symbol_name = self.symbol_table.get_string(record.symbol_name_key)?;
        let file_name = self
            .file_name_table
            .get_string(record.location.file_name_key)?;

        let symbol_namespace = if record.namespace_key != 0 {
            Some(
                self.namespace_table
                    .get_string(record.namespace_key)?
                    .to_string(),
            )
        } else {
            None
        };

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
            symbol_namespace,
            symbol_type: record.attributes.symbol_type(),
            location: CursorLocation {
                file_name: file_name.to_string(),
                line: record.location.line(),
                column: record.location.column(),
            },
            definition,
        })
    }

    /// Projects query results into a self-contained, transportable set.
    pub fn inflate_records(&self, records: &[&Record]) -> StoreResult<CursorSet> {
        CursorSet::from_records(records, &self.symbol_table, &self.file_name_table)
    }

    /*
     * Management
     */

    /// Merges another project in: the three string tables are merged, then
    /// every translation unit of `other` is replayed with its keys
    /// remapped. Span dedup is content-addressed, so shared headers are
    /// stored once regardless of merge order.
    pub fn merge_from(&mut self, other: &ProjectDb) -> StoreResult<()> {
        let symbol_map = self.symbol_table.merge_from(&other.symbol_table)?;
        let namespace_map = self.namespace_table.merge_from(&other.namespace_table)?;
        let file_name_map = self.file_name_table.merge_from(&other.file_name_table)?;

        for unit in &other.translation_units {
            let file_name_key = *file_name_map
                .get(&unit.file_name_key())
                .ok_or(StoreError::InvalidKey(unit.file_name_key()))?;

            let copied = TranslationUnit::copy_records(
                unit,
                &other.span_manager,
                &mut self.span_manager,
                &symbol_map,
                &namespace_map,
                &file_name_map,
                file_name_key,
            )?;
            self.add_translation_unit(copied)?;
        }

        debug!(
            project = %self.name,
            merged_units = other.translation_units.len(),
            records = self.record_count(),
            "merged project"
        );
        Ok(())
    }

    /// Replaces the translation unit for `file_name` with the one carried
    /// by `other`: the existing unit is removed and its span references
    /// dropped before the merge replays the incoming records.
    pub fn update_from(&mut self, file_name: &str, other: &ProjectDb) -> StoreResult<()> {
        let replaced = self.remove_translation_unit(file_name)?;
        debug!(project = %self.name, file = file_name, replaced, "updating translation unit");
        self.merge_from(other)
    }

    /*
     * Serialization
     */

    pub fn serialized_size(&self) -> u64 {
        let units: u64 = self
            .translation_units
            .iter()
            .map(|unit| unit.serialized_size())
            .sum();

        OBJECT_HEADER_SIZE
            + string_serialized_size(&self.name)
            + string_serialized_size(&self.root)
            + self.file_name_table.serialized_size()
            + self.symbol_table.serialized_size()
            + self.namespace_table.serialized_size()
            + self.span_manager.serialized_size()
            + 8
            + units
    }

    pub fn serialize(&self, insertor: &mut Insertor) -> StoreResult<()> {
        let header = ObjectHeader::new(SERIAL_TAG, self.serialized_size() - OBJECT_HEADER_SIZE);
        insertor.put_header(&header)?;

        insertor.put_string(&self.name)?;
        insertor.put_string(&self.root)?;

        self.file_name_table.serialize(insertor)?;
        self.symbol_table.serialize(insertor)?;
        self.namespace_table.serialize(insertor)?;
        self.span_manager.serialize(insertor)?;

        insertor.put_u64(self.translation_units.len() as u64)?;
        for unit in &self.translation_units {
            unit.serialize(insertor)?;
        }
        Ok(())
    }

    pub fn deserialize(extractor: &mut Extractor) -> StoreResult<Self> {
        extractor.expect_header(SERIAL_TAG)?;

        let name = extractor.get_string()?;
        let root = extractor.get_string()?;

        let file_name_table = StringTable::deserialize(extractor)?;
        let symbol_table = StringTable::deserialize(extractor)?;
        let namespace_table = StringTable::deserialize(extractor)?;
        let span_manager = RecordSpanManager::deserialize(extractor)?;

        let unit_count = extractor.get_u64()?;
        let mut translation_units = Vec::with_capacity(unit_count as usize);
        let mut file_index = HashMap::new();
        for position in 0..unit_count as usize {
            let unit = TranslationUnit::deserialize(extractor)?;
            file_index.insert(unit.file_name_key(), position);
            translation_units.push(unit);
        }

        Ok(Self {
            name,
            root,
            file_name_table,
            symbol_table,
            namespace_table,
            span_manager,
            translation_units,
            file_index,
        })
    }

    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        let mut sink = BufferSink::with_expected_size(self.serialized_size());
        self.serialize(&mut Insertor::new(&mut sink))?;
        Ok(sink.into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let mut source = BufferSource::new(bytes);
        let project = Self::deserialize(&mut Extractor::new(&mut source))?;
        source.assert_drained();
        Ok(project)
    }

    pub fn save_to_file(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut sink = StreamSink::new(BufWriter::new(File::create(path)?));
        self.serialize(&mut Insertor::new(&mut sink))
    }

    pub fn load_from_file(path: &Path) -> StoreResult<Self> {
        let mut source = StreamSource::new(BufReader::new(File::open(path)?));
        Self::deserialize(&mut Extractor::new(&mut source))
    }

    /*
     * Statistics
     */

    pub fn statistics_remarks(&self, group: &str) -> Vec<String> {
        match group {
            "symbols" => {
                let mut sizes = Sample::new();
                self.symbol_table
                    .for_each(|symbol, _key| sizes.add_value(symbol.len() as u64));

                let mut remarks = vec![format!("Indexed {} symbols", self.symbol_count())];
                if let Some(summary) = sizes.five_number_summary() {
                    remarks.push("Symbol sizes (five number summary):".to_string());
                    remarks.push(format!("  minimum:        {:>8}", summary.minimum));
                    remarks.push(format!("  lower quartile: {:>8}", summary.lower_quartile));
                    remarks.push(format!("  median:         {:>8}", summary.median));
                    remarks.push(format!("  upper quartile: {:>8}", summary.upper_quartile));
                    remarks.push(format!("  maximum:        {:>8}", summary.maximum));
                }
                remarks
            }
            "recordspans" => self.span_manager.statistics_remarks(),
            _ => vec![
                format!("Serialized size is {} bytes", self.serialized_size()),
                format!(
                    "Indexed {} translation units",
                    self.translation_unit_count()
                ),
                format!("Indexed {} symbols", self.symbol_count()),
                format!("Indexed {} distinct files", self.file_count()),
            ],
        }
    }

    pub fn analyze_data(&self, group: &str) -> Vec<String> {
        match group {
            "recordspans" => self.span_manager.analyze_spans(),
            "records" => {
                let mut definitions = 0usize;
                let mut declarations = 0usize;
                let mut references = 0usize;
                let mut expressions = 0usize;
                let mut total = 0usize;
                self.span_manager.for_each_record(|record| {
                    total += 1;
                    if record.attributes.is_definition() {
                        definitions += 1;
                    }
                    if record.attributes.is_declaration() {
                        declarations += 1;
                    }
                    if record.attributes.is_reference() {
                        references += 1;
                    }
                    if record.attributes.is_expression() {
                        expressions += 1;
                    }
                });
                vec![
                    format!("Analyzed {total} records"),
                    format!("  {definitions} definitions"),
                    format!("  {declarations} declarations"),
                    format!("  {references} references"),
                    format!("  {expressions} expressions"),
                ]
            }
            _ => vec![format!("Analysis of '{group}' complete.")],
        }
    }

    /*
     * Content equality
     */

    /// Canonical projection used for equality: per main file, the inflated
    /// record stream of its translation unit.
    #[allow(clippy::type_complexity)]
    fn content_snapshot(
        &self,
    ) -> StoreResult<BTreeMap<String, Vec<(String, String, u32, u32, u64)>>> {
        let mut snapshot = BTreeMap::new();

        for unit in &self.translation_units {
            let main_file = self
                .file_name_table
                .get_string(unit.file_name_key())
                .ok_or(StoreError::InvalidKey(unit.file_name_key()))?
                .to_string();

            let mut stream = Vec::new();
            for record in unit.get_records(false, &self.span_manager)? {
                let symbol = self
                    .symbol_table
                    .get_string(record.symbol_name_key)
                    .ok_or(StoreError::InvalidKey(record.symbol_name_key))?;
                let file = self
                    .file_name_table
                    .get_string(record.location.file_name_key)
                    .ok_or(StoreError::InvalidKey(record.location.file_name_key))?;
                stream.push((
                    symbol.to_string(),
                    file.to_string(),
                    record.location.line(),
                    record.location.column(),
                    record.attributes.bits(),
                ));
            }
            snapshot.insert(main_file, stream);
        }

        Ok(snapshot)
    }

    fn collect_records<F>(&self, mut predicate: F) -> Vec<&Record>
    where
        F: FnMut(&Record) -> bool,
    {
        let mut results = Vec::new();
        self.span_manager.for_each_record(|record| {
            if predicate(record) {
                results.push(record);
            }
        });
        results
    }

    fn filter_records_with_symbol<F>(
        &self,
        symbol_name: &str,
        predicate: F,
    ) -> StoreResult<Vec<&Record>>
    where
        F: FnMut(&Record) -> bool,
    {
        let symbol_key = self.symbol_table.get_key(symbol_name);
        let mut results = self
            .span_manager
            .filter_records_with_symbol(symbol_key, predicate)?;
        Record::filter_duplicates(&mut results);
        Ok(results)
    }
}

impl PartialEq for ProjectDb {
    fn eq(&self, other: &Self) -> bool {
        match (self.content_snapshot(), other.content_snapshot()) {
            (Ok(own), Ok(theirs)) => own == theirs,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record::Attributes;

    fn cursor(symbol: &str, file: &str, line: u32, column: u32) -> Cursor {
        Cursor {
            symbol_name: symbol.to_string(),
            symbol_namespace: None,
            symbol_type: SymbolType::FunctionDeclaration,
            location: CursorLocation {
                file_name: file.to_string(),
                line,
                column,
            },
            definition: None,
        }
    }

    fn definition_attributes() -> Attributes {
        let mut attributes = Attributes::default();
        attributes.set_definition(true);
        attributes
    }

    fn index_simple_unit(project: &mut ProjectDb, file: &str, symbols: &[(&str, u32)]) {
        let mut builder = project.translation_unit_builder(file).unwrap();
        for &(symbol, line) in symbols {
            builder
                .add_cursor(&cursor(symbol, file, line, 1), definition_attributes())
                .unwrap();
        }
        let unit = builder.finish().unwrap();
        project.add_translation_unit(unit).unwrap();
    }

    #[test]
    fn find_symbol_sees_indexed_records() {
        let mut project = ProjectDb::new("demo", "/src");
        index_simple_unit(&mut project, "/src/a.c", &[("alpha", 3), ("beta", 9)]);

        let hits = project.find_symbol("alpha").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].location.line(), 3);
        assert!(project.find_symbol("gamma").unwrap().is_empty());
    }

    #[test]
    fn declaration_and_definition_filters_are_disjoint() {
        let mut project = ProjectDb::new("demo", "/src");
        let mut builder = project.translation_unit_builder("/src/a.c").unwrap();

        let mut declaration = Attributes::default();
        declaration.set_declaration(true);
        builder
            .add_cursor(&cursor("f", "/src/a.h", 2, 1), declaration)
            .unwrap();
        builder
            .add_cursor(&cursor("f", "/src/a.c", 20, 1), definition_attributes())
            .unwrap();
        let unit = builder.finish().unwrap();
        project.add_translation_unit(unit).unwrap();

        let declarations = project.find_declaration("f").unwrap();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].location.line(), 2);

        let definitions = project.find_definition("f").unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].location.line(), 20);
    }

    #[test]
    fn reindexing_a_file_replaces_its_unit() {
        let mut project = ProjectDb::new("demo", "/src");
        index_simple_unit(&mut project, "/src/a.c", &[("old_symbol", 1)]);
        assert!(project.is_file_indexed("/src/a.c"));

        index_simple_unit(&mut project, "/src/a.c", &[("new_symbol", 1)]);

        assert_eq!(project.translation_unit_count(), 1);
        assert!(project.find_symbol("old_symbol").unwrap().is_empty());
        assert_eq!(project.find_symbol("new_symbol").unwrap().len(), 1);
        assert_eq!(project.record_count(), 1);
    }

    #[test]
    fn remove_translation_unit_reclaims_spans() {
        let mut project = ProjectDb::new("demo", "/src");
        index_simple_unit(&mut project, "/src/a.c", &[("keep", 1)]);
        index_simple_unit(&mut project, "/src/b.c", &[("drop", 1)]);

        assert!(project.remove_translation_unit("/src/b.c").unwrap());
        assert!(!project.remove_translation_unit("/src/b.c").unwrap());

        assert_eq!(project.translation_unit_count(), 1);
        assert_eq!(project.find_symbol("keep").unwrap().len(), 1);
        assert!(project.find_symbol("drop").unwrap().is_empty());
        assert!(project.dump_translation_unit("/src/a.c").unwrap().is_some());
    }

    #[test]
    fn dump_translation_unit_returns_the_full_stream() {
        let mut project = ProjectDb::new("demo", "/src");
        let mut builder = project.translation_unit_builder("/src/a.c").unwrap();
        builder
            .add_cursor(&cursor("own", "/src/a.c", 1, 1), definition_attributes())
            .unwrap();
        builder
            .add_cursor(
                &cursor("from_header", "/src/h.h", 2, 1),
                definition_attributes(),
            )
            .unwrap();
        let unit = builder.finish().unwrap();
        project.add_translation_unit(unit).unwrap();

        let records = project.dump_translation_unit("/src/a.c").unwrap().unwrap();
        assert_eq!(records.len(), 2);
        assert!(project.dump_translation_unit("/src/h.h").unwrap().is_none());
    }

    #[test]
    fn update_from_replaces_the_stale_unit() {
        let mut project = ProjectDb::new("demo", "/src");
        index_simple_unit(&mut project, "/src/a.c", &[("stale", 5)]);

        let mut fresh = ProjectDb::new("demo-worker", "/src");
        index_simple_unit(&mut fresh, "/src/a.c", &[("fresh", 5)]);

        project.update_from("/src/a.c", &fresh).unwrap();

        assert_eq!(project.translation_unit_count(), 1);
        assert!(project.find_symbol("stale").unwrap().is_empty());
        assert_eq!(project.find_symbol("fresh").unwrap().len(), 1);
    }

    #[test]
    fn serialization_preserves_content_equality() {
        let mut project = ProjectDb::new("demo", "/src");
        index_simple_unit(&mut project, "/src/a.c", &[("alpha", 3), ("beta", 9)]);
        index_simple_unit(&mut project, "/src/b.c", &[("gamma", 7)]);

        let bytes = project.to_bytes().unwrap();
        let restored = ProjectDb::from_bytes(&bytes).unwrap();

        assert_eq!(restored.name(), "demo");
        assert_eq!(restored.root(), "/src");
        assert!(restored == project);
        assert_eq!(
            restored.find_symbol("alpha").unwrap().len(),
            project.find_symbol("alpha").unwrap().len()
        );
    }

    #[test]
    fn statistics_cover_the_default_group() {
        let mut project = ProjectDb::new("demo", "/src");
        index_simple_unit(&mut project, "/src/a.c", &[("alpha", 3)]);

        let remarks = project.statistics_remarks("");
        assert!(remarks.iter().any(|remark| remark.contains("1 translation units")));

        let symbol_remarks = project.statistics_remarks("symbols");
        assert!(symbol_remarks[0].contains("1 symbols"));
    }
}
