//! Shared fixtures for the integration tests.

use ftags::db::record::{Attributes, Cursor, CursorLocation, SymbolType};
use ftags::db::project::ProjectDb;

/// One cursor the parser would emit: `(file, symbol, line, column)` plus
/// its attributes and an optional definition site.
pub struct CursorSpec {
    pub file: &'static str,
    pub symbol: &'static str,
    pub line: u32,
    pub column: u32,
    pub attributes: Attributes,
    pub definition: Option<(&'static str, u32, u32)>,
}

impl CursorSpec {
    pub fn definition(file: &'static str, symbol: &'static str, line: u32) -> Self {
        let mut attributes = Attributes::new(SymbolType::FunctionDeclaration);
        attributes.set_definition(true);
        Self {
            file,
            symbol,
            line,
            column: 5,
            attributes,
            definition: None,
        }
    }

    pub fn declaration(file: &'static str, symbol: &'static str, line: u32) -> Self {
        let mut attributes = Attributes::new(SymbolType::FunctionDeclaration);
        attributes.set_declaration(true);
        Self {
            file,
            symbol,
            line,
            column: 5,
            attributes,
            definition: None,
        }
    }

    pub fn reference(file: &'static str, symbol: &'static str, line: u32) -> Self {
        let mut attributes = Attributes::new(SymbolType::DeclarationReferenceExpression);
        attributes.set_reference(true);
        Self {
            file,
            symbol,
            line,
            column: 5,
            attributes,
            definition: None,
        }
    }

    pub fn defined_at(mut self, file: &'static str, line: u32, column: u32) -> Self {
        self.definition = Some((file, line, column));
        self
    }

    fn to_cursor(&self) -> Cursor {
        Cursor {
            symbol_name: self.symbol.to_string(),
            symbol_namespace: None,
            symbol_type: self.attributes.symbol_type(),
            location: CursorLocation {
                file_name: self.file.to_string(),
                line: self.line,
                column: self.column,
            },
            definition: self.definition.map(|(file, line, column)| CursorLocation {
                file_name: file.to_string(),
                line,
                column,
            }),
        }
    }
}

/// Parses one translation unit worth of cursors into `project`.
pub fn index_translation_unit(project: &mut ProjectDb, main_file: &str, cursors: &[CursorSpec]) {
    let mut builder = project.translation_unit_builder(main_file).unwrap();
    for spec in cursors {
        builder.add_cursor(&spec.to_cursor(), spec.attributes).unwrap();
    }
    let unit = builder.finish().unwrap();
    project.add_translation_unit(unit).unwrap();
}

/// The five-record header every fixture "includes": the same byte content
/// regardless of which translation unit parsed it.
pub fn header_cursors(header: &'static str) -> Vec<CursorSpec> {
    vec![
        CursorSpec::definition(header, "buffer_size", 1),
        CursorSpec::declaration(header, "grow_buffer", 2),
        CursorSpec::declaration(header, "shrink_buffer", 3),
        CursorSpec::definition(header, "buffer_state", 4),
        CursorSpec::declaration(header, "reset_buffer", 5),
    ]
}
