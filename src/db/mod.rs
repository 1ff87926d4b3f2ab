//! The symbol database: records, deduplicated record spans, translation
//! units and the project aggregate that answers queries over them.

pub mod cursor_set;
pub mod project;
pub mod record;
pub mod record_span;
pub mod span_manager;
pub mod statistics;
pub mod translation_unit;

pub use cursor_set::CursorSet;
pub use project::ProjectDb;
pub use record::{Attributes, Cursor, CursorLocation, Location, Record, SymbolType};
pub use record_span::{RecordSpan, SpanKey};
pub use span_manager::RecordSpanManager;
pub use translation_unit::{TranslationUnit, TranslationUnitBuilder};
