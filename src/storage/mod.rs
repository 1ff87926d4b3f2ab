//! Slab-backed storage engine: segmented arenas, interning tables and the
//! binary serialization framework shared by everything that persists.

pub mod file_name_table;
pub mod index_map;
pub mod serialization;
pub mod store;
pub mod string_table;

use std::collections::HashMap;

use thiserror::Error;

/// Translation from the key space of one table into another, as produced by
/// a cross-table merge.
pub type KeyMap = HashMap<u32, u32>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The slab reached its segment limit, or a single request exceeded the
    /// largest contiguous run a segment can hold.
    #[error("store capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A key of zero or one pointing outside the live segments.
    #[error("invalid store key {0:#010x}")]
    InvalidKey(u32),

    /// `extend` was called where no adjacent free space exists; the caller
    /// is expected to fall back to allocate-and-move.
    #[error("allocation cannot be extended in place")]
    NotExtendable,

    /// Header tag or version did not match, or the input ran out early.
    #[error("deserialization mismatch: {0}")]
    DeserializationMismatch(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
