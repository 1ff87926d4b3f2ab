//! ftags: a persistent, queryable code-symbol index for C/C++ codebases.
//!
//! The core is an in-memory storage engine built on segmented slab
//! allocators and interned strings; on top of it sits a deduplicating
//! record-span manager, per-translation-unit aggregation and a serializable
//! project database. The server module exposes the query surface over a
//! Unix-domain socket.

pub mod config;
pub mod db;
pub mod server;
pub mod storage;
