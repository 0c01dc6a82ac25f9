//! Graph storage backend for CaseGraph.
//!
//! The engine and strategies only ever see the `GraphBackend` trait from
//! `casegraph-core`; this crate provides the in-memory implementation used
//! in production for single-process investigations and throughout the test
//! suites.

pub mod memory;

pub use memory::MemoryGraph;
