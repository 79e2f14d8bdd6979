//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod circuit;
pub mod file_map;
pub mod graph;
pub mod provenance_id;
pub mod types;
