//! Deterministic, pure logic shared by the swarm engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod criteria;
pub mod decompose;
pub mod extract;
pub mod identity;
pub mod ledger_state;
pub mod org;
pub mod render_context;
pub mod report;
pub mod task;
pub mod uid;
