//! Hierarchical task delegation and execution engine.
//!
//! A fixed organization of workers (CEO → CTO/COO → LEAD → DEV/QA/DOC), each
//! named by a self-describing identity token, claims tasks from a shared
//! on-disk ledger, drives a language model through adapter-defined prompts,
//! and rolls its progress up into manager reports. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (identity codec, ledger state
//!   transitions, completion criteria, report rollups). No I/O.
//! - **[`io`]**: Side-effecting operations (ledger store, adapters, provider
//!   processes, report files). Isolated behind seams for scripted tests.
//!
//! [`orchestrator`] executes one claimed task; [`looping`] runs worker loops
//! on top of it for the CLI.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
