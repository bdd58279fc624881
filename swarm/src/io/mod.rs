//! Side-effecting operations: filesystem state, the ledger store, adapter
//! loading, template rendering, and provider process execution.

pub mod adapter;
pub mod atomic;
pub mod config;
pub mod init;
pub mod ledger;
pub mod org;
pub mod output;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod report_store;
pub mod seed;
pub mod session;
