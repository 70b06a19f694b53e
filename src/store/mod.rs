//! SQLite-backed run store.
//!
//! The only writer of run, step, artifact and event records.

pub mod db;

pub use db::{RunStore, StoreHandle};
