//! Database module for binwatch.
//!
//! Defines the fleet store interface with SQLite and in-memory implementations.

mod memory;
mod models;
mod store;

pub use memory::*;
pub use models::*;
pub use store::*;
