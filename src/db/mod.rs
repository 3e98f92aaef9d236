//! Database module: row models and SQL repositories.
//!
//! - `model`: view models returned by or written through repositories.
//! - `repo`: SQL-only functions that map rows into domain types.
//!
//! Every status change goes through a conditional `UPDATE ... WHERE status`
//! so concurrent callers race on the row, not in memory.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{AppleRegistration, DispatchRecord};
