//! Database module: read models and SQL repositories.
//!
//! - `model`: typed read models returned by repositories.
//! - `repo`: SQL-only functions over the relay's state store (cursors, user id
//!   cache, influencer list, token budget, manager assignments, outbox).
//!
//! The repository API is re-exported at `crate::db::*`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ManagerCount, RelayStats, TokenUsage};
