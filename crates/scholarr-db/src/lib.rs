//! Relational persistence for Scholarr.
//!
//! One repository module per table. Mutations run inside explicit
//! transactions; the publication dedup and queue-claim guarantees live in
//! the SQL here, not in caller logic.

pub mod database;
pub mod links;
pub mod publications;
pub mod queues;
pub mod runs;
pub mod safety;
pub mod schema;
pub mod scholars;
pub mod users;

pub use database::Database;
