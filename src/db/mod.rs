//! Persistence layer — snapshot schema and connection setup.

pub mod schema;
