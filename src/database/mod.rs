//! # Database Plumbing
//!
//! Pool creation and schema migrations for the Postgres staged message store.

pub mod connection;
pub mod migrator;

pub use connection::DatabaseConnection;
pub use migrator::{run_migrations, MIGRATOR};
