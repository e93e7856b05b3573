//! Command line and environment configuration for embedding the notification listener.

pub mod listener;
pub mod postgres;

pub use listener::ListenerArgs;
pub use postgres::PostgresArgs;
