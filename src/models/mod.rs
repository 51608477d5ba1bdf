//! Data models shared by the connection layer.

pub mod connection;

pub use connection::{ConnectionParams, DatabaseType, ExecutionModel, IsolationLevel};
