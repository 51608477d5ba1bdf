//! Transaction and connection-lifecycle core.
//!
//! This library opens, pools and tears down database connections and manages
//! nested atomic blocks (with savepoints) for a blocking and a suspendable
//! execution model that interoperate.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, DatabaseSettings, Settings};
pub use db::{Atomic, ConnectionHandle, ConnectionHandler, ExecutionContext, atomic};
pub use error::{DbError, DbResult};
