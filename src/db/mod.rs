//! Connection and transaction layer.
//!
//! This module provides:
//! - The driver contract and its implementations (sqlx, plus an in-memory
//!   driver for tests behind the `test-utils` feature)
//! - Connection handles with autocommit, savepoint and health-check state
//! - Connection pools per alias and execution model
//! - Atomic blocks shared by the blocking and suspendable models
//! - Context-scoped registries and the bridge between the two models

pub mod async_connection;
pub mod atomic;
pub mod bridge;
pub mod driver;
pub mod handle;
pub mod handler;
#[macro_use]
pub mod macros;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod pool;
pub mod registry;
pub mod session;
pub mod signals;
pub mod sqlx_driver;
pub mod types;

pub use async_connection::AsyncConnection;
pub use atomic::{
    Atomic, Outcome, atomic, mark_for_rollback_on_error, mark_for_rollback_on_error_async,
};
pub use bridge::{
    BridgedConnection, ConnectionScope, ExecutionContext, block_on, should_use_sync_fallback,
};
pub use driver::{Driver, DriverConnection, DriverFeatures, Row};
pub use handle::{BlockMarker, ConnectionHandle, QueryRecord};
pub use handler::{ConnectionHandler, HandlerBuilder};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{DriverOp, FaultPoint, MemoryDatabase, MemoryDriver};
pub use pool::{ConnectionPool, DriverConnectionManager, PoolRegistry, PooledConnection};
pub use registry::{AsyncConnectionRegistry, ConnectionRegistry};
pub use session::{ConnectionConfigurer, SessionSetup};
pub use signals::Signals;
pub use sqlx_driver::SqlxDriver;
