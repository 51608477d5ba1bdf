//! A connection handle shared between suspendable tasks.
//!
//! [`AsyncConnection`] puts a [`ConnectionHandle`] behind an async mutex. The
//! gate is held for the whole of an atomic block's entry and exit, so those
//! transitions never interleave. Exits of cancelled blocks are queued and run
//! by whoever takes the gate next.

use crate::db::atomic::{Atomic, Outcome};
use crate::db::driver::Row;
use crate::db::handle::ConnectionHandle;
use crate::error::DbResult;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

struct Shared {
    alias: String,
    gate: Arc<AsyncMutex<ConnectionHandle>>,
    cancelled: Mutex<VecDeque<Atomic>>,
}

/// Cheaply clonable reference to a shared suspendable handle.
#[derive(Clone)]
pub struct AsyncConnection {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for AsyncConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConnection")
            .field("alias", &self.inner.alias)
            .field("pending_exits", &self.pending_exits())
            .finish()
    }
}

impl AsyncConnection {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            inner: Arc::new(Shared {
                alias: handle.alias().to_string(),
                gate: Arc::new(AsyncMutex::new(handle)),
                cancelled: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn alias(&self) -> &str {
        &self.inner.alias
    }

    /// Whether both values refer to the same handle.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take exclusive access to the handle.
    ///
    /// Exits queued by cancelled blocks run first, in the order they were
    /// cancelled. Do not hold the guard across a nested atomic block on the
    /// same connection; the block takes the gate itself.
    pub async fn lock(&self) -> OwnedMutexGuard<ConnectionHandle> {
        let mut handle = Arc::clone(&self.inner.gate).lock_owned().await;
        while let Some(atomic) = self.next_cancelled() {
            debug!(alias = %self.inner.alias, "Finishing cancelled atomic block");
            if let Err(e) = atomic.exit(&mut handle, Outcome::Cancelled).await {
                warn!(
                    alias = %self.inner.alias,
                    error = %e,
                    "Error while exiting cancelled atomic block"
                );
            }
        }
        handle
    }

    fn next_cancelled(&self) -> Option<Atomic> {
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Queue the exit of a block whose owner went away. It runs on the next
    /// [`lock`](Self::lock), which is started right away when a runtime is
    /// available.
    pub fn schedule_exit(&self, atomic: Atomic) {
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(atomic);
        if let Ok(runtime) = Handle::try_current() {
            let conn = self.clone();
            runtime.spawn(async move {
                drop(conn.lock().await);
            });
        }
    }

    /// Number of queued exits not yet run.
    pub fn pending_exits(&self) -> usize {
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        self.lock().await.execute(sql).await
    }

    pub async fn fetch_all(&self, sql: &str) -> DbResult<Vec<Row>> {
        self.lock().await.fetch_all(sql).await
    }

    pub async fn get_rollback(&self) -> DbResult<bool> {
        self.lock().await.get_rollback()
    }

    pub async fn set_rollback(&self, rollback: bool) -> DbResult<()> {
        self.lock().await.set_rollback(rollback)
    }

    pub async fn in_atomic_block(&self) -> bool {
        self.lock().await.in_atomic_block()
    }

    pub async fn on_commit<F>(&self, func: F, robust: bool) -> DbResult<()>
    where
        F: FnOnce() -> DbResult<()> + Send + 'static,
    {
        self.lock().await.on_commit(func, robust).await
    }

    pub async fn close(&self) -> DbResult<()> {
        self.lock().await.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseSettings, Settings};
    use crate::db::atomic::atomic;
    use crate::db::handler::ConnectionHandler;
    use crate::db::memory::MemoryDriver;
    use crate::models::ExecutionModel;

    fn shared(driver: Arc<MemoryDriver>) -> AsyncConnection {
        let settings = Settings::new()
            .with_database("default", DatabaseSettings::new("memory").with_name("shared"));
        let handler = ConnectionHandler::builder(settings)
            .driver("memory", driver)
            .build();
        AsyncConnection::new(
            handler
                .create_connection("default", ExecutionModel::Suspendable)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_clones_share_the_handle() {
        let conn = shared(Arc::new(MemoryDriver::new()));
        let other = conn.clone();
        assert!(conn.ptr_eq(&other));
        assert_eq!(other.alias(), "default");

        conn.execute("INSERT 1").await.unwrap();
        assert!(other.lock().await.is_connected());
    }

    #[tokio::test]
    async fn test_queued_exit_runs_on_next_lock() {
        let driver = Arc::new(MemoryDriver::new());
        let conn = shared(driver.clone());
        let block = atomic("default");
        {
            let mut handle = conn.lock().await;
            block.enter(&mut handle).await.unwrap();
            handle.execute("INSERT 1").await.unwrap();
        }

        // Queue without a runtime-spawned drain racing the assertions below.
        conn.inner
            .cancelled
            .lock()
            .unwrap()
            .push_back(block.clone());
        assert_eq!(conn.pending_exits(), 1);

        let handle = conn.lock().await;
        assert_eq!(conn.pending_exits(), 0);
        assert!(!handle.in_atomic_block());
        assert!(driver.database("shared").committed().is_empty());
    }

    #[tokio::test]
    async fn test_nested_run_with_failed_inner_block() {
        let driver = Arc::new(MemoryDriver::new());
        let conn = shared(driver.clone());

        let result: DbResult<()> = atomic("default")
            .run(&conn, |c| async move {
                c.execute("INSERT 1").await?;
                let inner: DbResult<()> = atomic("default")
                    .run(&c, |c| async move {
                        c.execute("INSERT 2").await?;
                        Err(crate::error::DbError::internal("inner failed"))
                    })
                    .await;
                assert!(inner.is_err());
                assert!(!c.get_rollback().await?);
                Ok(())
            })
            .await;
        result.unwrap();
        assert_eq!(driver.database("shared").committed(), vec!["INSERT 1"]);
        assert!(!conn.in_atomic_block().await);
    }
}
