//! Interplay between the blocking and suspendable execution models.
//!
//! Suspendable code talks to the database through connections opened by a
//! [`ExecutionContext::new_connection`] scope. Outside any such scope it falls
//! back to the context's blocking handles, which run on a blocking worker and
//! relay their results unchanged.
//!
//! [`block_on`] is the blocking strategy used everywhere a blocking caller
//! needs to drive the async connection machinery.

use crate::db::async_connection::AsyncConnection;
use crate::db::atomic::{Atomic, Outcome};
use crate::db::driver::Row;
use crate::db::handle::ConnectionHandle;
use crate::db::handler::ConnectionHandler;
use crate::db::registry::{AsyncConnectionRegistry, ConnectionRegistry};
use crate::error::{DbError, DbResult};
use crate::models::ExecutionModel;
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::resume_unwind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

/// Whether an async-capable operation should take the blocking fallback:
/// only when no `new_connection` scope is open.
pub fn should_use_sync_fallback(async_variant: bool, depth: usize) -> bool {
    async_variant && depth == 0
}

/// Drive `fut` to completion from blocking code.
///
/// Without a runtime the future runs on the calling thread. On a
/// multi-threaded runtime the worker is handed over with `block_in_place`.
/// On a current-thread runtime the future runs on a scoped helper thread
/// inside the runtime context; the runtime itself is parked meanwhile, so
/// futures that need its I/O or timer drivers must use a multi-threaded
/// runtime.
pub fn block_on<F>(fut: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    let Ok(handle) = Handle::try_current() else {
        return futures::executor::block_on(fut);
    };
    match handle.runtime_flavor() {
        RuntimeFlavor::CurrentThread => std::thread::scope(|scope| {
            let worker = scope.spawn(|| {
                let _guard = handle.enter();
                futures::executor::block_on(fut)
            });
            match worker.join() {
                Ok(output) => output,
                Err(panic) => resume_unwind(panic),
            }
        }),
        _ => tokio::task::block_in_place(|| handle.block_on(fut)),
    }
}

struct ContextInner {
    handler: ConnectionHandler,
    blocking: Arc<Mutex<ConnectionRegistry>>,
    suspendable: AsyncConnectionRegistry,
    depth: AtomicUsize,
}

/// The connections of one logical execution context: a blocking registry
/// and a stack of suspendable connections per alias.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("depth", &self.depth())
            .field("suspendable", &self.inner.suspendable)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub fn new(handler: ConnectionHandler) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                blocking: Arc::new(Mutex::new(ConnectionRegistry::new(handler.clone()))),
                handler,
                suspendable: AsyncConnectionRegistry::new(),
                depth: AtomicUsize::new(0),
            }),
        }
    }

    pub fn handler(&self) -> &ConnectionHandler {
        &self.inner.handler
    }

    /// Number of open `new_connection` scopes.
    pub fn depth(&self) -> usize {
        self.inner.depth.load(Ordering::SeqCst)
    }

    pub fn should_use_sync_fallback(&self, async_variant: bool) -> bool {
        should_use_sync_fallback(async_variant, self.depth())
    }

    /// Lock the blocking registry. Not for use on an async worker while a
    /// fallback operation may be running; use [`sync_to_async`](Self::sync_to_async).
    pub fn blocking(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.inner
            .blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn suspendable(&self) -> &AsyncConnectionRegistry {
        &self.inner.suspendable
    }

    fn blocking_in_atomic_block(&self, alias: &str) -> bool {
        self.blocking()
            .peek(alias)
            .is_some_and(ConnectionHandle::in_atomic_block)
    }

    /// Run `f` against the blocking registry on a blocking worker and relay
    /// its result.
    pub async fn sync_to_async<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut ConnectionRegistry) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.inner.blocking);
        let run = move || {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut registry)
        };
        if Handle::try_current().is_err() {
            return run();
        }
        match tokio::task::spawn_blocking(run).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => resume_unwind(e.into_panic()),
            Err(e) => Err(DbError::internal(format!("blocking task failed: {e}"))),
        }
    }

    /// Open a fresh suspendable connection for `alias`.
    ///
    /// The connection becomes the innermost one for `alias` until the scope is
    /// closed. With `force_rollback` the scope runs in one transaction that is
    /// rolled back on close.
    pub async fn new_connection(&self, alias: &str, force_rollback: bool) -> DbResult<ConnectionScope> {
        let handle = self
            .inner
            .handler
            .create_connection(alias, ExecutionModel::Suspendable)?;
        if !handle.features().supports_async {
            return Err(DbError::not_supported(
                "The database backend does not support asynchronous execution.",
            ));
        }
        if self.blocking_in_atomic_block(alias) {
            return Err(DbError::not_supported(
                "Can't open an async connection while inside of a synchronous transaction block",
            ));
        }

        let conn = AsyncConnection::new(handle);
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        self.inner.suspendable.push(alias, conn.clone());
        let scope = ConnectionScope {
            context: self.clone(),
            alias: alias.to_string(),
            conn,
            force_rollback,
            finished: false,
        };

        let opened = async {
            let mut handle = scope.conn.lock().await;
            handle.ensure_connection().await?;
            if force_rollback {
                handle.set_autocommit(false, false).await?;
            }
            Ok::<_, DbError>(())
        }
        .await;
        if let Err(e) = opened {
            if let Err(close) = scope.close(true).await {
                warn!(alias = %alias, error = %close, "Error closing failed async connection");
            }
            return Err(e);
        }
        debug!(alias = %alias, depth = self.depth(), "Opened async connection");
        Ok(scope)
    }

    /// Run `body` with a fresh suspendable connection, closing it afterwards.
    /// The body's error wins over any error raised while closing.
    pub async fn with_new_connection<T, E, F, Fut>(
        &self,
        alias: &str,
        force_rollback: bool,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(AsyncConnection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let scope = self.new_connection(alias, force_rollback).await?;
        let result = body(scope.connection().clone()).await;
        let closed = scope.close(result.is_err()).await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), closed) => {
                if let Err(close) = closed {
                    warn!(alias = %alias, error = %close, "Error closing async connection");
                }
                Err(e)
            }
        }
    }

    /// The innermost suspendable connection for `alias`.
    pub fn get_connection(&self, alias: &str) -> DbResult<AsyncConnection> {
        self.inner.suspendable.get(alias)
    }

    /// Run `body` in an atomic block, on the innermost suspendable connection
    /// or, outside any `new_connection` scope, on the blocking handle.
    pub async fn atomic<T, E, F, Fut>(&self, atomic: &Atomic, body: F) -> Result<T, E>
    where
        F: FnOnce(BridgedConnection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if !self.should_use_sync_fallback(true) {
            let conn = self.get_connection(atomic.alias())?;
            return atomic
                .run(&conn, |c| body(BridgedConnection::Suspendable(c)))
                .await;
        }

        let alias = atomic.alias().to_string();
        {
            let atomic = atomic.clone();
            let alias = alias.clone();
            self.sync_to_async(move |registry| block_on(atomic.enter(registry.get(&alias)?)))
                .await?;
        }
        let mut guard = FallbackGuard {
            context: self.clone(),
            alias: alias.clone(),
            atomic: atomic.clone(),
            armed: true,
        };

        let result = body(BridgedConnection::Fallback {
            context: self.clone(),
            alias: alias.clone(),
        })
        .await;
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failed
        };
        guard.armed = false;
        let exited = {
            let atomic = atomic.clone();
            let alias = alias.clone();
            self.sync_to_async(move |registry| block_on(atomic.exit(registry.get(&alias)?, outcome)))
                .await
        };

        match (result, exited) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), exited) => {
                if let Err(exit) = exited {
                    warn!(alias = %alias, error = %exit, "Error while exiting failed atomic block");
                }
                Err(e)
            }
        }
    }

    /// Run one statement, on the blocking fallback outside any
    /// `new_connection` scope.
    pub async fn execute(&self, alias: &str, sql: &str) -> DbResult<u64> {
        if self.should_use_sync_fallback(true) {
            let alias = alias.to_string();
            let sql = sql.to_string();
            return self
                .sync_to_async(move |registry| block_on(registry.get(&alias)?.execute(&sql)))
                .await;
        }
        self.get_connection(alias)?.execute(sql).await
    }

    /// Close every suspendable connection and every blocking handle.
    pub async fn close_all(&self) -> DbResult<()> {
        for conn in self.inner.suspendable.all() {
            if let Err(e) = conn.close().await {
                warn!(alias = %conn.alias(), error = %e, "Error closing async connection");
            }
        }
        self.sync_to_async(|registry| {
            block_on(registry.close_all());
            Ok(())
        })
        .await
    }

    /// Unregister a scope's connection.
    fn leave_scope(&self, alias: &str, conn: &AsyncConnection) {
        self.inner.depth.fetch_sub(1, Ordering::SeqCst);
        self.inner.suspendable.pop(alias, conn);
        debug!(alias = %alias, depth = self.depth(), "Left async connection scope");
    }
}

/// Commit (or roll back) a scope's open manual-commit transaction, then
/// close its connection.
async fn settle_and_close(conn: &AsyncConnection, force_rollback: bool, failed: bool) -> DbResult<()> {
    let mut handle = conn.lock().await;
    let settled = if handle.is_connected() {
        match handle.get_autocommit().await {
            Ok(true) => Ok(()),
            Ok(false) if failed || force_rollback => handle.rollback().await,
            Ok(false) => handle.commit().await,
            Err(e) => Err(e),
        }
    } else {
        Ok(())
    };
    let closed = handle.close().await;
    settled.and(closed)
}

/// An open `new_connection` scope. Close it with [`close`](Self::close);
/// a scope dropped while open is rolled back and closed in the background.
pub struct ConnectionScope {
    context: ExecutionContext,
    alias: String,
    conn: AsyncConnection,
    force_rollback: bool,
    finished: bool,
}

impl std::fmt::Debug for ConnectionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionScope")
            .field("alias", &self.alias)
            .field("force_rollback", &self.force_rollback)
            .finish_non_exhaustive()
    }
}

impl ConnectionScope {
    pub fn connection(&self) -> &AsyncConnection {
        &self.conn
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Commit (or roll back when `failed` or forced) any open manual-commit
    /// transaction, then close the connection.
    pub async fn close(mut self, failed: bool) -> DbResult<()> {
        self.finished = true;
        let result = settle_and_close(&self.conn, self.force_rollback, failed).await;
        self.context.leave_scope(&self.alias, &self.conn);
        result
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.context.leave_scope(&self.alias, &self.conn);
        let Ok(runtime) = Handle::try_current() else {
            warn!(alias = %self.alias, "Async connection dropped outside a runtime; not closed");
            return;
        };
        let alias = self.alias.clone();
        let conn = self.conn.clone();
        let force_rollback = self.force_rollback;
        runtime.spawn(async move {
            if let Err(e) = settle_and_close(&conn, force_rollback, true).await {
                warn!(alias = %alias, error = %e, "Error closing dropped async connection");
            }
        });
    }
}

/// Exits a fallback atomic block whose future was dropped.
struct FallbackGuard {
    context: ExecutionContext,
    alias: String,
    atomic: Atomic,
    armed: bool,
}

impl Drop for FallbackGuard {
    fn drop(&mut self) {
        if !self.armed || Handle::try_current().is_err() {
            return;
        }
        let registry = Arc::clone(&self.context.inner.blocking);
        let alias = self.alias.clone();
        let atomic = self.atomic.clone();
        tokio::task::spawn_blocking(move || {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            let exited = registry
                .get(&alias)
                .and_then(|handle| block_on(atomic.exit(handle, Outcome::Cancelled)));
            if let Err(e) = exited {
                warn!(alias = %alias, error = %e, "Error while exiting cancelled atomic block");
            }
        });
    }
}

/// The connection an atomic block body runs against.
#[derive(Clone, Debug)]
pub enum BridgedConnection {
    Suspendable(AsyncConnection),
    Fallback {
        context: ExecutionContext,
        alias: String,
    },
}

impl BridgedConnection {
    pub fn alias(&self) -> &str {
        match self {
            Self::Suspendable(conn) => conn.alias(),
            Self::Fallback { alias, .. } => alias,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    /// Run `f` with exclusive access to the underlying handle.
    pub async fn with_handle<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&'a mut ConnectionHandle) -> BoxFuture<'a, DbResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Self::Suspendable(conn) => {
                let mut handle = conn.lock().await;
                f(&mut *handle).await
            }
            Self::Fallback { context, alias } => {
                let alias = alias.clone();
                context
                    .sync_to_async(move |registry| block_on(f(registry.get(&alias)?)))
                    .await
            }
        }
    }

    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        let sql = sql.to_string();
        self.with_handle(move |h| Box::pin(async move { h.execute(&sql).await }))
            .await
    }

    pub async fn fetch_all(&self, sql: &str) -> DbResult<Vec<Row>> {
        let sql = sql.to_string();
        self.with_handle(move |h| Box::pin(async move { h.fetch_all(&sql).await }))
            .await
    }

    pub async fn get_rollback(&self) -> DbResult<bool> {
        self.with_handle(|h| Box::pin(async move { h.get_rollback() }))
            .await
    }

    pub async fn set_rollback(&self, rollback: bool) -> DbResult<()> {
        self.with_handle(move |h| Box::pin(async move { h.set_rollback(rollback) }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseSettings, Settings};
    use crate::db::atomic::atomic;
    use crate::db::memory::MemoryDriver;

    fn context(driver: Arc<MemoryDriver>) -> ExecutionContext {
        let settings = Settings::new()
            .with_database("default", DatabaseSettings::new("memory").with_name("ctx"));
        ExecutionContext::new(
            ConnectionHandler::builder(settings)
                .driver("memory", driver)
                .build(),
        )
    }

    #[test]
    fn test_should_use_sync_fallback() {
        assert!(should_use_sync_fallback(true, 0));
        assert!(!should_use_sync_fallback(true, 1));
        assert!(!should_use_sync_fallback(false, 0));
    }

    #[test]
    fn test_block_on_without_runtime() {
        assert_eq!(block_on(async { 7 }), 7);
    }

    #[tokio::test]
    async fn test_block_on_inside_current_thread_runtime() {
        let value = block_on(async {
            assert!(Handle::try_current().is_ok());
            42
        });
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_on_inside_multi_thread_runtime() {
        let value = block_on(async {
            tokio::task::yield_now().await;
            5
        });
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_new_connection_scope_depth_and_commit() {
        let driver = Arc::new(MemoryDriver::new());
        let ctx = context(driver.clone());
        assert!(ctx.should_use_sync_fallback(true));

        let scope = ctx.new_connection("default", false).await.unwrap();
        assert_eq!(ctx.depth(), 1);
        assert!(!ctx.should_use_sync_fallback(true));
        assert!(ctx.get_connection("default").unwrap().ptr_eq(scope.connection()));

        ctx.execute("default", "INSERT 1").await.unwrap();
        scope.close(false).await.unwrap();

        assert_eq!(ctx.depth(), 0);
        assert!(ctx.get_connection("default").is_err());
        assert_eq!(driver.database("ctx").committed(), vec!["INSERT 1"]);
        assert_eq!(driver.database("ctx").open_connections(), 0);
    }

    #[tokio::test]
    async fn test_force_rollback_scope() {
        let driver = Arc::new(MemoryDriver::new());
        let ctx = context(driver.clone());
        let result: DbResult<()> = ctx
            .with_new_connection("default", true, |conn| async move {
                conn.execute("INSERT 1").await?;
                Ok(())
            })
            .await;
        result.unwrap();
        assert!(driver.database("ctx").committed().is_empty());
        assert_eq!(ctx.depth(), 0);
    }

    #[tokio::test]
    async fn test_new_connection_requires_async_support() {
        let ctx = context(Arc::new(MemoryDriver::new().blocking_only()));
        let err = ctx.new_connection("default", false).await.unwrap_err();
        assert!(matches!(err, DbError::NotSupported { .. }));
        assert_eq!(ctx.depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_connection_rejected_inside_blocking_atomic_block() {
        let ctx = context(Arc::new(MemoryDriver::new()));
        ctx.sync_to_async(|registry| block_on(atomic("default").enter(registry.get("default")?)))
            .await
            .unwrap();

        let err = ctx.new_connection("default", false).await.unwrap_err();
        assert!(matches!(err, DbError::NotSupported { .. }));
        assert!(err.to_string().contains("synchronous transaction block"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_atomic_falls_back_outside_scope() {
        let driver = Arc::new(MemoryDriver::new());
        let ctx = context(driver.clone());
        let result: DbResult<()> = ctx
            .atomic(&atomic("default"), |conn| async move {
                assert!(conn.is_fallback());
                conn.execute("INSERT 1").await?;
                assert!(!conn.get_rollback().await?);
                Ok(())
            })
            .await;
        result.unwrap();
        assert_eq!(driver.database("ctx").committed(), vec!["INSERT 1"]);
        assert!(!ctx.blocking().peek("default").unwrap().in_atomic_block());
    }

    #[tokio::test]
    async fn test_atomic_uses_scope_connection() {
        let driver = Arc::new(MemoryDriver::new());
        let ctx = context(driver.clone());
        let result: DbResult<()> = ctx
            .with_new_connection("default", false, |_| {
                let ctx = ctx.clone();
                async move {
                    ctx.atomic(&atomic("default"), |conn| async move {
                        assert!(!conn.is_fallback());
                        conn.execute("INSERT 1").await?;
                        conn.set_rollback(true).await
                    })
                    .await
                }
            })
            .await;
        result.unwrap();
        assert!(driver.database("ctx").committed().is_empty());
        assert!(ctx.blocking().peek("default").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fallback_relays_errors_verbatim() {
        let driver = Arc::new(MemoryDriver::new());
        let ctx = context(driver.clone());
        ctx.execute("default", "SELECT 1").await.unwrap();
        driver
            .database("ctx")
            .fail_next(crate::db::memory::FaultPoint::Execute);
        let err = ctx.execute("default", "SELECT 1").await.unwrap_err();
        assert_eq!(err.to_string(), "OperationalError: injected failure at Execute");
    }
}
