//! Connection pooling.
//!
//! A [`ConnectionPool`] is a bb8 pool of configured physical connections for
//! one alias. bb8 owns lease and return; this module adds the driver-level
//! connection manager and the cleanup a connection needs before it goes back.
//! [`PoolRegistry`] creates pools lazily, one per alias, with single-flight
//! initialization.

use crate::config::PoolOptions;
use crate::db::driver::{Driver, DriverConnection};
use crate::db::session::ConnectionConfigurer;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionParams;
use async_trait::async_trait;
use bb8::{ManageConnection, RunError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tracing::{debug, info, warn};

/// Opens, validates and retires driver connections for bb8.
pub struct DriverConnectionManager {
    alias: String,
    driver: Arc<dyn Driver>,
    params: ConnectionParams,
    configurer: Arc<dyn ConnectionConfigurer>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for DriverConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConnectionManager")
            .field("alias", &self.alias)
            .field("vendor", &self.driver.vendor())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ManageConnection for DriverConnectionManager {
    type Connection = Box<dyn DriverConnection>;
    type Error = DbError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error(&self.alias));
        }
        let mut conn = self.driver.connect(&self.params).await?;
        if self.configurer.configure(conn.as_mut()).await? && conn.in_transaction() {
            conn.commit().await?;
        }
        debug!(alias = %self.alias, "Pool opened a new connection");
        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.ping().await
    }

    /// Connections come back closed, mid-transaction (a lease dropped
    /// without cleanup) or to a closed pool; none of them is reused.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        self.closed.load(Ordering::Acquire) || conn.is_closed() || conn.in_transaction()
    }
}

fn closed_error(alias: &str) -> DbError {
    DbError::operational(format!("The connection pool for '{alias}' is closed."))
}

/// Bounded pool of physical connections for one alias.
pub struct ConnectionPool {
    alias: String,
    vendor: &'static str,
    inner: bb8::Pool<DriverConnectionManager>,
    max_size: u32,
    timeout: Duration,
    check_on_return: bool,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("alias", &self.alias)
            .field("vendor", &self.vendor)
            .field("max_size", &self.max_size)
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool and eagerly open `min_size` connections.
    ///
    /// `check_on_acquire` pings idle connections before leasing them out.
    pub async fn open(
        alias: impl Into<String>,
        driver: Arc<dyn Driver>,
        params: ConnectionParams,
        options: &PoolOptions,
        configurer: Arc<dyn ConnectionConfigurer>,
        check_on_acquire: bool,
    ) -> DbResult<Arc<Self>> {
        let alias = alias.into();
        options.validate().map_err(|msg| {
            DbError::improperly_configured(format!("Invalid pool options for '{alias}': {msg}"))
        })?;
        if Handle::try_current().is_err() {
            return Err(DbError::not_supported(format!(
                "The connection pool for '{alias}' needs a Tokio runtime."
            )));
        }

        let vendor = driver.vendor();
        let max_size = options.max_size_or_default(vendor == "sqlite");
        let min_size = options.min_size_or_default();
        let timeout = options.timeout_or_default();
        let closed = Arc::new(AtomicBool::new(false));
        let manager = DriverConnectionManager {
            alias: alias.clone(),
            driver,
            params,
            configurer,
            closed: Arc::clone(&closed),
        };

        let inner = bb8::Pool::builder()
            .max_size(max_size)
            .min_idle((min_size > 0).then_some(min_size))
            .connection_timeout(timeout)
            .test_on_check_out(check_on_acquire)
            .retry_connection(false)
            .build(manager)
            .await?;

        info!(
            alias = %alias,
            max_size,
            min_size,
            "Opened connection pool"
        );
        Ok(Arc::new(Self {
            alias,
            vendor,
            inner,
            max_size,
            timeout,
            check_on_return: options.check_on_return_or_default(),
            closed,
        }))
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state().idle_connections as usize
    }

    /// Connections currently leased out.
    pub fn in_use(&self) -> usize {
        let state = self.inner.state();
        state.connections.saturating_sub(state.idle_connections) as usize
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lease_error(&self, err: RunError<DbError>) -> DbError {
        match err {
            RunError::User(e) => e,
            RunError::TimedOut => DbError::timeout(
                format!("acquiring a connection from the '{}' pool", self.alias),
                self.timeout.as_secs(),
            ),
        }
    }

    /// Lease a connection, reusing an idle one when possible.
    pub async fn acquire(self: &Arc<Self>) -> DbResult<PooledConnection> {
        if self.is_closed() {
            return Err(closed_error(&self.alias));
        }
        let lease = self
            .inner
            .get_owned()
            .await
            .map_err(|e| self.lease_error(e))?;
        Ok(PooledConnection {
            lease: Some(lease),
            pool: Arc::clone(self),
        })
    }

    /// Roll back a returned connection and probe it; on failure the
    /// connection is closed so bb8 discards it.
    async fn reset(&self, conn: &mut dyn DriverConnection) {
        let reset = async {
            if self.is_closed() {
                return Err(closed_error(&self.alias));
            }
            if conn.in_transaction() {
                conn.rollback().await?;
            }
            if self.check_on_return {
                conn.ping().await?;
            }
            Ok::<_, DbError>(())
        }
        .await;
        if let Err(e) = reset {
            debug!(alias = %self.alias, error = %e, "Dropping connection on return");
            if let Err(e) = conn.close().await {
                warn!(alias = %self.alias, error = %e, "Failed to close pooled connection");
            }
        }
    }

    /// Close every idle connection and refuse further leases. Leased
    /// connections are closed when they come back.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.inner.state().idle_connections {
            let Ok(mut lease) = self.inner.get().await else {
                break;
            };
            if let Err(e) = lease.close().await {
                warn!(alias = %self.alias, error = %e, "Failed to close pooled connection");
            }
        }
        info!(alias = %self.alias, "Closed connection pool");
    }
}

/// A connection leased from a [`ConnectionPool`].
///
/// Call [`PooledConnection::release`] to return it; a lease that is simply
/// dropped goes back to bb8, which discards it if a transaction is still open.
pub struct PooledConnection {
    lease: Option<bb8::PooledConnection<'static, DriverConnectionManager>>,
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("alias", &self.pool.alias)
            .field("released", &self.lease.is_none())
            .finish()
    }
}

impl PooledConnection {
    pub fn connection(&mut self) -> DbResult<&mut dyn DriverConnection> {
        match self.lease.as_mut() {
            Some(lease) => {
                let conn: &mut Box<dyn DriverConnection> = lease;
                let conn: &mut dyn DriverConnection = conn.as_mut();
                Ok(conn)
            }
            None => Err(DbError::internal("pooled connection already released")),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Return the connection to its pool.
    pub async fn release(mut self) {
        if let Some(mut lease) = self.lease.take() {
            let conn: &mut Box<dyn DriverConnection> = &mut lease;
            self.pool.reset(conn.as_mut()).await;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.lease.is_some() {
            debug!(alias = %self.pool.alias, "Pooled connection dropped without release");
        }
    }
}

/// Lazily created pools keyed by alias.
#[derive(Default)]
pub struct PoolRegistry {
    pools: TokioRwLock<HashMap<String, Arc<OnceCell<Arc<ConnectionPool>>>>>,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry").finish_non_exhaustive()
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the pool for `alias`, creating it with `create` on first use.
    /// Concurrent callers for the same alias wait for a single creation.
    pub async fn get_or_create<F, Fut>(&self, alias: &str, create: F) -> DbResult<Arc<ConnectionPool>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<Arc<ConnectionPool>>>,
    {
        let cell = {
            let pools = self.pools.read().await;
            if let Some(cell) = pools.get(alias) {
                Arc::clone(cell)
            } else {
                drop(pools);
                let mut pools = self.pools.write().await;
                Arc::clone(
                    pools
                        .entry(alias.to_string())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        };

        let pool = cell.get_or_try_init(create).await?;
        Ok(Arc::clone(pool))
    }

    /// The pool for `alias` if it has been created.
    pub async fn get(&self, alias: &str) -> Option<Arc<ConnectionPool>> {
        let pools = self.pools.read().await;
        pools.get(alias).and_then(|cell| cell.get().cloned())
    }

    /// Number of initialized pools.
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|cell| cell.get().is_some()).count()
    }

    /// Close and forget the pool for `alias`; returns whether one existed.
    pub async fn close(&self, alias: &str) -> bool {
        let cell = {
            let mut pools = self.pools.write().await;
            pools.remove(alias)
        };
        match cell.and_then(|cell| cell.get().cloned()) {
            Some(pool) => {
                pool.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut pools = self.pools.write().await;
            pools.drain().collect()
        };
        for (_, cell) in drained {
            if let Some(pool) = cell.get() {
                pool.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::db::memory::{FaultPoint, MemoryDriver};
    use crate::db::session::SessionSetup;

    fn params() -> ConnectionParams {
        ConnectionParams::from_settings(&DatabaseSettings::new("memory").with_name("pool")).unwrap()
    }

    async fn open(driver: &Arc<MemoryDriver>, options: PoolOptions) -> Arc<ConnectionPool> {
        let configurer = Arc::new(SessionSetup::new(driver.clone(), None, None, None));
        ConnectionPool::open("default", driver.clone(), params(), &options, configurer, false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_released_connections_are_reused() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = open(&driver, PoolOptions::default()).await;

        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 1);
        lease.release().await;
        assert_eq!(pool.idle_count(), 1);

        let lease = pool.acquire().await.unwrap();
        lease.release().await;
        assert_eq!(driver.database("pool").connections_opened(), 1);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_min_size_opens_eagerly() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = open(
            &driver,
            PoolOptions {
                min_size: Some(2),
                ..PoolOptions::default()
            },
        )
        .await;
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(driver.database("pool").open_connections(), 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = open(
            &driver,
            PoolOptions {
                max_size: Some(1),
                timeout_secs: Some(1),
                ..PoolOptions::default()
            },
        )
        .await;

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        held.release().await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_return_rolls_back_open_transaction() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = open(&driver, PoolOptions::default()).await;

        let mut lease = pool.acquire().await.unwrap();
        let conn = lease.connection().unwrap();
        conn.set_autocommit(false).await.unwrap();
        conn.execute("INSERT 1").await.unwrap();
        lease.release().await;

        assert!(driver.database("pool").committed().is_empty());
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_in_transaction_is_discarded() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = open(&driver, PoolOptions::default()).await;
        {
            let mut lease = pool.acquire().await.unwrap();
            let conn = lease.connection().unwrap();
            conn.set_autocommit(false).await.unwrap();
            conn.execute("INSERT 1").await.unwrap();
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(driver.database("pool").open_connections(), 0);
        assert!(driver.database("pool").committed().is_empty());
    }

    #[test]
    fn test_open_requires_runtime() {
        let driver = Arc::new(MemoryDriver::new());
        let configurer = Arc::new(SessionSetup::new(driver.clone(), None, None, None));
        let opened = futures::executor::block_on(ConnectionPool::open(
            "default",
            driver,
            params(),
            &PoolOptions::default(),
            configurer,
            false,
        ));
        assert!(matches!(opened, Err(DbError::NotSupported { .. })));
    }

    #[tokio::test]
    async fn test_broken_connection_not_returned() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = open(&driver, PoolOptions::default()).await;

        let lease = pool.acquire().await.unwrap();
        driver.database("pool").fail_next(FaultPoint::Ping);
        lease.release().await;
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_leases() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = open(&driver, PoolOptions::default()).await;
        let lease = pool.acquire().await.unwrap();
        pool.close().await;
        assert!(pool.acquire().await.is_err());

        lease.release().await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(driver.database("pool").open_connections(), 0);
    }

    #[tokio::test]
    async fn test_registry_creates_once() {
        let driver = Arc::new(MemoryDriver::new());
        let registry = PoolRegistry::new();
        let first = registry
            .get_or_create("default", || async {
                Ok(open(&driver, PoolOptions::default()).await)
            })
            .await
            .unwrap();
        let second = registry
            .get_or_create("default", || async {
                Err::<Arc<ConnectionPool>, _>(DbError::internal("should not be called"))
            })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.pool_count().await, 1);

        assert!(registry.close("default").await);
        assert!(first.is_closed());
        assert!(registry.get("default").await.is_none());
        assert!(!registry.close("default").await);
    }
}
