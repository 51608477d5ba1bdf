//! Shared entry point that turns settings into connection handles.
//!
//! A [`ConnectionHandler`] is cheap to clone and is shared by every registry
//! and execution context. It owns the settings, the engine drivers, the
//! connection pools (one registry per execution model) and the signals.

use crate::config::{DatabaseSettings, Settings};
use crate::db::driver::Driver;
use crate::db::handle::ConnectionHandle;
use crate::db::pool::{ConnectionPool, PoolRegistry};
use crate::db::session::SessionSetup;
use crate::db::signals::Signals;
use crate::db::sqlx_driver::SqlxDriver;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionParams, ExecutionModel, IsolationLevel};
use std::collections::HashMap;
use std::sync::Arc;

struct HandlerInner {
    settings: Settings,
    drivers: HashMap<String, Arc<dyn Driver>>,
    blocking_pools: PoolRegistry,
    suspendable_pools: PoolRegistry,
    signals: Signals,
}

#[derive(Clone)]
pub struct ConnectionHandler {
    inner: Arc<HandlerInner>,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut engines: Vec<_> = self.inner.drivers.keys().collect();
        engines.sort();
        f.debug_struct("ConnectionHandler")
            .field("aliases", &self.aliases())
            .field("engines", &engines)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ConnectionHandler`].
pub struct HandlerBuilder {
    settings: Settings,
    drivers: HashMap<String, Arc<dyn Driver>>,
    signals: Signals,
}

impl HandlerBuilder {
    /// Register (or replace) the driver for an engine name.
    pub fn driver(mut self, engine: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(engine.into(), driver);
        self
    }

    pub fn signals(mut self, signals: Signals) -> Self {
        self.signals = signals;
        self
    }

    pub fn build(self) -> ConnectionHandler {
        ConnectionHandler {
            inner: Arc::new(HandlerInner {
                settings: self.settings,
                drivers: self.drivers,
                blocking_pools: PoolRegistry::new(),
                suspendable_pools: PoolRegistry::new(),
                signals: self.signals,
            }),
        }
    }
}

impl ConnectionHandler {
    /// Handler with the sqlx drivers registered for `postgresql` and `sqlite`.
    pub fn new(settings: Settings) -> Self {
        Self::builder(settings).build()
    }

    pub fn builder(settings: Settings) -> HandlerBuilder {
        let mut drivers: HashMap<String, Arc<dyn Driver>> = HashMap::new();
        drivers.insert("postgresql".to_string(), Arc::new(SqlxDriver::postgres()));
        drivers.insert("sqlite".to_string(), Arc::new(SqlxDriver::sqlite()));
        HandlerBuilder {
            settings,
            drivers,
            signals: Signals::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn database(&self, alias: &str) -> DbResult<&DatabaseSettings> {
        self.inner.settings.database(alias)
    }

    /// Every configured alias, whether or not a connection exists for it.
    pub fn aliases(&self) -> Vec<String> {
        self.inner.settings.aliases().map(str::to_string).collect()
    }

    pub fn signals(&self) -> &Signals {
        &self.inner.signals
    }

    pub fn driver_for(&self, alias: &str) -> DbResult<Arc<dyn Driver>> {
        let settings = self.database(alias)?;
        let engine = settings.engine_name();
        self.inner.drivers.get(engine).cloned().ok_or_else(|| {
            DbError::improperly_configured(format!(
                "No driver registered for engine '{}' (alias '{alias}').",
                settings.engine
            ))
        })
    }

    /// Build an unconnected handle. No I/O happens until first use.
    pub fn create_connection(&self, alias: &str, model: ExecutionModel) -> DbResult<ConnectionHandle> {
        ConnectionHandle::new(self.clone(), alias, model)
    }

    /// Time zone new connections of `alias` are put in, if any.
    pub fn timezone_name(&self, alias: &str) -> DbResult<Option<String>> {
        let db = self.database(alias)?;
        let settings = self.settings();
        if !settings.use_tz {
            return Ok(settings.time_zone.clone());
        }
        Ok(Some(db.time_zone.clone().unwrap_or_else(|| "UTC".to_string())))
    }

    /// Session configuration applied to each new connection of `alias`.
    pub fn session_setup(&self, alias: &str) -> DbResult<SessionSetup> {
        let db = self.database(alias)?;
        let isolation_level = db
            .options
            .isolation_level
            .as_deref()
            .map(IsolationLevel::parse)
            .transpose()?;
        Ok(SessionSetup::new(
            self.driver_for(alias)?,
            self.timezone_name(alias)?,
            db.options.assume_role.clone(),
            isolation_level,
        ))
    }

    fn pools(&self, model: ExecutionModel) -> &PoolRegistry {
        match model {
            ExecutionModel::Blocking => &self.inner.blocking_pools,
            ExecutionModel::Suspendable => &self.inner.suspendable_pools,
        }
    }

    /// The pool for `alias` in `model`, created on first use. `None` when the
    /// alias is not pooled.
    pub async fn pool(
        &self,
        alias: &str,
        model: ExecutionModel,
    ) -> DbResult<Option<Arc<ConnectionPool>>> {
        let db = self.database(alias)?;
        let Some(options) = db.pool_options() else {
            return Ok(None);
        };
        if db.conn_max_age != Some(0) {
            return Err(DbError::improperly_configured(
                "Pooling doesn't support persistent connections.",
            ));
        }

        let options = &options;
        let pool = self
            .pools(model)
            .get_or_create(alias, move || async move {
                let params = ConnectionParams::from_settings(db)?;
                let setup = Arc::new(self.session_setup(alias)?);
                ConnectionPool::open(
                    alias,
                    self.driver_for(alias)?,
                    params,
                    options,
                    setup,
                    db.conn_health_checks,
                )
                .await
            })
            .await?;
        Ok(Some(pool))
    }

    /// Close the pool for `alias` in `model`; returns whether one was open.
    pub async fn close_pool(&self, alias: &str, model: ExecutionModel) -> bool {
        self.pools(model).close(alias).await
    }

    /// Close every pool of both models.
    pub async fn close_pools(&self) {
        self.inner.blocking_pools.close_all().await;
        self.inner.suspendable_pools.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolOptions, PoolSetting};
    use crate::db::memory::MemoryDriver;

    fn handler(db: DatabaseSettings) -> ConnectionHandler {
        ConnectionHandler::builder(Settings::new().with_database("default", db))
            .driver("memory", Arc::new(MemoryDriver::new()))
            .build()
    }

    #[test]
    fn test_unknown_engine() {
        let handler = handler(DatabaseSettings::new("oracle").with_name("x"));
        let err = handler.driver_for("default").err().unwrap();
        assert!(matches!(err, DbError::ImproperlyConfigured { .. }));
        assert!(matches!(
            handler.driver_for("other"),
            Err(DbError::ConnectionDoesNotExist { .. })
        ));
    }

    #[test]
    fn test_timezone_name() {
        let mut db = DatabaseSettings::new("memory").with_name("x");
        let h = handler(db.clone());
        assert_eq!(h.timezone_name("default").unwrap().as_deref(), Some("UTC"));

        db.time_zone = Some("Europe/Paris".to_string());
        let h = handler(db);
        assert_eq!(
            h.timezone_name("default").unwrap().as_deref(),
            Some("Europe/Paris")
        );
    }

    #[tokio::test]
    async fn test_pool_rejects_persistent_connections() {
        let mut db = DatabaseSettings::new("memory").with_name("x");
        db.options.pool = Some(PoolSetting::Enabled(true));
        db.conn_max_age = None;
        let h = handler(db);
        let err = h.pool("default", ExecutionModel::Blocking).await.unwrap_err();
        assert!(matches!(err, DbError::ImproperlyConfigured { .. }));
        assert!(err.to_string().contains("Pooling doesn't support persistent connections."));
    }

    #[tokio::test]
    async fn test_pools_are_separate_per_model() {
        let mut db = DatabaseSettings::new("memory").with_name("x");
        db.options.pool = Some(PoolSetting::Options(PoolOptions {
            max_size: Some(2),
            ..PoolOptions::default()
        }));
        let h = handler(db);

        let blocking = h.pool("default", ExecutionModel::Blocking).await.unwrap().unwrap();
        let suspendable = h
            .pool("default", ExecutionModel::Suspendable)
            .await
            .unwrap()
            .unwrap();
        assert!(!Arc::ptr_eq(&blocking, &suspendable));
        assert_eq!(blocking.max_size(), 2);

        assert!(h.close_pool("default", ExecutionModel::Blocking).await);
        assert!(blocking.is_closed());
        assert!(!suspendable.is_closed());
        h.close_pools().await;
        assert!(suspendable.is_closed());
    }

    #[tokio::test]
    async fn test_unpooled_alias_has_no_pool() {
        let h = handler(DatabaseSettings::new("memory").with_name("x"));
        assert!(h.pool("default", ExecutionModel::Blocking).await.unwrap().is_none());
    }
}
