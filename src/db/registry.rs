//! Context-scoped connection registries.
//!
//! A [`ConnectionRegistry`] owns the blocking handles of one execution
//! context, one per alias, created on first lookup. An
//! [`AsyncConnectionRegistry`] tracks the suspendable connections opened by
//! `new_connection` scopes as a stack per alias. The two never share a handle.

use crate::db::async_connection::AsyncConnection;
use crate::db::handle::ConnectionHandle;
use crate::db::handler::ConnectionHandler;
use crate::error::{DbError, DbResult};
use crate::models::ExecutionModel;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Blocking handles of one execution context, keyed by alias.
#[derive(Debug)]
pub struct ConnectionRegistry {
    handler: ConnectionHandler,
    connections: BTreeMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new(handler: ConnectionHandler) -> Self {
        Self {
            handler,
            connections: BTreeMap::new(),
        }
    }

    pub fn handler(&self) -> &ConnectionHandler {
        &self.handler
    }

    /// The handle for `alias`, created (unconnected) on first lookup.
    pub fn get(&mut self, alias: &str) -> DbResult<&mut ConnectionHandle> {
        if !self.connections.contains_key(alias) {
            let handle = self
                .handler
                .create_connection(alias, ExecutionModel::Blocking)?;
            debug!(alias = %alias, "Created blocking connection handle");
            self.connections.insert(alias.to_string(), handle);
        }
        self.connections
            .get_mut(alias)
            .ok_or_else(|| DbError::connection_does_not_exist(alias))
    }

    /// The handle for `alias` if one was created.
    pub fn peek(&self, alias: &str) -> Option<&ConnectionHandle> {
        self.connections.get(alias)
    }

    /// Every configured alias, whether or not a handle exists for it.
    pub fn aliases(&self) -> Vec<String> {
        self.handler.aliases()
    }

    /// Handles in alias order. Unless `initialized_only`, a handle is created
    /// for every configured alias first.
    pub fn all(&mut self, initialized_only: bool) -> DbResult<Vec<&mut ConnectionHandle>> {
        if !initialized_only {
            for alias in self.handler.aliases() {
                self.get(&alias)?;
            }
        }
        Ok(self.connections.values_mut().collect())
    }

    /// Close every handle's connection. Errors are logged, not returned.
    pub async fn close_all(&mut self) {
        for (alias, handle) in &mut self.connections {
            if let Err(e) = handle.close().await {
                warn!(alias = %alias, error = %e, "Error closing connection");
            }
        }
    }

    pub fn reset_queries(&mut self) {
        for handle in self.connections.values_mut() {
            handle.reset_queries();
        }
    }

    /// Close connections that are broken, past their max age or left in a
    /// non-default autocommit state.
    pub async fn close_old_connections(&mut self) {
        for (alias, handle) in &mut self.connections {
            if let Err(e) = handle.close_if_unusable_or_obsolete().await {
                warn!(alias = %alias, error = %e, "Error closing old connection");
            }
        }
    }

    /// Start-of-request housekeeping.
    pub async fn request_started(&mut self) {
        self.reset_queries();
        self.close_old_connections().await;
    }

    pub async fn request_finished(&mut self) {
        self.close_old_connections().await;
    }
}

/// Suspendable connections opened by `new_connection` scopes. Scopes nest,
/// so each alias holds a stack and lookups see the innermost one.
#[derive(Debug, Default)]
pub struct AsyncConnectionRegistry {
    stacks: Mutex<HashMap<String, Vec<AsyncConnection>>>,
}

impl AsyncConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn stacks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<AsyncConnection>>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, alias: &str, conn: AsyncConnection) {
        self.stacks()
            .entry(alias.to_string())
            .or_default()
            .push(conn);
    }

    /// Remove `conn` from the stack of `alias`; returns whether it was there.
    pub fn pop(&self, alias: &str, conn: &AsyncConnection) -> bool {
        let mut stacks = self.stacks();
        let Some(stack) = stacks.get_mut(alias) else {
            return false;
        };
        let Some(pos) = stack.iter().rposition(|c| c.ptr_eq(conn)) else {
            return false;
        };
        stack.remove(pos);
        if stack.is_empty() {
            stacks.remove(alias);
        }
        true
    }

    /// The innermost open connection for `alias`.
    pub fn get(&self, alias: &str) -> DbResult<AsyncConnection> {
        self.stacks()
            .get(alias)
            .and_then(|stack| stack.last().cloned())
            .ok_or_else(|| {
                DbError::not_supported(format!(
                    "No async connection is open for '{alias}'; open one with new_connection()."
                ))
            })
    }

    /// Every open connection, innermost last within an alias.
    pub fn all(&self) -> Vec<AsyncConnection> {
        let stacks = self.stacks();
        let mut aliases: Vec<_> = stacks.keys().collect();
        aliases.sort();
        aliases
            .into_iter()
            .flat_map(|alias| stacks[alias].iter().cloned())
            .collect()
    }

    pub fn depth(&self, alias: &str) -> usize {
        self.stacks().get(alias).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseSettings, Settings};
    use crate::db::memory::MemoryDriver;
    use std::sync::Arc;

    fn handler(driver: Arc<MemoryDriver>) -> ConnectionHandler {
        let settings = Settings::new()
            .with_database("default", DatabaseSettings::new("memory").with_name("one"))
            .with_database("other", DatabaseSettings::new("memory").with_name("two"));
        ConnectionHandler::builder(settings)
            .driver("memory", driver)
            .build()
    }

    #[tokio::test]
    async fn test_get_creates_one_handle_per_alias() {
        let driver = Arc::new(MemoryDriver::new());
        let mut registry = ConnectionRegistry::new(handler(driver.clone()));
        assert!(registry.peek("default").is_none());

        registry.get("default").unwrap().execute("SELECT 1").await.unwrap();
        registry.get("default").unwrap().execute("SELECT 1").await.unwrap();
        assert_eq!(driver.database("one").connections_opened(), 1);

        assert!(matches!(
            registry.get("missing"),
            Err(DbError::ConnectionDoesNotExist { .. })
        ));
    }

    #[tokio::test]
    async fn test_all_lists_configured_aliases() {
        let mut registry = ConnectionRegistry::new(handler(Arc::new(MemoryDriver::new())));
        registry.get("other").unwrap();
        assert_eq!(registry.all(true).unwrap().len(), 1);

        let aliases: Vec<_> = registry
            .all(false)
            .unwrap()
            .into_iter()
            .map(|h| h.alias().to_string())
            .collect();
        assert_eq!(aliases, vec!["default", "other"]);
        assert_eq!(registry.aliases(), vec!["default", "other"]);
    }

    #[tokio::test]
    async fn test_request_finished_closes_obsolete_connections() {
        let driver = Arc::new(MemoryDriver::new());
        let mut registry = ConnectionRegistry::new(handler(driver.clone()));
        // CONN_MAX_AGE defaults to 0: connections last one request.
        registry.get("default").unwrap().execute("SELECT 1").await.unwrap();
        registry.request_finished().await;
        assert!(!registry.peek("default").unwrap().is_connected());
        assert_eq!(driver.database("one").open_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_all() {
        let driver = Arc::new(MemoryDriver::new());
        let mut registry = ConnectionRegistry::new(handler(driver.clone()));
        registry.get("default").unwrap().execute("SELECT 1").await.unwrap();
        registry.get("other").unwrap().execute("SELECT 1").await.unwrap();
        registry.close_all().await;
        assert_eq!(driver.database("one").open_connections(), 0);
        assert_eq!(driver.database("two").open_connections(), 0);
    }

    #[test]
    fn test_async_registry_stacks() {
        let h = handler(Arc::new(MemoryDriver::new()));
        let registry = AsyncConnectionRegistry::new();
        assert!(matches!(
            registry.get("default"),
            Err(DbError::NotSupported { .. })
        ));

        let outer = AsyncConnection::new(
            h.create_connection("default", ExecutionModel::Suspendable)
                .unwrap(),
        );
        let inner = AsyncConnection::new(
            h.create_connection("default", ExecutionModel::Suspendable)
                .unwrap(),
        );
        registry.push("default", outer.clone());
        registry.push("default", inner.clone());
        assert!(registry.get("default").unwrap().ptr_eq(&inner));
        assert_eq!(registry.depth("default"), 2);

        assert!(registry.pop("default", &inner));
        assert!(!registry.pop("default", &inner));
        assert!(registry.get("default").unwrap().ptr_eq(&outer));
        assert!(registry.pop("default", &outer));
        assert!(registry.all().is_empty());
    }
}
