//! Connection lifecycle hooks.
//!
//! `connection_created` receivers run right after a physical connection is
//! opened and configured, for blocking and suspendable handles alike. They may
//! issue statements on the fresh connection; a failing receiver fails the
//! connect.

use crate::db::driver::DriverConnection;
use crate::error::{DbError, DbResult};
use crate::models::ExecutionModel;
use futures::future::BoxFuture;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

type ConnectionCreatedFn = dyn for<'a> Fn(&'a str, ExecutionModel, &'a mut dyn DriverConnection) -> BoxFuture<'a, DbResult<()>>
    + Send
    + Sync;

#[derive(Clone)]
struct Receiver {
    name: String,
    hook: Arc<ConnectionCreatedFn>,
}

/// Registered lifecycle receivers.
#[derive(Clone, Default)]
pub struct Signals {
    connection_created: Arc<RwLock<Vec<Receiver>>>,
}

impl std::fmt::Debug for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signals")
            .field("connection_created", &self.receiver_names())
            .finish()
    }
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a `connection_created` receiver. A receiver registered again
    /// under the same name replaces the earlier one.
    pub fn connect_connection_created<F>(&self, name: impl Into<String>, hook: F)
    where
        F: for<'a> Fn(&'a str, ExecutionModel, &'a mut dyn DriverConnection) -> BoxFuture<'a, DbResult<()>>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let mut receivers = self
            .connection_created
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        receivers.retain(|r| r.name != name);
        receivers.push(Receiver {
            name,
            hook: Arc::new(hook),
        });
    }

    /// Remove a receiver; returns whether it was registered.
    pub fn disconnect_connection_created(&self, name: &str) -> bool {
        let mut receivers = self
            .connection_created
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = receivers.len();
        receivers.retain(|r| r.name != name);
        receivers.len() != before
    }

    pub fn receiver_names(&self) -> Vec<String> {
        self.connection_created
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    /// Run every receiver in registration order.
    pub async fn send_connection_created(
        &self,
        alias: &str,
        model: ExecutionModel,
        conn: &mut dyn DriverConnection,
    ) -> DbResult<()> {
        let receivers = self
            .connection_created
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for receiver in receivers {
            debug!(alias = %alias, receiver = %receiver.name, "Sending connection_created");
            (receiver.hook)(alias, model, &mut *conn)
                .await
                .map_err(|e| DbError::hook(&receiver.name, e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_replaces_same_name() {
        let signals = Signals::new();
        signals.connect_connection_created("a", |_, _, _| Box::pin(async { Ok(()) }));
        signals.connect_connection_created("b", |_, _, _| Box::pin(async { Ok(()) }));
        signals.connect_connection_created("a", |_, _, _| Box::pin(async { Ok(()) }));
        assert_eq!(signals.receiver_names(), vec!["b", "a"]);
        assert!(signals.disconnect_connection_created("b"));
        assert!(!signals.disconnect_connection_created("b"));
    }
}
