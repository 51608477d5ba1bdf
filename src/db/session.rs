//! Post-connect session configuration: time zone, role and isolation level.
//!
//! Direct connections are configured by their handle right after connecting;
//! pooled connections are configured once by the pool when it opens them.

use crate::db::driver::{Driver, DriverConnection};
use crate::error::DbResult;
use crate::models::IsolationLevel;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Applied to every new physical connection before first use.
#[async_trait]
pub trait ConnectionConfigurer: Send + Sync {
    /// Configure `conn`; returns true when the changes need a commit to stick.
    async fn configure(&self, conn: &mut dyn DriverConnection) -> DbResult<bool>;
}

/// Session settings resolved for one alias.
#[derive(Clone)]
pub struct SessionSetup {
    driver: Arc<dyn Driver>,
    time_zone: Option<String>,
    role: Option<String>,
    isolation_level: Option<IsolationLevel>,
}

impl std::fmt::Debug for SessionSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSetup")
            .field("vendor", &self.driver.vendor())
            .field("time_zone", &self.time_zone)
            .field("role", &self.role)
            .field("isolation_level", &self.isolation_level)
            .finish()
    }
}

impl SessionSetup {
    pub fn new(
        driver: Arc<dyn Driver>,
        time_zone: Option<String>,
        role: Option<String>,
        isolation_level: Option<IsolationLevel>,
    ) -> Self {
        Self {
            driver,
            time_zone,
            role,
            isolation_level,
        }
    }

    /// Set the session time zone if it differs from the server's.
    pub async fn configure_time_zone(&self, conn: &mut dyn DriverConnection) -> DbResult<bool> {
        let Some(tz) = self.time_zone.as_deref() else {
            return Ok(false);
        };
        let Some(sql) = self.driver.set_time_zone_sql(tz) else {
            return Ok(false);
        };
        if conn.time_zone().await?.as_deref() == Some(tz) {
            return Ok(false);
        }
        conn.execute(&sql).await?;
        debug!(time_zone = %tz, "Configured session time zone");
        Ok(true)
    }

    pub async fn configure_role(&self, conn: &mut dyn DriverConnection) -> DbResult<bool> {
        let Some(role) = self.role.as_deref() else {
            return Ok(false);
        };
        let Some(sql) = self.driver.set_role_sql(role) else {
            return Ok(false);
        };
        conn.execute(&sql).await?;
        debug!(role = %role, "Assumed session role");
        Ok(true)
    }

    pub async fn configure_isolation_level(&self, conn: &mut dyn DriverConnection) -> DbResult<()> {
        let Some(level) = self.isolation_level else {
            return Ok(());
        };
        if let Some(sql) = self.driver.isolation_level_sql(level) {
            conn.execute(&sql).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionConfigurer for SessionSetup {
    async fn configure(&self, conn: &mut dyn DriverConnection) -> DbResult<bool> {
        self.configure_isolation_level(conn).await?;
        let commit_tz = self.configure_time_zone(conn).await?;
        let commit_role = self.configure_role(conn).await?;
        Ok(commit_tz || commit_role)
    }
}
