//! Driver for PostgreSQL and SQLite built on sqlx.
//!
//! sqlx connections have no autocommit switch, so the session emulates one:
//! with autocommit off, the first statement of a transaction is preceded by
//! `BEGIN`, and `COMMIT`/`ROLLBACK` end it. SQLite instead opens transactions
//! explicitly (`start_transaction_under_autocommit`).
//!
//! Statements go out as plain SQL over the simple query protocol. With
//! `OPTIONS.server_side_binding` a PostgreSQL session prepares them on the
//! server instead.

use crate::db::driver::{Driver, DriverConnection, DriverFeatures, Row as JsonRow};
use crate::db::macros::impl_session_dispatch;
use crate::db::types::RowToJson;
use crate::error::{DatabaseErrorKind, DbError, DbResult};
use crate::models::{ConnectionParams, DatabaseType, IsolationLevel};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Executor, Row};
use std::str::FromStr;
use tracing::debug;

/// A live backend session.
#[derive(Debug)]
pub enum Session {
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

/// One sqlx session plus the emulated autocommit state.
#[derive(Debug)]
pub struct SqlxConnection {
    session: Option<Session>,
    db_type: DatabaseType,
    server_side_binding: bool,
    autocommit: bool,
    in_transaction: bool,
}

impl SqlxConnection {
    fn session(&mut self) -> DbResult<&mut Session> {
        self.session.as_mut().ok_or_else(|| {
            DbError::database(
                DatabaseErrorKind::Interface,
                "connection already closed",
                None,
            )
        })
    }

    /// Run a statement without any implicit `BEGIN`.
    async fn raw_execute(&mut self, sql: &str) -> DbResult<u64> {
        let prepare = self.server_side_binding;
        let session = self.session()?;
        let affected = impl_session_dispatch!(session, conn => {
            let done = if prepare {
                conn.execute(sqlx::query(sql)).await?
            } else {
                conn.execute(sql).await?
            };
            done.rows_affected()
        });
        Ok(affected)
    }

    async fn begin_if_needed(&mut self) -> DbResult<()> {
        if !self.autocommit && !self.in_transaction {
            self.raw_execute("BEGIN").await?;
            self.in_transaction = true;
        }
        Ok(())
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }
}

#[async_trait]
impl DriverConnection for SqlxConnection {
    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.begin_if_needed().await?;
        self.raw_execute(sql).await
    }

    async fn fetch_all(&mut self, sql: &str) -> DbResult<Vec<JsonRow>> {
        self.begin_if_needed().await?;
        let prepare = self.server_side_binding;
        let session = self.session()?;
        let rows: Vec<JsonRow> = impl_session_dispatch!(session, conn => {
            let rows = if prepare {
                conn.fetch_all(sqlx::query(sql)).await?
            } else {
                conn.fetch_all(sql).await?
            };
            rows.iter().map(RowToJson::to_json_map).collect()
        });
        Ok(rows)
    }

    async fn set_autocommit(&mut self, autocommit: bool) -> DbResult<()> {
        if autocommit && self.in_transaction {
            return Err(DbError::database(
                DatabaseErrorKind::Programming,
                "autocommit cannot be enabled inside a transaction",
                None,
            ));
        }
        self.autocommit = autocommit;
        Ok(())
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.raw_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        if self.in_transaction {
            self.raw_execute("COMMIT").await?;
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.raw_execute("ROLLBACK").await?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> DbResult<()> {
        let session = self.session()?;
        impl_session_dispatch!(session, conn => conn.ping().await?);
        Ok(())
    }

    async fn time_zone(&mut self) -> DbResult<Option<String>> {
        let session = self.session()?;
        match session {
            Session::Postgres(conn) => {
                let row = conn.fetch_one("SHOW TIME ZONE").await?;
                Ok(Some(row.try_get::<String, _>(0)?))
            }
            Session::SQLite(_) => Ok(None),
        }
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    async fn close(&mut self) -> DbResult<()> {
        self.in_transaction = false;
        match self.session.take() {
            Some(session) => {
                impl_session_dispatch!(session, conn => conn.close().await?);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Opens PostgreSQL or SQLite sessions.
#[derive(Debug, Clone, Copy)]
pub struct SqlxDriver {
    db_type: DatabaseType,
}

impl SqlxDriver {
    pub fn new(db_type: DatabaseType) -> Self {
        Self { db_type }
    }

    pub fn postgres() -> Self {
        Self::new(DatabaseType::PostgreSQL)
    }

    pub fn sqlite() -> Self {
        Self::new(DatabaseType::SQLite)
    }

    fn pg_options(params: &ConnectionParams) -> DbResult<PgConnectOptions> {
        if params.database.is_none() && params.service.is_some() {
            return Err(DbError::not_supported(
                "connection services are not supported by the sqlx driver; supply NAME",
            ));
        }
        let mut opts = PgConnectOptions::new();
        if let Some(host) = &params.host {
            opts = opts.host(host);
        }
        opts = opts.port(
            params
                .port
                .or(DatabaseType::PostgreSQL.default_port())
                .unwrap_or(5432),
        );
        if let Some(user) = &params.user {
            opts = opts.username(user);
        }
        if let Some(password) = &params.password {
            opts = opts.password(password);
        }
        if let Some(name) = &params.database {
            opts = opts.database(name);
        }
        for (key, value) in &params.extra {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match key.as_str() {
                "sslmode" => {
                    let mode = PgSslMode::from_str(&value).map_err(|e| {
                        DbError::improperly_configured(format!("Invalid sslmode '{value}': {e}"))
                    })?;
                    opts = opts.ssl_mode(mode);
                }
                "application_name" => opts = opts.application_name(&value),
                other => debug!(option = %other, "Ignoring unsupported PostgreSQL option"),
            }
        }
        Ok(opts)
    }

    /// Whether statements are prepared on the server. SQLite always
    /// prepares them locally, so the option only applies to PostgreSQL.
    fn server_side_binding(&self, params: &ConnectionParams) -> bool {
        self.db_type == DatabaseType::PostgreSQL && params.server_side_binding
    }

    fn sqlite_options(params: &ConnectionParams) -> DbResult<SqliteConnectOptions> {
        let name = params.database_name();
        if name == ":memory:" {
            return Ok(SqliteConnectOptions::from_str("sqlite::memory:")?);
        }
        Ok(SqliteConnectOptions::new()
            .filename(name)
            .create_if_missing(true))
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    fn vendor(&self) -> &'static str {
        match self.db_type {
            DatabaseType::PostgreSQL => "postgresql",
            DatabaseType::SQLite => "sqlite",
        }
    }

    fn features(&self) -> DriverFeatures {
        match self.db_type {
            DatabaseType::PostgreSQL => DriverFeatures {
                supports_timezones: true,
                supports_roles: true,
                ..DriverFeatures::default()
            },
            DatabaseType::SQLite => DriverFeatures {
                start_transaction_under_autocommit: true,
                ..DriverFeatures::default()
            },
        }
    }

    async fn connect(&self, params: &ConnectionParams) -> DbResult<Box<dyn DriverConnection>> {
        let session = match self.db_type {
            DatabaseType::PostgreSQL => {
                let opts = Self::pg_options(params)?;
                Session::Postgres(PgConnection::connect_with(&opts).await?)
            }
            DatabaseType::SQLite => {
                let opts = Self::sqlite_options(params)?;
                Session::SQLite(SqliteConnection::connect_with(&opts).await?)
            }
        };
        debug!(
            db_type = %self.db_type,
            database = %params.database_name(),
            "Opened sqlx session"
        );
        Ok(Box::new(SqlxConnection {
            session: Some(session),
            db_type: self.db_type,
            server_side_binding: self.server_side_binding(params),
            autocommit: true,
            in_transaction: false,
        }))
    }

    fn isolation_level_sql(&self, level: IsolationLevel) -> Option<String> {
        match self.db_type {
            DatabaseType::PostgreSQL => Some(format!(
                "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            )),
            // SQLite transactions are always serializable.
            DatabaseType::SQLite => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;

    #[test]
    fn test_features_by_backend() {
        let pg = SqlxDriver::postgres().features();
        assert!(pg.supports_timezones);
        assert!(!pg.start_transaction_under_autocommit);

        let sqlite = SqlxDriver::sqlite().features();
        assert!(sqlite.start_transaction_under_autocommit);
        assert!(!sqlite.supports_roles);
        assert!(SqlxDriver::sqlite().set_role_sql("admin").is_none());
    }

    #[test]
    fn test_sqlite_has_no_isolation_sql() {
        assert!(
            SqlxDriver::sqlite()
                .isolation_level_sql(IsolationLevel::Serializable)
                .is_none()
        );
        assert!(
            SqlxDriver::postgres()
                .isolation_level_sql(IsolationLevel::ReadCommitted)
                .is_some()
        );
    }

    #[test]
    fn test_pg_options_reject_service_without_name() {
        let mut settings = DatabaseSettings::new("postgresql");
        settings.options.service = Some("billing".to_string());
        let params = ConnectionParams::from_settings(&settings).unwrap();
        assert!(matches!(
            SqlxDriver::pg_options(&params),
            Err(DbError::NotSupported { .. })
        ));
    }

    #[test]
    fn test_pg_options_invalid_sslmode() {
        let mut settings = DatabaseSettings::new("postgresql").with_name("app");
        settings
            .options
            .extra
            .insert("sslmode".to_string(), serde_json::json!("sometimes"));
        let params = ConnectionParams::from_settings(&settings).unwrap();
        assert!(SqlxDriver::pg_options(&params).is_err());
    }

    #[test]
    fn test_server_side_binding_is_postgres_only() {
        let mut settings = DatabaseSettings::new("postgresql").with_name("app");
        let params = ConnectionParams::from_settings(&settings).unwrap();
        assert!(!SqlxDriver::postgres().server_side_binding(&params));

        settings.options.server_side_binding = Some(true);
        let params = ConnectionParams::from_settings(&settings).unwrap();
        assert!(SqlxDriver::postgres().server_side_binding(&params));
        assert!(!SqlxDriver::sqlite().server_side_binding(&params));
    }

    #[tokio::test]
    async fn test_sqlite_emulated_autocommit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let params = ConnectionParams::from_settings(
            &DatabaseSettings::new("sqlite").with_name(path.to_string_lossy()),
        )
        .unwrap();
        let mut conn = SqlxDriver::sqlite().connect(&params).await.unwrap();
        conn.execute("CREATE TABLE t (id INTEGER)").await.unwrap();

        conn.set_autocommit(false).await.unwrap();
        conn.execute("INSERT INTO t VALUES (1)").await.unwrap();
        assert!(conn.in_transaction());
        conn.rollback().await.unwrap();
        assert!(!conn.in_transaction());

        conn.execute("INSERT INTO t VALUES (2)").await.unwrap();
        conn.commit().await.unwrap();

        let rows = conn.fetch_all("SELECT id FROM t").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], serde_json::json!(2));
        conn.commit().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.ping().await.is_err());
    }
}
