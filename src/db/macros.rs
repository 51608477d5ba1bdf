//! Dispatch macros for the sqlx-backed driver.
//!
//! The macros expand to a `match` over the backend variants of a session so
//! backend-generic code stays linear. They expand at compile time with zero
//! runtime overhead.

/// Macro for generating session dispatch match arms.
///
/// The body is written once and type-checked separately per backend.
///
/// # Example
///
/// ```ignore
/// let affected = impl_session_dispatch!(session, conn => {
///     conn.execute(sql).await?.rows_affected()
/// });
/// ```
#[macro_export]
macro_rules! impl_session_dispatch {
    ($session:expr, $conn:ident => $body:expr) => {
        match $session {
            $crate::db::sqlx_driver::Session::Postgres($conn) => $body,
            $crate::db::sqlx_driver::Session::SQLite($conn) => $body,
        }
    };
}

pub use impl_session_dispatch;
