//! Postgres connection pool and shared SQLx error helpers.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Meaning |
//! |------------|----------------------|---------|
//! | Database (unique violation) | `23505` | concurrent enqueue of the same in-flight job (treated as already queued) |
//! | Database (foreign key violation) | `23503` | referenced organization / message missing |
//! | Database (check constraint violation) | `23514` | invalid status or priority |
//! | PoolClosed | N/A | pool shut down |
//! | Other | N/A | network / connection failures |

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool against `database_url`.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Human-readable description of a SQLx error, tagged with the failing operation.
pub fn describe_sqlx_error(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("23505") => format!("unique violation in {}: {}", operation, db_err.message()),
            Some("23503") => format!("foreign key violation in {}: {}", operation, db_err.message()),
            Some("23514") => format!("check violation in {}: {}", operation, db_err.message()),
            _ => format!("database error in {}: {}", operation, db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {}", operation),
        sqlx::Error::RowNotFound => format!("unexpected row not found in {}", operation),
        other => format!("sqlx error in {}: {}", operation, other),
    }
}

/// Check if an error is a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}
