use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;
use turso::{Builder, Connection, Database};

use crate::constants::SEED_MODELS;
use crate::error::ProxyError;

/// Global database instance
static DATABASE: OnceCell<Arc<Database>> = OnceCell::const_new();

// ---------------------------------------------------------------------------
// Migration framework
// ---------------------------------------------------------------------------

type MigrationFn =
    fn(&Connection) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + '_>>;

struct Migration {
    version: i64,
    description: &'static str,
    migrate: MigrationFn,
}

/// Ordered list of all migrations. Each migration assumes all prior migrations
/// have already been applied. New migrations are appended at the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "initial schema: accounts, requests, request_payloads, api_keys, models, oauth_sessions",
    migrate: migrate_v1,
}];

/// Read the current schema version (0 if table is empty or doesn't exist yet).
async fn get_schema_version(conn: &Connection) -> Result<i64, ProxyError> {
    let mut rows = conn
        .query("SELECT version FROM schema_version LIMIT 1", ())
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to read schema version: {e}")))?;
    let version = rows
        .next()
        .await
        .ok()
        .flatten()
        .and_then(|r| r.get::<i64>(0).ok())
        .unwrap_or(0);
    Ok(version)
}

/// Set the schema version (insert or update the single row).
async fn set_schema_version(conn: &Connection, version: i64) -> Result<(), ProxyError> {
    conn.execute("DELETE FROM schema_version", ())
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to clear schema version: {e}")))?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        (version,),
    )
    .await
    .map_err(|e| ProxyError::DatabaseError(format!("Failed to set schema version: {e}")))?;
    Ok(())
}

/// Run all pending migrations.
async fn run_migrations(conn: &Connection, db_path: &Path) -> Result<(), ProxyError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        (),
    )
    .await
    .map_err(|e| {
        ProxyError::DatabaseError(format!("Failed to create schema_version table: {e}"))
    })?;

    let mut current = get_schema_version(conn).await?;

    // Back up the database before running any pending migrations
    let has_pending = MIGRATIONS.iter().any(|m| m.version > current);
    if has_pending && db_path.exists() && current > 0 {
        let backup_name = format!(
            "{}.backup-v{}",
            db_path.file_name().unwrap_or_default().to_string_lossy(),
            current
        );
        let backup_path = db_path.with_file_name(&backup_name);
        std::fs::copy(db_path, &backup_path).map_err(|e| {
            ProxyError::DatabaseError(format!("Failed to backup database before migration: {e}"))
        })?;
        // Also copy WAL file if present (contains recent uncommitted writes)
        let wal_path = db_path.with_extension("db-wal");
        if wal_path.exists() {
            let wal_backup = db_path.with_file_name(format!("{backup_name}-wal"));
            let _ = std::fs::copy(&wal_path, &wal_backup);
        }
        info!("Database backup created at {}", backup_path.display());
    }

    for migration in MIGRATIONS {
        if migration.version > current {
            info!(
                "Running migration v{}: {}",
                migration.version, migration.description
            );
            (migration.migrate)(conn).await?;
            set_schema_version(conn, migration.version).await?;
            current = migration.version;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Seed the models table with default pricing if it's empty.
async fn seed_models_if_empty(conn: &Connection) -> Result<(), ProxyError> {
    let mut count_rows = conn
        .query("SELECT COUNT(*) FROM models", ())
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to count models: {e}")))?;
    let model_count: i64 = count_rows
        .next()
        .await
        .ok()
        .flatten()
        .and_then(|r| r.get::<i64>(0).ok())
        .unwrap_or(0);

    if model_count == 0 {
        info!(
            "Seeding models table with {} default models",
            SEED_MODELS.len()
        );
        for &(id, input_price, output_price, cache_read_price, cache_write_price) in SEED_MODELS {
            conn.execute(
                "INSERT INTO models (id, input_price, output_price, cache_read_price, cache_write_price) VALUES (?, ?, ?, ?, ?)",
                (id, input_price, output_price, cache_read_price, cache_write_price),
            )
            .await
            .map_err(|e| ProxyError::DatabaseError(format!("Failed to seed model {id}: {e}")))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Migration v1 — full schema
// ---------------------------------------------------------------------------

fn migrate_v1(
    conn: &Connection,
) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + '_>> {
    Box::pin(async move {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL,
                api_key TEXT,
                refresh_token TEXT,
                access_token TEXT,
                expires_at INTEGER,
                priority INTEGER NOT NULL DEFAULT 0,
                paused INTEGER NOT NULL DEFAULT 0,
                token_invalid INTEGER NOT NULL DEFAULT 0,
                rate_limited_until INTEGER,
                rate_limit_status TEXT,
                rate_limit_remaining INTEGER,
                rate_limit_reset INTEGER,
                session_start INTEGER,
                session_request_count INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                total_requests INTEGER NOT NULL DEFAULT 0,
                last_used INTEGER,
                auto_refresh_enabled INTEGER NOT NULL DEFAULT 1,
                auto_fallback_enabled INTEGER NOT NULL DEFAULT 1,
                custom_endpoint TEXT,
                model_mappings TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to create accounts table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                account_used TEXT,
                status_code INTEGER,
                success INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                response_time_ms INTEGER NOT NULL DEFAULT 0,
                failover_attempts INTEGER NOT NULL DEFAULT 0,
                model TEXT,
                input_tokens INTEGER,
                cache_read_input_tokens INTEGER,
                cache_creation_input_tokens INTEGER,
                output_tokens INTEGER,
                total_tokens INTEGER,
                cost_usd REAL,
                agent_used TEXT,
                output_tokens_per_second REAL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to create requests table: {e}")))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests (timestamp)",
            (),
        )
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to index requests: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS request_payloads (
                request_id TEXT PRIMARY KEY REFERENCES requests(id) ON DELETE CASCADE,
                request_headers_json TEXT,
                request_body_b64 TEXT,
                response_status INTEGER,
                response_headers_json TEXT,
                response_body_b64 TEXT,
                error TEXT
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            ProxyError::DatabaseError(format!("Failed to create request_payloads table: {e}"))
        })?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                hashed_key TEXT NOT NULL UNIQUE,
                prefix_last_8 TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_used INTEGER,
                usage_count INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1
            )
            "#,
            (),
        )
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to create api_keys table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                input_price REAL NOT NULL DEFAULT 0,
                output_price REAL NOT NULL DEFAULT 0,
                cache_read_price REAL NOT NULL DEFAULT 0,
                cache_write_price REAL NOT NULL DEFAULT 0
            )
            "#,
            (),
        )
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to create models table: {e}")))?;

        seed_models_if_empty(conn).await?;

        // Transient rows written by the authorization-code flow; swept hourly.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_sessions (
                state TEXT PRIMARY KEY,
                account_name TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            ProxyError::DatabaseError(format!("Failed to create oauth_sessions table: {e}"))
        })?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                path TEXT PRIMARY KEY,
                last_seen INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            ProxyError::DatabaseError(format!("Failed to create workspaces table: {e}"))
        })?;

        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Initialize the database and run all pending migrations.
pub async fn init_db(path: &Path) -> Result<(), ProxyError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ProxyError::DatabaseError(format!("Failed to create DB directory: {e}"))
        })?;
    }

    let path_str = path.to_str().unwrap_or("balancer.db");
    let db = Builder::new_local(path_str)
        .build()
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to open database: {e}")))?;

    let conn = db
        .connect()
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to connect: {e}")))?;

    // Enable foreign key enforcement (required for ON DELETE CASCADE)
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to enable foreign keys: {e}")))?;

    run_migrations(&conn, path).await?;

    DATABASE
        .set(Arc::new(db))
        .map_err(|_| ProxyError::DatabaseError("Database already initialized".into()))?;

    info!("Database initialized at {}", path_str);
    Ok(())
}

/// Get a database connection with foreign keys enabled.
pub async fn get_conn() -> Result<Connection, ProxyError> {
    let db = DATABASE
        .get()
        .ok_or_else(|| ProxyError::DatabaseError("Database not initialized".into()))?;
    let conn = db
        .connect()
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to get connection: {e}")))?;
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Failed to enable foreign keys: {e}")))?;
    Ok(conn)
}
