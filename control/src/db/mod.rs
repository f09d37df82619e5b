use anyhow::{anyhow, Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Default database location under the user's local data directory.
pub fn default_db_path() -> Result<PathBuf> {
    let mut path = dirs::data_local_dir().context("Cannot determine data directory")?;
    path.push("node-deployer");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("Cannot create data directory {:?}", path))?;
    path.push("control.db");
    Ok(path)
}

/// Initialize database with connection pool and run migrations
pub fn init_db(db_path: Option<PathBuf>) -> Result<DbPool> {
    let path = match db_path {
        Some(p) => p,
        None => default_db_path()?,
    };

    info!("Initializing database at: {:?}", path);

    let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))
    });
    let pool = Pool::builder()
        .max_size(10)
        .build(manager)
        .context("Failed to create connection pool")?;

    let conn = pool.get().context("Failed to get database connection")?;
    run_migrations(&conn)?;

    info!("Database initialized successfully");
    Ok(pool)
}

/// Applies every migration past the schema version recorded in
/// `PRAGMA user_version`. Column additions are not rerunnable, so each
/// script runs once.
fn run_migrations(conn: &Connection) -> Result<()> {
    let migrations = [
        include_str!("../../migrations/001_nodes.sql"),
        include_str!("../../migrations/002_deployments.sql"),
        include_str!("../../migrations/003_users.sql"),
        include_str!("../../migrations/004_node_location.sql"),
    ];

    let applied: usize = conn
        .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .context("Failed to read schema version")?
        .max(0) as usize;

    for (i, migration) in migrations.iter().enumerate().skip(applied) {
        let version = i + 1;
        info!("Running migration {}", version);
        conn.execute_batch(&format!(
            "BEGIN;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
            migration, version
        ))
        .with_context(|| format!("Failed to run migration {}", version))?;
    }

    Ok(())
}

/// Helper for async database operations (spawn_blocking wrapper).
///
/// Generic over the error type so domain services can return `DeployError`
/// and plumbing can keep returning `anyhow::Error`.
pub async fn execute_async<F, T, E>(pool: &DbPool, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(&Connection) -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<anyhow::Error> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .context("Failed to get database connection")
            .map_err(E::from)?;
        f(&conn)
    })
    .await
    .map_err(|e| E::from(anyhow!("Task join error: {}", e)))?
}

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// True when a write failed on a UNIQUE constraint.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

#[cfg(test)]
pub fn test_pool() -> (tempfile::TempDir, DbPool) {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = init_db(Some(dir.path().join("control.db"))).unwrap();
    (dir, pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_rerunnable() {
        let (dir, _pool) = test_pool();
        let again = init_db(Some(dir.path().join("control.db"))).unwrap();
        let version: i64 = again
            .get()
            .unwrap()
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 4);
    }

    #[test]
    fn test_unversioned_database_gains_location_columns() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("control.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(include_str!("../../migrations/001_nodes.sql"))
                .unwrap();
        }

        let pool = init_db(Some(path)).unwrap();
        let conn = pool.get().unwrap();
        conn.prepare("SELECT location, disk_bytes, disk_used_bytes, disk_percent FROM nodes")
            .unwrap();
    }
}
