//! Local SQLite database for the board.
//!
//! Uses rusqlite with WAL mode. Holds the served-order cache and a small
//! category/key/value settings table (manual mode flag, device id).

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Database handle shared by the board and its cache.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "kds.db";

/// Initialize the database at `{data_dir}/kds.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    // A file that is not a database only fails on first read.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|e| format!("sqlite probe: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings store.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;
    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: served-order cache, scoped per outlet.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS served_orders (
            outlet_id TEXT NOT NULL,
            order_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            order_time TEXT,
            cached_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (outlet_id, order_id)
        );

        CREATE INDEX IF NOT EXISTS idx_served_orders_time ON served_orders(outlet_id, order_time);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;
    info!("Applied migration v2");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

const BOARD_CATEGORY: &str = "kds";
const MANUAL_MODE_KEY: &str = "manual_mode";
const DEVICE_ID_KEY: &str = "device_id";

/// Persisted manual/auto mode. Boards start in manual mode.
pub fn load_manual_mode(conn: &Connection) -> bool {
    match get_setting(conn, BOARD_CATEGORY, MANUAL_MODE_KEY).as_deref() {
        Some("false") => false,
        Some("true") | None => true,
        Some(other) => {
            warn!(value = other, "unreadable manual_mode setting, assuming manual");
            true
        }
    }
}

pub fn store_manual_mode(conn: &Connection, manual: bool) -> Result<(), String> {
    set_setting(
        conn,
        BOARD_CATEGORY,
        MANUAL_MODE_KEY,
        if manual { "true" } else { "false" },
    )
}

/// Device token sent with status mutations. Generated once and kept.
pub fn device_id(conn: &Connection) -> Result<String, String> {
    if let Some(existing) = get_setting(conn, BOARD_CATEGORY, DEVICE_ID_KEY) {
        return Ok(existing);
    }
    let generated = uuid::Uuid::new_v4().simple().to_string();
    set_setting(conn, BOARD_CATEGORY, DEVICE_ID_KEY, &generated)?;
    info!("Generated device id");
    Ok(generated)
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&conn).expect("migrations");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_tables_once() {
        let conn = test_conn();
        let tables = table_names(&conn);
        assert!(tables.contains(&"local_settings".to_string()));
        assert!(tables.contains(&"served_orders".to_string()));

        // Second run is a no-op.
        run_migrations(&conn).expect("rerun");
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_settings_upsert() {
        let conn = test_conn();
        assert_eq!(get_setting(&conn, "kds", "x"), None);
        set_setting(&conn, "kds", "x", "1").unwrap();
        set_setting(&conn, "kds", "x", "2").unwrap();
        assert_eq!(get_setting(&conn, "kds", "x").as_deref(), Some("2"));
    }

    #[test]
    fn test_manual_mode_defaults_on_and_persists() {
        let conn = test_conn();
        assert!(load_manual_mode(&conn));
        store_manual_mode(&conn, false).unwrap();
        assert!(!load_manual_mode(&conn));
    }

    #[test]
    fn test_device_id_is_stable() {
        let conn = test_conn();
        let first = device_id(&conn).unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(device_id(&conn).unwrap(), first);
    }

    #[test]
    fn test_init_recovers_from_corrupt_file() {
        let dir = std::env::temp_dir().join(format!("kds-db-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DB_FILE_NAME), b"definitely not sqlite, just garbage bytes").unwrap();

        let state = init(&dir).expect("init should recover");
        let conn = state.conn.lock().unwrap();
        assert!(table_names(&conn).contains(&"served_orders".to_string()));
        drop(conn);
        let _ = fs::remove_dir_all(&dir);
    }
}
