pub mod pool;
pub mod schema;

use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use crate::error::{MemoryError, MemoryResult, StorageContext};

pub use pool::{ConnectionPool, PoolSettings, PoolStats, PooledConnection};

/// How long a connection waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Create the parent directory of a database file if it is missing.
pub fn ensure_parent_dir(path: &Path) -> MemoryResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| MemoryError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Open one connection with every mandatory pragma applied.
///
/// Schema is not touched here; each store initializes its own tables once.
pub fn open_connection(path: &Path) -> MemoryResult<Connection> {
    load_sqlite_vec();

    let conn = Connection::open(path).storage("open connection")?;

    // Enable WAL mode for concurrent readers alongside one writer
    conn.pragma_update(None, "journal_mode", "WAL")
        .storage("enable WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .storage("enable foreign keys")?;
    conn.busy_timeout(BUSY_TIMEOUT).storage("set busy timeout")?;

    tracing::trace!(path = %path.display(), "connection opened");
    Ok(conn)
}
