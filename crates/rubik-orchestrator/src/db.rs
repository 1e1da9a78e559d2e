use std::path::Path;

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Open a SQLite connection in WAL mode, creating the parent directory.
///
/// Every subsystem gets its own connection to the same file.
pub fn open_db(path: &str) -> Result<Connection> {
    ensure_parent_dir(path)?;
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    info!(path, "opened SQLite database");
    Ok(conn)
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}
