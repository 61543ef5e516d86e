//! Shared SQLite persistence substrate for the ApiCache and ScrobbleQueue (§2a).
//!
//! One database, two tables, opened once and shared behind a mutex the way the reference
//! client's `db_manager` owns a single `rusqlite::Connection` for all playlist state.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

/// Opens (or creates) the on-disk database and applies schema migrations.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(data_dir: &Path) -> Result<Self, rusqlite::Error> {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).map_err(|err| {
                rusqlite::Error::ToSqlConversionFailure(Box::new(err))
            })?;
        }
        let conn = Connection::open(data_dir.join("playback_core.db"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().expect("store connection lock poisoned");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_cache (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL,
                expires_at_epoch_ms INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS scrobble_queue (
                id TEXT PRIMARY KEY,
                track_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                played_at_epoch_ms INTEGER,
                queued_at_epoch_ms INTEGER NOT NULL,
                retry_count INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Runs `f` with exclusive access to the underlying connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>) -> Result<T, rusqlite::Error> {
        let conn = self.conn.lock().expect("store connection lock poisoned");
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_both_tables() {
        let store = Store::open_in_memory().expect("store should open");
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO api_cache (key, value_json, expires_at_epoch_ms) VALUES (?1, ?2, ?3)",
                    rusqlite::params!["k", "{}", 0i64],
                )
            })
            .expect("insert into api_cache should succeed");
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO scrobble_queue (id, track_id, kind, played_at_epoch_ms, queued_at_epoch_ms, retry_count) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params!["r1", "t1", "NowPlaying", Option::<i64>::None, 0i64, 0i64],
                )
            })
            .expect("insert into scrobble_queue should succeed");
    }
}
