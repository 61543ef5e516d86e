//! SQLite-backed CRUD for `ScrobbleRecord` rows (§4.B, §2a).

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::warn;

use crate::error::PlaybackError;
use crate::models::{ScrobbleKind, ScrobbleRecord};
use crate::persistence::Store;

/// Thin persistence adapter over the shared `scrobble_queue` table.
pub struct ScrobbleStore {
    db: Arc<Store>,
}

impl ScrobbleStore {
    pub fn new(db: Arc<Store>) -> Self {
        Self { db }
    }

    pub fn insert(&self, record: &ScrobbleRecord) -> Result<(), PlaybackError> {
        let played_at_epoch_ms = record.played_at.map(instant_to_epoch_ms);
        let queued_at_epoch_ms = instant_to_epoch_ms(record.queued_at);
        self.db
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO scrobble_queue
                        (id, track_id, kind, played_at_epoch_ms, queued_at_epoch_ms, retry_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET retry_count = excluded.retry_count",
                    rusqlite::params![
                        record.id,
                        record.track_id,
                        kind_to_str(record.kind),
                        played_at_epoch_ms,
                        queued_at_epoch_ms,
                        record.retry_count,
                    ],
                )
            })
            .map(|_| ())
            .map_err(|err| PlaybackError::persistence(format!("scrobble insert failed: {err}")))
    }

    pub fn update_retry_count(&self, id: &str, retry_count: u32) -> Result<(), PlaybackError> {
        let id = id.to_string();
        self.db
            .with_connection(|conn| {
                conn.execute(
                    "UPDATE scrobble_queue SET retry_count = ?1 WHERE id = ?2",
                    rusqlite::params![retry_count, id],
                )
            })
            .map(|_| ())
            .map_err(|err| PlaybackError::persistence(format!("scrobble retry update failed: {err}")))
    }

    pub fn delete(&self, id: &str) -> Result<(), PlaybackError> {
        let id = id.to_string();
        self.db
            .with_connection(|conn| conn.execute("DELETE FROM scrobble_queue WHERE id = ?1", rusqlite::params![id]))
            .map(|_| ())
            .map_err(|err| PlaybackError::persistence(format!("scrobble delete failed: {err}")))
    }

    /// Loads every queued record in FIFO (`queued_at`) order, skipping rows that fail to
    /// deserialize instead of failing the whole load (§4.B: "discards the malformed record only").
    pub fn load_all(&self) -> Result<Vec<ScrobbleRecord>, PlaybackError> {
        let rows = self
            .db
            .with_connection(|conn| {
                let mut statement = conn.prepare(
                    "SELECT id, track_id, kind, played_at_epoch_ms, queued_at_epoch_ms, retry_count
                     FROM scrobble_queue ORDER BY queued_at_epoch_ms ASC",
                )?;
                let mapped = statement
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, u32>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(mapped)
            })
            .map_err(|err| PlaybackError::persistence(format!("scrobble load failed: {err}")))?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, track_id, kind_raw, played_at_epoch_ms, queued_at_epoch_ms, retry_count) in rows {
            let Some(kind) = kind_from_str(&kind_raw) else {
                warn!("ScrobbleStore: discarding record {id} with unknown kind {kind_raw}");
                continue;
            };
            records.push(ScrobbleRecord {
                id,
                track_id,
                kind,
                played_at: played_at_epoch_ms.map(epoch_ms_to_instant),
                queued_at: epoch_ms_to_instant(queued_at_epoch_ms),
                retry_count,
            });
        }
        Ok(records)
    }
}

fn kind_to_str(kind: ScrobbleKind) -> &'static str {
    match kind {
        ScrobbleKind::NowPlaying => "NowPlaying",
        ScrobbleKind::Submission => "Submission",
    }
}

fn kind_from_str(raw: &str) -> Option<ScrobbleKind> {
    match raw {
        "NowPlaying" => Some(ScrobbleKind::NowPlaying),
        "Submission" => Some(ScrobbleKind::Submission),
        _ => None,
    }
}

/// `Instant` has no epoch; anchor every conversion to a fresh `(Instant::now, SystemTime::now)`
/// pair taken at call time so round trips stay monotonic within a process lifetime.
fn instant_to_epoch_ms(instant: Instant) -> i64 {
    let now = Instant::now();
    let now_epoch_ms = epoch_ms_now();
    if instant <= now {
        now_epoch_ms - now.duration_since(instant).as_millis() as i64
    } else {
        now_epoch_ms + instant.duration_since(now).as_millis() as i64
    }
}

fn epoch_ms_to_instant(epoch_ms: i64) -> Instant {
    let now = Instant::now();
    let now_epoch_ms = epoch_ms_now();
    let delta = now_epoch_ms - epoch_ms;
    if delta >= 0 {
        now - Duration::from_millis(delta as u64)
    } else {
        now + Duration::from_millis((-delta) as u64)
    }
}

fn epoch_ms_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, track_id: &str, kind: ScrobbleKind) -> ScrobbleRecord {
        ScrobbleRecord {
            id: id.to_string(),
            track_id: track_id.to_string(),
            kind,
            played_at: None,
            queued_at: Instant::now(),
            retry_count: 0,
        }
    }

    #[test]
    fn test_insert_and_load_round_trips() {
        let store = ScrobbleStore::new(Arc::new(Store::open_in_memory().unwrap()));
        store.insert(&record("r1", "t1", ScrobbleKind::NowPlaying)).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "r1");
        assert_eq!(loaded[0].kind, ScrobbleKind::NowPlaying);
    }

    #[test]
    fn test_load_all_is_fifo_by_queued_at() {
        let store = ScrobbleStore::new(Arc::new(Store::open_in_memory().unwrap()));
        let mut first = record("r1", "t1", ScrobbleKind::Submission);
        first.queued_at = Instant::now();
        store.insert(&first).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let mut second = record("r2", "t2", ScrobbleKind::Submission);
        second.queued_at = Instant::now();
        store.insert(&second).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["r1", "r2"]);
    }

    #[test]
    fn test_delete_removes_record() {
        let store = ScrobbleStore::new(Arc::new(Store::open_in_memory().unwrap()));
        store.insert(&record("r1", "t1", ScrobbleKind::NowPlaying)).unwrap();
        store.delete("r1").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_kind_is_discarded_not_fatal() {
        let store = ScrobbleStore::new(Arc::new(Store::open_in_memory().unwrap()));
        store
            .db
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO scrobble_queue (id, track_id, kind, played_at_epoch_ms, queued_at_epoch_ms, retry_count)
                     VALUES ('bad', 't1', 'NotAKind', NULL, 0, 0)",
                    [],
                )
            })
            .unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
