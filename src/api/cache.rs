//! Two-tier request cache with single-flight dedup and per-endpoint TTLs (§4.A).
//!
//! Mirrors the reference client's `LibraryManager` control-bus pattern of broadcasting a result
//! to every listener waiting on the same key, except here the "listeners" are concurrent cache
//! callers instead of UI subscribers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::api::fingerprint::fingerprint;
use crate::error::PlaybackError;
use crate::persistence::Store;

/// Per-endpoint freshness policy (§4.A TTL table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachePolicy {
    ttl: Duration,
    persistent: bool,
}

fn policy_for(endpoint: &str) -> CachePolicy {
    match endpoint {
        "getAlbumList2" => CachePolicy {
            ttl: Duration::from_secs(3 * 60),
            persistent: true,
        },
        "getAlbum" => CachePolicy {
            ttl: Duration::from_secs(10 * 60),
            persistent: true,
        },
        "getArtists" => CachePolicy {
            ttl: Duration::from_secs(15 * 60),
            persistent: true,
        },
        "getArtist" => CachePolicy {
            ttl: Duration::from_secs(10 * 60),
            persistent: true,
        },
        "search3" => CachePolicy {
            ttl: Duration::from_secs(5 * 60),
            persistent: true,
        },
        "getRandomSongs" => CachePolicy {
            ttl: Duration::from_secs(60),
            persistent: false,
        },
        other => {
            warn!("ApiCache: no TTL policy for endpoint {other}, defaulting to 1 minute, in-memory only");
            CachePolicy {
                ttl: Duration::from_secs(60),
                persistent: false,
            }
        }
    }
}

struct MemoryEntry {
    value_json: String,
    expires_at: Instant,
}

type FlightResult = Result<String, String>;

/// Two-tier (in-memory + SQLite) request cache sitting in front of a `ServerApi` (§4.A).
pub struct ApiCache {
    store: Option<Arc<Store>>,
    memory: Mutex<HashMap<String, MemoryEntry>>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ApiCache {
    pub fn new(store: Option<Arc<Store>>) -> Self {
        Self {
            store,
            memory: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Fetches `endpoint(params)`, serving from cache when fresh and deduplicating concurrent
    /// misses for the same key (§4.A). `fetch` only ever runs once per outstanding miss.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        fetch: F,
    ) -> Result<T, PlaybackError>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PlaybackError>>,
    {
        let key = fingerprint(endpoint, params);
        let policy = policy_for(endpoint);

        if let Some(value) = self.read_fresh(&key, policy).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return serde_json::from_str(&value).map_err(|err| {
                PlaybackError::persistence(format!("corrupt cache entry for {key}: {err}"))
            });
        }

        let mut in_flight = self.in_flight.lock().await;
        if let Some(sender) = in_flight.get(&key) {
            let mut receiver = sender.subscribe();
            drop(in_flight);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Self::await_flight(&mut receiver).await.and_then(|raw| {
                serde_json::from_str(&raw).map_err(|err| {
                    PlaybackError::persistence(format!("corrupt fetch result for {key}: {err}"))
                })
            });
        }

        let (sender, _) = broadcast::channel(1);
        in_flight.insert(key.clone(), sender.clone());
        drop(in_flight);

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("ApiCache: miss for {key}, fetching");
        let outcome = fetch().await;

        self.in_flight.lock().await.remove(&key);

        match outcome {
            Ok(value) => {
                let value_json = serde_json::to_string(&value).map_err(|err| {
                    PlaybackError::persistence(format!("failed to serialize {key}: {err}"))
                })?;
                self.write(&key, &value_json, policy).await;
                let _ = sender.send(Ok(value_json));
                Ok(value)
            }
            Err(err) => {
                let _ = sender.send(Err(err.to_string()));
                Err(err)
            }
        }
    }

    async fn await_flight(receiver: &mut broadcast::Receiver<FlightResult>) -> Result<String, PlaybackError> {
        match receiver.recv().await {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(message)) => Err(PlaybackError::transport("single-flight", message)),
            Err(_) => Err(PlaybackError::transport(
                "single-flight",
                "leader request dropped before completing",
            )),
        }
    }

    async fn read_fresh(&self, key: &str, policy: CachePolicy) -> Option<String> {
        {
            let memory = self.memory.lock().await;
            if let Some(entry) = memory.get(key) {
                if entry.expires_at > Instant::now() {
                    return Some(entry.value_json.clone());
                }
            }
        }
        if !policy.persistent {
            return None;
        }
        let Some(store) = &self.store else {
            return None;
        };
        let now_ms = epoch_ms_now();
        let key_owned = key.to_string();
        let row = store
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT value_json, expires_at_epoch_ms FROM api_cache WHERE key = ?1",
                    rusqlite::params![key_owned],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
            })
            .ok();
        match row {
            Some((value_json, expires_at_epoch_ms)) if expires_at_epoch_ms > now_ms => {
                self.memory.lock().await.insert(
                    key.to_string(),
                    MemoryEntry {
                        value_json: value_json.clone(),
                        expires_at: Instant::now() + policy.ttl,
                    },
                );
                Some(value_json)
            }
            Some(_) => None,
            None => None,
        }
    }

    async fn write(&self, key: &str, value_json: &str, policy: CachePolicy) {
        self.memory.lock().await.insert(
            key.to_string(),
            MemoryEntry {
                value_json: value_json.to_string(),
                expires_at: Instant::now() + policy.ttl,
            },
        );
        if !policy.persistent {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let expires_at_epoch_ms = epoch_ms_now() + policy.ttl.as_millis() as i64;
        let key_owned = key.to_string();
        let value_owned = value_json.to_string();
        if let Err(err) = store.with_connection(|conn| {
            conn.execute(
                "INSERT INTO api_cache (key, value_json, expires_at_epoch_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, expires_at_epoch_ms = excluded.expires_at_epoch_ms",
                rusqlite::params![key_owned, value_owned, expires_at_epoch_ms],
            )
        }) {
            warn!("ApiCache: failed to persist entry for {key}: {err}");
        }
    }

    /// Drops every cached entry whose key starts with `endpoint`, e.g. after a scrobble
    /// invalidates album listings that show play counts (§4.A).
    pub async fn invalidate_matching(&self, endpoint: &str) {
        let prefix = format!("{endpoint}?");
        self.memory
            .lock()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
        if let Some(store) = &self.store {
            let pattern = format!("{prefix}%");
            if let Err(err) = store.with_connection(|conn| {
                conn.execute("DELETE FROM api_cache WHERE key LIKE ?1", rusqlite::params![pattern])
            }) {
                warn!("ApiCache: failed to invalidate persisted entries for {endpoint}: {err}");
            }
        }
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
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_second_call_hits_memory_without_refetching() {
        let cache = ApiCache::new(None);
        let calls = AtomicU32::new(0);
        let fetch = || async {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok::<_, PlaybackError>(vec!["a".to_string()])
        };
        let first: Vec<String> = cache.get_or_fetch("getArtists", &[], fetch).await.unwrap();
        let second: Vec<String> = cache
            .get_or_fetch("getArtists", &[], || async { unreachable!("should hit cache") })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_single_flight_to_one_fetch() {
        let cache = Arc::new(ApiCache::new(None));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("getAlbumList2", &[("size", "10")], || async move {
                        calls.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, PlaybackError>(vec!["album-1".to_string()])
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_invalidate_matching_drops_only_prefixed_keys() {
        let cache = ApiCache::new(None);
        let _: Vec<String> = cache
            .get_or_fetch("getAlbumList2", &[], || async { Ok(vec!["x".to_string()]) })
            .await
            .unwrap();
        let _: Vec<String> = cache
            .get_or_fetch("getArtists", &[], || async { Ok(vec!["y".to_string()]) })
            .await
            .unwrap();
        cache.invalidate_matching("getAlbumList2").await;

        let calls = AtomicU32::new(0);
        let _: Vec<String> = cache
            .get_or_fetch("getAlbumList2", &[], || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(vec!["x2".to_string()])
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1, "album list should have been evicted");

        let calls2 = AtomicU32::new(0);
        let _: Vec<String> = cache
            .get_or_fetch("getArtists", &[], || async {
                calls2.fetch_add(1, Ordering::Relaxed);
                Ok(vec!["y".to_string()])
            })
            .await
            .unwrap();
        assert_eq!(calls2.load(Ordering::Relaxed), 0, "artists entry should still be cached");
    }
}
