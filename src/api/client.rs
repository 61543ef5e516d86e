//! `ServerApi` contract boundary and its `ureq`-backed Subsonic implementation (§6a).

use std::time::Duration;

use async_trait::async_trait;

use crate::api::xml::{self, parse_envelope};
use crate::api::{Album, AlbumDetail, Artist, SearchResult};
use crate::config::NetworkConfig;
use crate::credentials::Credentials;
use crate::error::PlaybackError;
use crate::models::Track;

const API_VERSION: &str = "1.16.1";
const CLIENT_ID: &str = "subsonic-playback-core";

/// Narrow, already-typed async interface every server call goes through (§6a). Implementations
/// never leak HTTP status codes or XML elements to callers.
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn get_album_list(&self, size: u32) -> Result<Vec<Album>, PlaybackError>;
    async fn get_album(&self, id: &str) -> Result<AlbumDetail, PlaybackError>;
    async fn get_artists(&self) -> Result<Vec<Artist>, PlaybackError>;
    async fn get_artist_albums(&self, id: &str) -> Result<Vec<Album>, PlaybackError>;
    async fn search(
        &self,
        query: &str,
        artist_count: u32,
        album_count: u32,
        song_count: u32,
    ) -> Result<SearchResult, PlaybackError>;
    async fn get_random_songs(&self, size: u32) -> Result<Vec<Track>, PlaybackError>;
    /// Stream URLs are uncached (§4.C: "signed and short-lived").
    fn stream_url(&self, track_id: &str) -> String;
    fn cover_art_url(&self, cover_art_id: &str) -> String;
    async fn scrobble(&self, track_id: &str, submission: bool) -> Result<(), PlaybackError>;
}

/// `ureq`-backed implementation speaking the Subsonic REST dialect (§6, §6a).
pub struct SubsonicServerApi {
    credentials: Credentials,
    network: NetworkConfig,
}

impl SubsonicServerApi {
    pub fn new(credentials: Credentials, network: NetworkConfig) -> Result<Self, PlaybackError> {
        if !credentials.server_url.starts_with("https://") {
            return Err(PlaybackError::Auth {
                message: "server URL must use HTTPS".to_string(),
            });
        }
        Ok(Self {
            credentials,
            network,
        })
    }

    fn make_salt() -> String {
        let mut bytes = [0u8; 8];
        let _ = getrandom::fill(&mut bytes);
        bytes.iter().map(|value| format!("{value:02x}")).collect()
    }

    fn auth_params(&self) -> Vec<(String, String)> {
        let salt = Self::make_salt();
        let token = format!(
            "{:x}",
            md5::compute(format!("{}{}", self.credentials.password, salt))
        );
        vec![
            ("u".to_string(), self.credentials.username.clone()),
            ("t".to_string(), token),
            ("s".to_string(), salt),
            ("f".to_string(), "xml".to_string()),
            ("v".to_string(), API_VERSION.to_string()),
            ("c".to_string(), CLIENT_ID.to_string()),
        ]
    }

    fn endpoint_url(&self, method: &str, params: &[(&str, &str)]) -> String {
        let mut query_parts: Vec<String> = self
            .auth_params()
            .into_iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(&value)))
            .collect();
        query_parts.extend(
            params
                .iter()
                .map(|(key, value)| format!("{key}={}", urlencoding::encode(value))),
        );
        let base = self.credentials.server_url.trim_end_matches('/');
        format!("{base}/rest/{method}.view?{}", query_parts.join("&"))
    }

    /// Issues one GET request with retry-on-idempotent semantics (§6a), off the async executor.
    async fn request_xml(
        &self,
        method: &'static str,
        params: Vec<(String, String)>,
    ) -> Result<xml::Envelope, PlaybackError> {
        let url_params: Vec<(&str, &str)> = params
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        let url = self.endpoint_url(method, &url_params);
        let network = self.network;
        let max_attempts = network.max_retry_attempts.max(1);

        let mut last_error = None;
        for attempt in 0..max_attempts {
            let url = url.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let agent = ureq::AgentBuilder::new()
                    .timeout_connect(network.connection_timeout)
                    .timeout_read(network.request_timeout)
                    .timeout_write(network.request_timeout)
                    .build();
                agent
                    .get(&url)
                    .call()
                    .map_err(|err| err.to_string())
                    .and_then(|response| response.into_string().map_err(|err| err.to_string()))
            })
            .await
            .map_err(|err| PlaybackError::transport(method, format!("task join failed: {err}")))?;

            match outcome {
                Ok(body) => return parse_envelope(method, &body),
                Err(message) => {
                    last_error = Some(message);
                    if attempt + 1 < max_attempts {
                        let backoff = retry_backoff(&network, attempt);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(PlaybackError::transport(
            method,
            last_error.unwrap_or_else(|| "unknown transport failure".to_string()),
        ))
    }
}

fn retry_backoff(network: &NetworkConfig, attempt: u32) -> Duration {
    let exponential = network.base_backoff.saturating_mul(1 << attempt.min(16));
    exponential.min(network.max_backoff)
}

#[async_trait]
impl ServerApi for SubsonicServerApi {
    async fn get_album_list(&self, size: u32) -> Result<Vec<Album>, PlaybackError> {
        let envelope = self
            .request_xml(
                "getAlbumList2",
                vec![
                    ("type".to_string(), "recent".to_string()),
                    ("size".to_string(), size.to_string()),
                ],
            )
            .await?;
        xml::album_list("getAlbumList2", envelope)
    }

    async fn get_album(&self, id: &str) -> Result<AlbumDetail, PlaybackError> {
        let envelope = self
            .request_xml("getAlbum", vec![("id".to_string(), id.to_string())])
            .await?;
        xml::album_detail("getAlbum", envelope)
    }

    async fn get_artists(&self) -> Result<Vec<Artist>, PlaybackError> {
        let envelope = self.request_xml("getArtists", vec![]).await?;
        xml::artists("getArtists", envelope)
    }

    async fn get_artist_albums(&self, id: &str) -> Result<Vec<Album>, PlaybackError> {
        let envelope = self
            .request_xml("getArtist", vec![("id".to_string(), id.to_string())])
            .await?;
        xml::artist_albums("getArtist", envelope)
    }

    async fn search(
        &self,
        query: &str,
        artist_count: u32,
        album_count: u32,
        song_count: u32,
    ) -> Result<SearchResult, PlaybackError> {
        let envelope = self
            .request_xml(
                "search3",
                vec![
                    ("query".to_string(), query.to_string()),
                    ("artistCount".to_string(), artist_count.to_string()),
                    ("albumCount".to_string(), album_count.to_string()),
                    ("songCount".to_string(), song_count.to_string()),
                ],
            )
            .await?;
        xml::search_result("search3", envelope)
    }

    async fn get_random_songs(&self, size: u32) -> Result<Vec<Track>, PlaybackError> {
        let envelope = self
            .request_xml("getRandomSongs", vec![("size".to_string(), size.to_string())])
            .await?;
        xml::random_songs("getRandomSongs", envelope)
    }

    fn stream_url(&self, track_id: &str) -> String {
        self.endpoint_url("stream", &[("id", track_id)])
    }

    fn cover_art_url(&self, cover_art_id: &str) -> String {
        self.endpoint_url("getCoverArt", &[("id", cover_art_id), ("size", "300")])
    }

    async fn scrobble(&self, track_id: &str, submission: bool) -> Result<(), PlaybackError> {
        let _ = self
            .request_xml(
                "scrobble",
                vec![
                    ("id".to_string(), track_id.to_string()),
                    ("submission".to_string(), submission.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            server_url: "https://music.example.com".to_string(),
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[test]
    fn test_rejects_non_https_server_url() {
        let insecure = Credentials {
            server_url: "http://music.example.com".to_string(),
            ..credentials()
        };
        let result = SubsonicServerApi::new(insecure, NetworkConfig::default());
        assert!(matches!(result, Err(PlaybackError::Auth { .. })));
    }

    #[test]
    fn test_endpoint_url_contains_fixed_auth_params() {
        let api = SubsonicServerApi::new(credentials(), NetworkConfig::default()).unwrap();
        let url = api.endpoint_url("ping", &[]);
        assert!(url.starts_with("https://music.example.com/rest/ping.view?"));
        assert!(url.contains("u=alice"));
        assert!(url.contains("f=xml"));
        assert!(url.contains("v=1.16.1"));
        assert!(url.contains("c=subsonic-playback-core"));
    }

    #[test]
    fn test_stream_url_is_uncached_direct_link() {
        let api = SubsonicServerApi::new(credentials(), NetworkConfig::default()).unwrap();
        let url = api.stream_url("song-1");
        assert!(url.contains("/rest/stream.view?"));
        assert!(url.contains("id=song-1"));
    }
}
