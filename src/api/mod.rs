//! Server API contract boundary (§4.A, §6, §6a) and the two-tier request cache built on it.

pub mod cache;
pub mod client;
pub mod fingerprint;
mod xml;

use serde::{Deserialize, Serialize};

use crate::models::Track;

/// Summary fields for one album, as returned by `getAlbumList2` / `getArtist` (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    pub artist: String,
    pub cover_art_id: Option<String>,
    pub song_count: u32,
    pub duration_s: u32,
}

/// Full album detail: summary fields plus its tracks, as returned by `getAlbum` (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumDetail {
    pub album: Album,
    pub tracks: Vec<Track>,
}

/// Summary fields for one artist, as returned by `getArtists` (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub cover_art_id: Option<String>,
    pub album_count: u32,
}

/// Combined result of `search3` (§6).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub artists: Vec<Artist>,
    pub albums: Vec<Album>,
    pub songs: Vec<Track>,
}
