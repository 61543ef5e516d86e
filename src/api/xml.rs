//! Minimal Subsonic `<subsonic-response>` XML parsing (§6a).
//!
//! This intentionally models only the fields this core consumes (§1's "interfaces only"
//! scoping of full XML parsing) rather than the complete OpenSubsonic schema.

use serde::Deserialize;

use crate::api::{Album, AlbumDetail, Artist, SearchResult};
use crate::error::PlaybackError;
use crate::models::Track;

#[derive(Debug, Deserialize)]
#[serde(rename = "subsonic-response")]
pub struct Envelope {
    #[serde(rename = "@status")]
    pub status: String,
    pub error: Option<XmlError>,
    #[serde(rename = "albumList2", default)]
    pub album_list2: Option<AlbumList2Xml>,
    #[serde(default)]
    pub album: Option<AlbumXml>,
    #[serde(default)]
    pub artists: Option<ArtistsXml>,
    #[serde(default)]
    pub artist: Option<ArtistXml>,
    #[serde(rename = "searchResult3", default)]
    pub search_result3: Option<SearchResult3Xml>,
    #[serde(rename = "randomSongs", default)]
    pub random_songs: Option<RandomSongsXml>,
    #[serde(default)]
    pub playlist: Option<PlaylistXml>,
}

#[derive(Debug, Deserialize)]
pub struct XmlError {
    #[serde(rename = "@message")]
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct AlbumList2Xml {
    #[serde(rename = "album", default)]
    pub album: Vec<AlbumSummaryXml>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ArtistsXml {
    #[serde(rename = "artist", default)]
    pub artist: Vec<ArtistSummaryXml>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ArtistXml {
    #[serde(rename = "@id", default)]
    pub id: String,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "album", default)]
    pub album: Vec<AlbumSummaryXml>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchResult3Xml {
    #[serde(rename = "artist", default)]
    pub artist: Vec<ArtistSummaryXml>,
    #[serde(rename = "album", default)]
    pub album: Vec<AlbumSummaryXml>,
    #[serde(rename = "song", default)]
    pub song: Vec<SongXml>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RandomSongsXml {
    #[serde(rename = "song", default)]
    pub song: Vec<SongXml>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PlaylistXml {
    #[serde(rename = "@id", default)]
    pub id: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AlbumSummaryXml {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@artist", default)]
    pub artist: String,
    #[serde(rename = "@coverArt", default)]
    pub cover_art: Option<String>,
    #[serde(rename = "@songCount", default)]
    pub song_count: u32,
    #[serde(rename = "@duration", default)]
    pub duration: u32,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ArtistSummaryXml {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@coverArt", default)]
    pub cover_art: Option<String>,
    #[serde(rename = "@albumCount", default)]
    pub album_count: u32,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AlbumXml {
    #[serde(rename = "@id", default)]
    pub id: String,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@artist", default)]
    pub artist: String,
    #[serde(rename = "@coverArt", default)]
    pub cover_art: Option<String>,
    #[serde(rename = "@songCount", default)]
    pub song_count: u32,
    #[serde(rename = "@duration", default)]
    pub duration: u32,
    #[serde(rename = "song", default)]
    pub song: Vec<SongXml>,
}

/// A `<song>` element. ReplayGain attributes accept the three spellings named in §6.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct SongXml {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@title", default)]
    pub title: String,
    #[serde(rename = "@artist", default)]
    pub artist: String,
    #[serde(rename = "@album", default)]
    pub album: String,
    #[serde(rename = "@albumId", default)]
    pub album_id: String,
    #[serde(rename = "@coverArt", default)]
    pub cover_art: Option<String>,
    #[serde(rename = "@duration", default)]
    pub duration: u32,
    #[serde(rename = "@track", default)]
    pub track: Option<u32>,
    #[serde(rename = "@suffix", default)]
    pub suffix: Option<String>,
    #[serde(rename = "@contentType", default)]
    pub content_type: Option<String>,

    #[serde(rename = "@replayGainTrackGain", default)]
    pub replay_gain_track_gain: Option<f32>,
    #[serde(rename = "@rgTrackGain", default)]
    pub rg_track_gain: Option<f32>,
    #[serde(rename = "@trackGain", default)]
    pub track_gain: Option<f32>,

    #[serde(rename = "@replayGainAlbumGain", default)]
    pub replay_gain_album_gain: Option<f32>,
    #[serde(rename = "@rgAlbumGain", default)]
    pub rg_album_gain: Option<f32>,
    #[serde(rename = "@albumGain", default)]
    pub album_gain: Option<f32>,

    #[serde(rename = "@replayGainTrackPeak", default)]
    pub replay_gain_track_peak: Option<f32>,
    #[serde(rename = "@rgTrackPeak", default)]
    pub rg_track_peak: Option<f32>,
    #[serde(rename = "@trackPeak", default)]
    pub track_peak: Option<f32>,

    #[serde(rename = "@replayGainAlbumPeak", default)]
    pub replay_gain_album_peak: Option<f32>,
    #[serde(rename = "@rgAlbumPeak", default)]
    pub rg_album_peak: Option<f32>,
    #[serde(rename = "@albumPeak", default)]
    pub album_peak: Option<f32>,
}

fn first_some(values: [Option<f32>; 3]) -> Option<f32> {
    values.into_iter().flatten().next()
}

impl SongXml {
    pub fn into_track(self) -> Track {
        let track_gain_db = first_some([
            self.replay_gain_track_gain,
            self.rg_track_gain,
            self.track_gain,
        ]);
        let album_gain_db = first_some([
            self.replay_gain_album_gain,
            self.rg_album_gain,
            self.album_gain,
        ]);
        let track_peak = first_some([
            self.replay_gain_track_peak,
            self.rg_track_peak,
            self.track_peak,
        ]);
        let album_peak = first_some([
            self.replay_gain_album_peak,
            self.rg_album_peak,
            self.album_peak,
        ]);
        Track {
            track_id: self.id,
            title: self.title,
            artist: self.artist,
            album: self.album,
            album_id: self.album_id,
            cover_art_id: self.cover_art,
            duration_s: self.duration,
            track_number: self.track,
            mime: self
                .content_type
                .or(self.suffix)
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            track_gain_db,
            album_gain_db,
            track_peak,
            album_peak,
        }
    }
}

impl From<AlbumSummaryXml> for Album {
    fn from(xml: AlbumSummaryXml) -> Self {
        Album {
            id: xml.id,
            name: xml.name,
            artist: xml.artist,
            cover_art_id: xml.cover_art,
            song_count: xml.song_count,
            duration_s: xml.duration,
        }
    }
}

impl From<ArtistSummaryXml> for Artist {
    fn from(xml: ArtistSummaryXml) -> Self {
        Artist {
            id: xml.id,
            name: xml.name,
            cover_art_id: xml.cover_art,
            album_count: xml.album_count,
        }
    }
}

/// Parses a response body and returns the `Envelope`, translating a non-"ok" status into a
/// `PlaybackError::Protocol` (§7: protocol errors are not retried).
pub fn parse_envelope(endpoint: &str, body: &str) -> Result<Envelope, PlaybackError> {
    let envelope: Envelope = quick_xml::de::from_str(body)
        .map_err(|err| PlaybackError::protocol(endpoint, format!("malformed XML: {err}")))?;
    if envelope.status != "ok" {
        let message = envelope
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "server returned an error status".to_string());
        return Err(PlaybackError::protocol(endpoint, message));
    }
    Ok(envelope)
}

pub fn album_list(endpoint: &str, envelope: Envelope) -> Result<Vec<Album>, PlaybackError> {
    let list = envelope
        .album_list2
        .ok_or_else(|| PlaybackError::protocol(endpoint, "missing albumList2 element"))?;
    Ok(list.album.into_iter().map(Album::from).collect())
}

pub fn album_detail(endpoint: &str, envelope: Envelope) -> Result<AlbumDetail, PlaybackError> {
    let album_xml = envelope
        .album
        .ok_or_else(|| PlaybackError::protocol(endpoint, "missing album element"))?;
    let tracks = album_xml.song.iter().cloned().map(SongXml::into_track).collect();
    let album = Album {
        id: album_xml.id,
        name: album_xml.name,
        artist: album_xml.artist,
        cover_art_id: album_xml.cover_art,
        song_count: album_xml.song_count,
        duration_s: album_xml.duration,
    };
    Ok(AlbumDetail { album, tracks })
}

pub fn artists(endpoint: &str, envelope: Envelope) -> Result<Vec<Artist>, PlaybackError> {
    let artists_xml = envelope
        .artists
        .ok_or_else(|| PlaybackError::protocol(endpoint, "missing artists element"))?;
    Ok(artists_xml.artist.into_iter().map(Artist::from).collect())
}

pub fn artist_albums(endpoint: &str, envelope: Envelope) -> Result<Vec<Album>, PlaybackError> {
    let artist_xml = envelope
        .artist
        .ok_or_else(|| PlaybackError::protocol(endpoint, "missing artist element"))?;
    Ok(artist_xml.album.into_iter().map(Album::from).collect())
}

pub fn search_result(endpoint: &str, envelope: Envelope) -> Result<SearchResult, PlaybackError> {
    let search_xml = envelope.search_result3.unwrap_or_default();
    let _ = endpoint;
    Ok(SearchResult {
        artists: search_xml.artist.into_iter().map(Artist::from).collect(),
        albums: search_xml.album.into_iter().map(Album::from).collect(),
        songs: search_xml.song.into_iter().map(SongXml::into_track).collect(),
    })
}

pub fn random_songs(endpoint: &str, envelope: Envelope) -> Result<Vec<Track>, PlaybackError> {
    let songs_xml = envelope
        .random_songs
        .ok_or_else(|| PlaybackError::protocol(endpoint, "missing randomSongs element"))?;
    Ok(songs_xml.song.into_iter().map(SongXml::into_track).collect())
}
