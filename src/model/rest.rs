use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::track::{RawTrack, Track};

/// Body of `PATCH /v4/sessions/{sid}/players/{guildId}`. Only the present
/// fields reach the wire, so a patch touches exactly what it names.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceUpdate>,
}

/// `encoded: null` tells the node to stop the current track, so the field is
/// always serialized once the `track` block is present.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    pub encoded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUpdate {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSession {
    pub resuming: bool,
    pub timeout: u64,
}

/// Result of `GET /v4/loadtracks`, dispatched by `loadType`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    Track(RawTrack),
    Playlist(RawPlaylist),
    Search(Vec<RawTrack>),
    Empty(Option<Value>),
    Error(LoadException),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylist {
    pub info: RawPlaylistInfo,
    #[serde(default)]
    pub plugin_info: Map<String, Value>,
    pub tracks: Vec<RawTrack>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylistInfo {
    pub name: String,
    pub selected_track: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoadException {
    pub message: Option<String>,
    pub severity: String,
    pub cause: String,
}

/// Search outcome after canonicalization, handed back to callers.
#[derive(Clone, Debug)]
pub struct SearchResult {
    pub load_type: LoadType,
    pub tracks: Vec<Track>,
    pub playlist: Option<PlaylistData>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

#[derive(Clone, Debug)]
pub struct PlaylistData {
    pub name: String,
    pub selected_track: Option<i64>,
    /// Summed duration of every playlist track, in milliseconds.
    pub duration: u64,
}

/// Player object returned by `GET /v4/sessions/{sid}/players`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestPlayer {
    pub guild_id: String,
    pub track: Option<RawTrack>,
    pub volume: u16,
    pub paused: bool,
    pub state: RestPlayerState,
    pub voice: RestVoiceState,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestPlayerState {
    pub time: u64,
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestVoiceState {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub session_id: String,
}

/// Result of `GET /v4/info`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: NodeVersion,
    #[serde(default)]
    pub source_managers: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<NodePlugin>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersion {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodePlugin {
    pub name: String,
    pub version: String,
}

/// Lyrics payload served by lyrics-capable plugins.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lyrics {
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub lines: Vec<LyricsLine>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LyricsLine {
    pub timestamp: Option<u64>,
    pub duration: Option<u64>,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_patch_serializes_explicit_null() {
        let patch = UpdatePlayer {
            track: Some(UpdatePlayerTrack { encoded: None, user_data: None }),
            ..Default::default()
        };

        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({"track": {"encoded": null}}));
    }

    #[test]
    fn absent_fields_stay_off_the_wire() {
        let patch = UpdatePlayer {
            volume: Some(70),
            ..Default::default()
        };

        assert_eq!(serde_json::to_string(&patch).unwrap(), r#"{"volume":70}"#);
    }

    #[test]
    fn load_result_dispatches_on_load_type() {
        let body = r#"{"loadType":"empty","data":{}}"#;
        assert!(matches!(serde_json::from_str::<LoadResult>(body).unwrap(), LoadResult::Empty(_)));

        let body = r#"{
            "loadType": "error",
            "data": {"message": "no matches", "severity": "common", "cause": "none"}
        }"#;
        assert!(matches!(serde_json::from_str::<LoadResult>(body).unwrap(), LoadResult::Error(_)));
    }
}
