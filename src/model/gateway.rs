use serde::{Deserialize, Serialize};
use serde_aux::prelude::*;

use super::track::RawTrack;

/// Frame received on a node's websocket, dispatched by `op`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum NodeMessage {
    Ready(Ready),
    Stats(Stats),
    PlayerUpdate(PlayerUpdate),
    Event(PlayerEvent),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u64,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub guild_id: u64,
    pub state: PlayerUpdateState,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    pub time: u64,
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

/// Playback event emitted by a node for one player, dispatched by `type`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        guild_id: u64,
        track: RawTrack,
    },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        guild_id: u64,
        track: Option<RawTrack>,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        guild_id: u64,
        track: Option<RawTrack>,
        exception: TrackException,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        guild_id: u64,
        track: Option<RawTrack>,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        guild_id: u64,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    #[serde(rename = "SegmentsLoaded", rename_all = "camelCase")]
    SegmentsLoaded {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        guild_id: u64,
        segments: Vec<SponsorSegment>,
    },
    #[serde(rename = "SegmentSkipped", rename_all = "camelCase")]
    SegmentSkipped {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        guild_id: u64,
        segment: SponsorSegment,
    },
    #[serde(rename = "ChapterStarted", rename_all = "camelCase")]
    ChapterStarted {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        guild_id: u64,
        chapter: Chapter,
    },
    #[serde(rename = "ChaptersLoaded", rename_all = "camelCase")]
    ChaptersLoaded {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        guild_id: u64,
        chapters: Vec<Chapter>,
    },
}

impl PlayerEvent {
    pub fn guild_id(&self) -> u64 {
        match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::WebSocketClosed { guild_id, .. }
            | Self::SegmentsLoaded { guild_id, .. }
            | Self::SegmentSkipped { guild_id, .. }
            | Self::ChapterStarted { guild_id, .. }
            | Self::ChaptersLoaded { guild_id, .. } => *guild_id,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: String,
    pub cause: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorSegment {
    pub category: String,
    pub start: u64,
    pub end: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub duration: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_ready_frame() {
        let frame = r#"{"op":"ready","resumed":false,"sessionId":"la3kfltkdt8gp9vfd"}"#;

        match serde_json::from_str::<NodeMessage>(frame).unwrap() {
            NodeMessage::Ready(ready) => {
                assert!(!ready.resumed);
                assert_eq!(ready.session_id, "la3kfltkdt8gp9vfd");
            }
            other => panic!("expected ready frame, got {:?}", other),
        }
    }

    #[test]
    fn dispatches_track_end_event() {
        let frame = r#"{
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "987654321",
            "track": null,
            "reason": "finished"
        }"#;

        match serde_json::from_str::<NodeMessage>(frame).unwrap() {
            NodeMessage::Event(PlayerEvent::TrackEnd { guild_id, reason, .. }) => {
                assert_eq!(guild_id, 987_654_321);
                assert_eq!(reason, TrackEndReason::Finished);
            }
            other => panic!("expected track end event, got {:?}", other),
        }
    }

    #[test]
    fn dispatches_player_update() {
        let frame = r#"{
            "op": "playerUpdate",
            "guildId": "42",
            "state": {"time": 1, "position": 5000, "connected": true, "ping": 12}
        }"#;

        match serde_json::from_str::<NodeMessage>(frame).unwrap() {
            NodeMessage::PlayerUpdate(update) => {
                assert_eq!(update.guild_id, 42);
                assert_eq!(update.state.position, 5000);
            }
            other => panic!("expected player update, got {:?}", other),
        }
    }
}
