use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::{
    error::MagmalinkError,
    model::gateway::{Chapter, SponsorSegment, TrackEndReason, TrackException},
    model::track::Track,
    node::Node,
    player::{Player, PlayerSnapshot, PlayerStateChange},
    types::GuildId,
};

/// Subscription surface for everything the library emits. Every method has a
/// no-op default, so handlers implement only what they care about.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn debug(&self, _message: String) {}

    /// A node was registered with the manager.
    async fn node_create(&self, _node: Arc<Node>) {}
    /// A node was removed from the pool; its players have been migrated.
    async fn node_destroy(&self, _node: Arc<Node>) {}
    async fn node_connect(&self, _node: Arc<Node>) {}
    async fn node_reconnect(&self, _node: Arc<Node>) {}
    async fn node_disconnect(&self, _node: Arc<Node>, _code: u16, _reason: String) {}
    /// A node failed terminally, e.g. its reconnect budget ran out.
    async fn node_error(&self, _node: Arc<Node>, _error: MagmalinkError) {}
    /// Raw frame from a node, before any dispatching.
    async fn node_raw(&self, _payload: Value) {}

    async fn player_create(&self, _player: Arc<Player>) {}
    async fn player_destroy(&self, _player: Arc<Player>, _reason: Option<String>) {}
    /// Before/after snapshot pair around one observable mutation.
    async fn player_state_update(
        &self,
        _old: PlayerSnapshot,
        _new: PlayerSnapshot,
        _change: PlayerStateChange,
    ) {
    }
    async fn player_move(&self, _player: Arc<Player>, _old_channel: Option<u64>, _new_channel: u64) {}
    async fn player_disconnect(&self, _player: Arc<Player>, _old_channel: Option<u64>) {}

    async fn track_start(&self, _player: Arc<Player>, _track: Track) {}
    async fn track_end(&self, _player: Arc<Player>, _track: Option<Track>, _reason: TrackEndReason) {}
    async fn track_stuck(&self, _player: Arc<Player>, _track: Option<Track>, _threshold_ms: u64) {}
    async fn track_error(&self, _player: Arc<Player>, _track: Option<Track>, _error: TrackException) {}
    async fn queue_end(&self, _player: Arc<Player>) {}
    /// The voice websocket between node and platform closed.
    async fn socket_closed(&self, _player: Arc<Player>, _code: u16, _reason: String, _by_remote: bool) {}

    async fn segments_loaded(&self, _player: Arc<Player>, _segments: Vec<SponsorSegment>) {}
    async fn segment_skipped(&self, _player: Arc<Player>, _segment: SponsorSegment) {}
    async fn chapter_started(&self, _player: Arc<Player>, _chapter: Chapter) {}
    async fn chapters_loaded(&self, _player: Arc<Player>, _chapters: Vec<Chapter>) {}
}

pub(crate) enum Event {
    Debug(String),
    NodeCreate(Arc<Node>),
    NodeDestroy(Arc<Node>),
    NodeConnect(Arc<Node>),
    NodeReconnect(Arc<Node>),
    NodeDisconnect { node: Arc<Node>, code: u16, reason: String },
    NodeError { node: Arc<Node>, error: MagmalinkError },
    NodeRaw(Value),
    PlayerCreate(Arc<Player>),
    PlayerDestroy { player: Arc<Player>, reason: Option<String> },
    PlayerStateUpdate { old: PlayerSnapshot, new: PlayerSnapshot, change: PlayerStateChange },
    PlayerMove { player: Arc<Player>, old_channel: Option<GuildId>, new_channel: GuildId },
    PlayerDisconnect { player: Arc<Player>, old_channel: Option<GuildId> },
    TrackStart { player: Arc<Player>, track: Track },
    TrackEnd { player: Arc<Player>, track: Option<Track>, reason: TrackEndReason },
    TrackStuck { player: Arc<Player>, track: Option<Track>, threshold_ms: u64 },
    TrackError { player: Arc<Player>, track: Option<Track>, error: TrackException },
    QueueEnd(Arc<Player>),
    SocketClosed { player: Arc<Player>, code: u16, reason: String, by_remote: bool },
    SegmentsLoaded { player: Arc<Player>, segments: Vec<SponsorSegment> },
    SegmentSkipped { player: Arc<Player>, segment: SponsorSegment },
    ChapterStarted { player: Arc<Player>, chapter: Chapter },
    ChaptersLoaded { player: Arc<Player>, chapters: Vec<Chapter> },
}

/// Hands one event to the handler on its own task so a slow subscriber never
/// stalls a node's read loop.
pub(crate) fn process(handler: Arc<dyn EventHandler>, event: Event) {
    tokio::spawn(async move {
        match event {
            Event::Debug(message) => handler.debug(message).await,
            Event::NodeCreate(node) => handler.node_create(node).await,
            Event::NodeDestroy(node) => handler.node_destroy(node).await,
            Event::NodeConnect(node) => handler.node_connect(node).await,
            Event::NodeReconnect(node) => handler.node_reconnect(node).await,
            Event::NodeDisconnect { node, code, reason } => {
                handler.node_disconnect(node, code, reason).await
            }
            Event::NodeError { node, error } => handler.node_error(node, error).await,
            Event::NodeRaw(payload) => handler.node_raw(payload).await,
            Event::PlayerCreate(player) => handler.player_create(player).await,
            Event::PlayerDestroy { player, reason } => handler.player_destroy(player, reason).await,
            Event::PlayerStateUpdate { old, new, change } => {
                handler.player_state_update(old, new, change).await
            }
            Event::PlayerMove { player, old_channel, new_channel } => {
                handler.player_move(player, old_channel, new_channel).await
            }
            Event::PlayerDisconnect { player, old_channel } => {
                handler.player_disconnect(player, old_channel).await
            }
            Event::TrackStart { player, track } => handler.track_start(player, track).await,
            Event::TrackEnd { player, track, reason } => handler.track_end(player, track, reason).await,
            Event::TrackStuck { player, track, threshold_ms } => {
                handler.track_stuck(player, track, threshold_ms).await
            }
            Event::TrackError { player, track, error } => {
                handler.track_error(player, track, error).await
            }
            Event::QueueEnd(player) => handler.queue_end(player).await,
            Event::SocketClosed { player, code, reason, by_remote } => {
                handler.socket_closed(player, code, reason, by_remote).await
            }
            Event::SegmentsLoaded { player, segments } => {
                handler.segments_loaded(player, segments).await
            }
            Event::SegmentSkipped { player, segment } => {
                handler.segment_skipped(player, segment).await
            }
            Event::ChapterStarted { player, chapter } => {
                handler.chapter_started(player, chapter).await
            }
            Event::ChaptersLoaded { player, chapters } => {
                handler.chapters_loaded(player, chapters).await
            }
        }
    });
}
