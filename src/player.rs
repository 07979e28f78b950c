use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{
    error::{MagmalinkError, MagmalinkResult},
    events::Event,
    filters::Filters,
    manager::Manager,
    model::gateway::{PlayerEvent, PlayerUpdateState, TrackEndReason},
    model::rest::{UpdatePlayer, UpdatePlayerTrack, VoiceUpdate},
    model::track::Track,
    node::Node,
    queue::Queue,
    types::GuildId,
};

/// Options a player is created with.
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub guild_id: GuildId,
    pub text_channel_id: Option<u64>,
    pub voice_channel_id: Option<u64>,
    pub volume: u16,
    pub self_deaf: bool,
    pub self_mute: bool,
    /// Pin the player to a specific node instead of letting the manager pick.
    pub node_identifier: Option<String>,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            guild_id: 0,
            text_channel_id: None,
            voice_channel_id: None,
            volume: 100,
            self_deaf: true,
            self_mute: false,
            node_identifier: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlayerStateKind {
    Connected,
    Connecting,
    Disconnected,
    Disconnecting,
    Destroying,
}

/// The two asynchronous halves of a voice connection plus the session id,
/// pushed to the hosting node once all three are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSessionState {
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub endpoint: Option<String>,
}

impl VoiceSessionState {
    pub fn is_complete(&self) -> bool {
        self.session_id.is_some() && self.token.is_some() && self.endpoint.is_some()
    }
}

/// Serializable point-in-time view of a player. Doubles as the on-disk
/// session snapshot; back references to the manager and node handles are
/// reduced to the node identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub guild_id: GuildId,
    pub node: String,
    pub text_channel_id: Option<u64>,
    pub voice_channel_id: Option<u64>,
    pub self_deaf: bool,
    pub self_mute: bool,
    pub playing: bool,
    pub paused: bool,
    pub volume: u16,
    pub position: u64,
    pub ping: i64,
    pub state: PlayerStateKind,
    pub track_repeat: bool,
    pub queue_repeat: bool,
    pub dynamic_repeat: bool,
    pub dynamic_repeat_interval_ms: Option<u64>,
    pub is_autoplay: bool,
    pub autoplay_tries: u8,
    pub voice_state: VoiceSessionState,
    pub queue: Queue,
    pub filters: Filters,
    #[serde(default)]
    pub user_data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChangeKind {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatMode {
    Off,
    Track,
    Queue,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueChangeKind {
    Add,
    Remove,
    Clear,
    Shuffle,
    RoundRobin,
    UserBlock,
    AutoPlayAdd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChangeKind {
    Start,
    End,
    Previous,
    TimeUpdate,
    AutoPlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelChangeKind {
    Voice,
    Text,
}

/// What changed in a `player_state_update`, with the before/after detail the
/// snapshots alone do not spell out.
#[derive(Debug, Clone)]
pub enum PlayerStateChange {
    AutoPlayChange { enabled: bool },
    ConnectionChange { kind: ConnectionChangeKind },
    RepeatChange { mode: RepeatMode },
    PauseChange { paused: bool },
    QueueChange { kind: QueueChangeKind, tracks: Vec<Track> },
    TrackChange { kind: TrackChangeKind, old: Option<Track>, new: Option<Track> },
    VolumeChange { old: u16, new: u16 },
    ChannelChange { kind: ChannelChangeKind, old: Option<u64>, new: Option<u64> },
    PlayerCreate,
    PlayerDestroy,
}

#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    pub track: Option<Track>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub no_replace: bool,
    pub paused: Option<bool>,
}

pub(crate) struct PlayerInner {
    node: Arc<Node>,
    text_channel_id: Option<u64>,
    voice_channel_id: Option<u64>,
    self_deaf: bool,
    self_mute: bool,
    playing: bool,
    paused: bool,
    volume: u16,
    position: u64,
    ping: i64,
    voice_connected: bool,
    state: PlayerStateKind,
    queue: Queue,
    filters: Filters,
    track_repeat: bool,
    queue_repeat: bool,
    dynamic_repeat: bool,
    dynamic_repeat_interval: Option<Duration>,
    dynamic_repeat_task: Option<JoinHandle<()>>,
    is_autoplay: bool,
    autoplay_tries: u8,
    autoplay_bot_user: Option<Value>,
    explicit_stop: bool,
    voice_state: VoiceSessionState,
    user_data: Map<String, Value>,
}

/// Per-guild audio session, bound to exactly one node at a time. All state
/// lives behind one lock so player operations and the hosting node's event
/// dispatch serialize against each other.
pub struct Player {
    pub guild_id: GuildId,
    pub(crate) manager: Weak<Manager>,
    inner: RwLock<PlayerInner>,
}

impl Player {
    pub(crate) fn new(
        manager: Weak<Manager>,
        node: Arc<Node>,
        options: PlayerOptions,
        max_previous: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            guild_id: options.guild_id,
            manager,
            inner: RwLock::new(PlayerInner {
                node,
                text_channel_id: options.text_channel_id,
                voice_channel_id: options.voice_channel_id,
                self_deaf: options.self_deaf,
                self_mute: options.self_mute,
                playing: false,
                paused: false,
                volume: options.volume,
                position: 0,
                ping: 0,
                voice_connected: false,
                state: PlayerStateKind::Disconnected,
                queue: Queue::new(max_previous),
                filters: Filters::default(),
                track_repeat: false,
                queue_repeat: false,
                dynamic_repeat: false,
                dynamic_repeat_interval: None,
                dynamic_repeat_task: None,
                is_autoplay: false,
                autoplay_tries: 3,
                autoplay_bot_user: None,
                explicit_stop: false,
                voice_state: VoiceSessionState::default(),
                user_data: Map::new(),
            }),
        })
    }

    fn snapshot_inner(&self, inner: &PlayerInner) -> PlayerSnapshot {
        PlayerSnapshot {
            guild_id: self.guild_id,
            node: inner.node.identifier(),
            text_channel_id: inner.text_channel_id,
            voice_channel_id: inner.voice_channel_id,
            self_deaf: inner.self_deaf,
            self_mute: inner.self_mute,
            playing: inner.playing,
            paused: inner.paused,
            volume: inner.volume,
            position: inner.position,
            ping: inner.ping,
            state: inner.state,
            track_repeat: inner.track_repeat,
            queue_repeat: inner.queue_repeat,
            dynamic_repeat: inner.dynamic_repeat,
            dynamic_repeat_interval_ms: inner.dynamic_repeat_interval.map(|d| d.as_millis() as u64),
            is_autoplay: inner.is_autoplay,
            autoplay_tries: inner.autoplay_tries,
            voice_state: inner.voice_state.clone(),
            queue: inner.queue.clone(),
            filters: inner.filters.clone(),
            user_data: inner.user_data.clone(),
        }
    }

    /// Consistent point-in-time view of the player.
    pub async fn snapshot(&self) -> PlayerSnapshot {
        let inner = self.inner.read().await;
        self.snapshot_inner(&inner)
    }

    fn dispatch(&self, event: Event) {
        if let Some(manager) = self.manager.upgrade() {
            manager.dispatch(event);
        }
    }

    async fn emit_state_update(&self, old: PlayerSnapshot, change: PlayerStateChange) {
        let new = self.snapshot().await;
        self.dispatch(Event::PlayerStateUpdate { old, new, change });
    }

    pub async fn node(&self) -> Arc<Node> {
        Arc::clone(&self.inner.read().await.node)
    }

    pub async fn playing(&self) -> bool {
        self.inner.read().await.playing
    }

    pub async fn paused(&self) -> bool {
        self.inner.read().await.paused
    }

    pub async fn volume(&self) -> u16 {
        self.inner.read().await.volume
    }

    pub async fn position(&self) -> u64 {
        self.inner.read().await.position
    }

    /// Whether the node reports the voice connection as up.
    pub async fn voice_connected(&self) -> bool {
        self.inner.read().await.voice_connected
    }

    pub async fn state(&self) -> PlayerStateKind {
        self.inner.read().await.state
    }

    pub async fn voice_channel_id(&self) -> Option<u64> {
        self.inner.read().await.voice_channel_id
    }

    pub async fn text_channel_id(&self) -> Option<u64> {
        self.inner.read().await.text_channel_id
    }

    pub async fn is_autoplay(&self) -> bool {
        self.inner.read().await.is_autoplay
    }

    pub async fn queue(&self) -> Queue {
        self.inner.read().await.queue.clone()
    }

    pub async fn filters(&self) -> Filters {
        self.inner.read().await.filters.clone()
    }

    pub async fn set_user_data(&self, key: &str, value: Value) {
        self.inner.write().await.user_data.insert(key.to_string(), value);
    }

    pub async fn get_user_data(&self, key: &str) -> Option<Value> {
        self.inner.read().await.user_data.get(key).cloned()
    }

    pub(crate) async fn autoplay_settings(&self) -> (bool, u8, Option<Value>) {
        let inner = self.inner.read().await;
        (inner.is_autoplay, inner.autoplay_tries, inner.autoplay_bot_user.clone())
    }

    // ---- queue -------------------------------------------------------------

    /// Adds tracks to the queue, optionally at an offset. Emits a single
    /// queue-change state update; additions requested by the cached bot user
    /// are reported as autoplay inserts.
    pub async fn add_to_queue(
        self: &Arc<Self>,
        tracks: Vec<Track>,
        offset: Option<usize>,
    ) -> MagmalinkResult<()> {
        if tracks.is_empty() {
            return Ok(());
        }

        let (old, kind) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);

            let bot_user = inner.autoplay_bot_user.clone();
            let kind = if bot_user.is_some()
                && tracks.iter().all(|t| t.requester == bot_user)
            {
                QueueChangeKind::AutoPlayAdd
            } else {
                QueueChangeKind::Add
            };

            inner.queue.add_many(tracks.clone(), offset);
            (old, kind)
        };

        self.emit_state_update(old, PlayerStateChange::QueueChange { kind, tracks }).await;
        Ok(())
    }

    pub async fn remove_from_queue(self: &Arc<Self>, position: usize) -> MagmalinkResult<Track> {
        let (old, removed) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            let removed = inner.queue.remove(position)?;
            (old, removed)
        };

        self.emit_state_update(
            old,
            PlayerStateChange::QueueChange {
                kind: QueueChangeKind::Remove,
                tracks: vec![removed.clone()],
            },
        )
        .await;

        Ok(removed)
    }

    pub async fn remove_queue_range(
        self: &Arc<Self>,
        start: usize,
        end: usize,
    ) -> MagmalinkResult<Vec<Track>> {
        let (old, removed) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            let removed = inner.queue.remove_range(start, end)?;
            (old, removed)
        };

        self.emit_state_update(
            old,
            PlayerStateChange::QueueChange {
                kind: QueueChangeKind::Remove,
                tracks: removed.clone(),
            },
        )
        .await;

        Ok(removed)
    }

    pub async fn clear_queue(self: &Arc<Self>) {
        let (old, cleared) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            let cleared = inner.queue.clear();
            (old, cleared)
        };

        self.emit_state_update(
            old,
            PlayerStateChange::QueueChange { kind: QueueChangeKind::Clear, tracks: cleared },
        )
        .await;
    }

    pub async fn shuffle_queue(self: &Arc<Self>) {
        let old = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            inner.queue.shuffle();
            old
        };

        self.emit_state_update(
            old,
            PlayerStateChange::QueueChange { kind: QueueChangeKind::Shuffle, tracks: Vec::new() },
        )
        .await;
    }

    pub async fn user_block_shuffle_queue(self: &Arc<Self>) {
        let old = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            inner.queue.user_block_shuffle();
            old
        };

        self.emit_state_update(
            old,
            PlayerStateChange::QueueChange { kind: QueueChangeKind::UserBlock, tracks: Vec::new() },
        )
        .await;
    }

    pub async fn round_robin_shuffle_queue(self: &Arc<Self>) {
        let old = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            inner.queue.round_robin_shuffle();
            old
        };

        self.emit_state_update(
            old,
            PlayerStateChange::QueueChange { kind: QueueChangeKind::RoundRobin, tracks: Vec::new() },
        )
        .await;
    }

    // ---- playback ----------------------------------------------------------

    /// Plays `queue.current`, shifting the next upcoming track into place
    /// when nothing is current.
    pub async fn play(self: &Arc<Self>) -> MagmalinkResult<()> {
        self.play_with(PlayOptions::default()).await
    }

    /// Replaces the current track immediately.
    pub async fn play_track(self: &Arc<Self>, track: Track) -> MagmalinkResult<()> {
        self.play_with(PlayOptions { track: Some(track), ..Default::default() }).await
    }

    pub async fn play_with(self: &Arc<Self>, options: PlayOptions) -> MagmalinkResult<()> {
        let (node, old, old_current, track, volume) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            let old_current = inner.queue.current.clone();

            if let Some(track) = options.track.clone() {
                inner.queue.current = Some(track);
            } else if inner.queue.current.is_none() && inner.queue.advance().is_none() {
                return Err(MagmalinkError::NothingToPlay);
            }

            inner.position = options.start_time.unwrap_or(0);
            let track = inner.queue.current.clone().expect("current was just populated");
            (Arc::clone(&inner.node), old, old_current, track, inner.volume)
        };

        let patch = UpdatePlayer {
            track: Some(UpdatePlayerTrack { encoded: Some(track.track.clone()), user_data: None }),
            position: options.start_time,
            end_time: options.end_time,
            volume: Some(volume),
            paused: options.paused,
            ..Default::default()
        };

        node.update_player(self.guild_id, &patch, options.no_replace).await?;

        if old_current.as_ref().map(|t| &t.track) != Some(&track.track) {
            self.emit_state_update(
                old,
                PlayerStateChange::TrackChange {
                    kind: TrackChangeKind::Start,
                    old: old_current,
                    new: Some(track),
                },
            )
            .await;
        }

        Ok(())
    }

    /// Stops the current track. `amount` skips ahead: `stop(n)` drops `n - 1`
    /// upcoming tracks before stopping, so the following track-end advances
    /// straight to the target.
    pub async fn stop(self: &Arc<Self>, amount: Option<usize>) -> MagmalinkResult<()> {
        if amount == Some(0) {
            return Err(MagmalinkError::InvalidQueuePosition(0));
        }

        let (node, old, dropped) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            let dropped = match amount {
                Some(n) => inner.queue.drop_front(n - 1),
                None => Vec::new(),
            };
            inner.explicit_stop = true;
            (Arc::clone(&inner.node), old, dropped)
        };

        if !dropped.is_empty() {
            self.emit_state_update(
                old,
                PlayerStateChange::QueueChange { kind: QueueChangeKind::Remove, tracks: dropped },
            )
            .await;
        }

        let patch = UpdatePlayer {
            track: Some(UpdatePlayerTrack { encoded: None, user_data: None }),
            ..Default::default()
        };
        node.update_player(self.guild_id, &patch, false).await?;

        Ok(())
    }

    pub async fn pause(self: &Arc<Self>, paused: bool) -> MagmalinkResult<()> {
        let (node, old) = {
            let mut inner = self.inner.write().await;
            if inner.paused == paused {
                return Ok(());
            }

            let old = self.snapshot_inner(&inner);
            inner.paused = paused;
            inner.playing = !paused && inner.queue.current.is_some();
            (Arc::clone(&inner.node), old)
        };

        self.emit_state_update(old, PlayerStateChange::PauseChange { paused }).await;

        let patch = UpdatePlayer { paused: Some(paused), ..Default::default() };
        node.update_player(self.guild_id, &patch, false).await?;

        Ok(())
    }

    /// Jumps to a position in the current track, clamped to its duration.
    pub async fn seek(self: &Arc<Self>, position: u64) -> MagmalinkResult<()> {
        let (node, old, clamped) = {
            let mut inner = self.inner.write().await;
            let current = inner.queue.current.clone().ok_or(MagmalinkError::NothingToPlay)?;

            if current.is_seekable == Some(false) {
                return Err(MagmalinkError::TrackNotSeekable);
            }

            let old = self.snapshot_inner(&inner);
            let clamped = current.duration.map(|d| position.min(d)).unwrap_or(position);
            inner.position = clamped;
            (Arc::clone(&inner.node), old, clamped)
        };

        let patch = UpdatePlayer { position: Some(clamped), ..Default::default() };
        node.update_player(self.guild_id, &patch, false).await?;

        self.emit_state_update(
            old,
            PlayerStateChange::TrackChange { kind: TrackChangeKind::TimeUpdate, old: None, new: None },
        )
        .await;

        Ok(())
    }

    pub async fn set_volume(self: &Arc<Self>, volume: u16) -> MagmalinkResult<()> {
        if volume > 1000 {
            return Err(MagmalinkError::InvalidVolume(volume));
        }

        let (node, old, previous) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            let previous = inner.volume;
            inner.volume = volume;
            (Arc::clone(&inner.node), old, previous)
        };

        let patch = UpdatePlayer { volume: Some(volume), ..Default::default() };
        node.update_player(self.guild_id, &patch, false).await?;

        self.emit_state_update(old, PlayerStateChange::VolumeChange { old: previous, new: volume })
            .await;

        Ok(())
    }

    /// Steps back through history: the current track returns to the front of
    /// the queue and the most recent history entry starts playing.
    pub async fn previous(self: &Arc<Self>) -> MagmalinkResult<()> {
        let (node, old, old_current, track, volume) = {
            let mut inner = self.inner.write().await;
            let previous = inner.queue.pop_previous().ok_or(MagmalinkError::EmptyHistory)?;

            let old = self.snapshot_inner(&inner);
            let old_current = inner.queue.current.take();
            if let Some(current) = old_current.clone() {
                inner.queue.push_front(current);
            }
            inner.queue.current = Some(previous.clone());
            inner.position = 0;
            (Arc::clone(&inner.node), old, old_current, previous, inner.volume)
        };

        let patch = UpdatePlayer {
            track: Some(UpdatePlayerTrack { encoded: Some(track.track.clone()), user_data: None }),
            volume: Some(volume),
            ..Default::default()
        };
        node.update_player(self.guild_id, &patch, false).await?;

        self.emit_state_update(
            old,
            PlayerStateChange::TrackChange {
                kind: TrackChangeKind::Previous,
                old: old_current,
                new: Some(track),
            },
        )
        .await;

        Ok(())
    }

    /// Restarts the current track from the beginning, or starts the queue
    /// when nothing is current.
    pub async fn restart(self: &Arc<Self>) -> MagmalinkResult<()> {
        let has_current = self.inner.read().await.queue.current.is_some();

        if has_current {
            self.seek(0).await
        } else {
            self.play().await
        }
    }

    // ---- repeat modes ------------------------------------------------------

    pub async fn set_track_repeat(self: &Arc<Self>, enabled: bool) {
        let old = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            Self::clear_repeat(&mut inner);
            inner.track_repeat = enabled;
            old
        };

        let mode = if enabled { RepeatMode::Track } else { RepeatMode::Off };
        self.emit_state_update(old, PlayerStateChange::RepeatChange { mode }).await;
    }

    pub async fn set_queue_repeat(self: &Arc<Self>, enabled: bool) {
        let old = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            Self::clear_repeat(&mut inner);
            inner.queue_repeat = enabled;
            old
        };

        let mode = if enabled { RepeatMode::Queue } else { RepeatMode::Off };
        self.emit_state_update(old, PlayerStateChange::RepeatChange { mode }).await;
    }

    /// Queue repeat that also reshuffles the upcoming sequence on a fixed
    /// interval while the mode is active.
    pub async fn set_dynamic_repeat(
        self: &Arc<Self>,
        enabled: bool,
        interval: Duration,
    ) -> MagmalinkResult<()> {
        if enabled && interval.is_zero() {
            return Err(MagmalinkError::InvalidConfig("dynamic repeat interval must be non-zero"));
        }

        let old = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            Self::clear_repeat(&mut inner);

            if enabled {
                inner.dynamic_repeat = true;
                inner.dynamic_repeat_interval = Some(interval);

                let player = Arc::downgrade(self);
                inner.dynamic_repeat_task = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        match player.upgrade() {
                            Some(player) => player.shuffle_queue().await,
                            None => break,
                        }
                    }
                }));
            }
            old
        };

        let mode = if enabled { RepeatMode::Dynamic } else { RepeatMode::Off };
        self.emit_state_update(old, PlayerStateChange::RepeatChange { mode }).await;

        Ok(())
    }

    fn clear_repeat(inner: &mut PlayerInner) {
        inner.track_repeat = false;
        inner.queue_repeat = false;
        inner.dynamic_repeat = false;
        inner.dynamic_repeat_interval = None;
        if let Some(task) = inner.dynamic_repeat_task.take() {
            task.abort();
        }
    }

    /// Enables autoplay. `bot_user` is the requester handle attached to
    /// autoplay inserts so they can be told apart from user additions.
    pub async fn set_autoplay(
        self: &Arc<Self>,
        enabled: bool,
        bot_user: Option<Value>,
        tries: Option<u8>,
    ) {
        let old = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            inner.is_autoplay = enabled;
            if let Some(bot_user) = bot_user {
                inner.autoplay_bot_user = Some(bot_user);
            }
            if let Some(tries) = tries {
                inner.autoplay_tries = tries;
            }
            old
        };

        self.emit_state_update(old, PlayerStateChange::AutoPlayChange { enabled }).await;
    }

    // ---- voice -------------------------------------------------------------

    /// Asks the chat gateway to join the player's voice channel.
    pub async fn connect(self: &Arc<Self>) -> MagmalinkResult<()> {
        let manager = self.manager.upgrade().ok_or(MagmalinkError::ManagerDropped)?;

        let (old, channel_id, self_mute, self_deaf) = {
            let mut inner = self.inner.write().await;
            let channel_id = inner.voice_channel_id.ok_or(MagmalinkError::NoVoiceChannel)?;
            let old = self.snapshot_inner(&inner);
            inner.state = PlayerStateKind::Connecting;
            (old, channel_id, inner.self_mute, inner.self_deaf)
        };

        manager.send_gateway(
            self.guild_id,
            json!({
                "op": 4,
                "d": {
                    "guild_id": self.guild_id.to_string(),
                    "channel_id": channel_id.to_string(),
                    "self_mute": self_mute,
                    "self_deaf": self_deaf,
                }
            }),
        );

        self.emit_state_update(
            old,
            PlayerStateChange::ConnectionChange { kind: ConnectionChangeKind::Connect },
        )
        .await;

        Ok(())
    }

    /// Leaves the voice channel and clears the voice binding.
    pub async fn disconnect(self: &Arc<Self>) -> MagmalinkResult<()> {
        let manager = self.manager.upgrade().ok_or(MagmalinkError::ManagerDropped)?;

        let (old, self_mute, self_deaf) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            inner.state = PlayerStateKind::Disconnecting;
            (old, inner.self_mute, inner.self_deaf)
        };

        manager.send_gateway(
            self.guild_id,
            json!({
                "op": 4,
                "d": {
                    "guild_id": self.guild_id.to_string(),
                    "channel_id": Value::Null,
                    "self_mute": self_mute,
                    "self_deaf": self_deaf,
                }
            }),
        );

        {
            let mut inner = self.inner.write().await;
            inner.voice_channel_id = None;
            inner.voice_state = VoiceSessionState::default();
            inner.playing = false;
            inner.state = PlayerStateKind::Disconnected;
        }

        self.emit_state_update(
            old,
            PlayerStateChange::ConnectionChange { kind: ConnectionChangeKind::Disconnect },
        )
        .await;

        Ok(())
    }

    pub async fn set_voice_channel(self: &Arc<Self>, channel_id: Option<u64>) {
        let (old, previous) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            let previous = inner.voice_channel_id;
            inner.voice_channel_id = channel_id;
            (old, previous)
        };

        self.emit_state_update(
            old,
            PlayerStateChange::ChannelChange {
                kind: ChannelChangeKind::Voice,
                old: previous,
                new: channel_id,
            },
        )
        .await;
    }

    pub async fn set_text_channel(self: &Arc<Self>, channel_id: Option<u64>) {
        let (old, previous) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            let previous = inner.text_channel_id;
            inner.text_channel_id = channel_id;
            (old, previous)
        };

        self.emit_state_update(
            old,
            PlayerStateChange::ChannelChange {
                kind: ChannelChangeKind::Text,
                old: previous,
                new: channel_id,
            },
        )
        .await;
    }

    /// Records the voice-server half (token + endpoint) and pushes the voice
    /// triple once complete.
    pub(crate) async fn set_voice_server(
        self: &Arc<Self>,
        token: String,
        endpoint: String,
    ) -> MagmalinkResult<()> {
        {
            let mut inner = self.inner.write().await;
            inner.voice_state.token = Some(token);
            inner.voice_state.endpoint = Some(endpoint);
        }

        self.try_push_voice().await
    }

    /// Records the voice-state half (session id) and pushes the voice triple
    /// once complete.
    pub(crate) async fn set_voice_session(self: &Arc<Self>, session_id: String) -> MagmalinkResult<()> {
        {
            let mut inner = self.inner.write().await;
            inner.voice_state.session_id = Some(session_id);
        }

        self.try_push_voice().await
    }

    async fn try_push_voice(self: &Arc<Self>) -> MagmalinkResult<()> {
        let (node, voice, has_channel, old) = {
            let inner = self.inner.read().await;
            (
                Arc::clone(&inner.node),
                inner.voice_state.clone(),
                inner.voice_channel_id.is_some(),
                self.snapshot_inner(&inner),
            )
        };

        if !voice.is_complete() || !has_channel {
            return Ok(());
        }

        let patch = UpdatePlayer {
            voice: Some(VoiceUpdate {
                token: voice.token.expect("checked complete"),
                endpoint: voice.endpoint.expect("checked complete"),
                session_id: voice.session_id.expect("checked complete"),
            }),
            ..Default::default()
        };
        node.update_player(self.guild_id, &patch, false).await?;

        let became_connected = {
            let mut inner = self.inner.write().await;
            let changed = inner.state != PlayerStateKind::Connected;
            inner.state = PlayerStateKind::Connected;
            changed
        };

        if became_connected {
            self.emit_state_update(
                old,
                PlayerStateChange::ConnectionChange { kind: ConnectionChangeKind::Connect },
            )
            .await;
        }

        Ok(())
    }

    // ---- teardown ----------------------------------------------------------

    /// Destroys the player: optionally leaves the voice channel, always tears
    /// the server-side player down and removes it from the manager.
    pub async fn destroy(self: &Arc<Self>, disconnect: bool) -> MagmalinkResult<()> {
        let manager = self.manager.upgrade().ok_or(MagmalinkError::ManagerDropped)?;

        if disconnect {
            if let Err(why) = self.disconnect().await {
                warn!("player {} failed disconnecting during destroy: {}", self.guild_id, why);
            }
        }

        let (node, old) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            inner.state = PlayerStateKind::Destroying;
            Self::clear_repeat(&mut inner);
            (Arc::clone(&inner.node), old)
        };

        if let Err(why) = node.destroy_player(self.guild_id).await {
            warn!("player {} failed server-side teardown: {}", self.guild_id, why);
        }

        manager.players.remove(&self.guild_id);
        manager.remove_player_state_file(self.guild_id).await;

        self.emit_state_update(old, PlayerStateChange::PlayerDestroy).await;
        self.dispatch(Event::PlayerDestroy { player: Arc::clone(self), reason: None });

        Ok(())
    }

    /// Removes the player from the manager without touching the server-side
    /// player, for hosts that want to re-adopt it later.
    pub async fn detach(self: &Arc<Self>) -> MagmalinkResult<()> {
        let manager = self.manager.upgrade().ok_or(MagmalinkError::ManagerDropped)?;

        {
            let mut inner = self.inner.write().await;
            Self::clear_repeat(&mut inner);
        }

        manager.players.remove(&self.guild_id);
        manager.remove_player_state_file(self.guild_id).await;

        self.dispatch(Event::PlayerDestroy {
            player: Arc::clone(self),
            reason: Some("detached".to_string()),
        });

        Ok(())
    }

    // ---- migration ---------------------------------------------------------

    /// Rebinds the player to the best usable node, re-pushes voice and
    /// resumes playback from the saved position.
    pub async fn auto_move_node(self: &Arc<Self>) -> MagmalinkResult<()> {
        let manager = self.manager.upgrade().ok_or(MagmalinkError::ManagerDropped)?;
        let current = self.node().await;
        let target = manager.useable_node_excluding(Some(&current.identifier())).await?;

        self.move_to_node(target).await
    }

    pub async fn move_node(self: &Arc<Self>, identifier: &str) -> MagmalinkResult<()> {
        let manager = self.manager.upgrade().ok_or(MagmalinkError::ManagerDropped)?;
        let target = manager
            .nodes
            .get(identifier)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MagmalinkError::NodeNotFound(identifier.to_string()))?;

        self.move_to_node(target).await
    }

    async fn move_to_node(self: &Arc<Self>, target: Arc<Node>) -> MagmalinkResult<()> {
        let old_node = self.node().await;
        if old_node.identifier() == target.identifier() {
            return Ok(());
        }

        debug!(
            "moving player {} from node {} to node {}",
            self.guild_id,
            old_node.identifier(),
            target.identifier()
        );

        // Best effort; the old node may already be gone.
        if let Err(why) = old_node.destroy_player(self.guild_id).await {
            debug!("old node teardown for player {} failed: {}", self.guild_id, why);
        }

        self.inner.write().await.node = Arc::clone(&target);
        self.resume().await
    }

    /// Re-pushes the voice triple and the playing track (at its saved
    /// position) to the player's current node. Used after a migration and
    /// when restoring a snapshot.
    pub(crate) async fn resume(self: &Arc<Self>) -> MagmalinkResult<()> {
        let (node, voice, current, position, volume, paused, filters) = {
            let inner = self.inner.read().await;
            (
                Arc::clone(&inner.node),
                inner.voice_state.clone(),
                inner.queue.current.clone(),
                inner.position,
                inner.volume,
                inner.paused,
                inner.filters.payload(),
            )
        };

        let mut patch = UpdatePlayer::default();
        if voice.is_complete() {
            patch.voice = Some(VoiceUpdate {
                token: voice.token.expect("checked complete"),
                endpoint: voice.endpoint.expect("checked complete"),
                session_id: voice.session_id.expect("checked complete"),
            });
        }
        if let Some(track) = &current {
            patch.track = Some(UpdatePlayerTrack { encoded: Some(track.track.clone()), user_data: None });
            patch.position = Some(position);
            patch.volume = Some(volume);
            patch.paused = Some(paused);
            patch.filters = Some(filters);
        }

        node.update_player(self.guild_id, &patch, false).await?;

        Ok(())
    }

    // ---- filters -----------------------------------------------------------

    /// Mutates the filter stack and pushes the resulting payload to the node.
    pub async fn update_filters<F>(self: &Arc<Self>, apply: F) -> MagmalinkResult<()>
    where
        F: FnOnce(&mut Filters),
    {
        let (node, payload) = {
            let mut inner = self.inner.write().await;
            apply(&mut inner.filters);
            (Arc::clone(&inner.node), inner.filters.payload())
        };

        let patch = UpdatePlayer { filters: Some(payload), ..Default::default() };
        node.update_player(self.guild_id, &patch, false).await?;

        Ok(())
    }

    pub async fn clear_filters(self: &Arc<Self>) -> MagmalinkResult<()> {
        self.update_filters(|filters| filters.clear()).await
    }

    // ---- plugin endpoints --------------------------------------------------

    /// Lyrics for the current track, served by lyrics-capable node plugins.
    pub async fn get_lyrics(&self) -> MagmalinkResult<Option<crate::model::rest::Lyrics>> {
        let (node, current) = {
            let inner = self.inner.read().await;
            (Arc::clone(&inner.node), inner.queue.current.clone())
        };

        let current = current.ok_or(MagmalinkError::NothingToPlay)?;
        node.get_lyrics(&current.track).await
    }

    pub async fn get_sponsorblock_categories(&self) -> MagmalinkResult<Vec<String>> {
        let node = self.node().await;
        let session_id = node.session_id().await.ok_or(MagmalinkError::MissingSessionId)?;
        node.rest.get_sponsorblock_categories(&session_id, self.guild_id).await
    }

    pub async fn set_sponsorblock_categories(&self, categories: &[String]) -> MagmalinkResult<()> {
        let node = self.node().await;
        let session_id = node.session_id().await.ok_or(MagmalinkError::MissingSessionId)?;
        node.rest.set_sponsorblock_categories(&session_id, self.guild_id, categories).await
    }

    // ---- node events -------------------------------------------------------

    pub(crate) async fn handle_player_update(&self, state: &PlayerUpdateState) {
        let (old, position_changed) = {
            let mut inner = self.inner.write().await;
            let old = self.snapshot_inner(&inner);
            let position_changed = inner.position != state.position;
            inner.position = state.position;
            inner.ping = state.ping;
            inner.voice_connected = state.connected;
            (old, position_changed)
        };

        if position_changed {
            self.emit_state_update(
                old,
                PlayerStateChange::TrackChange {
                    kind: TrackChangeKind::TimeUpdate,
                    old: None,
                    new: None,
                },
            )
            .await;
        }
    }

    pub(crate) async fn handle_event(player: Arc<Player>, event: PlayerEvent) {
        match event {
            PlayerEvent::TrackStart { .. } => {
                let (old, track) = {
                    let mut inner = player.inner.write().await;
                    let old = player.snapshot_inner(&inner);
                    inner.playing = true;
                    inner.paused = false;
                    (old, inner.queue.current.clone())
                };

                if let Some(track) = track.clone() {
                    player.dispatch(Event::TrackStart { player: Arc::clone(&player), track });
                }

                player
                    .emit_state_update(
                        old,
                        PlayerStateChange::TrackChange {
                            kind: TrackChangeKind::Start,
                            old: None,
                            new: track,
                        },
                    )
                    .await;
            }
            PlayerEvent::TrackEnd { reason, .. } => {
                Self::handle_track_end(&player, reason).await;
            }
            PlayerEvent::TrackException { exception, .. } => {
                let ended = player.inner.read().await.queue.current.clone();
                player.dispatch(Event::TrackError {
                    player: Arc::clone(&player),
                    track: ended.clone(),
                    error: exception,
                });

                Self::recover_or_advance(&player, ended).await;
            }
            PlayerEvent::TrackStuck { threshold_ms, .. } => {
                let ended = player.inner.read().await.queue.current.clone();
                player.dispatch(Event::TrackStuck {
                    player: Arc::clone(&player),
                    track: ended,
                    threshold_ms,
                });

                // Stop server-side; the resulting stopped track-end advances
                // the state machine.
                player.inner.write().await.explicit_stop = true;
                let node = player.node().await;
                let patch = UpdatePlayer {
                    track: Some(UpdatePlayerTrack { encoded: None, user_data: None }),
                    ..Default::default()
                };
                if let Err(why) = node.update_player(player.guild_id, &patch, false).await {
                    error!("player {} failed stopping a stuck track: {}", player.guild_id, why);
                }
            }
            PlayerEvent::WebSocketClosed { code, reason, by_remote, .. } => {
                player.dispatch(Event::SocketClosed {
                    player: Arc::clone(&player),
                    code,
                    reason,
                    by_remote,
                });

                // 4014: kicked / channel deleted. 4022: session terminated.
                if code == 4014 || code == 4022 {
                    if let Err(why) = player.destroy(false).await {
                        error!("player {} failed destroying after voice close: {}", player.guild_id, why);
                    }
                }
            }
            PlayerEvent::SegmentsLoaded { segments, .. } => {
                player.dispatch(Event::SegmentsLoaded { player: Arc::clone(&player), segments });
            }
            PlayerEvent::SegmentSkipped { segment, .. } => {
                player.dispatch(Event::SegmentSkipped { player: Arc::clone(&player), segment });
            }
            PlayerEvent::ChapterStarted { chapter, .. } => {
                player.dispatch(Event::ChapterStarted { player: Arc::clone(&player), chapter });
            }
            PlayerEvent::ChaptersLoaded { chapters, .. } => {
                player.dispatch(Event::ChaptersLoaded { player: Arc::clone(&player), chapters });
            }
        }
    }

    async fn handle_track_end(player: &Arc<Player>, reason: TrackEndReason) {
        let ended = player.inner.read().await.queue.current.clone();
        player.dispatch(Event::TrackEnd {
            player: Arc::clone(player),
            track: ended.clone(),
            reason,
        });

        match reason {
            // Another play command caused this end; that command owns the
            // queue transition.
            TrackEndReason::Replaced => {}
            TrackEndReason::LoadFailed => {
                Self::recover_or_advance(player, ended).await;
            }
            TrackEndReason::Stopped => {
                let (explicit, has_next) = {
                    let mut inner = player.inner.write().await;
                    let explicit = inner.explicit_stop;
                    inner.explicit_stop = false;
                    inner.playing = false;

                    if let Some(current) = inner.queue.current.take() {
                        inner.queue.push_previous(current);
                    }
                    (explicit, !inner.queue.is_empty())
                };

                if explicit && has_next {
                    player.inner.write().await.queue.advance();
                    if let Err(why) = player.play().await {
                        error!("player {} failed advancing after skip: {}", player.guild_id, why);
                    }
                } else {
                    player.dispatch(Event::QueueEnd(Arc::clone(player)));
                }
            }
            TrackEndReason::Finished | TrackEndReason::Cleanup => {
                let (track_repeat, queue_repeat, dynamic_repeat) = {
                    let inner = player.inner.read().await;
                    (inner.track_repeat, inner.queue_repeat, inner.dynamic_repeat)
                };

                if track_repeat {
                    if let Some(track) = ended {
                        if let Err(why) = player.play_track(track).await {
                            error!("player {} failed repeating track: {}", player.guild_id, why);
                        }
                    }
                } else if queue_repeat || dynamic_repeat {
                    let advanced = {
                        let mut inner = player.inner.write().await;
                        if let Some(current) = inner.queue.current.take() {
                            inner.queue.push_back(current);
                        }
                        inner.queue.advance().is_some()
                    };

                    if advanced {
                        if let Err(why) = player.play().await {
                            error!("player {} failed repeating queue: {}", player.guild_id, why);
                        }
                    } else {
                        player.dispatch(Event::QueueEnd(Arc::clone(player)));
                    }
                } else {
                    {
                        let mut inner = player.inner.write().await;
                        if let Some(current) = inner.queue.current.take() {
                            inner.queue.push_previous(current);
                        }
                    }
                    Self::advance_or_end(player, ended).await;
                }
            }
        }
    }

    /// Failure path shared by load failures and exceptions: an autoplay
    /// lookup may rescue the session, otherwise the queue advances.
    async fn recover_or_advance(player: &Arc<Player>, ended: Option<Track>) {
        {
            let mut inner = player.inner.write().await;
            if let Some(current) = inner.queue.current.take() {
                inner.queue.push_previous(current);
            }
        }

        Self::advance_or_end(player, ended).await;
    }

    /// Shifts the queue forward; when it runs dry, autoplay gets
    /// `autoplay_tries` attempts to refill it before the queue ends.
    async fn advance_or_end(player: &Arc<Player>, ended: Option<Track>) {
        let advanced = player.inner.write().await.queue.advance().is_some();

        if advanced {
            if let Err(why) = player.play().await {
                error!("player {} failed advancing the queue: {}", player.guild_id, why);
            }
            return;
        }

        let (enabled, tries, _) = player.autoplay_settings().await;
        if enabled && tries > 0 {
            let manager = player.manager.upgrade().filter(|m| m.options.auto_play);
            if let (Some(manager), Some(seed)) = (manager, ended) {
                for attempt in 1..=tries {
                    let candidates = crate::autoplay::resolve(&manager, player, &seed).await;
                    if candidates.is_empty() {
                        debug!(
                            "player {} autoplay attempt {}/{} found nothing",
                            player.guild_id, attempt, tries
                        );
                        continue;
                    }

                    if player.add_to_queue(candidates, None).await.is_ok()
                        && player.play().await.is_ok()
                    {
                        return;
                    }
                }
            }
        }

        player.inner.write().await.playing = false;
        player.dispatch(Event::QueueEnd(Arc::clone(player)));
    }

    // ---- persistence -------------------------------------------------------

    /// Rehydrates queue, filters, repeat flags and autoplay settings from a
    /// stored snapshot.
    pub(crate) async fn restore(self: &Arc<Self>, snapshot: PlayerSnapshot) {
        let mut inner = self.inner.write().await;
        inner.text_channel_id = snapshot.text_channel_id;
        inner.voice_channel_id = snapshot.voice_channel_id;
        inner.self_deaf = snapshot.self_deaf;
        inner.self_mute = snapshot.self_mute;
        inner.paused = snapshot.paused;
        inner.volume = snapshot.volume;
        inner.position = snapshot.position;
        inner.queue = snapshot.queue;
        inner.filters = snapshot.filters;
        inner.track_repeat = snapshot.track_repeat;
        inner.queue_repeat = snapshot.queue_repeat;
        inner.dynamic_repeat = snapshot.dynamic_repeat;
        inner.dynamic_repeat_interval = snapshot.dynamic_repeat_interval_ms.map(Duration::from_millis);
        inner.is_autoplay = snapshot.is_autoplay;
        inner.autoplay_tries = snapshot.autoplay_tries;
        inner.voice_state = snapshot.voice_state;
        inner.user_data = snapshot.user_data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeOptions;

    fn offline_player() -> Arc<Player> {
        let node = Node::new(Weak::new(), NodeOptions::default());
        Player::new(
            Weak::new(),
            node,
            PlayerOptions { guild_id: 1, ..Default::default() },
            20,
        )
    }

    fn test_track(id: &str) -> Track {
        Track { track: id.to_string(), title: Some(id.to_string()), ..Default::default() }
    }

    #[tokio::test]
    async fn repeat_modes_are_pairwise_exclusive() {
        let player = offline_player();

        player.set_track_repeat(true).await;
        player.set_queue_repeat(true).await;

        let snapshot = player.snapshot().await;
        assert!(!snapshot.track_repeat);
        assert!(snapshot.queue_repeat);
        assert!(!snapshot.dynamic_repeat);

        player.set_dynamic_repeat(true, Duration::from_secs(60)).await.unwrap();

        let snapshot = player.snapshot().await;
        assert!(!snapshot.queue_repeat);
        assert!(snapshot.dynamic_repeat);
        assert_eq!(snapshot.dynamic_repeat_interval_ms, Some(60_000));

        player.set_dynamic_repeat(false, Duration::from_secs(60)).await.unwrap();
        let snapshot = player.snapshot().await;
        assert!(!snapshot.track_repeat && !snapshot.queue_repeat && !snapshot.dynamic_repeat);
    }

    #[tokio::test]
    async fn previous_with_empty_history_fails() {
        let player = offline_player();

        assert!(matches!(player.previous().await, Err(MagmalinkError::EmptyHistory)));
    }

    #[tokio::test]
    async fn set_volume_rejects_out_of_range() {
        let player = offline_player();

        assert!(matches!(
            player.set_volume(1001).await,
            Err(MagmalinkError::InvalidVolume(1001))
        ));
    }

    #[tokio::test]
    async fn play_with_empty_queue_fails() {
        let player = offline_player();

        assert!(matches!(player.play().await, Err(MagmalinkError::NothingToPlay)));
    }

    #[tokio::test]
    async fn queue_adds_promote_and_append() {
        let player = offline_player();

        player.add_to_queue(vec![test_track("a"), test_track("b")], None).await.unwrap();

        let queue = player.queue().await;
        assert_eq!(queue.current.as_ref().unwrap().track, "a");
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_json() {
        let player = offline_player();
        player.add_to_queue(vec![test_track("a"), test_track("b")], None).await.unwrap();
        player.set_track_repeat(true).await;

        let snapshot = player.snapshot().await;
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: PlayerSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.guild_id, snapshot.guild_id);
        assert_eq!(restored.queue, snapshot.queue);
        assert!(restored.track_repeat);
    }

    #[tokio::test]
    async fn stop_rejects_zero_amount() {
        let player = offline_player();

        assert!(matches!(
            player.stop(Some(0)).await,
            Err(MagmalinkError::InvalidQueuePosition(0))
        ));
    }
}
