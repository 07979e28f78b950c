use dashmap::DashMap;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use typemap_rev::TypeMap;

use crate::{
    error::{MagmalinkError, MagmalinkResult},
    events::{self, Event, EventHandler},
    model::rest::{LoadResult, LoadType, PlaylistData, SearchResult},
    model::track::{Track, TrackBuilder},
    node::{Node, NodeOptions},
    player::{Player, PlayerOptions, PlayerSnapshot, PlayerStateChange, PlayerStateKind},
    types::{GuildId, SendGatewayPayload},
};

lazy_static!(
    static ref URL_REGEX: Regex = Regex::new(r"https?://(?:www\.)?.+").unwrap();
);

/// Root of the on-disk session data, relative to the working directory.
const SESSION_DATA_DIR: &str = "magmalink/sessionData";

/// Search prefixes the audio nodes understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchPlatform {
    YouTube,
    YouTubeMusic,
    SoundCloud,
    Spotify,
    Deezer,
    Tidal,
    AppleMusic,
    Bandcamp,
    Jiosaavn,
    VkMusic,
    Qobuz,
}

impl SearchPlatform {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::YouTube => "ytsearch",
            Self::YouTubeMusic => "ytmsearch",
            Self::SoundCloud => "scsearch",
            Self::Spotify => "spsearch",
            Self::Deezer => "dzsearch",
            Self::Tidal => "tdsearch",
            Self::AppleMusic => "amsearch",
            Self::Bandcamp => "bcsearch",
            Self::Jiosaavn => "jssearch",
            Self::VkMusic => "vksearch",
            Self::Qobuz => "qbsearch",
        }
    }

    /// Name the node's `sourceManagers` list advertises for this platform.
    pub fn source_tag(&self) -> &'static str {
        match self {
            Self::YouTube | Self::YouTubeMusic => "youtube",
            Self::SoundCloud => "soundcloud",
            Self::Spotify => "spotify",
            Self::Deezer => "deezer",
            Self::Tidal => "tidal",
            Self::AppleMusic => "applemusic",
            Self::Bandcamp => "bandcamp",
            Self::Jiosaavn => "jiosaavn",
            Self::VkMusic => "vkmusic",
            Self::Qobuz => "qobuz",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub source: Option<SearchPlatform>,
}

impl From<&str> for SearchQuery {
    fn from(query: &str) -> Self {
        Self { query: query.to_string(), source: None }
    }
}

impl From<String> for SearchQuery {
    fn from(query: String) -> Self {
        Self { query, source: None }
    }
}

impl From<(String, SearchPlatform)> for SearchQuery {
    fn from((query, source): (String, SearchPlatform)) -> Self {
        Self { query, source: Some(source) }
    }
}

/// Host-supplied extension loaded at `init`. Plugins typically subscribe to
/// shared data or wrap manager operations.
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn load(&self, manager: &Arc<Manager>);
    fn unload(&self, _manager: &Arc<Manager>) {}
}

/// How the manager picks a hosting node when priorities are not in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelectionStrategy {
    LeastLoad,
    LeastPlayers,
}

pub struct ManagerOptions {
    pub client_name: String,
    pub auto_play: bool,
    pub autoplay_search_platforms: Vec<SearchPlatform>,
    pub default_search_platform: SearchPlatform,
    pub last_fm_api_key: Option<String>,
    pub max_previous_tracks: usize,
    pub replace_youtube_credentials: bool,
    pub blocked_words: Vec<String>,
    pub track_partial: Option<Vec<crate::model::track::TrackPartial>>,
    pub use_node: NodeSelectionStrategy,
    pub use_priority: bool,
    pub(crate) send: SendGatewayPayload,
}

/// Owns the node pool and the per-guild player map; everything else hangs
/// off it. Cheap to share: hand out `Arc<Manager>` clones.
pub struct Manager {
    pub options: ManagerOptions,
    pub nodes: DashMap<String, Arc<Node>>,
    pub players: DashMap<GuildId, Arc<Player>>,
    pub shared_data: Arc<RwLock<TypeMap>>,
    pub(crate) http: HttpClient,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) track_builder: TrackBuilder,
    client_id: AtomicU64,
    cluster_id: AtomicU32,
    initiated: AtomicBool,
    session_ids: RwLock<HashMap<String, String>>,
    pending_nodes: Mutex<Vec<NodeOptions>>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Manager {
    pub(crate) fn new(
        options: ManagerOptions,
        nodes: Vec<NodeOptions>,
        handler: Arc<dyn EventHandler>,
        data: TypeMap,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Arc<Self> {
        let track_builder = TrackBuilder::new(
            options.track_partial.clone(),
            options.replace_youtube_credentials,
            &options.blocked_words,
        );

        Arc::new(Self {
            options,
            nodes: DashMap::new(),
            players: DashMap::new(),
            shared_data: Arc::new(RwLock::new(data)),
            http: HttpClient::new(),
            handler,
            track_builder,
            client_id: AtomicU64::new(0),
            cluster_id: AtomicU32::new(0),
            initiated: AtomicBool::new(false),
            session_ids: RwLock::new(HashMap::new()),
            pending_nodes: Mutex::new(nodes),
            plugins,
        })
    }

    /// Brings the manager up: records the bot user id, loads persisted node
    /// sessions and connects every configured node. Idempotent.
    pub async fn init(self: &Arc<Self>, client_id: u64, cluster_id: u32) -> MagmalinkResult<()> {
        if client_id == 0 {
            return Err(MagmalinkError::InvalidConfig("client id must be non-zero"));
        }

        if self.initiated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.client_id.store(client_id, Ordering::SeqCst);
        self.cluster_id.store(cluster_id, Ordering::SeqCst);
        self.load_session_ids().await;

        let pending = std::mem::take(&mut *self.pending_nodes.lock().await);
        for options in pending {
            self.create_node(options).await;
        }

        for plugin in &self.plugins {
            info!("loading plugin {}", plugin.name());
            plugin.load(self);
        }

        info!("manager initiated for client {} (cluster {})", client_id, cluster_id);
        self.dispatch(Event::Debug(format!(
            "manager initiated for client {} (cluster {})",
            client_id, cluster_id
        )));
        Ok(())
    }

    pub(crate) fn client_id(&self) -> MagmalinkResult<u64> {
        match self.client_id.load(Ordering::SeqCst) {
            0 => Err(MagmalinkError::NotInitiated),
            id => Ok(id),
        }
    }

    pub fn cluster_id(&self) -> u32 {
        self.cluster_id.load(Ordering::SeqCst)
    }

    pub(crate) fn dispatch(&self, event: Event) {
        events::process(Arc::clone(&self.handler), event);
    }

    pub(crate) fn send_gateway(&self, guild_id: GuildId, payload: Value) {
        (self.options.send)(guild_id, payload);
    }

    // ---- node pool ---------------------------------------------------------

    /// Registers a node and spawns its connection loop.
    pub async fn create_node(self: &Arc<Self>, options: NodeOptions) -> Arc<Node> {
        let node = Node::new(Arc::downgrade(self), options);
        let identifier = node.identifier();

        // Seed the stored session so the resume header is available before
        // the first `ready` frame.
        if let Some(session_id) = self.stored_session_id(&identifier).await {
            node.write().await.session_id = Some(session_id);
        }

        self.nodes.insert(identifier, Arc::clone(&node));
        self.dispatch(Event::NodeCreate(Arc::clone(&node)));
        Node::run(Arc::clone(&node));

        node
    }

    pub async fn destroy_node(&self, identifier: &str) -> MagmalinkResult<()> {
        let node = self
            .nodes
            .get(identifier)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MagmalinkError::NodeNotFound(identifier.to_string()))?;

        Node::destroy(&node).await
    }

    /// Picks the node that should host the next player.
    pub async fn useable_node(&self) -> MagmalinkResult<Arc<Node>> {
        self.useable_node_excluding(None).await
    }

    pub(crate) async fn useable_node_excluding(
        &self,
        exclude: Option<&str>,
    ) -> MagmalinkResult<Arc<Node>> {
        let mut nodes = Vec::new();
        let mut meta = Vec::new();

        for entry in self.nodes.iter() {
            let node = Arc::clone(entry.value());
            if exclude == Some(node.identifier().as_str()) {
                continue;
            }
            if !node.connected().await {
                continue;
            }

            let stats = node.stats().await;
            meta.push(NodeCandidate {
                priority: node.options.priority,
                players: stats.as_ref().map(|s| s.players).unwrap_or(0),
                load: stats
                    .as_ref()
                    .map(|s| {
                        if s.cpu.cores > 0 {
                            s.cpu.lavalink_load / s.cpu.cores as f64
                        } else {
                            0.0
                        }
                    })
                    .unwrap_or(0.0),
            });
            nodes.push(node);
        }

        if nodes.is_empty() {
            return Err(MagmalinkError::NoUseableNode);
        }

        let draw = rand::thread_rng().gen_range(0.0..1.0);
        let index = select_candidate(&meta, self.options.use_priority, self.options.use_node, draw);

        Ok(nodes.swap_remove(index))
    }

    // ---- players -----------------------------------------------------------

    /// Creates (or returns) the player for a guild and binds it to a node.
    pub async fn create(self: &Arc<Self>, options: PlayerOptions) -> MagmalinkResult<Arc<Player>> {
        if let Some(player) = self.get(options.guild_id) {
            return Ok(player);
        }

        let node = match &options.node_identifier {
            Some(identifier) => self
                .nodes
                .get(identifier)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| MagmalinkError::NodeNotFound(identifier.clone()))?,
            None => self.useable_node().await?,
        };

        let player = Player::new(
            Arc::downgrade(self),
            node,
            options,
            self.options.max_previous_tracks,
        );

        self.players.insert(player.guild_id, Arc::clone(&player));
        self.dispatch(Event::PlayerCreate(Arc::clone(&player)));

        let snapshot = player.snapshot().await;
        self.dispatch(Event::PlayerStateUpdate {
            old: snapshot.clone(),
            new: snapshot,
            change: PlayerStateChange::PlayerCreate,
        });

        Ok(player)
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Destroys the guild's player, including its server-side half.
    pub async fn destroy(&self, guild_id: GuildId) -> MagmalinkResult<()> {
        let player = self.get(guild_id).ok_or(MagmalinkError::PlayerNotFound)?;
        player.destroy(true).await
    }

    /// Drops the guild's player from the map while leaving the server-side
    /// player untouched.
    pub async fn detach(&self, guild_id: GuildId) -> MagmalinkResult<()> {
        let player = self.get(guild_id).ok_or(MagmalinkError::PlayerNotFound)?;
        player.detach().await
    }

    // ---- search ------------------------------------------------------------

    /// Resolves a query or url through the best usable node.
    pub async fn search(
        self: &Arc<Self>,
        query: impl Into<SearchQuery>,
        requester: Option<Value>,
    ) -> MagmalinkResult<SearchResult> {
        let query = query.into();
        let node = self.useable_node().await?;
        let identifier = build_search_identifier(&query, self.options.default_search_platform);
        self.dispatch(Event::Debug(format!(
            "searching `{}` on node {}",
            identifier,
            node.identifier()
        )));

        match node.load_tracks(&identifier).await? {
            Some(result) => Ok(self.map_load_result(result, requester)),
            None => Ok(SearchResult {
                load_type: LoadType::Empty,
                tracks: Vec::new(),
                playlist: None,
                error: None,
            }),
        }
    }

    pub(crate) fn map_load_result(&self, result: LoadResult, requester: Option<Value>) -> SearchResult {
        map_load_result(&self.track_builder, result, requester)
    }

    pub async fn decode_tracks(
        &self,
        encoded: Vec<String>,
        requester: Option<Value>,
    ) -> MagmalinkResult<Vec<Track>> {
        let node = self.useable_node().await?;
        let raw = node.decode_tracks(&encoded).await?;
        Ok(self.track_builder.build_all(raw, requester))
    }

    pub async fn decode_track(
        &self,
        encoded: String,
        requester: Option<Value>,
    ) -> MagmalinkResult<Option<Track>> {
        Ok(self.decode_tracks(vec![encoded], requester).await?.into_iter().next())
    }

    // ---- voice routing -----------------------------------------------------

    /// Feeds raw chat-gateway voice packets into the library. Accepts both
    /// dispatch-wrapped (`t`/`d`) packets and bare inner objects.
    pub async fn update_voice_state(self: &Arc<Self>, packet: Value) -> MagmalinkResult<()> {
        let Some(update) = parse_voice_packet(packet) else {
            return Ok(());
        };

        match update {
            VoicePacket::Server { guild_id, token, endpoint } => {
                if let Some(player) = self.get(guild_id) {
                    player.set_voice_server(token, endpoint).await?;
                }
            }
            VoicePacket::State { guild_id, user_id, session_id, channel_id } => {
                if self.client_id().ok() != Some(user_id) {
                    return Ok(());
                }

                let Some(player) = self.get(guild_id) else {
                    return Ok(());
                };

                match channel_id {
                    Some(channel) => {
                        let old_channel = player.voice_channel_id().await;
                        if old_channel != Some(channel) {
                            self.dispatch(Event::PlayerMove {
                                player: Arc::clone(&player),
                                old_channel,
                                new_channel: channel,
                            });
                            player.set_voice_channel(Some(channel)).await;
                        }

                        player.set_voice_session(session_id).await?;
                    }
                    None => {
                        let old_channel = player.voice_channel_id().await;
                        self.dispatch(Event::PlayerDisconnect {
                            player: Arc::clone(&player),
                            old_channel,
                        });
                        player.destroy(false).await?;
                    }
                }
            }
        }

        Ok(())
    }

    // ---- session-id persistence --------------------------------------------

    fn session_key(&self, identifier: &str) -> String {
        format!("{}:{}", identifier, self.cluster_id())
    }

    async fn load_session_ids(&self) {
        match fs::read(session_ids_path()).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(map) => *self.session_ids.write().await = map,
                Err(why) => warn!("ignoring malformed session id store: {}", why),
            },
            Err(_) => (),
        }
    }

    pub(crate) async fn stored_session_id(&self, identifier: &str) -> Option<String> {
        self.session_ids
            .read()
            .await
            .get(&self.session_key(identifier))
            .cloned()
    }

    pub(crate) async fn store_session_id(&self, identifier: &str, session_id: &str) {
        let map = {
            let mut sessions = self.session_ids.write().await;
            sessions.insert(self.session_key(identifier), session_id.to_string());
            sessions.clone()
        };

        if let Err(why) = write_json_atomic(&session_ids_path(), &map).await {
            warn!("failed persisting session ids: {}", why);
        }
    }

    // ---- player persistence ------------------------------------------------

    /// Snapshots one player to disk, or removes its file when the player is
    /// gone or inactive.
    pub async fn save_player_state(&self, guild_id: GuildId) -> MagmalinkResult<()> {
        let Some(player) = self.get(guild_id) else {
            self.remove_player_state_file(guild_id).await;
            return Ok(());
        };

        let snapshot = player.snapshot().await;
        let inactive = matches!(
            snapshot.state,
            PlayerStateKind::Destroying | PlayerStateKind::Disconnecting
        ) || snapshot.voice_channel_id.is_none();

        if inactive {
            self.remove_player_state_file(guild_id).await;
            return Ok(());
        }

        write_json_atomic(&player_state_path(guild_id), &snapshot).await
    }

    pub(crate) async fn remove_player_state_file(&self, guild_id: GuildId) {
        let _ = fs::remove_file(player_state_path(guild_id)).await;
    }

    /// Restores every snapshot belonging to `node_id`: recreates the player,
    /// re-pushes voice and resumes playback, reconciling against the node's
    /// live player list. Processed files are deleted either way.
    pub async fn load_player_states(self: &Arc<Self>, node_id: &str) -> MagmalinkResult<()> {
        let node = self
            .nodes
            .get(node_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MagmalinkError::NodeNotFound(node_id.to_string()))?;

        let mut entries = match fs::read_dir(players_dir()).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        let live = node.get_all_players().await.unwrap_or_default();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let Ok(bytes) = fs::read(&path).await else { continue };
            let Ok(snapshot) = serde_json::from_slice::<PlayerSnapshot>(&bytes) else {
                warn!("removing malformed player snapshot {:?}", path);
                let _ = fs::remove_file(&path).await;
                continue;
            };

            if snapshot.node != node_id {
                continue;
            }

            let has_live_session = live
                .iter()
                .any(|p| p.guild_id == snapshot.guild_id.to_string());

            let options = PlayerOptions {
                guild_id: snapshot.guild_id,
                text_channel_id: snapshot.text_channel_id,
                voice_channel_id: snapshot.voice_channel_id,
                volume: snapshot.volume,
                self_deaf: snapshot.self_deaf,
                self_mute: snapshot.self_mute,
                node_identifier: Some(node_id.to_string()),
            };

            let player = self.create(options).await?;
            player.restore(snapshot.clone()).await;

            if has_live_session {
                if let Err(why) = player.resume().await {
                    warn!("failed resuming player {}: {}", snapshot.guild_id, why);
                }
            } else {
                // The node dropped the session while we were down; voice
                // cannot be resumed, so tear the player back down.
                info!("node {} has no live session for guild {}", node_id, snapshot.guild_id);
                if let Err(why) = player.destroy(false).await {
                    warn!("failed destroying stale player {}: {}", snapshot.guild_id, why);
                }
            }

            let _ = fs::remove_file(&path).await;
        }

        Ok(())
    }

    /// Snapshots every live player, then prunes stale snapshot files.
    /// Cleanup is bounded so shutdown never hangs.
    ///
    /// Signal wiring is left to the host application; the recommended
    /// binding is a `tokio::signal::ctrl_c()` (or SIGTERM) task that awaits
    /// this method before exiting.
    pub async fn handle_shutdown(self: &Arc<Self>) -> MagmalinkResult<()> {
        let guilds: Vec<GuildId> = self.players.iter().map(|entry| *entry.key()).collect();
        info!("shutdown: snapshotting {} players", guilds.len());

        futures::future::join_all(guilds.iter().map(|guild_id| self.save_player_state(*guild_id)))
            .await
            .into_iter()
            .filter_map(Result::err)
            .for_each(|why| error!("failed snapshotting a player: {}", why));

        let cleanup = async {
            let mut entries = match fs::read_dir(players_dir()).await {
                Ok(entries) => entries,
                Err(_) => return,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let live = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<GuildId>().ok())
                    .map(|guild_id| self.players.contains_key(&guild_id))
                    .unwrap_or(false);

                if !live {
                    let _ = fs::remove_file(&path).await;
                }
            }
        };

        if tokio::time::timeout(Duration::from_secs(2), cleanup).await.is_err() {
            warn!("shutdown cleanup exceeded its bound, continuing");
        }

        Ok(())
    }
}

struct NodeCandidate {
    priority: u32,
    players: u32,
    load: f64,
}

/// Pure selection policy over candidate metadata. `draw` is a uniform sample
/// in `[0, 1)` used by the priority weighting.
fn select_candidate(
    candidates: &[NodeCandidate],
    use_priority: bool,
    strategy: NodeSelectionStrategy,
    draw: f64,
) -> usize {
    if use_priority {
        let total: u32 = candidates.iter().map(|c| c.priority).sum();
        if total > 0 {
            let mut cumulative = 0.0;
            for (index, candidate) in candidates.iter().enumerate() {
                if candidate.priority == 0 {
                    continue;
                }
                cumulative += f64::from(candidate.priority) / f64::from(total);
                if cumulative >= draw {
                    return index;
                }
            }
        }
    }

    match strategy {
        NodeSelectionStrategy::LeastLoad => candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.load.total_cmp(&b.load))
            .map(|(index, _)| index)
            .unwrap_or(0),
        NodeSelectionStrategy::LeastPlayers => candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.players)
            .map(|(index, _)| index)
            .unwrap_or(0),
    }
}

/// Non-url queries get a `<source>:` prefix; urls pass through untouched.
fn build_search_identifier(query: &SearchQuery, default_platform: SearchPlatform) -> String {
    if URL_REGEX.is_match(&query.query) {
        query.query.clone()
    } else {
        let platform = query.source.unwrap_or(default_platform);
        format!("{}:{}", platform.prefix(), query.query)
    }
}

fn map_load_result(
    builder: &TrackBuilder,
    result: LoadResult,
    requester: Option<Value>,
) -> SearchResult {
    match result {
        LoadResult::Track(raw) => SearchResult {
            load_type: LoadType::Track,
            tracks: vec![builder.build(raw, requester)],
            playlist: None,
            error: None,
        },
        LoadResult::Search(raw) => SearchResult {
            load_type: LoadType::Search,
            tracks: builder.build_all(raw, requester),
            playlist: None,
            error: None,
        },
        LoadResult::Playlist(playlist) => {
            let duration = playlist.tracks.iter().map(|t| t.info.length).sum();
            let tracks = builder.build_all(playlist.tracks, requester);

            SearchResult {
                load_type: LoadType::Playlist,
                tracks,
                playlist: Some(PlaylistData {
                    name: playlist.info.name,
                    selected_track: playlist.info.selected_track,
                    duration,
                }),
                error: None,
            }
        }
        LoadResult::Empty(_) => SearchResult {
            load_type: LoadType::Empty,
            tracks: Vec::new(),
            playlist: None,
            error: None,
        },
        LoadResult::Error(exception) => SearchResult {
            load_type: LoadType::Error,
            tracks: Vec::new(),
            playlist: None,
            error: Some(exception.message.unwrap_or(exception.cause)),
        },
    }
}

pub(crate) enum VoicePacket {
    Server { guild_id: GuildId, token: String, endpoint: String },
    State { guild_id: GuildId, user_id: u64, session_id: String, channel_id: Option<u64> },
}

fn parse_snowflake(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Unwraps dispatch packets and classifies the voice half they carry. Packets
/// with neither a `token` nor a `session_id` are ignored.
pub(crate) fn parse_voice_packet(packet: Value) -> Option<VoicePacket> {
    let inner = match packet.get("t") {
        Some(t) => match t.as_str() {
            Some("VOICE_STATE_UPDATE") | Some("VOICE_SERVER_UPDATE") => packet.get("d")?.clone(),
            _ => return None,
        },
        None => packet,
    };

    let guild_id = parse_snowflake(inner.get("guild_id")?)?;

    if let Some(token) = inner.get("token").and_then(|t| t.as_str()) {
        let endpoint = inner.get("endpoint").and_then(|e| e.as_str())?;
        return Some(VoicePacket::Server {
            guild_id,
            token: token.to_string(),
            endpoint: endpoint.to_string(),
        });
    }

    if let Some(session_id) = inner.get("session_id").and_then(|s| s.as_str()) {
        return Some(VoicePacket::State {
            guild_id,
            user_id: parse_snowflake(inner.get("user_id")?)?,
            session_id: session_id.to_string(),
            channel_id: inner.get("channel_id").and_then(parse_snowflake),
        });
    }

    None
}

fn players_dir() -> PathBuf {
    Path::new(SESSION_DATA_DIR).join("players")
}

fn session_ids_path() -> PathBuf {
    Path::new(SESSION_DATA_DIR).join("sessionIds.json")
}

fn player_state_path(guild_id: GuildId) -> PathBuf {
    players_dir().join(format!("{}.json", guild_id))
}

/// Write-temp + rename, so readers never observe a half-written snapshot.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> MagmalinkResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    fs::rename(&tmp, path).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rest::{RawPlaylist, RawPlaylistInfo};
    use crate::model::track::{RawTrack, RawTrackInfo};
    use serde_json::json;

    fn candidate(priority: u32, players: u32, load: f64) -> NodeCandidate {
        NodeCandidate { priority, players, load }
    }

    #[test]
    fn least_players_picks_emptiest_node() {
        let candidates = vec![candidate(0, 4, 0.9), candidate(0, 1, 0.1), candidate(0, 7, 0.2)];

        let index = select_candidate(&candidates, false, NodeSelectionStrategy::LeastPlayers, 0.5);
        assert_eq!(index, 1);
    }

    #[test]
    fn least_load_picks_idlest_node() {
        let candidates = vec![candidate(0, 1, 0.9), candidate(0, 9, 0.05), candidate(0, 2, 0.5)];

        let index = select_candidate(&candidates, false, NodeSelectionStrategy::LeastLoad, 0.5);
        assert_eq!(index, 1);
    }

    #[test]
    fn priority_weighting_follows_the_draw() {
        // Weights: 0.25, 0.75.
        let candidates = vec![candidate(1, 0, 0.0), candidate(3, 0, 0.0)];

        assert_eq!(select_candidate(&candidates, true, NodeSelectionStrategy::LeastPlayers, 0.1), 0);
        assert_eq!(select_candidate(&candidates, true, NodeSelectionStrategy::LeastPlayers, 0.9), 1);
    }

    #[test]
    fn priority_falls_through_when_all_zero() {
        let candidates = vec![candidate(0, 5, 0.0), candidate(0, 2, 0.0)];

        let index = select_candidate(&candidates, true, NodeSelectionStrategy::LeastPlayers, 0.4);
        assert_eq!(index, 1);
    }

    #[test]
    fn search_identifier_prefixes_non_urls() {
        let query = SearchQuery { query: "never gonna give you up".into(), source: None };
        assert_eq!(
            build_search_identifier(&query, SearchPlatform::YouTube),
            "ytsearch:never gonna give you up"
        );

        let query = SearchQuery { query: "some song".into(), source: Some(SearchPlatform::Deezer) };
        assert_eq!(build_search_identifier(&query, SearchPlatform::YouTube), "dzsearch:some song");

        let query = SearchQuery { query: "https://youtu.be/dQw4w9WgXcQ".into(), source: None };
        assert_eq!(
            build_search_identifier(&query, SearchPlatform::YouTube),
            "https://youtu.be/dQw4w9WgXcQ"
        );
    }

    #[test]
    fn voice_packets_parse_wrapped_and_bare() {
        let wrapped = json!({
            "t": "VOICE_SERVER_UPDATE",
            "d": {"guild_id": "42", "token": "tok", "endpoint": "voice.example.com"}
        });
        match parse_voice_packet(wrapped).unwrap() {
            VoicePacket::Server { guild_id, token, endpoint } => {
                assert_eq!(guild_id, 42);
                assert_eq!(token, "tok");
                assert_eq!(endpoint, "voice.example.com");
            }
            _ => panic!("expected server packet"),
        }

        let bare = json!({
            "guild_id": 42,
            "user_id": "7",
            "session_id": "abc",
            "channel_id": null
        });
        match parse_voice_packet(bare).unwrap() {
            VoicePacket::State { guild_id, user_id, session_id, channel_id } => {
                assert_eq!(guild_id, 42);
                assert_eq!(user_id, 7);
                assert_eq!(session_id, "abc");
                assert_eq!(channel_id, None);
            }
            _ => panic!("expected state packet"),
        }

        assert!(parse_voice_packet(json!({"guild_id": "42"})).is_none());
        assert!(parse_voice_packet(json!({"t": "MESSAGE_CREATE", "d": {}})).is_none());
    }

    #[test]
    fn playlist_duration_sums_track_lengths() {
        fn raw(length: u64) -> RawTrack {
            RawTrack {
                encoded: "x".into(),
                info: RawTrackInfo { length, ..Default::default() },
                plugin_info: Default::default(),
            }
        }

        let builder = TrackBuilder::new(None, false, &[]);
        let result = LoadResult::Playlist(RawPlaylist {
            info: RawPlaylistInfo { name: "mix".into(), selected_track: None },
            plugin_info: Default::default(),
            tracks: vec![raw(1_000), raw(2_500)],
        });

        let mapped = map_load_result(&builder, result, None);
        assert_eq!(mapped.load_type, LoadType::Playlist);
        assert_eq!(mapped.playlist.unwrap().duration, 3_500);
        assert_eq!(mapped.tracks.len(), 2);
    }

    #[tokio::test]
    async fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let value = json!({"guildId": 42, "volume": 80});
        write_json_atomic(&path, &value).await.unwrap();

        let read: Value = serde_json::from_slice(&fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(read, value);

        // Overwrites go through the same temp + rename path.
        let updated = json!({"guildId": 42, "volume": 100});
        write_json_atomic(&path, &updated).await.unwrap();
        let read: Value = serde_json::from_slice(&fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(read, updated);
    }
}
