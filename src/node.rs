use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as TungsteniteMessage};
use tracing::{debug, error, info, warn};

use crate::{
    error::{MagmalinkError, MagmalinkResult},
    events::Event,
    manager::Manager,
    model::gateway::{NodeMessage, Stats},
    model::rest::{LoadResult, Lyrics, NodeInfo, RestPlayer, UpdatePlayer},
    model::track::RawTrack,
    player::Player,
    rest::Rest,
    types::{GuildId, WebSocketConnection},
};

/// Connection settings for one audio node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
    pub identifier: Option<String>,
    pub retry_amount: u32,
    pub retry_delay: Duration,
    pub resume_status: bool,
    pub resume_timeout: u64,
    pub request_timeout: Duration,
    pub priority: u32,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            secure: false,
            identifier: None,
            retry_amount: 5,
            retry_delay: Duration::from_secs(5),
            resume_status: false,
            resume_timeout: 60,
            request_timeout: Duration::from_secs(10),
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Destroying,
}

pub struct NodeInner {
    pub socket_write: Option<WebSocketConnection>,
    pub session_id: Option<String>,
    pub stats: Option<Stats>,
    pub info: Option<NodeInfo>,
    pub state: NodeState,
}

/// One audio node: a websocket session for events plus a REST surface for
/// control. Created by the manager, which also owns the only strong handle.
pub struct Node {
    pub options: NodeOptions,
    pub rest: Rest,
    inner: RwLock<NodeInner>,
    pub(crate) manager: Weak<Manager>,
}

impl std::ops::Deref for Node {
    type Target = RwLock<NodeInner>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Node {
    pub(crate) fn new(manager: Weak<Manager>, options: NodeOptions) -> Arc<Self> {
        let identifier = options.identifier.clone().unwrap_or_else(|| options.host.clone());
        let rest = Rest::new(
            &options.host,
            options.port,
            options.secure,
            &options.password,
            &identifier,
            options.request_timeout,
        );

        Arc::new(Self {
            options,
            rest,
            inner: RwLock::new(NodeInner {
                socket_write: None,
                session_id: None,
                stats: None,
                info: None,
                state: NodeState::Disconnected,
            }),
            manager,
        })
    }

    /// Stable identity of the node inside the pool.
    pub fn identifier(&self) -> String {
        self.options
            .identifier
            .clone()
            .unwrap_or_else(|| self.options.host.clone())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.options.host, self.options.port)
    }

    fn socket_url(&self) -> String {
        let scheme = if self.options.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.options.host, self.options.port)
    }

    pub async fn connected(&self) -> bool {
        self.inner.read().await.state == NodeState::Connected
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.read().await.session_id.clone()
    }

    pub async fn stats(&self) -> Option<Stats> {
        self.inner.read().await.stats.clone()
    }

    pub async fn info(&self) -> Option<NodeInfo> {
        self.inner.read().await.info.clone()
    }

    /// Source managers the node advertises, lowercased.
    pub async fn source_managers(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .info
            .as_ref()
            .map(|info| info.source_managers.iter().map(|s| s.to_lowercase()).collect())
            .unwrap_or_default()
    }

    /// Spawns the connect/read/reconnect loop for this node.
    pub(crate) fn run(node: Arc<Self>) {
        tokio::spawn(async move {
            let identifier = node.identifier();
            let retry_amount = node.options.retry_amount;
            let retry_delay = node.options.retry_delay;
            let mut attempt = 1u32;

            while attempt <= retry_amount {
                let manager = match node.manager.upgrade() {
                    Some(manager) => manager,
                    None => return,
                };

                {
                    let mut inner = node.inner.write().await;
                    if inner.state == NodeState::Destroying {
                        return;
                    }
                    inner.state = NodeState::Connecting;
                }

                info!("node {} trying to connect, attempt {}/{}", identifier, attempt, retry_amount);

                let request = match node.ws_request(&manager).await {
                    Ok(request) => request,
                    Err(why) => {
                        manager.dispatch(Event::NodeError { node: Arc::clone(&node), error: why });
                        return;
                    }
                };

                match tokio_tungstenite::connect_async(request).await {
                    Err(why) => {
                        warn!(
                            "node {} failed to connect (attempt {}/{}), retrying in {:?}: {}",
                            identifier, attempt, retry_amount, retry_delay, why
                        );
                        manager.dispatch(Event::NodeReconnect(Arc::clone(&node)));
                        drop(manager);

                        attempt += 1;
                        tokio::time::sleep(retry_delay).await;
                    }
                    Ok((stream, _)) => {
                        info!("node {} connected successfully", identifier);
                        attempt = 1;

                        let (write, mut read) = stream.split();
                        {
                            let mut inner = node.inner.write().await;
                            inner.socket_write = Some(write);
                            inner.state = NodeState::Connected;
                        }

                        manager.dispatch(Event::NodeConnect(Arc::clone(&node)));
                        drop(manager);

                        if let Ok(Some(info)) = node.rest.get_info().await {
                            node.inner.write().await.info = Some(info);
                        }

                        while let Some(Ok(message)) = read.next().await {
                            match message {
                                TungsteniteMessage::Text(text) => {
                                    Self::handle_frame(&node, &text).await;
                                }
                                TungsteniteMessage::Close(frame) => {
                                    let (code, reason) = frame
                                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                                        .unwrap_or((1006, String::new()));

                                    if let Some(manager) = node.manager.upgrade() {
                                        manager.dispatch(Event::NodeDisconnect {
                                            node: Arc::clone(&node),
                                            code,
                                            reason,
                                        });
                                    }
                                    break;
                                }
                                _ => (),
                            }
                        }

                        {
                            let mut inner = node.inner.write().await;
                            inner.socket_write = None;
                            if inner.state == NodeState::Destroying {
                                return;
                            }
                            inner.state = NodeState::Reconnecting;
                        }

                        info!("node {} lost its websocket, scheduling reconnect", identifier);
                        if let Some(manager) = node.manager.upgrade() {
                            manager.dispatch(Event::NodeReconnect(Arc::clone(&node)));
                        }

                        attempt += 1;
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }

            error!("node {} reached max connection attempts, destroying", identifier);

            if let Some(manager) = node.manager.upgrade() {
                manager.dispatch(Event::NodeError {
                    node: Arc::clone(&node),
                    error: MagmalinkError::RetriesExhausted(identifier),
                });
            }

            if let Err(why) = Self::destroy(&node).await {
                error!("node {} failed tearing down: {}", node.identifier(), why);
            }
        });
    }

    async fn ws_request(
        &self,
        manager: &Arc<Manager>,
    ) -> MagmalinkResult<http::Request<()>> {
        let client_id = manager.client_id()?;

        let mut request = self.socket_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            self.options
                .password
                .parse()
                .map_err(|_| MagmalinkError::InvalidConfig("node password is not a valid header value"))?,
        );
        headers.insert(
            "User-Id",
            client_id
                .to_string()
                .parse()
                .map_err(|_| MagmalinkError::InvalidConfig("client id is not a valid header value"))?,
        );
        headers.insert(
            "Client-Name",
            format!("{}/{}", manager.options.client_name, env!("CARGO_PKG_VERSION"))
                .parse()
                .map_err(|_| MagmalinkError::InvalidConfig("client name is not a valid header value"))?,
        );

        if self.options.resume_status {
            if let Some(session_id) = manager.stored_session_id(&self.identifier()).await {
                headers.insert(
                    "Session-Id",
                    session_id
                        .parse()
                        .map_err(|_| MagmalinkError::InvalidConfig("stored session id is not a valid header value"))?,
                );
            }
        }

        Ok(request)
    }

    async fn handle_frame(node: &Arc<Self>, text: &str) {
        let manager = match node.manager.upgrade() {
            Some(manager) => manager,
            None => return,
        };

        if let Ok(raw) = serde_json::from_str::<serde_json::Value>(text) {
            manager.dispatch(Event::NodeRaw(raw));
        }

        let message = match serde_json::from_str::<NodeMessage>(text) {
            Ok(message) => message,
            Err(why) => {
                debug!("node {} sent an unhandled frame: {}", node.identifier(), why);
                return;
            }
        };

        match message {
            NodeMessage::Ready(ready) => {
                info!(
                    "node {} is ready, session {} (resumed: {})",
                    node.identifier(),
                    ready.session_id,
                    ready.resumed
                );

                node.inner.write().await.session_id = Some(ready.session_id.clone());
                manager
                    .store_session_id(&node.identifier(), &ready.session_id)
                    .await;

                if node.options.resume_status {
                    if let Err(why) = node
                        .rest
                        .update_session(&ready.session_id, true, node.options.resume_timeout)
                        .await
                    {
                        warn!("node {} failed to enable resuming: {}", node.identifier(), why);
                    }
                }
            }
            NodeMessage::Stats(stats) => {
                node.inner.write().await.stats = Some(stats);
            }
            NodeMessage::PlayerUpdate(update) => {
                if let Some(player) = manager.get(update.guild_id) {
                    player.handle_player_update(&update.state).await;
                }
            }
            NodeMessage::Event(event) => {
                let guild_id = event.guild_id();
                match manager.get(guild_id) {
                    Some(player) => Player::handle_event(player, event).await,
                    None => debug!(
                        "node {} emitted an event for unknown guild {}",
                        node.identifier(),
                        guild_id
                    ),
                }
            }
        }
    }

    /// Tears the node down: migrates every hosted player to another usable
    /// node, closes the socket and removes the node from the pool.
    pub async fn destroy(node: &Arc<Self>) -> MagmalinkResult<()> {
        let manager = node.manager.upgrade().ok_or(MagmalinkError::ManagerDropped)?;

        {
            let mut inner = node.inner.write().await;
            if inner.state == NodeState::Destroying {
                return Ok(());
            }
            inner.state = NodeState::Destroying;
        }

        let identifier = node.identifier();
        info!("destroying node {}", identifier);

        let mut hosted = Vec::new();
        for entry in manager.players.iter() {
            let player = Arc::clone(entry.value());
            if player.node().await.identifier() == identifier {
                hosted.push(player);
            }
        }

        for player in hosted {
            if let Err(why) = player.auto_move_node().await {
                warn!(
                    "failed migrating player {} off node {}: {}",
                    player.guild_id, identifier, why
                );
            }
        }

        if let Some(mut socket) = node.inner.write().await.socket_write.take() {
            let _ = socket.close().await;
        }

        manager.nodes.remove(&identifier);
        manager.dispatch(Event::NodeDestroy(Arc::clone(node)));

        Ok(())
    }

    /// Escalates a lost node: destroy it and register a fresh replacement
    /// with the same options.
    async fn escalate_lost(node: &Arc<Self>) {
        warn!("node {} is considered lost, recreating", node.identifier());

        if let Some(manager) = node.manager.upgrade() {
            let options = node.options.clone();
            if let Err(why) = Self::destroy(node).await {
                error!("failed destroying lost node {}: {}", node.identifier(), why);
            }
            manager.create_node(options).await;
        }
    }

    async fn escalate_on_lost<T>(node: &Arc<Self>, result: MagmalinkResult<T>) -> MagmalinkResult<T> {
        if let Err(MagmalinkError::NodeLost(_)) = &result {
            Box::pin(Self::escalate_lost(node)).await;
        }
        result
    }

    pub async fn update_player(
        self: &Arc<Self>,
        guild_id: GuildId,
        patch: &UpdatePlayer,
        no_replace: bool,
    ) -> MagmalinkResult<Option<RestPlayer>> {
        let session_id = self.session_id().await.ok_or(MagmalinkError::MissingSessionId)?;
        let result = self.rest.update_player(&session_id, guild_id, patch, no_replace).await;
        Self::escalate_on_lost(self, result).await
    }

    pub async fn destroy_player(self: &Arc<Self>, guild_id: GuildId) -> MagmalinkResult<()> {
        let session_id = self.session_id().await.ok_or(MagmalinkError::MissingSessionId)?;
        let result = self.rest.destroy_player(&session_id, guild_id).await;
        Self::escalate_on_lost(self, result).await
    }

    pub async fn get_all_players(self: &Arc<Self>) -> MagmalinkResult<Vec<RestPlayer>> {
        let session_id = self.session_id().await.ok_or(MagmalinkError::MissingSessionId)?;
        let result = self.rest.get_all_players(&session_id).await;
        Self::escalate_on_lost(self, result).await
    }

    pub async fn load_tracks(self: &Arc<Self>, identifier: &str) -> MagmalinkResult<Option<LoadResult>> {
        let result = self.rest.load_tracks(identifier).await;
        Self::escalate_on_lost(self, result).await
    }

    pub async fn decode_tracks(self: &Arc<Self>, encoded: &[String]) -> MagmalinkResult<Vec<RawTrack>> {
        let result = self.rest.decode_tracks(encoded).await;
        Self::escalate_on_lost(self, result).await
    }

    pub async fn get_lyrics(self: &Arc<Self>, encoded_track: &str) -> MagmalinkResult<Option<Lyrics>> {
        let result = self.rest.get_lyrics(encoded_track).await;
        Self::escalate_on_lost(self, result).await
    }
}
