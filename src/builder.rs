use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use typemap_rev::TypeMap;

use crate::{
    error::{MagmalinkError, MagmalinkResult},
    events::EventHandler,
    manager::{Manager, ManagerOptions, NodeSelectionStrategy, Plugin, SearchPlatform},
    model::track::TrackPartial,
    node::NodeOptions,
    types::GuildId,
};

/// Uploader noise stripped from YouTube titles when credential cleaning is
/// enabled. Hosts can replace the list wholesale.
const DEFAULT_BLOCKED_WORDS: &[&str] = &[
    "official video",
    "official music video",
    "official audio",
    "official lyric video",
    "lyric video",
    "lyrics",
    "video oficial",
    "audio oficial",
    "visualizer",
    "remastered",
    "4k",
    "hd",
    "hq",
];

impl Manager {
    pub fn builder<H, F>(handler: H, send: F) -> ManagerBuilder
    where
        H: EventHandler,
        F: Fn(GuildId, Value) + Send + Sync + 'static,
    {
        ManagerBuilder::new(handler, send)
    }
}

pub struct ManagerBuilder {
    handler: Arc<dyn EventHandler>,
    send: Arc<dyn Fn(GuildId, Value) + Send + Sync>,
    nodes: Vec<NodeOptions>,
    data: TypeMap,
    client_name: String,
    auto_play: bool,
    autoplay_search_platforms: Vec<SearchPlatform>,
    default_search_platform: SearchPlatform,
    last_fm_api_key: Option<String>,
    max_previous_tracks: usize,
    replace_youtube_credentials: bool,
    blocked_words: Vec<String>,
    track_partial: Option<Vec<TrackPartial>>,
    use_node: NodeSelectionStrategy,
    use_priority: bool,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl ManagerBuilder {
    pub fn new<H, F>(handler: H, send: F) -> Self
    where
        H: EventHandler,
        F: Fn(GuildId, Value) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            send: Arc::new(send),
            nodes: Vec::new(),
            data: TypeMap::new(),
            client_name: "Magmalink".to_string(),
            auto_play: true,
            autoplay_search_platforms: vec![SearchPlatform::YouTube],
            default_search_platform: SearchPlatform::YouTube,
            last_fm_api_key: None,
            max_previous_tracks: crate::queue::DEFAULT_MAX_PREVIOUS_TRACKS,
            replace_youtube_credentials: false,
            blocked_words: DEFAULT_BLOCKED_WORDS.iter().map(|w| w.to_string()).collect(),
            track_partial: None,
            use_node: NodeSelectionStrategy::LeastPlayers,
            use_priority: false,
            plugins: Vec::new(),
        }
    }

    pub fn add_node<F>(&mut self, func: F) -> &mut Self
    where
        F: FnOnce(&mut NodeBuilder) -> &mut NodeBuilder,
    {
        let mut builder = NodeBuilder::default();

        func(&mut builder);

        self.nodes.push(builder.options);

        self
    }

    pub fn client_name(&mut self, name: impl ToString) -> &mut Self {
        self.client_name = name.to_string();
        self
    }

    pub fn auto_play(&mut self, enabled: bool) -> &mut Self {
        self.auto_play = enabled;
        self
    }

    pub fn autoplay_search_platforms(&mut self, platforms: Vec<SearchPlatform>) -> &mut Self {
        self.autoplay_search_platforms = platforms;
        self
    }

    pub fn default_search_platform(&mut self, platform: SearchPlatform) -> &mut Self {
        self.default_search_platform = platform;
        self
    }

    pub fn last_fm_api_key(&mut self, key: impl ToString) -> &mut Self {
        self.last_fm_api_key = Some(key.to_string());
        self
    }

    pub fn max_previous_tracks(&mut self, max: usize) -> &mut Self {
        self.max_previous_tracks = max;
        self
    }

    pub fn replace_youtube_credentials(&mut self, enabled: bool) -> &mut Self {
        self.replace_youtube_credentials = enabled;
        self
    }

    pub fn blocked_words(&mut self, words: Vec<String>) -> &mut Self {
        self.blocked_words = words;
        self
    }

    pub fn track_partial(&mut self, partial: Vec<TrackPartial>) -> &mut Self {
        self.track_partial = Some(partial);
        self
    }

    pub fn use_node(&mut self, strategy: NodeSelectionStrategy) -> &mut Self {
        self.use_node = strategy;
        self
    }

    pub fn use_priority(&mut self, enabled: bool) -> &mut Self {
        self.use_priority = enabled;
        self
    }

    pub fn add_plugin<P: Plugin>(&mut self, plugin: P) -> &mut Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn data_ref(&self) -> &TypeMap {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TypeMap {
        &mut self.data
    }

    /// Validates the configuration and constructs the manager. Call
    /// `Manager::init` afterwards to connect the nodes.
    pub fn build(self) -> MagmalinkResult<Arc<Manager>> {
        if self.nodes.is_empty() {
            return Err(MagmalinkError::InvalidConfig("at least one node must be configured"));
        }
        if self.client_name.is_empty() {
            return Err(MagmalinkError::InvalidConfig("client name must not be empty"));
        }
        if self.autoplay_search_platforms.is_empty() && self.auto_play {
            return Err(MagmalinkError::InvalidConfig(
                "autoplay requires at least one search platform",
            ));
        }

        let options = ManagerOptions {
            client_name: self.client_name,
            auto_play: self.auto_play,
            autoplay_search_platforms: self.autoplay_search_platforms,
            default_search_platform: self.default_search_platform,
            last_fm_api_key: self.last_fm_api_key,
            max_previous_tracks: self.max_previous_tracks,
            replace_youtube_credentials: self.replace_youtube_credentials,
            blocked_words: self.blocked_words,
            track_partial: self.track_partial,
            use_node: self.use_node,
            use_priority: self.use_priority,
            send: self.send,
        };

        Ok(Manager::new(options, self.nodes, self.handler, self.data, self.plugins))
    }
}

pub struct NodeBuilder {
    options: NodeOptions,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self { options: NodeOptions::default() }
    }
}

impl NodeBuilder {
    pub fn set_host(&mut self, host: impl ToString) -> &mut Self {
        self.options.host = host.to_string();
        self
    }

    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.options.port = port;
        self
    }

    pub fn set_password(&mut self, password: impl ToString) -> &mut Self {
        self.options.password = password.to_string();
        self
    }

    pub fn set_secure(&mut self, secure: bool) -> &mut Self {
        self.options.secure = secure;
        self
    }

    pub fn set_identifier(&mut self, identifier: impl ToString) -> &mut Self {
        self.options.identifier = Some(identifier.to_string());
        self
    }

    pub fn set_retry_amount(&mut self, amount: u32) -> &mut Self {
        self.options.retry_amount = amount;
        self
    }

    pub fn set_retry_delay(&mut self, delay: Duration) -> &mut Self {
        self.options.retry_delay = delay;
        self
    }

    pub fn set_resume_status(&mut self, enabled: bool) -> &mut Self {
        self.options.resume_status = enabled;
        self
    }

    pub fn set_resume_timeout(&mut self, timeout_sec: u64) -> &mut Self {
        self.options.resume_timeout = timeout_sec;
        self
    }

    pub fn set_request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.request_timeout = timeout;
        self
    }

    pub fn set_priority(&mut self, priority: u32) -> &mut Self {
        self.options.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl EventHandler for NoopHandler {}

    #[test]
    fn build_rejects_empty_node_list() {
        let builder = ManagerBuilder::new(NoopHandler, |_, _| {});

        assert!(matches!(builder.build(), Err(MagmalinkError::InvalidConfig(_))));
    }

    #[test]
    fn build_accepts_a_configured_node() {
        let mut builder = ManagerBuilder::new(NoopHandler, |_, _| {});
        builder.add_node(|node| {
            node.set_host("audio.example.com")
                .set_port(443)
                .set_secure(true)
                .set_identifier("main")
                .set_priority(2)
        });

        let manager = builder.build().unwrap();
        assert_eq!(manager.options.client_name, "Magmalink");
    }

    #[test]
    fn build_rejects_autoplay_without_platforms() {
        let mut builder = ManagerBuilder::new(NoopHandler, |_, _| {});
        builder.add_node(|node| node.set_host("localhost"));
        builder.autoplay_search_platforms(Vec::new());

        assert!(matches!(builder.build(), Err(MagmalinkError::InvalidConfig(_))));
    }
}
