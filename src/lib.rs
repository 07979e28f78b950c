pub mod types;
pub mod error;
pub mod model;
pub mod events;
pub mod rest;
pub mod node;
pub mod queue;
pub mod filters;
pub mod player;
pub mod manager;
pub mod builder;

mod autoplay;

pub use builder::{ManagerBuilder, NodeBuilder};
pub use error::{MagmalinkError, MagmalinkResult};
pub use events::EventHandler;
pub use filters::Filters;
pub use manager::{Manager, NodeSelectionStrategy, Plugin, SearchPlatform, SearchQuery};
pub use model::track::{Track, TrackPartial};
pub use node::{Node, NodeOptions};
pub use player::{PlayOptions, Player, PlayerOptions};
pub use queue::Queue;
