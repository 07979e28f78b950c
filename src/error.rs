use std::{
    error::Error,
    fmt::{
        Display,
        Formatter,
        Result,
    },
};
use tokio_tungstenite::tungstenite::error::Error as TungsteniteError;

pub type MagmalinkResult<T> = ::std::result::Result<T, MagmalinkError>;

#[derive(Debug)]
pub enum MagmalinkError {
    PlayerNotFound,
    NodeNotFound(String),
    NoUseableNode,
    ManagerDropped,
    NotInitiated,
    MissingSessionId,
    NoVoiceChannel,
    NothingToPlay,
    EmptyHistory,
    TrackNotSeekable,
    InvalidVolume(u16),
    InvalidQueuePosition(usize),
    InvalidQueueRange { start: usize, end: usize },
    InvalidConfig(&'static str),
    NodeLost(String),
    RetriesExhausted(String),
    RestStatus { status: u16, message: String },
    WebSocket(TungsteniteError),
    Http(reqwest::Error),
    Json(serde_json::Error),
    Io(std::io::Error),
}

impl Error for MagmalinkError {}

impl Display for MagmalinkError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            MagmalinkError::PlayerNotFound => write!(f, "Player not found"),
            MagmalinkError::NodeNotFound(id) => write!(f, "Node `{}` not found", id),
            MagmalinkError::NoUseableNode => write!(f, "No connected node is available to host the player"),
            MagmalinkError::ManagerDropped => write!(f, "The manager backing this handle has been dropped"),
            MagmalinkError::NotInitiated => write!(f, "The manager has not been initiated, call `init` first"),
            MagmalinkError::MissingSessionId => write!(f, "The node has not been assigned a session id yet"),
            MagmalinkError::NoVoiceChannel => write!(f, "The player has no voice channel to connect to"),
            MagmalinkError::NothingToPlay => write!(f, "There is no current track and the queue is empty"),
            MagmalinkError::EmptyHistory => write!(f, "No previous track is available"),
            MagmalinkError::TrackNotSeekable => write!(f, "The current track is not seekable"),
            MagmalinkError::InvalidVolume(v) => write!(f, "Volume must be between 0 and 1000, got {}", v),
            MagmalinkError::InvalidQueuePosition(pos) => write!(f, "Queue position {} is out of bounds", pos),
            MagmalinkError::InvalidQueueRange { start, end } => write!(f, "Invalid queue range {}..{}", start, end),
            MagmalinkError::InvalidConfig(why) => write!(f, "Invalid configuration: {}", why),
            MagmalinkError::NodeLost(id) => write!(f, "Node `{}` responded 404 and is considered lost", id),
            MagmalinkError::RetriesExhausted(id) => write!(f, "Node `{}` exhausted its reconnect budget", id),
            MagmalinkError::RestStatus { status, message } => write!(f, "Rest request failed with status {}: {}", status, message),
            MagmalinkError::WebSocket(why) => write!(f, "Websocket error: {}", why),
            MagmalinkError::Http(why) => write!(f, "Http error: {}", why),
            MagmalinkError::Json(why) => write!(f, "Serialization error: {}", why),
            MagmalinkError::Io(why) => write!(f, "Io error: {}", why),
        }
    }
}

impl From<TungsteniteError> for MagmalinkError {
    fn from(e: TungsteniteError) -> MagmalinkError {
        Self::WebSocket(e)
    }
}

impl From<reqwest::Error> for MagmalinkError {
    fn from(e: reqwest::Error) -> MagmalinkError {
        Self::Http(e)
    }
}

impl From<serde_json::Error> for MagmalinkError {
    fn from(e: serde_json::Error) -> MagmalinkError {
        Self::Json(e)
    }
}

impl From<std::io::Error> for MagmalinkError {
    fn from(e: std::io::Error) -> MagmalinkError {
        Self::Io(e)
    }
}
