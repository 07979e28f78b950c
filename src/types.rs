use futures::stream::SplitSink;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Guild (tenant) identifier, the primary partitioning key for players.
pub type GuildId = u64;

pub type WebSocketConnection = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Callback supplied by the host application that forwards voice payloads
/// to the chat-platform gateway.
pub type SendGatewayPayload = Arc<dyn Fn(GuildId, serde_json::Value) + Send + Sync>;
