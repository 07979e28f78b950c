use reqwest::{header::HeaderMap, Client as HttpClient, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    error::{MagmalinkError, MagmalinkResult},
    model::rest::{LoadResult, Lyrics, NodeInfo, RestPlayer, UpdatePlayer, UpdateSession},
    model::track::RawTrack,
    types::GuildId,
};

/// Typed REST surface of one audio node. Transport losses surface as `None`
/// so the caller decides whether to retry; a hard 404 marks the node lost.
pub struct Rest {
    http: HttpClient,
    base: String,
    identifier: String,
}

impl Rest {
    pub(crate) fn new(
        host: &str,
        port: u16,
        secure: bool,
        password: &str,
        identifier: &str,
        request_timeout: Duration,
    ) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            password.parse().expect("audio node password must be a valid header value"),
        );
        headers.insert("Content-Type", "application/json".parse().expect("static header"));

        let http = HttpClient::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .expect("failed building http client");

        let scheme = if secure { "https" } else { "http" };

        Self {
            http,
            base: format!("{}://{}:{}", scheme, host, port),
            identifier: identifier.to_string(),
        }
    }

    pub async fn get_all_players(&self, session_id: &str) -> MagmalinkResult<Vec<RestPlayer>> {
        let path = format!("/v4/sessions/{}/players", session_id);
        Ok(self
            .request(Method::GET, &path, None)
            .await?
            .unwrap_or_default())
    }

    pub async fn update_player(
        &self,
        session_id: &str,
        guild_id: GuildId,
        patch: &UpdatePlayer,
        no_replace: bool,
    ) -> MagmalinkResult<Option<RestPlayer>> {
        let path = format!(
            "/v4/sessions/{}/players/{}?noReplace={}",
            session_id, guild_id, no_replace
        );
        let body = serde_json::to_value(patch)?;

        self.request(Method::PATCH, &path, Some(body)).await
    }

    pub async fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> MagmalinkResult<()> {
        let path = format!("/v4/sessions/{}/players/{}", session_id, guild_id);
        self.request::<Value>(Method::DELETE, &path, None).await?;

        Ok(())
    }

    pub async fn update_session(
        &self,
        session_id: &str,
        resuming: bool,
        timeout_sec: u64,
    ) -> MagmalinkResult<()> {
        let path = format!("/v4/sessions/{}", session_id);
        let body = serde_json::to_value(UpdateSession { resuming, timeout: timeout_sec })?;
        self.request::<Value>(Method::PATCH, &path, Some(body)).await?;

        Ok(())
    }

    pub async fn load_tracks(&self, identifier: &str) -> MagmalinkResult<Option<LoadResult>> {
        let url = Url::parse_with_params(
            &format!("{}/v4/loadtracks", self.base),
            &[("identifier", identifier)],
        )
        .map_err(|_| MagmalinkError::InvalidConfig("load identifier is not url encodable"))?;

        self.request_url(Method::GET, url, None).await
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> MagmalinkResult<Vec<RawTrack>> {
        let body = serde_json::to_value(encoded)?;
        Ok(self
            .request(Method::POST, "/v4/decodetracks", Some(body))
            .await?
            .unwrap_or_default())
    }

    pub async fn get_info(&self) -> MagmalinkResult<Option<NodeInfo>> {
        self.request(Method::GET, "/v4/info", None).await
    }

    /// Lyrics endpoint exposed by lyrics-capable node plugins.
    pub async fn get_lyrics(&self, encoded_track: &str) -> MagmalinkResult<Option<Lyrics>> {
        let url = Url::parse_with_params(
            &format!("{}/v4/lyrics", self.base),
            &[("track", encoded_track)],
        )
        .map_err(|_| MagmalinkError::InvalidConfig("encoded track is not url encodable"))?;

        self.request_url(Method::GET, url, None).await
    }

    /// Sponsor-block categories for one player, exposed by the sponsorblock
    /// node plugin.
    pub async fn get_sponsorblock_categories(
        &self,
        session_id: &str,
        guild_id: GuildId,
    ) -> MagmalinkResult<Vec<String>> {
        let path = format!("/v4/sessions/{}/players/{}/sponsorblock/categories", session_id, guild_id);
        Ok(self
            .request(Method::GET, &path, None)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_sponsorblock_categories(
        &self,
        session_id: &str,
        guild_id: GuildId,
        categories: &[String],
    ) -> MagmalinkResult<()> {
        let path = format!("/v4/sessions/{}/players/{}/sponsorblock/categories", session_id, guild_id);
        let body = serde_json::to_value(categories)?;
        self.request::<Value>(Method::PUT, &path, Some(body)).await?;

        Ok(())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> MagmalinkResult<Option<T>> {
        let url = Url::parse(&format!("{}{}", self.base, path))
            .map_err(|_| MagmalinkError::InvalidConfig("request path is not a valid url"))?;

        self.request_url(method, url, body).await
    }

    async fn request_url<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> MagmalinkResult<Option<T>> {
        debug!("node {} rest {} {}", self.identifier, method, url);

        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(why) => {
                warn!("node {} rest transport error: {}", self.identifier, why);
                return Ok(None);
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            // Missing guilds are an expected outcome, not an error.
            if text.contains("Guild not found") {
                return Ok(None);
            }

            if status == StatusCode::NOT_FOUND {
                return Err(MagmalinkError::NodeLost(self.identifier.clone()));
            }

            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or(text);

            return Err(MagmalinkError::RestStatus { status: status.as_u16(), message });
        }

        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&text)?))
    }
}
