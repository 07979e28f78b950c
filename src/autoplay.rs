use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use sha1::Sha1;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::{
    manager::{Manager, SearchPlatform},
    model::rest::LoadResult,
    model::track::Track,
    node::Node,
    player::Player,
};

lazy_static!(
    static ref SPOTIFY_TRACK: Regex = Regex::new(r"open\.spotify\.com/(?:intl-[a-z]{2}/)?track/([A-Za-z0-9]+)").unwrap();
    static ref DEEZER_TRACK: Regex = Regex::new(r"deezer\.com/(?:[a-z]{2}/)?track/(\d+)").unwrap();
    static ref TIDAL_TRACK: Regex = Regex::new(r"tidal\.com/(?:browse/)?track/(\d+)").unwrap();
    static ref VK_TRACK: Regex = Regex::new(r"vk\.com/audio(-?\d+_\d+)").unwrap();
    static ref QOBUZ_TRACK: Regex = Regex::new(r"qobuz\.com/[^\s]*track/(\d+)").unwrap();
    static ref YOUTUBE_VIDEO: Regex = Regex::new(r"(?:[?&]v=|youtu\.be/)([A-Za-z0-9_-]{11})").unwrap();
    static ref SOUNDCLOUD_RECOMMENDED: Regex = Regex::new(r#"<a itemprop="url" href="(/[^"]+)""#).unwrap();
);

/// Shared secret the public token endpoint derives its one-time password
/// from. The provider rotates it occasionally; a stale secret degrades the
/// spotify strategy to an empty result.
const SPOTIFY_TOTP_SECRET: &[u8] = b"5507145853487499592248630329347";

/// Produces candidate follow-up tracks for an ending track. Platforms are
/// tried in configured order, intersected with what the hosting node
/// advertises; the first non-empty result wins. Failures of any strategy are
/// empty results, never errors.
pub(crate) async fn resolve(manager: &Arc<Manager>, player: &Arc<Player>, seed: &Track) -> Vec<Track> {
    let node = player.node().await;
    let supported = node.source_managers().await;
    let (_, _, bot_user) = player.autoplay_settings().await;

    for platform in manager.options.autoplay_search_platforms.clone() {
        if !supported.is_empty() && !supported.contains(&platform.source_tag().to_string()) {
            continue;
        }

        let candidates = match platform {
            SearchPlatform::Spotify => spotify(manager, &node, seed, bot_user.clone()).await,
            SearchPlatform::Deezer => {
                node_recommendation(manager, &node, seed, platform, "dzrec", bot_user.clone()).await
            }
            SearchPlatform::Tidal => {
                node_recommendation(manager, &node, seed, platform, "tdrec", bot_user.clone()).await
            }
            SearchPlatform::VkMusic => {
                node_recommendation(manager, &node, seed, platform, "vkrec", bot_user.clone()).await
            }
            SearchPlatform::Qobuz => {
                node_recommendation(manager, &node, seed, platform, "qbrec", bot_user.clone()).await
            }
            SearchPlatform::SoundCloud => soundcloud(manager, &node, seed, bot_user.clone()).await,
            SearchPlatform::YouTube | SearchPlatform::YouTubeMusic => {
                youtube(manager, &node, seed, bot_user.clone()).await
            }
            _ => Vec::new(),
        };

        let candidates = drop_seed(candidates, seed);
        if !candidates.is_empty() {
            debug!(
                "autoplay resolved {} candidates via {:?} for guild {}",
                candidates.len(),
                platform,
                player.guild_id
            );
            return candidates;
        }
    }

    if let Some(api_key) = manager.options.last_fm_api_key.clone() {
        return drop_seed(last_fm(manager, seed, &api_key, bot_user).await, seed);
    }

    Vec::new()
}

fn drop_seed(candidates: Vec<Track>, seed: &Track) -> Vec<Track> {
    candidates
        .into_iter()
        .filter(|t| t.uri.is_none() || t.uri != seed.uri)
        .collect()
}

fn pick_random<T: Clone>(items: &[T]) -> Option<T> {
    items.choose(&mut rand::thread_rng()).cloned()
}

/// Seed identifier on the target platform. Cross-platform seeds are
/// re-searched as `"author - title"` first and the top result substitutes.
async fn seed_identifier(
    node: &Arc<Node>,
    seed: &Track,
    platform: SearchPlatform,
    pattern: &Regex,
) -> Option<String> {
    if let Some(uri) = &seed.uri {
        if let Some(captures) = pattern.captures(uri) {
            return captures.get(1).map(|m| m.as_str().to_string());
        }
    }

    let query = format!(
        "{}:{} - {}",
        platform.prefix(),
        seed.author.as_deref()?,
        seed.title.as_deref()?
    );

    match node.load_tracks(&query).await.ok()?? {
        LoadResult::Search(tracks) => tracks.first().map(|t| t.info.identifier.clone()),
        LoadResult::Track(track) => Some(track.info.identifier),
        _ => None,
    }
}

/// Recommendation prefixes served directly by node plugins
/// (`dzrec:`/`tdrec:`/`vkrec:`/`qbrec:`).
async fn node_recommendation(
    manager: &Arc<Manager>,
    node: &Arc<Node>,
    seed: &Track,
    platform: SearchPlatform,
    prefix: &str,
    requester: Option<Value>,
) -> Vec<Track> {
    let pattern = match platform {
        SearchPlatform::Deezer => &*DEEZER_TRACK,
        SearchPlatform::Tidal => &*TIDAL_TRACK,
        SearchPlatform::VkMusic => &*VK_TRACK,
        SearchPlatform::Qobuz => &*QOBUZ_TRACK,
        _ => return Vec::new(),
    };

    let Some(id) = seed_identifier(node, seed, platform, pattern).await else {
        return Vec::new();
    };

    match node.load_tracks(&format!("{}:{}", prefix, id)).await {
        Ok(Some(result)) => manager.map_load_result(result, requester).tracks,
        _ => Vec::new(),
    }
}

async fn spotify(
    manager: &Arc<Manager>,
    node: &Arc<Node>,
    seed: &Track,
    requester: Option<Value>,
) -> Vec<Track> {
    let Some(id) = seed_identifier(node, seed, SearchPlatform::Spotify, &SPOTIFY_TRACK).await else {
        return Vec::new();
    };

    let Some(token) = spotify_access_token(manager).await else {
        return Vec::new();
    };

    let response = manager
        .http
        .get("https://api.spotify.com/v1/recommendations")
        .query(&[("seed_tracks", id.as_str()), ("limit", "10")])
        .bearer_auth(token)
        .send()
        .await;

    let Ok(response) = response else { return Vec::new() };
    let Ok(body) = response.json::<Value>().await else { return Vec::new() };

    let candidates: Vec<String> = body["tracks"]
        .as_array()
        .map(|tracks| {
            tracks
                .iter()
                .filter_map(|t| t["external_urls"]["spotify"].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let Some(url) = pick_random(&candidates) else { return Vec::new() };

    match manager.search(url, requester).await {
        Ok(result) => result.tracks,
        Err(_) => Vec::new(),
    }
}

/// Anonymous web-player token, gated behind a time-based one-time password.
/// The endpoint is best-effort: the provider has deprecated the
/// recommendation surface and may rotate the shared secret.
async fn spotify_access_token(manager: &Arc<Manager>) -> Option<String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
    let totp = totp_at(SPOTIFY_TOTP_SECRET, now);

    let response = manager
        .http
        .get("https://open.spotify.com/get_access_token")
        .query(&[
            ("reason", "transport"),
            ("productType", "embed"),
            ("totp", totp.as_str()),
            ("totpVer", "5"),
            ("ts", now.to_string().as_str()),
        ])
        .send()
        .await
        .ok()?;

    let body = response.json::<Value>().await.ok()?;
    body["accessToken"].as_str().map(String::from)
}

/// RFC-6238: HMAC-SHA-1 over the big-endian 30-second counter, dynamic
/// truncation, six digits.
fn totp_at(secret: &[u8], unix_seconds: u64) -> String {
    let counter = unix_seconds / 30;

    let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[19] & 0x0f) as usize;
    let code = ((u32::from(digest[offset]) & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);

    format!("{:06}", code % 1_000_000)
}

async fn soundcloud(
    manager: &Arc<Manager>,
    node: &Arc<Node>,
    seed: &Track,
    requester: Option<Value>,
) -> Vec<Track> {
    let uri = match &seed.uri {
        Some(uri) if uri.contains("soundcloud.com") => uri.clone(),
        _ => {
            let query = format!(
                "{}:{} - {}",
                SearchPlatform::SoundCloud.prefix(),
                seed.author.as_deref().unwrap_or_default(),
                seed.title.as_deref().unwrap_or_default()
            );
            match node.load_tracks(&query).await {
                Ok(Some(LoadResult::Search(tracks))) => match tracks.first().and_then(|t| t.info.uri.clone()) {
                    Some(uri) => uri,
                    None => return Vec::new(),
                },
                _ => return Vec::new(),
            }
        }
    };

    let response = manager.http.get(format!("{}/recommended", uri)).send().await;
    let Ok(response) = response else { return Vec::new() };
    let Ok(html) = response.text().await else { return Vec::new() };

    let hrefs: Vec<String> = SOUNDCLOUD_RECOMMENDED
        .captures_iter(&html)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();

    let Some(href) = pick_random(&hrefs) else { return Vec::new() };

    match manager
        .search(format!("https://soundcloud.com{}", href), requester)
        .await
    {
        Ok(result) => result.tracks,
        Err(_) => Vec::new(),
    }
}

async fn youtube(
    manager: &Arc<Manager>,
    node: &Arc<Node>,
    seed: &Track,
    requester: Option<Value>,
) -> Vec<Track> {
    let Some(id) = seed_identifier(node, seed, SearchPlatform::YouTube, &YOUTUBE_VIDEO).await else {
        return Vec::new();
    };

    let mix = mix_url(&id, rand::thread_rng().gen_range(2..=24));

    match node.load_tracks(&mix).await {
        Ok(Some(result)) => {
            let mapped = manager.map_load_result(result, requester);
            mapped
                .tracks
                .into_iter()
                .filter(|t| t.identifier.as_deref() != Some(id.as_str()))
                .collect()
        }
        _ => Vec::new(),
    }
}

fn mix_url(video_id: &str, index: u8) -> String {
    format!(
        "https://www.youtube.com/watch?v={}&list=RD{}&index={}",
        video_id, video_id, index
    )
}

/// Last-resort similar-track lookup by (artist, title), resolved through the
/// default search platform.
async fn last_fm(
    manager: &Arc<Manager>,
    seed: &Track,
    api_key: &str,
    requester: Option<Value>,
) -> Vec<Track> {
    let (Some(artist), Some(title)) = (seed.author.as_deref(), seed.title.as_deref()) else {
        return Vec::new();
    };

    let response = manager
        .http
        .get("https://ws.audioscrobbler.com/2.0/")
        .query(&[
            ("method", "track.getSimilar"),
            ("artist", artist),
            ("track", title),
            ("limit", "10"),
            ("autocorrect", "1"),
            ("api_key", api_key),
            ("format", "json"),
        ])
        .send()
        .await;

    let Ok(response) = response else { return Vec::new() };
    let Ok(body) = response.json::<Value>().await else { return Vec::new() };

    let similar: Vec<(String, String)> = body["similartracks"]["track"]
        .as_array()
        .map(|tracks| {
            tracks
                .iter()
                .filter_map(|t| {
                    let name = t["name"].as_str()?;
                    let artist = t["artist"]["name"].as_str()?;
                    Some((artist.to_string(), name.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let Some((artist, name)) = pick_random(&similar) else { return Vec::new() };

    match manager
        .search(format!("{} - {}", artist, name), requester)
        .await
    {
        Ok(result) => result.tracks,
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totp_matches_reference_vectors() {
        // RFC 6238 appendix B, truncated to six digits.
        let secret = b"12345678901234567890";
        assert_eq!(totp_at(secret, 59), "287082");
        assert_eq!(totp_at(secret, 1_111_111_109), "081804");
        assert_eq!(totp_at(secret, 1_111_111_111), "050471");
    }

    #[test]
    fn totp_is_stable_within_a_window() {
        assert_eq!(
            totp_at(SPOTIFY_TOTP_SECRET, 1_700_000_000),
            totp_at(SPOTIFY_TOTP_SECRET, 1_700_000_029)
        );
    }

    #[test]
    fn mix_url_carries_video_and_list() {
        assert_eq!(
            mix_url("dQw4w9WgXcQ", 7),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=RDdQw4w9WgXcQ&index=7"
        );
    }

    #[test]
    fn platform_patterns_extract_identifiers() {
        let captures = SPOTIFY_TRACK
            .captures("https://open.spotify.com/track/4cOdK2wGLETKBW3PvgPWqT")
            .unwrap();
        assert_eq!(&captures[1], "4cOdK2wGLETKBW3PvgPWqT");

        let captures = YOUTUBE_VIDEO
            .captures("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .unwrap();
        assert_eq!(&captures[1], "dQw4w9WgXcQ");

        let captures = DEEZER_TRACK.captures("https://www.deezer.com/en/track/3135556").unwrap();
        assert_eq!(&captures[1], "3135556");
    }

    #[test]
    fn recommended_anchors_are_scraped() {
        let html = r#"
            <section><h2>Related tracks</h2>
            <a itemprop="url" href="/artist-a/track-one">one</a>
            <a itemprop="url" href="/artist-b/track-two">two</a>
            </section>
        "#;

        let hrefs: Vec<&str> = SOUNDCLOUD_RECOMMENDED
            .captures_iter(html)
            .map(|c| c.get(1).unwrap().as_str())
            .collect();

        assert_eq!(hrefs, vec!["/artist-a/track-one", "/artist-b/track-two"]);
    }

    #[test]
    fn seed_is_never_recommended() {
        let seed = Track {
            track: "seed".into(),
            uri: Some("https://example.com/seed".into()),
            ..Default::default()
        };
        let candidates = vec![
            Track { track: "a".into(), uri: Some("https://example.com/seed".into()), ..Default::default() },
            Track { track: "b".into(), uri: Some("https://example.com/other".into()), ..Default::default() },
        ];

        let filtered = drop_seed(candidates, &seed);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].track, "b");
    }
}
