use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

lazy_static!(
    static ref TOPIC_SUFFIX: Regex = Regex::new(r"(?i)\s*-\s*Topic\s*$|^Topic\s*-\s*").unwrap();
    static ref EMPTY_BRACKETS: Regex = Regex::new(r"\(\s*\)|\[\s*\]").unwrap();
    static ref MULTI_SPACE: Regex = Regex::new(r"\s{2,}").unwrap();
);

/// Raw track payload as the audio node returns it.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawTrack {
    pub encoded: String,
    pub info: RawTrackInfo,
    #[serde(default)]
    pub plugin_info: Map<String, Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawTrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    pub length: u64,
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    #[serde(default)]
    pub source_name: String,
}

/// Named audio providers a track can originate from.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TrackSourceName {
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
    Http,
    Unknown,
}

impl TrackSourceName {
    pub fn from_raw(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "youtube" => Self::YouTube,
            "youtubemusic" | "youtube music" => Self::YouTubeMusic,
            "soundcloud" => Self::SoundCloud,
            "spotify" => Self::Spotify,
            "deezer" => Self::Deezer,
            "tidal" => Self::Tidal,
            "applemusic" | "apple music" => Self::AppleMusic,
            "bandcamp" => Self::Bandcamp,
            "jiosaavn" => Self::Jiosaavn,
            "vkmusic" | "vk music" => Self::VkMusic,
            "qobuz" => Self::Qobuz,
            "http" => Self::Http,
            _ => Self::Unknown,
        }
    }
}

/// Thumbnail resolutions the YouTube image host serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailSize {
    Default,
    MqDefault,
    HqDefault,
    SdDefault,
    MaxResDefault,
}

impl ThumbnailSize {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::MqDefault => "mqdefault",
            Self::HqDefault => "hqdefault",
            Self::SdDefault => "sddefault",
            Self::MaxResDefault => "maxresdefault",
        }
    }
}

/// Fields that survive a partial-track projection. The encoded identifier
/// always survives regardless of the configured set.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TrackPartial {
    Track,
    Identifier,
    Title,
    Author,
    Duration,
    IsSeekable,
    IsStream,
    Uri,
    ArtworkUrl,
    Isrc,
    SourceName,
    Requester,
    PluginInfo,
    CustomData,
}

/// Canonical track as the library exposes it. All fields aside from the
/// encoded identifier are optional so partial projections stay representable.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub track: String,
    pub identifier: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration: Option<u64>,
    pub is_seekable: Option<bool>,
    pub is_stream: Option<bool>,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: Option<TrackSourceName>,
    pub requester: Option<Value>,
    #[serde(default)]
    pub plugin_info: Map<String, Value>,
    #[serde(default)]
    pub custom_data: Map<String, Value>,
}

impl Track {
    /// Resolves the artwork for a given size. YouTube tracks are rebuilt
    /// against the image host; everything else falls back to the node's
    /// artwork url.
    pub fn display_thumbnail(&self, size: ThumbnailSize) -> Option<String> {
        if self.source_name == Some(TrackSourceName::YouTube) {
            if let Some(id) = &self.identifier {
                return Some(format!("https://img.youtube.com/vi/{}/{}.jpg", id, size.as_str()));
            }
        }

        self.artwork_url.clone()
    }
}

/// Maps raw node payloads into [`Track`]s, applying source normalization,
/// the optional partial projection and YouTube credential cleaning.
#[derive(Debug, Clone)]
pub struct TrackBuilder {
    partial: Option<Vec<TrackPartial>>,
    replace_youtube_credentials: bool,
    blocked_words: Regex,
}

impl TrackBuilder {
    pub fn new(
        partial: Option<Vec<TrackPartial>>,
        replace_youtube_credentials: bool,
        blocked_words: &[String],
    ) -> Self {
        let escaped = blocked_words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");

        let pattern = if escaped.is_empty() {
            // Never matches.
            r"\b\B".to_string()
        } else {
            format!(r"(?i)\s*[\(\[]?(?:{})[\)\]]?", escaped)
        };

        Self {
            partial,
            replace_youtube_credentials,
            blocked_words: Regex::new(&pattern).expect("blocked words are escaped before compiling"),
        }
    }

    pub fn build(&self, raw: RawTrack, requester: Option<Value>) -> Track {
        let source_name = TrackSourceName::from_raw(&raw.info.source_name);

        let (title, author) = if self.replace_youtube_credentials
            && matches!(source_name, TrackSourceName::YouTube | TrackSourceName::YouTubeMusic)
        {
            self.clean_credentials(&raw.info.title, &raw.info.author)
        } else {
            (raw.info.title.clone(), raw.info.author.clone())
        };

        let artwork_url = raw.info.artwork_url.clone().or_else(|| {
            if source_name == TrackSourceName::YouTube {
                Some(format!("https://img.youtube.com/vi/{}/default.jpg", raw.info.identifier))
            } else {
                None
            }
        });

        let mut track = Track {
            track: raw.encoded,
            identifier: Some(raw.info.identifier),
            title: Some(title),
            author: Some(author),
            duration: Some(raw.info.length),
            is_seekable: Some(raw.info.is_seekable),
            is_stream: Some(raw.info.is_stream),
            uri: raw.info.uri,
            artwork_url,
            isrc: raw.info.isrc,
            source_name: Some(source_name),
            requester,
            plugin_info: raw.plugin_info,
            custom_data: Map::new(),
        };

        if let Some(partial) = &self.partial {
            self.apply_partial(&mut track, partial);
        }

        track
    }

    pub fn build_all(&self, raw: Vec<RawTrack>, requester: Option<Value>) -> Vec<Track> {
        raw.into_iter()
            .map(|t| self.build(t, requester.clone()))
            .collect()
    }

    fn apply_partial(&self, track: &mut Track, partial: &[TrackPartial]) {
        let keep = |field: TrackPartial| partial.contains(&field);

        if !keep(TrackPartial::Identifier) {
            track.identifier = None;
        }
        if !keep(TrackPartial::Title) {
            track.title = None;
        }
        if !keep(TrackPartial::Author) {
            track.author = None;
        }
        if !keep(TrackPartial::Duration) {
            track.duration = None;
        }
        if !keep(TrackPartial::IsSeekable) {
            track.is_seekable = None;
        }
        if !keep(TrackPartial::IsStream) {
            track.is_stream = None;
        }
        if !keep(TrackPartial::Uri) {
            track.uri = None;
        }
        if !keep(TrackPartial::ArtworkUrl) {
            track.artwork_url = None;
        }
        if !keep(TrackPartial::Isrc) {
            track.isrc = None;
        }
        if !keep(TrackPartial::SourceName) {
            track.source_name = None;
        }
        if !keep(TrackPartial::Requester) {
            track.requester = None;
        }
        if !keep(TrackPartial::PluginInfo) {
            track.plugin_info = Map::new();
        }
        if !keep(TrackPartial::CustomData) {
            track.custom_data = Map::new();
        }
    }

    /// Strips uploader noise from YouTube metadata: "- Topic" markers,
    /// blocked words, dangling brackets and `@` handles. When the title
    /// carries an "author - title" shape whose left side matches the cleaned
    /// author, the two halves are split back out.
    fn clean_credentials(&self, title: &str, author: &str) -> (String, String) {
        let author = TOPIC_SUFFIX.replace_all(author, "").trim().to_string();

        let mut title = self.blocked_words.replace_all(title, "").to_string();
        title = balance_brackets(&title);
        title = EMPTY_BRACKETS.replace_all(&title, "").to_string();
        title = MULTI_SPACE.replace_all(title.trim(), " ").to_string();

        if let Some(stripped) = title.strip_prefix('@') {
            title = stripped.to_string();
        }

        if let Some((left, right)) = title.split_once(" - ") {
            if !author.is_empty() && left.trim().eq_ignore_ascii_case(&author) {
                return (right.trim().to_string(), author);
            }
        }

        (title, author)
    }
}

/// Drops unmatched closing brackets and closes unmatched opening ones so the
/// cleaned title never ends with dangling punctuation.
fn balance_brackets(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut stack = Vec::new();

    for c in input.chars() {
        match c {
            '(' | '[' => {
                stack.push(c);
                out.push(c);
            }
            ')' => {
                if stack.last() == Some(&'(') {
                    stack.pop();
                    out.push(c);
                }
            }
            ']' => {
                if stack.last() == Some(&'[') {
                    stack.pop();
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    for open in stack.into_iter().rev() {
        out.push(match open {
            '(' => ')',
            _ => ']',
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(title: &str, author: &str, source: &str) -> RawTrack {
        RawTrack {
            encoded: "QAAAjQIA".to_string(),
            info: RawTrackInfo {
                identifier: "dQw4w9WgXcQ".to_string(),
                is_seekable: true,
                author: author.to_string(),
                length: 212_000,
                is_stream: false,
                position: 0,
                title: title.to_string(),
                uri: Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string()),
                artwork_url: None,
                isrc: None,
                source_name: source.to_string(),
            },
            plugin_info: Map::new(),
        }
    }

    #[test]
    fn builds_canonical_track() {
        let builder = TrackBuilder::new(None, false, &[]);
        let track = builder.build(raw("Never Gonna Give You Up", "Rick Astley", "youtube"), Some(json!("user#1")));

        assert_eq!(track.source_name, Some(TrackSourceName::YouTube));
        assert_eq!(track.duration, Some(212_000));
        assert_eq!(track.requester, Some(json!("user#1")));
        assert_eq!(
            track.artwork_url.as_deref(),
            Some("https://img.youtube.com/vi/dQw4w9WgXcQ/default.jpg")
        );
    }

    #[test]
    fn partial_projection_always_keeps_encoded() {
        let builder = TrackBuilder::new(Some(vec![TrackPartial::Title]), false, &[]);
        let track = builder.build(raw("Song", "Artist", "youtube"), None);

        assert_eq!(track.track, "QAAAjQIA");
        assert_eq!(track.title.as_deref(), Some("Song"));
        assert!(track.author.is_none());
        assert!(track.uri.is_none());
        assert!(track.duration.is_none());
    }

    #[test]
    fn cleans_topic_author_and_blocked_words() {
        let blocked = vec!["official video".to_string(), "lyrics".to_string()];
        let builder = TrackBuilder::new(None, true, &blocked);
        let track = builder.build(raw("Never Gonna Give You Up (Official Video)", "Rick Astley - Topic", "youtube"), None);

        assert_eq!(track.title.as_deref(), Some("Never Gonna Give You Up"));
        assert_eq!(track.author.as_deref(), Some("Rick Astley"));
    }

    #[test]
    fn splits_author_prefixed_title() {
        let builder = TrackBuilder::new(None, true, &[]);
        let track = builder.build(raw("Rick Astley - Never Gonna Give You Up", "Rick Astley - Topic", "youtube"), None);

        assert_eq!(track.author.as_deref(), Some("Rick Astley"));
        assert_eq!(track.title.as_deref(), Some("Never Gonna Give You Up"));
    }

    #[test]
    fn balances_dangling_brackets() {
        assert_eq!(balance_brackets("song (feat. x"), "song (feat. x)");
        assert_eq!(balance_brackets("song feat. x)"), "song feat. x");
        assert_eq!(balance_brackets("song [mix"), "song [mix]");
    }

    #[test]
    fn thumbnail_resolves_for_youtube() {
        let builder = TrackBuilder::new(None, false, &[]);
        let track = builder.build(raw("Song", "Artist", "youtube"), None);

        assert_eq!(
            track.display_thumbnail(ThumbnailSize::MaxResDefault).as_deref(),
            Some("https://img.youtube.com/vi/dQw4w9WgXcQ/maxresdefault.jpg")
        );
    }

    #[test]
    fn source_names_normalize() {
        assert_eq!(TrackSourceName::from_raw("YouTube"), TrackSourceName::YouTube);
        assert_eq!(TrackSourceName::from_raw("deezer"), TrackSourceName::Deezer);
        assert_eq!(TrackSourceName::from_raw("unknown-plugin"), TrackSourceName::Unknown);
    }
}
