use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::{KuraError, KuraResult},
    util::range::ByteRange,
};

/// Identifier of an asset. Used verbatim as a path component by the store and
/// the serving endpoint, so only `[A-Za-z0-9_.-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> KuraResult<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 128
            && id != "."
            && id != ".."
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(Self(id))
        } else {
            Err(KuraError::InvalidAssetId(id))
        }
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AssetId {
    type Err = KuraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AssetId {
    type Error = KuraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AssetId> for String {
    fn from(value: AssetId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    Hls,
    SmoothStreaming,
    Dash,
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hls => "hls",
            Self::SmoothStreaming => "smooth",
            Self::Dash => "dash",
        })
    }
}

impl FromStr for StreamFormat {
    type Err = KuraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hls" | "m3u8" => Ok(Self::Hls),
            "dash" | "mpd" => Ok(Self::Dash),
            "smooth" | "smoothstreaming" | "smooth_streaming" | "hss" | "mss" => {
                Ok(Self::SmoothStreaming)
            }
            _ => Err(KuraError::ConfigError(format!("unknown stream format {s}"))),
        }
    }
}

/// Lifecycle of an asset.
///
/// ```text
/// Queued ──► Downloading ──► Completed
///   │            │  ▲
///   │            ▼  │
///   └───────► Paused
///
/// Downloading ──► Failed
/// any non-terminal ──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl AssetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition(&self, to: AssetState) -> bool {
        use AssetState::*;
        match (*self, to) {
            (Queued, Downloading) | (Queued, Paused) => true,
            (Downloading, Paused) | (Downloading, Completed) | (Downloading, Failed) => true,
            (Paused, Downloading) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
    Subtitle,
}

impl MediaKind {
    pub fn from_mime_type(mime_type: Option<&str>) -> Self {
        let mime_type = mime_type.unwrap_or("video").to_ascii_lowercase();
        if mime_type.starts_with("audio") {
            Self::Audio
        } else if mime_type.starts_with("text")
            || mime_type.contains("ttml")
            || mime_type.contains("vtt")
            || mime_type.contains("subtitle")
        {
            Self::Subtitle
        } else {
            Self::Video
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentFormat {
    #[default]
    Mpeg2TS,
    Mp4,
    M4a,
    Cmfv,
    Cmfa,
    Aac,
    WebVtt,
    Ttml,
    Other(String),
}

impl SegmentFormat {
    pub fn as_ext(&self) -> &str {
        match self {
            Self::Mpeg2TS => "ts",
            Self::Mp4 => "mp4",
            Self::M4a => "m4a",
            Self::Cmfv => "cmfv",
            Self::Cmfa => "cmfa",
            Self::Aac => "aac",
            Self::WebVtt => "vtt",
            Self::Ttml => "ttml",
            Self::Other(ext) => ext.as_str(),
        }
    }

    pub fn from_filename(s: &str) -> Self {
        let s = s.split(['?', '#']).next().unwrap_or(s);
        let s = s.rsplit('/').next().unwrap_or(s);
        let (_, ext) = s.rsplit_once('.').unwrap_or(("", ""));
        match ext.to_ascii_lowercase().as_str() {
            "ts" => Self::Mpeg2TS,
            "mp4" | "m4s" | "m4f" | "m4v" | "ismv" => Self::Mp4,
            "m4a" | "isma" => Self::M4a,
            "cmfv" => Self::Cmfv,
            "cmfa" => Self::Cmfa,
            "aac" => Self::Aac,
            "vtt" | "webvtt" => Self::WebVtt,
            "ttml" | "dfxp" | "xml" => Self::Ttml,
            // extensionless fragments are fragmented mp4 in practice
            "" => Self::Mp4,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn content_type(&self, kind: MediaKind) -> &'static str {
        match self {
            Self::Mpeg2TS => "video/mp2t",
            Self::Mp4 | Self::Cmfv | Self::Cmfa | Self::M4a => match kind {
                MediaKind::Audio => "audio/mp4",
                MediaKind::Subtitle => "application/mp4",
                MediaKind::Video => "video/mp4",
            },
            Self::Aac => "audio/aac",
            Self::WebVtt => "text/vtt",
            Self::Ttml => "application/ttml+xml",
            Self::Other(_) => "application/octet-stream",
        }
    }
}

/// Position of a segment inside its rendition. Initialization segments sort
/// before every media segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentIndex {
    Init,
    /// Initialization segment of a later section: a DASH period or the part
    /// of an HLS playlist after its `EXT-X-MAP` changed.
    Section(u32),
    Media(u64),
}

impl fmt::Display for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Section(section) => write!(f, "init-{section}"),
            Self::Media(sequence) => write!(f, "{sequence}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    Pending,
    InFlight,
    Stored,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionScheme {
    /// Whole-segment AES-128-CBC, decrypted before serving.
    Aes128,
    /// HLS SAMPLE-AES with a DRM key format, decrypted by the player.
    SampleAes,
    /// Common encryption, `cenc` protection scheme.
    Cenc,
    /// Common encryption, `cbcs` protection scheme.
    Cbcs,
}

impl EncryptionScheme {
    /// Whether the player decrypts this scheme itself through its DRM stack.
    pub fn is_player_decrypted(&self) -> bool {
        !matches!(self, Self::Aes128)
    }
}

/// Where the key of a segment or rendition comes from. Never holds key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub scheme: EncryptionScheme,
    pub key_id: Option<String>,
    pub key_uri: Option<Url>,
    pub iv: Option<[u8; 16]>,
    /// PSSH box or protection header, base64 encoded.
    pub init_data: Option<String>,
    pub key_format: Option<String>,
    /// Format-specific signalling handed through to the player untouched.
    pub signalling: Option<String>,
}

impl EncryptionContext {
    pub fn new(scheme: EncryptionScheme) -> Self {
        Self {
            scheme,
            key_id: None,
            key_uri: None,
            iv: None,
            init_data: None,
            key_format: None,
            signalling: None,
        }
    }

    /// Identifier used to cache the license of this key.
    pub fn key_ref(&self) -> String {
        if let Some(kid) = &self.key_id {
            normalize_kid(kid)
        } else if let Some(uri) = &self.key_uri {
            uri.to_string()
        } else {
            "default".to_string()
        }
    }
}

/// Lowercase hex without dashes, the form `kid:key` pairs use.
pub fn normalize_kid(kid: &str) -> String {
    kid.chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub index: SegmentIndex,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    /// Duration in seconds.
    pub duration: f64,
    /// Presentation time in the timescale of the segment's period.
    pub time: Option<u64>,
    /// Section the segment belongs to, 0 being the first.
    #[serde(default)]
    pub section: u32,
    /// Starts after an encoding discontinuity (HLS `EXT-X-DISCONTINUITY`).
    #[serde(default)]
    pub discontinuity: bool,
    pub length: Option<u64>,
    pub encryption: Option<EncryptionContext>,
    pub format: SegmentFormat,
    pub state: TransferState,
    pub stored_bytes: Option<u64>,
}

impl Segment {
    pub fn new(index: SegmentIndex, url: Url) -> Self {
        let format = SegmentFormat::from_filename(url.path());
        Self {
            index,
            url,
            byte_range: None,
            duration: 0.,
            time: None,
            section: 0,
            discontinuity: false,
            length: None,
            encryption: None,
            format,
            state: TransferState::Pending,
            stored_bytes: None,
        }
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        if let Some(length) = range.and_then(|r| r.length) {
            self.length = Some(length);
        }
        self.byte_range = range;
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn is_stored(&self) -> bool {
        self.state == TransferState::Stored
    }

    /// File name under which the serving endpoint exposes this segment.
    pub fn local_name(&self) -> String {
        format!("{}.{}", self.index, self.format.as_ext())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rendition {
    pub id: String,
    /// Position inside the asset, part of every storage key of this rendition.
    pub index: u32,
    pub kind: MediaKind,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub resolution: Option<(u64, u64)>,
    pub frame_rate: Option<f64>,
    pub language: Option<String>,
    pub name: Option<String>,
    /// Group the rendition belongs to (HLS `GROUP-ID`).
    pub group: Option<String>,
    pub selected: bool,
    /// Child manifest that still has to be loaded to know the segments.
    pub source: Option<Url>,
    pub timescale: u64,
    pub init: Option<Segment>,
    /// Initialization segments of later sections, by `SegmentIndex::Section`.
    #[serde(default)]
    pub sections: Vec<Segment>,
    pub segments: Vec<Segment>,
    /// DASH periods the rendition takes part in, by section.
    #[serde(default)]
    pub periods: Vec<Period>,
    pub encryption: Option<EncryptionContext>,
    pub attributes: BTreeMap<String, String>,
}

/// Timing of one DASH period as far as one rendition is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Period {
    /// Position of the period in the source manifest.
    pub number: u32,
    pub id: Option<String>,
    /// Seconds from the start of the presentation.
    pub start: f64,
    pub duration: Option<f64>,
    pub timescale: u64,
    pub presentation_time_offset: u64,
}

impl Rendition {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            index: 0,
            kind,
            bandwidth: 0,
            codecs: None,
            resolution: None,
            frame_rate: None,
            language: None,
            name: None,
            group: None,
            selected: false,
            source: None,
            timescale: 1000,
            init: None,
            sections: Vec::new(),
            segments: Vec::new(),
            periods: Vec::new(),
            encryption: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Init segments first, then media segments in order.
    pub fn all_segments(&self) -> impl Iterator<Item = &Segment> {
        self.init
            .iter()
            .chain(self.sections.iter())
            .chain(self.segments.iter())
    }

    pub fn all_segments_mut(&mut self) -> impl Iterator<Item = &mut Segment> {
        self.init
            .iter_mut()
            .chain(self.sections.iter_mut())
            .chain(self.segments.iter_mut())
    }

    pub fn segment(&self, index: SegmentIndex) -> Option<&Segment> {
        match index {
            SegmentIndex::Init => self.init.as_ref(),
            SegmentIndex::Section(_) => self.sections.iter().find(|s| s.index == index),
            SegmentIndex::Media(_) => self.segments.iter().find(|s| s.index == index),
        }
    }

    pub fn segment_mut(&mut self, index: SegmentIndex) -> Option<&mut Segment> {
        match index {
            SegmentIndex::Init => self.init.as_mut(),
            SegmentIndex::Section(_) => self.sections.iter_mut().find(|s| s.index == index),
            SegmentIndex::Media(_) => self.segments.iter_mut().find(|s| s.index == index),
        }
    }

    /// Initialization segment `segment` is decoded with. A section without
    /// its own keeps the one before it.
    pub fn init_for(&self, segment: &Segment) -> Option<&Segment> {
        self.sections
            .iter()
            .rev()
            .find(|init| matches!(init.index, SegmentIndex::Section(n) if n <= segment.section))
            .or(self.init.as_ref())
    }

    /// Encryption that applies to `segment`, its own key taking precedence.
    pub fn encryption_for<'a>(&'a self, segment: &'a Segment) -> Option<&'a EncryptionContext> {
        segment.encryption.as_ref().or(self.encryption.as_ref())
    }

    pub fn is_complete(&self) -> bool {
        self.all_segments().all(Segment::is_stored)
    }

    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    pub fn bytes_stored(&self) -> u64 {
        self.all_segments().filter_map(|s| s.stored_bytes).sum()
    }

    /// Expected size of the rendition. Segments without a known length are
    /// estimated from the advertised bandwidth.
    pub fn bytes_expected(&self) -> u64 {
        self.all_segments()
            .map(|s| {
                s.stored_bytes
                    .or(s.length)
                    .unwrap_or_else(|| (self.bandwidth as f64 * s.duration / 8.) as u64)
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub url: Url,
    pub format: StreamFormat,
    pub state: AssetState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Lower values are downloaded first.
    pub priority: i32,
    /// Enqueue order, breaks priority ties.
    pub sequence: u64,
    pub description: Option<String>,
    /// Total duration in seconds, when the manifest tells.
    pub duration: Option<f64>,
    pub renditions: Vec<Rendition>,
    /// Transfer attempts that had to be repeated.
    pub retry_count: u32,
    pub failure: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Asset {
    pub fn selected_renditions(&self) -> impl Iterator<Item = &Rendition> {
        self.renditions.iter().filter(|r| r.selected)
    }

    pub fn rendition(&self, index: u32) -> Option<&Rendition> {
        self.renditions.iter().find(|r| r.index == index)
    }

    pub fn rendition_mut(&mut self, index: u32) -> Option<&mut Rendition> {
        self.renditions.iter_mut().find(|r| r.index == index)
    }

    pub fn segment(&self, rendition: u32, index: SegmentIndex) -> Option<&Segment> {
        self.rendition(rendition)?.segment(index)
    }

    pub fn segment_mut(&mut self, rendition: u32, index: SegmentIndex) -> Option<&mut Segment> {
        self.rendition_mut(rendition)?.segment_mut(index)
    }

    /// Every segment of every selected rendition is stored.
    pub fn is_complete(&self) -> bool {
        self.selected_renditions().all(Rendition::is_complete)
    }

    pub fn bytes_stored(&self) -> u64 {
        self.selected_renditions().map(Rendition::bytes_stored).sum()
    }

    pub fn bytes_total(&self) -> u64 {
        self.selected_renditions()
            .map(Rendition::bytes_expected)
            .sum::<u64>()
            .max(self.bytes_stored())
    }

    pub fn segment_count(&self) -> usize {
        self.selected_renditions()
            .map(|r| r.all_segments().count())
            .sum()
    }

    pub fn stored_count(&self) -> usize {
        self.selected_renditions()
            .map(|r| r.all_segments().filter(|s| s.is_stored()).count())
            .sum()
    }

    pub fn fraction_complete(&self) -> f64 {
        let total = self.segment_count();
        if total == 0 {
            return 0.;
        }
        self.stored_count() as f64 / total as f64
    }

    /// Segments of selected renditions that still need a transfer, in the
    /// order they should be attempted.
    pub fn pending_segments(&self) -> Vec<(u32, SegmentIndex)> {
        self.selected_renditions()
            .flat_map(|r| {
                r.all_segments()
                    .filter(|s| !s.is_stored())
                    .map(move |s| (r.index, s.index))
            })
            .collect()
    }

    pub fn transition(&mut self, to: AssetState) -> KuraResult<AssetState> {
        if !self.state.can_transition(to) {
            return Err(KuraError::InvalidTransition {
                asset: self.id.clone(),
                from: self.state,
                to,
            });
        }
        let from = std::mem::replace(&mut self.state, to);
        self.updated_at = Utc::now();
        Ok(from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey {
    pub asset: AssetId,
    pub rendition: u32,
    pub index: SegmentIndex,
}

impl StorageKey {
    pub fn new(asset: AssetId, rendition: u32, index: SegmentIndex) -> Self {
        Self {
            asset,
            rendition,
            index,
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.asset, self.rendition, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_id_validation() {
        assert!(AssetId::new("movie_01-final.v2").is_ok());
        assert!(AssetId::new("").is_err());
        assert!(AssetId::new("..").is_err());
        assert!(AssetId::new(".hidden").is_err());
        assert!(AssetId::new("a/b").is_err());
        assert!(AssetId::new("a b").is_err());

        let generated = AssetId::generate();
        assert!(AssetId::new(generated.as_str()).is_ok());
    }

    #[test]
    fn test_state_machine() {
        use AssetState::*;
        assert!(Queued.can_transition(Downloading));
        assert!(Downloading.can_transition(Paused));
        assert!(Paused.can_transition(Downloading));
        assert!(Downloading.can_transition(Completed));
        assert!(Downloading.can_transition(Failed));
        assert!(Paused.can_transition(Cancelled));
        assert!(Queued.can_transition(Cancelled));

        assert!(!Queued.can_transition(Completed));
        assert!(!Paused.can_transition(Completed));
        assert!(!Paused.can_transition(Failed));
        assert!(!Completed.can_transition(Cancelled));
        assert!(!Failed.can_transition(Downloading));
        assert!(!Cancelled.can_transition(Queued));
    }

    #[test]
    fn test_segment_index_order() {
        let mut indices = vec![
            SegmentIndex::Media(2),
            SegmentIndex::Section(1),
            SegmentIndex::Init,
            SegmentIndex::Media(0),
        ];
        indices.sort();
        assert_eq!(
            indices,
            vec![
                SegmentIndex::Init,
                SegmentIndex::Section(1),
                SegmentIndex::Media(0),
                SegmentIndex::Media(2)
            ]
        );
        assert_eq!(SegmentIndex::Section(3).to_string(), "init-3");
    }

    #[test]
    fn test_init_for_section() {
        let url = Url::parse("https://cdn.test/a.mp4").unwrap();
        let mut rendition = Rendition::new("v", MediaKind::Video);
        rendition.init = Some(Segment::new(SegmentIndex::Init, url.clone()));
        rendition.sections.push(Segment::new(SegmentIndex::Section(2), url.clone()));
        let mut segment = Segment::new(SegmentIndex::Media(0), url);

        assert_eq!(rendition.init_for(&segment).unwrap().index, SegmentIndex::Init);
        segment.section = 1;
        assert_eq!(rendition.init_for(&segment).unwrap().index, SegmentIndex::Init);
        segment.section = 3;
        assert_eq!(
            rendition.init_for(&segment).unwrap().index,
            SegmentIndex::Section(2)
        );
    }

    #[test]
    fn test_segment_format() {
        assert_eq!(SegmentFormat::from_filename("a/b/seg-1.ts?token=1"), SegmentFormat::Mpeg2TS);
        assert_eq!(SegmentFormat::from_filename("chunk.m4s"), SegmentFormat::Mp4);
        assert_eq!(SegmentFormat::from_filename("Fragments(video=0)"), SegmentFormat::Mp4);
        assert_eq!(SegmentFormat::from_filename("subs.vtt"), SegmentFormat::WebVtt);
        assert_eq!(
            SegmentFormat::Mp4.content_type(MediaKind::Audio),
            "audio/mp4"
        );
    }

    #[test]
    fn test_kid_normalization() {
        let mut ctx = EncryptionContext::new(EncryptionScheme::Cenc);
        ctx.key_id = Some("ABCDEF01-2345-6789-ABCD-EF0123456789".to_string());
        assert_eq!(ctx.key_ref(), "abcdef0123456789abcdef0123456789");
    }
}
