pub mod dash;
pub mod hls;
pub mod smooth;

use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Duration};

use url::Url;

use crate::{
    error::{KuraError, KuraResult},
    model::{Asset, Rendition, SegmentIndex, StreamFormat},
    util::transport::{FetchRequest, FetchResponse, Transport},
};

/// Format-independent result of parsing one manifest document.
#[derive(Debug, Clone, Default)]
pub struct NormalizedManifest {
    pub renditions: Vec<Rendition>,
    /// Total duration in seconds.
    pub duration: Option<f64>,
    pub attributes: BTreeMap<String, String>,
}

/// What a local request path maps to.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalResource {
    Manifest {
        body: String,
        content_type: &'static str,
    },
    Segment {
        rendition: u32,
        index: SegmentIndex,
    },
}

/// One streaming format: reading its manifests, and writing them back for
/// offline playback.
pub trait ManifestCodec: Send + Sync + 'static {
    fn format(&self) -> StreamFormat;

    /// Parses a manifest. Relative locators are resolved against `base`.
    fn parse(&self, data: &[u8], base: &Url) -> KuraResult<NormalizedManifest>;

    /// Request path of the synthesized root manifest.
    fn manifest_name(&self) -> &'static str;

    /// Root manifest of a stored asset, referencing local paths only.
    fn synthesize(&self, asset: &Asset) -> String;

    /// Maps a request path below the asset root to a synthesized manifest or
    /// a stored segment. Only selected renditions are reachable.
    fn resolve(&self, asset: &Asset, path: &str) -> Option<LocalResource>;
}

/// Codecs keyed by their format tag.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<StreamFormat, Arc<dyn ManifestCodec>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    pub fn register(&mut self, codec: impl ManifestCodec) -> &mut Self {
        self.codecs.insert(codec.format(), Arc::new(codec));
        self
    }

    pub fn get(&self, format: StreamFormat) -> KuraResult<Arc<dyn ManifestCodec>> {
        self.codecs.get(&format).cloned().ok_or_else(|| {
            KuraError::ManifestParseError(format!("no codec registered for {format}"))
        })
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(hls::HlsCodec)
            .register(dash::DashCodec)
            .register(smooth::SmoothCodec);
        registry
    }
}

/// Guesses the format from the URL, then the content type, then the body.
pub fn detect_format(url: &Url, content_type: Option<&str>, body: &[u8]) -> Option<StreamFormat> {
    // 1. check extension
    let path = url.path().to_lowercase();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        return Some(StreamFormat::Hls);
    } else if path.ends_with(".mpd") {
        return Some(StreamFormat::Dash);
    } else if path.ends_with(".ism/manifest") || path.ends_with(".isml/manifest") {
        return Some(StreamFormat::SmoothStreaming);
    }

    // 2. check content type
    match content_type.map(|c| c.split(';').next().unwrap_or(c).trim()) {
        Some("application/x-mpegurl" | "application/vnd.apple.mpegurl" | "audio/mpegurl") => {
            return Some(StreamFormat::Hls)
        }
        Some("application/dash+xml") => return Some(StreamFormat::Dash),
        Some("application/vnd.ms-sstr+xml") => return Some(StreamFormat::SmoothStreaming),
        _ => {}
    }

    // 3. check by content
    let head = String::from_utf8_lossy(&body[..body.len().min(1024)]);
    let head = head.trim_start_matches('\u{feff}').trim_start();
    if head.starts_with("#EXTM3U") {
        Some(StreamFormat::Hls)
    } else if head.contains("<MPD") {
        Some(StreamFormat::Dash)
    } else if head.contains("<SmoothStreamingMedia") {
        Some(StreamFormat::SmoothStreaming)
    } else {
        None
    }
}

/// Fetches manifests and resolves child manifests of renditions.
#[derive(Clone)]
pub struct ManifestLoader {
    transport: Arc<dyn Transport>,
    registry: CodecRegistry,
    retries: u32,
    max_depth: u32,
}

pub struct LoadedManifest {
    pub format: StreamFormat,
    /// Final URL the manifest was fetched from.
    pub url: Url,
    pub manifest: NormalizedManifest,
}

impl ManifestLoader {
    pub fn new(transport: Arc<dyn Transport>, registry: CodecRegistry) -> Self {
        Self {
            transport,
            registry,
            retries: 3,
            max_depth: 4,
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    async fn fetch(&self, url: &Url) -> KuraResult<FetchResponse> {
        let mut attempt = 0;
        loop {
            let request = FetchRequest::get(url.clone()).accept(
                "application/vnd.apple.mpegurl,application/x-mpegurl,application/dash+xml,application/vnd.ms-sstr+xml,*/*;q=0.5",
            );
            match self.transport.fetch(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(%url, attempt, "Failed to fetch manifest, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => {
                    tracing::error!(%url, "Failed to fetch manifest: {e}");
                    return Err(KuraError::ManifestFetchError(format!("{url}: {e}")));
                }
            }
        }
    }

    /// Fetches and parses the root manifest. Child manifests are left for
    /// [`ManifestLoader::resolve_children`].
    pub async fn load(&self, url: &Url, format: Option<StreamFormat>) -> KuraResult<LoadedManifest> {
        tracing::info!(%url, "Start fetching manifest.");
        let response = self.fetch(url).await?;
        let format = match format {
            Some(format) => format,
            None => detect_format(url, response.content_type.as_deref(), &response.body)
                .ok_or_else(|| {
                    KuraError::ManifestParseError(format!("can not detect the format of {url}"))
                })?,
        };

        let codec = self.registry.get(format)?;
        let manifest = codec.parse(&response.body, url)?;
        tracing::info!(
            %url,
            %format,
            renditions = manifest.renditions.len(),
            "Manifest fetched."
        );

        Ok(LoadedManifest {
            format,
            url: url.clone(),
            manifest,
        })
    }

    /// Loads the child manifest of every selected rendition that still points
    /// to one, filling in its segments.
    pub async fn resolve_children(
        &self,
        format: StreamFormat,
        renditions: &mut [Rendition],
    ) -> KuraResult<()> {
        let codec = self.registry.get(format)?;
        for rendition in renditions.iter_mut().filter(|r| r.selected) {
            self.resolve_child(codec.as_ref(), rendition, 0).await?;
        }
        Ok(())
    }

    #[async_recursion::async_recursion]
    async fn resolve_child(
        &self,
        codec: &dyn ManifestCodec,
        rendition: &mut Rendition,
        depth: u32,
    ) -> KuraResult<()> {
        let Some(source) = rendition.source.clone() else {
            return Ok(());
        };
        if depth >= self.max_depth {
            return Err(KuraError::ManifestParseError(format!(
                "manifest nesting deeper than {} at {source}",
                self.max_depth
            )));
        }

        let response = self.fetch(&source).await?;
        let mut child = codec.parse(&response.body, &source)?;
        if child.renditions.len() != 1 {
            return Err(KuraError::ManifestParseError(format!(
                "expected one stream in child manifest {source}, found {}",
                child.renditions.len()
            )));
        }
        let child = child.renditions.remove(0);

        rendition.source = child.source;
        rendition.init = child.init;
        rendition.sections = child.sections;
        rendition.segments = child.segments;
        rendition.periods = child.periods;
        rendition.timescale = child.timescale;
        if rendition.encryption.is_none() {
            rendition.encryption = child.encryption;
        }
        if rendition.codecs.is_none() {
            rendition.codecs = child.codecs;
        }
        for (key, value) in child.attributes {
            rendition.attributes.entry(key).or_insert(value);
        }

        // a child may point further down, e.g. a master referencing a master
        self.resolve_child(codec, rendition, depth + 1).await
    }
}

/// Resolves `{rendition}/{local name}` against the stored segments.
pub(crate) fn resolve_segment_path(asset: &Asset, path: &str) -> Option<LocalResource> {
    let (rendition, name) = path.split_once('/')?;
    let rendition = asset.rendition(rendition.parse().ok()?)?;
    if !rendition.selected {
        return None;
    }
    rendition
        .all_segments()
        .find(|s| s.local_name() == name)
        .map(|s| LocalResource::Segment {
            rendition: rendition.index,
            index: s.index,
        })
}

/// Assigns asset-local rendition indices in manifest order.
pub(crate) fn number_renditions(renditions: &mut [Rendition]) {
    for (index, rendition) in renditions.iter_mut().enumerate() {
        rendition.index = index as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        let url = Url::parse("https://example.com/live/playlist.m3u8?token=1").unwrap();
        assert_eq!(detect_format(&url, None, b""), Some(StreamFormat::Hls));

        let url = Url::parse("https://example.com/video.ism/Manifest").unwrap();
        assert_eq!(
            detect_format(&url, None, b""),
            Some(StreamFormat::SmoothStreaming)
        );

        let url = Url::parse("https://example.com/stream").unwrap();
        assert_eq!(
            detect_format(&url, Some("application/dash+xml; charset=utf-8"), b""),
            Some(StreamFormat::Dash)
        );
        assert_eq!(
            detect_format(&url, Some("text/plain"), b"#EXTM3U\n#EXT-X-VERSION:3"),
            Some(StreamFormat::Hls)
        );
        assert_eq!(
            detect_format(
                &url,
                None,
                b"<?xml version=\"1.0\"?><SmoothStreamingMedia MajorVersion=\"2\">"
            ),
            Some(StreamFormat::SmoothStreaming)
        );
        assert_eq!(detect_format(&url, None, b"hello"), None);
    }
}
