use std::fmt::Write;

use m3u8_rs::{AlternativeMediaType, KeyMethod, MasterPlaylist, MediaPlaylist, Playlist};
use url::Url;

use super::{
    number_renditions, resolve_segment_path, LocalResource, ManifestCodec, NormalizedManifest,
};
use crate::{
    error::{KuraError, KuraResult},
    model::{
        Asset, EncryptionContext, EncryptionScheme, MediaKind, Rendition, Segment, SegmentFormat,
        SegmentIndex, StreamFormat,
    },
    util::{range::ByteRange, urls::merge_baseurls},
};

const FAIRPLAY_KEYFORMAT: &str = "com.apple.streamingkeydelivery";
const MASTER_NAME: &str = "master.m3u8";
const MEDIA_NAME: &str = "index.m3u8";
const CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

pub struct HlsCodec;

impl ManifestCodec for HlsCodec {
    fn format(&self) -> StreamFormat {
        StreamFormat::Hls
    }

    fn parse(&self, data: &[u8], base: &Url) -> KuraResult<NormalizedManifest> {
        let playlist = m3u8_rs::parse_playlist_res(data)
            .map_err(|e| KuraError::ManifestParseError(format!("invalid m3u8 file: {e:?}")))?;
        match playlist {
            Playlist::MasterPlaylist(pl) => parse_master(pl, base),
            Playlist::MediaPlaylist(pl) => parse_media(pl, base),
        }
    }

    fn manifest_name(&self) -> &'static str {
        MASTER_NAME
    }

    fn synthesize(&self, asset: &Asset) -> String {
        synthesize_master(asset)
    }

    fn resolve(&self, asset: &Asset, path: &str) -> Option<LocalResource> {
        if path == MASTER_NAME {
            return Some(LocalResource::Manifest {
                body: self.synthesize(asset),
                content_type: CONTENT_TYPE,
            });
        }

        if let Some(rendition) = path.strip_suffix(&format!("/{MEDIA_NAME}")) {
            let rendition = asset.rendition(rendition.parse().ok()?)?;
            if !rendition.selected {
                return None;
            }
            return Some(LocalResource::Manifest {
                body: synthesize_media(rendition),
                content_type: CONTENT_TYPE,
            });
        }

        resolve_segment_path(asset, path)
    }
}

fn parse_master(pl: MasterPlaylist, base: &Url) -> KuraResult<NormalizedManifest> {
    tracing::debug!(
        variants = pl.variants.len(),
        alternatives = pl.alternatives.len(),
        "Master playlist input detected."
    );
    let mut renditions = Vec::new();

    for (i, variant) in pl.variants.iter().filter(|v| !v.is_i_frame).enumerate() {
        let audio_only = variant.resolution.is_none()
            && variant.codecs.as_deref().is_some_and(|codecs| {
                codecs.split(',').all(|c| {
                    let c = c.trim();
                    c.starts_with("mp4a") || c.starts_with("ac-3") || c.starts_with("ec-3")
                })
            });
        let kind = if audio_only {
            MediaKind::Audio
        } else {
            MediaKind::Video
        };

        let mut rendition = Rendition::new(format!("variant-{i}"), kind);
        rendition.bandwidth = variant.bandwidth;
        rendition.codecs = variant.codecs.clone();
        rendition.resolution = variant.resolution.as_ref().map(|r| (r.width, r.height));
        rendition.frame_rate = variant.frame_rate;
        rendition.source = Some(merge_baseurls(base, &variant.uri)?);
        if let Some(audio) = &variant.audio {
            rendition.attributes.insert("audio".into(), audio.clone());
        }
        if let Some(subtitles) = &variant.subtitles {
            rendition
                .attributes
                .insert("subtitles".into(), subtitles.clone());
        }
        if let Some(average) = variant.average_bandwidth {
            rendition
                .attributes
                .insert("average_bandwidth".into(), average.to_string());
        }
        renditions.push(rendition);
    }

    for (i, media) in pl.alternatives.iter().enumerate() {
        // closed captions and renditions muxed into the variant have no uri
        let Some(uri) = &media.uri else {
            continue;
        };
        let (kind, prefix) = match media.media_type {
            AlternativeMediaType::Audio => (MediaKind::Audio, "audio"),
            AlternativeMediaType::Subtitles => (MediaKind::Subtitle, "subtitle"),
            AlternativeMediaType::Video => (MediaKind::Video, "video"),
            _ => continue,
        };

        let mut rendition = Rendition::new(format!("{prefix}-{i}"), kind);
        rendition.language = media.language.clone();
        rendition.name = Some(media.name.clone());
        rendition.group = Some(media.group_id.clone());
        rendition.source = Some(merge_baseurls(base, uri)?);
        rendition
            .attributes
            .insert("default".into(), yes_no(media.default).into());
        rendition
            .attributes
            .insert("autoselect".into(), yes_no(media.autoselect).into());
        if let Some(channels) = &media.channels {
            rendition.attributes.insert("channels".into(), channels.clone());
        }
        renditions.push(rendition);
    }

    if renditions.is_empty() {
        return Err(KuraError::ManifestParseError(
            "master playlist without streams".to_string(),
        ));
    }
    number_renditions(&mut renditions);

    Ok(NormalizedManifest {
        renditions,
        duration: None,
        ..Default::default()
    })
}

fn parse_media(pl: MediaPlaylist, base: &Url) -> KuraResult<NormalizedManifest> {
    let mut rendition = Rendition::new("main", MediaKind::Video);

    let mut key: Option<EncryptionContext> = None;
    let mut last_range_end: Option<(String, u64)> = None;
    let mut section = 0;

    for (i, segment) in pl.segments.iter().enumerate() {
        let sequence = pl.media_sequence + i as u64;

        if let Some(k) = &segment.key {
            key = parse_key(k, base)?;
        }

        if let Some(map) = &segment.map {
            let url = merge_baseurls(base, &map.uri)?;
            let range = map
                .byte_range
                .as_ref()
                .map(|r| ByteRange::new(r.offset.unwrap_or(0), Some(r.length)));
            let previous = rendition.sections.last().or(rendition.init.as_ref());
            if previous.map_or(true, |p| p.url != url || p.byte_range != range) {
                let index = match previous {
                    None => SegmentIndex::Init,
                    Some(_) => {
                        section += 1;
                        SegmentIndex::Section(section)
                    }
                };
                let mut init = Segment::new(index, url).with_range(range);
                init.encryption = key
                    .as_ref()
                    .filter(|k| k.scheme == EncryptionScheme::Aes128)
                    .cloned()
                    .map(|mut k| {
                        k.iv.get_or_insert(iv_from_sequence(sequence));
                        k
                    });
                match index {
                    SegmentIndex::Init => rendition.init = Some(init),
                    _ => rendition.sections.push(init),
                }
            }
        }

        let url = merge_baseurls(base, &segment.uri)?;
        let range = match &segment.byte_range {
            Some(range) => {
                let offset = match range.offset {
                    Some(offset) => offset,
                    // continues from the end of the previous sub-range of the same resource
                    None => match &last_range_end {
                        Some((uri, end)) if uri == &segment.uri => *end,
                        _ => 0,
                    },
                };
                last_range_end = Some((segment.uri.clone(), offset + range.length));
                Some(ByteRange::new(offset, Some(range.length)))
            }
            None => {
                last_range_end = None;
                None
            }
        };

        let mut media = Segment::new(SegmentIndex::Media(sequence), url)
            .with_range(range)
            .with_duration(segment.duration as f64);
        media.section = section;
        media.discontinuity = segment.discontinuity;
        media.encryption = key.clone().map(|mut k| {
            if k.scheme == EncryptionScheme::Aes128 {
                k.iv.get_or_insert(iv_from_sequence(sequence));
            }
            k
        });
        rendition.segments.push(media);
    }

    if !pl.end_list {
        tracing::warn!("Playlist has no EXT-X-ENDLIST, downloading the segments listed now.");
    }

    if let Some(first) = rendition.segments.first() {
        rendition.kind = match first.format {
            SegmentFormat::Aac | SegmentFormat::M4a | SegmentFormat::Cmfa => MediaKind::Audio,
            SegmentFormat::WebVtt | SegmentFormat::Ttml => MediaKind::Subtitle,
            _ => MediaKind::Video,
        };
    }
    rendition
        .attributes
        .insert("target_duration".into(), pl.target_duration.to_string());
    if pl.discontinuity_sequence > 0 {
        rendition.attributes.insert(
            "discontinuity_sequence".into(),
            pl.discontinuity_sequence.to_string(),
        );
    }
    rendition.selected = true;

    let duration = rendition.duration();
    Ok(NormalizedManifest {
        renditions: vec![rendition],
        duration: Some(duration),
        ..Default::default()
    })
}

fn parse_key(key: &m3u8_rs::Key, base: &Url) -> KuraResult<Option<EncryptionContext>> {
    let scheme = match &key.method {
        KeyMethod::None => return Ok(None),
        KeyMethod::AES128 => EncryptionScheme::Aes128,
        KeyMethod::SampleAES => match key.keyformat.as_deref() {
            None | Some("identity") => {
                return Err(KuraError::ManifestParseError(
                    "SAMPLE-AES with identity key format is not supported".to_string(),
                ))
            }
            Some(_) => EncryptionScheme::SampleAes,
        },
        KeyMethod::Other(name) => match name.as_str() {
            "SAMPLE-AES-CENC" | "SAMPLE-AES-CTR" => EncryptionScheme::Cenc,
            _ => {
                return Err(KuraError::ManifestParseError(format!(
                    "unknown key method {name}"
                )))
            }
        },
    };

    let mut context = EncryptionContext::new(scheme);
    context.key_format = key.keyformat.clone();
    context.signalling = Some(key_attributes(key));

    match key.uri.as_deref() {
        Some(uri) if uri.starts_with("data:") => {
            context.init_data = uri.split_once(";base64,").map(|(_, data)| data.to_string());
        }
        Some(uri) if key.keyformat.as_deref() == Some(FAIRPLAY_KEYFORMAT) => {
            // skd:// identifiers are not fetchable, keep them as the key id
            context.key_id = Some(uri.trim_start_matches("skd://").to_string());
        }
        Some(uri) => context.key_uri = Some(merge_baseurls(base, uri)?),
        None if scheme == EncryptionScheme::Aes128 => {
            return Err(KuraError::ManifestParseError(
                "URI field in AES-128 key must exist".to_string(),
            ))
        }
        None => {}
    }

    if let Some(iv) = &key.iv {
        let iv = iv
            .strip_prefix("0x")
            .or_else(|| iv.strip_prefix("0X"))
            .unwrap_or(iv);
        let iv = u128::from_str_radix(iv, 16)
            .map_err(|_| KuraError::ManifestParseError(format!("invalid IV {iv}")))?;
        context.iv = Some(iv.to_be_bytes());
    }

    Ok(Some(context))
}

fn iv_from_sequence(sequence: u64) -> [u8; 16] {
    (sequence as u128).to_be_bytes()
}

fn key_attributes(key: &m3u8_rs::Key) -> String {
    let mut attributes = format!("METHOD={}", key.method);
    if let Some(uri) = &key.uri {
        _ = write!(attributes, ",URI=\"{uri}\"");
    }
    if let Some(iv) = &key.iv {
        _ = write!(attributes, ",IV={iv}");
    }
    if let Some(keyformat) = &key.keyformat {
        _ = write!(attributes, ",KEYFORMAT=\"{keyformat}\"");
    }
    if let Some(versions) = &key.keyformatversions {
        _ = write!(attributes, ",KEYFORMATVERSIONS=\"{versions}\"");
    }
    attributes
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "YES"
    } else {
        "NO"
    }
}

fn synthesize_master(asset: &Asset) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:6\n#EXT-X-INDEPENDENT-SEGMENTS\n");

    let selected: Vec<&Rendition> = asset.selected_renditions().collect();
    let grouped = |group: &str| {
        selected
            .iter()
            .any(|r| r.group.as_deref() == Some(group))
    };

    for rendition in selected.iter().filter(|r| r.group.is_some()) {
        let media_type = match rendition.kind {
            MediaKind::Audio => "AUDIO",
            MediaKind::Subtitle => "SUBTITLES",
            MediaKind::Video => "VIDEO",
        };
        let group = rendition.group.as_deref().unwrap_or_default();
        let name = rendition.name.as_deref().unwrap_or(&rendition.id);
        _ = write!(out, "#EXT-X-MEDIA:TYPE={media_type},GROUP-ID=\"{group}\",NAME=\"{name}\"");
        if let Some(language) = &rendition.language {
            _ = write!(out, ",LANGUAGE=\"{language}\"");
        }
        for (attribute, tag) in [("default", "DEFAULT"), ("autoselect", "AUTOSELECT")] {
            if let Some(value) = rendition.attributes.get(attribute) {
                _ = write!(out, ",{tag}={value}");
            }
        }
        if let Some(channels) = rendition.attributes.get("channels") {
            _ = write!(out, ",CHANNELS=\"{channels}\"");
        }
        _ = writeln!(out, ",URI=\"{}/{MEDIA_NAME}\"", rendition.index);
    }

    let variants: Vec<&&Rendition> = selected.iter().filter(|r| r.group.is_none()).collect();
    for rendition in variants {
        _ = write!(out, "#EXT-X-STREAM-INF:BANDWIDTH={}", rendition.bandwidth.max(1));
        if let Some(average) = rendition.attributes.get("average_bandwidth") {
            _ = write!(out, ",AVERAGE-BANDWIDTH={average}");
        }
        if let Some(codecs) = &rendition.codecs {
            _ = write!(out, ",CODECS=\"{codecs}\"");
        }
        if let Some((width, height)) = rendition.resolution {
            _ = write!(out, ",RESOLUTION={width}x{height}");
        }
        if let Some(frame_rate) = rendition.frame_rate {
            _ = write!(out, ",FRAME-RATE={frame_rate:.3}");
        }
        for (attribute, tag) in [("audio", "AUDIO"), ("subtitles", "SUBTITLES")] {
            if let Some(group) = rendition.attributes.get(attribute).filter(|g| grouped(g)) {
                _ = write!(out, ",{tag}=\"{group}\"");
            }
        }
        _ = writeln!(out, "\n{}/{MEDIA_NAME}", rendition.index);
    }

    out
}

fn synthesize_media(rendition: &Rendition) -> String {
    let target_duration = rendition
        .segments
        .iter()
        .map(|s| s.duration.ceil() as u64)
        .max()
        .unwrap_or(1)
        .max(1);
    let media_sequence = match rendition.segments.first().map(|s| s.index) {
        Some(SegmentIndex::Media(sequence)) => sequence,
        _ => 0,
    };

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:6\n");
    _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_duration}");
    _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{media_sequence}");
    if let Some(sequence) = rendition.attributes.get("discontinuity_sequence") {
        _ = writeln!(out, "#EXT-X-DISCONTINUITY-SEQUENCE:{sequence}");
    }
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");

    // AES-128 segments are decrypted before serving, so only DRM signalling
    // is handed to the player.
    let mut current_key: Option<&str> = None;
    let mut current_init: Option<SegmentIndex> = None;
    for segment in &rendition.segments {
        if segment.discontinuity {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        if let Some(init) = rendition.init_for(segment) {
            if current_init != Some(init.index) {
                _ = writeln!(out, "#EXT-X-MAP:URI=\"{}\"", init.local_name());
                current_init = Some(init.index);
            }
        }
        let key = rendition
            .encryption_for(segment)
            .filter(|k| k.scheme.is_player_decrypted())
            .and_then(|k| k.signalling.as_deref());
        if key != current_key {
            match key {
                Some(attributes) => {
                    _ = writeln!(out, "#EXT-X-KEY:{attributes}");
                }
                None => out.push_str("#EXT-X-KEY:METHOD=NONE\n"),
            }
            current_key = key;
        }
        _ = writeln!(out, "#EXTINF:{:.3},\n{}", segment.duration, segment.local_name());
    }
    out.push_str("#EXT-X-ENDLIST\n");

    out
}
