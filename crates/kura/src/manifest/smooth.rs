use std::{fmt::Write, sync::LazyLock};

use base64::{engine::general_purpose::STANDARD, Engine};
use quick_xml::escape::escape;
use regex::Regex;
use serde::Deserialize;
use url::Url;

use super::{number_renditions, LocalResource, ManifestCodec, NormalizedManifest};
use crate::{
    error::{KuraError, KuraResult},
    model::{
        normalize_kid, Asset, EncryptionContext, EncryptionScheme, MediaKind, Rendition, Segment,
        SegmentIndex, StreamFormat,
    },
    util::urls::merge_baseurls,
};

const MANIFEST_NAME: &str = "Manifest";
const CONTENT_TYPE: &str = "application/vnd.ms-sstr+xml";
const DEFAULT_TIMESCALE: u64 = 10_000_000;

/// Attributes of a QualityLevel copied verbatim into the synthesized manifest.
const QUALITY_ATTRIBUTES: [&str; 8] = [
    "FourCC",
    "CodecPrivateData",
    "SamplingRate",
    "Channels",
    "BitsPerSample",
    "PacketSize",
    "AudioTag",
    "NALUnitLengthField",
];

static KID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<KID(?:\s[^>]*?VALUE="([^"]+)"[^>]*)?>([^<]*)"#).unwrap()
});

static FRAGMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^QualityLevels\((\d+)(?:,[^)]*)?\)/Fragments\(([^=]+)=(\d+)\)$").unwrap()
});

#[derive(Debug, Deserialize)]
struct SmoothStreamingMedia {
    #[serde(rename = "@Duration")]
    duration: Option<u64>,
    #[serde(rename = "@TimeScale")]
    timescale: Option<u64>,
    #[serde(rename = "@IsLive")]
    is_live: Option<String>,
    #[serde(rename = "Protection")]
    protection: Option<Protection>,
    #[serde(rename = "StreamIndex", default)]
    streams: Vec<StreamIndex>,
}

#[derive(Debug, Deserialize)]
struct Protection {
    #[serde(rename = "ProtectionHeader", default)]
    headers: Vec<ProtectionHeader>,
}

#[derive(Debug, Deserialize)]
struct ProtectionHeader {
    #[serde(rename = "@SystemID")]
    system_id: String,
    #[serde(rename = "$text", default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct StreamIndex {
    #[serde(rename = "@Type")]
    kind: String,
    #[serde(rename = "@Name")]
    name: Option<String>,
    #[serde(rename = "@Url")]
    url: Option<String>,
    #[serde(rename = "@Language")]
    language: Option<String>,
    #[serde(rename = "@TimeScale")]
    timescale: Option<u64>,
    #[serde(rename = "@Subtype")]
    subtype: Option<String>,
    #[serde(rename = "QualityLevel", default)]
    quality_levels: Vec<QualityLevel>,
    #[serde(rename = "c", default)]
    chunks: Vec<Chunk>,
}

#[derive(Debug, Deserialize)]
struct QualityLevel {
    #[serde(rename = "@Index")]
    index: Option<u32>,
    #[serde(rename = "@Bitrate")]
    bitrate: u64,
    #[serde(rename = "@FourCC")]
    fourcc: Option<String>,
    #[serde(rename = "@MaxWidth")]
    max_width: Option<u64>,
    #[serde(rename = "@MaxHeight")]
    max_height: Option<u64>,
    #[serde(rename = "@CodecPrivateData")]
    codec_private_data: Option<String>,
    #[serde(rename = "@SamplingRate")]
    sampling_rate: Option<String>,
    #[serde(rename = "@Channels")]
    channels: Option<String>,
    #[serde(rename = "@BitsPerSample")]
    bits_per_sample: Option<String>,
    #[serde(rename = "@PacketSize")]
    packet_size: Option<String>,
    #[serde(rename = "@AudioTag")]
    audio_tag: Option<String>,
    #[serde(rename = "@NALUnitLengthField")]
    nal_unit_length_field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(rename = "@t")]
    t: Option<u64>,
    #[serde(rename = "@d")]
    d: Option<u64>,
    #[serde(rename = "@r")]
    r: Option<u64>,
}

pub struct SmoothCodec;

impl ManifestCodec for SmoothCodec {
    fn format(&self) -> StreamFormat {
        StreamFormat::SmoothStreaming
    }

    fn parse(&self, data: &[u8], base: &Url) -> KuraResult<NormalizedManifest> {
        let text = std::str::from_utf8(data)
            .map_err(|e| KuraError::ManifestParseError(format!("manifest is not UTF-8: {e}")))?;
        let text = text.trim_start_matches('\u{feff}');
        let media: SmoothStreamingMedia = quick_xml::de::from_str(text)
            .map_err(|e| KuraError::ManifestParseError(format!("invalid Smooth manifest: {e}")))?;
        parse_media(media, base)
    }

    fn manifest_name(&self) -> &'static str {
        MANIFEST_NAME
    }

    fn synthesize(&self, asset: &Asset) -> String {
        synthesize(asset)
    }

    fn resolve(&self, asset: &Asset, path: &str) -> Option<LocalResource> {
        if path == MANIFEST_NAME {
            return Some(LocalResource::Manifest {
                body: self.synthesize(asset),
                content_type: CONTENT_TYPE,
            });
        }

        let caps = FRAGMENT_REGEX.captures(path)?;
        let bitrate: u64 = caps[1].parse().ok()?;
        let stream = &caps[2];
        let time: u64 = caps[3].parse().ok()?;

        let rendition = asset.selected_renditions().find(|r| {
            r.bandwidth == bitrate && r.attributes.get("stream").map(String::as_str) == Some(stream)
        })?;
        let segment = rendition.segments.iter().find(|s| s.time == Some(time))?;
        Some(LocalResource::Segment {
            rendition: rendition.index,
            index: segment.index,
        })
    }
}

fn parse_media(media: SmoothStreamingMedia, base: &Url) -> KuraResult<NormalizedManifest> {
    if media
        .is_live
        .as_deref()
        .is_some_and(|live| live.eq_ignore_ascii_case("true"))
    {
        return Err(KuraError::ManifestParseError(
            "live Smooth presentation can not be downloaded for offline playback".to_string(),
        ));
    }

    let manifest_timescale = media.timescale.unwrap_or(DEFAULT_TIMESCALE).max(1);
    let encryption = media
        .protection
        .as_ref()
        .and_then(|p| p.headers.first())
        .map(protection_context);

    let mut renditions = Vec::new();
    for (stream_index, stream) in media.streams.iter().enumerate() {
        let kind = match stream.kind.to_ascii_lowercase().as_str() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "text" => MediaKind::Subtitle,
            other => {
                tracing::warn!(kind = other, "Skipping unknown Smooth stream type.");
                continue;
            }
        };
        let name = stream
            .name
            .clone()
            .unwrap_or_else(|| stream.kind.to_ascii_lowercase());
        let template = stream.url.as_deref().ok_or_else(|| {
            KuraError::ManifestParseError(format!("StreamIndex {name} has no Url"))
        })?;
        let timescale = stream.timescale.unwrap_or(manifest_timescale).max(1);
        let timeline = expand_chunks(&stream.chunks, &name)?;

        for (level_position, level) in stream.quality_levels.iter().enumerate() {
            let level_index = level.index.unwrap_or(level_position as u32);
            let mut rendition = Rendition::new(format!("{name}-{level_index}"), kind);
            rendition.bandwidth = level.bitrate;
            rendition.codecs = level.fourcc.as_deref().map(codec_from_fourcc);
            rendition.resolution = level.max_width.zip(level.max_height);
            rendition.language = stream.language.clone();
            rendition.timescale = timescale;
            rendition.encryption = encryption.clone();

            rendition.attributes.insert("stream".into(), name.clone());
            rendition
                .attributes
                .insert("stream_order".into(), stream_index.to_string());
            rendition
                .attributes
                .insert("url_template".into(), template.to_string());
            if let Some(subtype) = &stream.subtype {
                rendition.attributes.insert("Subtype".into(), subtype.clone());
            }
            for (key, value) in [
                ("FourCC", &level.fourcc),
                ("CodecPrivateData", &level.codec_private_data),
                ("SamplingRate", &level.sampling_rate),
                ("Channels", &level.channels),
                ("BitsPerSample", &level.bits_per_sample),
                ("PacketSize", &level.packet_size),
                ("AudioTag", &level.audio_tag),
                ("NALUnitLengthField", &level.nal_unit_length_field),
            ] {
                if let Some(value) = value {
                    rendition.attributes.insert(key.into(), value.clone());
                }
            }

            for (i, (time, duration)) in timeline.iter().enumerate() {
                let path = template
                    .replace("{bitrate}", &level.bitrate.to_string())
                    .replace("{Bitrate}", &level.bitrate.to_string())
                    .replace("{start time}", &time.to_string())
                    .replace("{start_time}", &time.to_string());
                let url = merge_baseurls(base, &path)?;
                let mut segment = Segment::new(SegmentIndex::Media(i as u64), url)
                    .with_duration(*duration as f64 / timescale as f64)
                    .with_time(*time);
                segment.format = crate::model::SegmentFormat::Mp4;
                rendition.segments.push(segment);
            }
            renditions.push(rendition);
        }
    }

    if renditions.is_empty() {
        return Err(KuraError::ManifestParseError(
            "Smooth manifest without quality levels".to_string(),
        ));
    }
    number_renditions(&mut renditions);

    let mut manifest = NormalizedManifest {
        renditions,
        duration: media
            .duration
            .map(|d| d as f64 / manifest_timescale as f64),
        ..Default::default()
    };
    manifest
        .attributes
        .insert("TimeScale".into(), manifest_timescale.to_string());
    if let Some(duration) = media.duration {
        manifest
            .attributes
            .insert("Duration".into(), duration.to_string());
    }
    Ok(manifest)
}

/// Expands `c` elements into `(start time, duration)` pairs.
fn expand_chunks(chunks: &[Chunk], stream: &str) -> KuraResult<Vec<(u64, u64)>> {
    let mut timeline = Vec::new();
    let mut time = 0u64;
    for (i, chunk) in chunks.iter().enumerate() {
        if let Some(t) = chunk.t {
            time = t;
        }
        let duration = match chunk.d {
            Some(d) => d,
            // without @d the chunk lasts until the next one starts
            None => chunks
                .get(i + 1)
                .and_then(|next| next.t)
                .map(|next| next.saturating_sub(time))
                .ok_or_else(|| {
                    KuraError::ManifestParseError(format!(
                        "chunk {i} of {stream} has no duration"
                    ))
                })?,
        };
        for _ in 0..chunk.r.unwrap_or(1).max(1) {
            timeline.push((time, duration));
            time += duration;
        }
    }
    Ok(timeline)
}

fn protection_context(header: &ProtectionHeader) -> EncryptionContext {
    let mut context = EncryptionContext::new(EncryptionScheme::Cenc);
    let data: String = header.data.split_whitespace().collect();
    context.key_id = playready_kid(&data);
    context.signalling = Some(header.system_id.clone());
    context.init_data = Some(data);
    context
}

/// Key id from a base64 PlayReady object. The WRM header stores the GUID in
/// little-endian layout.
fn playready_kid(data: &str) -> Option<String> {
    let bytes = STANDARD.decode(data).ok()?;
    // object length (4) + record count (2) + record type (2) + record length (2)
    let xml = bytes.get(10..)?;
    let units: Vec<u16> = xml
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let xml = String::from_utf16_lossy(&units);

    let caps = KID_REGEX.captures(&xml)?;
    let kid = caps
        .get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())?;
    let mut guid = STANDARD.decode(kid).ok()?;
    if guid.len() != 16 {
        return None;
    }
    guid[0..4].reverse();
    guid[4..6].reverse();
    guid[6..8].reverse();
    Some(normalize_kid(&hex::encode(guid)))
}

fn codec_from_fourcc(fourcc: &str) -> String {
    match fourcc.to_ascii_uppercase().as_str() {
        "H264" | "AVC1" | "DAVC" => "avc1".to_string(),
        "HEVC" | "HVC1" | "HEV1" => "hvc1".to_string(),
        "AACL" => "mp4a.40.2".to_string(),
        "AACH" => "mp4a.40.5".to_string(),
        "EC-3" => "ec-3".to_string(),
        "AC-3" => "ac-3".to_string(),
        "TTML" => "stpp".to_string(),
        _ => fourcc.to_ascii_lowercase(),
    }
}

fn synthesize(asset: &Asset) -> String {
    let timescale: u64 = asset
        .attributes
        .get("TimeScale")
        .and_then(|t| t.parse().ok())
        .unwrap_or(DEFAULT_TIMESCALE);
    let duration = asset
        .attributes
        .get("Duration")
        .and_then(|d| d.parse().ok())
        .unwrap_or_else(|| (asset.duration.unwrap_or(0.) * timescale as f64) as u64);

    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    _ = writeln!(
        out,
        "<SmoothStreamingMedia MajorVersion=\"2\" MinorVersion=\"0\" Duration=\"{duration}\" TimeScale=\"{timescale}\">"
    );

    // quality levels of one original StreamIndex stay together
    let mut streams: Vec<(&str, Vec<&Rendition>)> = Vec::new();
    for rendition in asset.selected_renditions() {
        let name = rendition
            .attributes
            .get("stream")
            .map(String::as_str)
            .unwrap_or(rendition.id.as_str());
        match streams.iter_mut().find(|(n, _)| *n == name) {
            Some((_, members)) => members.push(rendition),
            None => streams.push((name, vec![rendition])),
        }
    }

    for (name, members) in &streams {
        let Some(first) = members.first() else {
            continue;
        };
        let kind = match first.kind {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Subtitle => "text",
        };
        _ = write!(
            out,
            "  <StreamIndex Type=\"{kind}\" Name=\"{}\" Chunks=\"{}\" QualityLevels=\"{}\" TimeScale=\"{}\" Url=\"QualityLevels({{bitrate}})/Fragments({}={{start time}})\"",
            escape(*name),
            first.segments.len(),
            members.len(),
            first.timescale,
            escape(*name),
        );
        if let Some(language) = &first.language {
            _ = write!(out, " Language=\"{}\"", escape(language.as_str()));
        }
        if let Some(subtype) = first.attributes.get("Subtype") {
            _ = write!(out, " Subtype=\"{}\"", escape(subtype.as_str()));
        }
        out.push_str(">\n");

        for (index, rendition) in members.iter().enumerate() {
            _ = write!(
                out,
                "    <QualityLevel Index=\"{index}\" Bitrate=\"{}\"",
                rendition.bandwidth
            );
            if let Some((width, height)) = rendition.resolution {
                _ = write!(out, " MaxWidth=\"{width}\" MaxHeight=\"{height}\"");
            }
            for attribute in QUALITY_ATTRIBUTES {
                if let Some(value) = rendition.attributes.get(attribute) {
                    _ = write!(out, " {attribute}=\"{}\"", escape(value.as_str()));
                }
            }
            out.push_str("/>\n");
        }

        for segment in &first.segments {
            let duration = (segment.duration * first.timescale as f64).round() as u64;
            _ = writeln!(
                out,
                "    <c t=\"{}\" d=\"{duration}\"/>",
                segment.time.unwrap_or_default()
            );
        }
        out.push_str("  </StreamIndex>\n");
    }

    if let Some(protection) = asset
        .selected_renditions()
        .find_map(|r| r.encryption.as_ref())
        .filter(|p| p.init_data.is_some())
    {
        _ = writeln!(
            out,
            "  <Protection>\n    <ProtectionHeader SystemID=\"{}\">{}</ProtectionHeader>\n  </Protection>",
            escape(protection.signalling.as_deref().unwrap_or_default()),
            protection.init_data.as_deref().unwrap_or_default()
        );
    }

    out.push_str("</SmoothStreamingMedia>\n");
    out
}
