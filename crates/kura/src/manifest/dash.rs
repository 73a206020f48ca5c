mod template;

use std::{borrow::Cow, collections::HashMap, fmt::Write};

use dash_mpd::{AdaptationSet, ContentProtection, Representation, MPD};
use quick_xml::escape::escape;
use url::Url;

pub use template::Template;

use super::{
    number_renditions, resolve_segment_path, LocalResource, ManifestCodec, NormalizedManifest,
};
use crate::{
    error::{KuraError, KuraResult},
    model::{
        normalize_kid, Asset, EncryptionContext, EncryptionScheme, MediaKind, Period, Rendition,
        Segment, SegmentIndex, StreamFormat,
    },
    util::{range::ByteRange, urls::merge_baseurls},
};

const MANIFEST_NAME: &str = "manifest.mpd";
const CONTENT_TYPE: &str = "application/dash+xml";
/// Timescale of synthesized timelines that have no source timing, milliseconds.
const SYNTH_TIMESCALE: u64 = 1000;

pub struct DashCodec;

impl ManifestCodec for DashCodec {
    fn format(&self) -> StreamFormat {
        StreamFormat::Dash
    }

    fn parse(&self, data: &[u8], base: &Url) -> KuraResult<NormalizedManifest> {
        let text = std::str::from_utf8(data)
            .map_err(|e| KuraError::ManifestParseError(format!("MPD is not UTF-8: {e}")))?;
        let mpd = dash_mpd::parse(text)
            .map_err(|e| KuraError::ManifestParseError(format!("invalid MPD: {e}")))?;
        parse_mpd(&mpd, base)
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
        resolve_segment_path(asset, path)
    }
}

fn parse_mpd(mpd: &MPD, base: &Url) -> KuraResult<NormalizedManifest> {
    if mpd.mpdtype.as_deref() == Some("dynamic") {
        return Err(KuraError::ManifestParseError(
            "dynamic MPD can not be downloaded for offline playback".to_string(),
        ));
    }

    let mut base_url = base.clone();
    if let Some(mpd_base_url) = mpd.base_url.first() {
        base_url = merge_baseurls(&base_url, &mpd_base_url.base)?;
    }

    let total_duration = mpd.mediaPresentationDuration.map(|d| d.as_secs_f64());

    let mut renditions: Vec<Rendition> = Vec::new();
    let mut by_key: HashMap<(MediaKind, String), usize> = HashMap::new();

    let mut period_start = 0.;
    for (period_index, period) in mpd.periods.iter().enumerate() {
        if let Some(start) = period.start {
            period_start = start.as_secs_f64();
        }
        let next_start = mpd
            .periods
            .get(period_index + 1)
            .and_then(|p| p.start)
            .map(|s| s.as_secs_f64());
        let period_duration = period
            .duration
            .map(|d| d.as_secs_f64())
            .or_else(|| next_start.map(|next| next - period_start))
            .or_else(|| total_duration.map(|total| total - period_start));

        let base_url = match period.BaseURL.first() {
            Some(b) => Cow::Owned(merge_baseurls(&base_url, &b.base)?),
            None => Cow::Borrowed(&base_url),
        };

        for (adaptation_index, adaptation) in period.adaptations.iter().enumerate() {
            let base_url = match adaptation.BaseURL.first() {
                Some(b) => Cow::Owned(merge_baseurls(&base_url, &b.base)?),
                None => base_url.clone(),
            };

            for (representation_index, representation) in
                adaptation.representations.iter().enumerate()
            {
                let base_url = match representation.BaseURL.first() {
                    Some(b) => Cow::Owned(merge_baseurls(&base_url, &b.base)?),
                    None => base_url.clone(),
                };

                let mime_type = adaptation
                    .contentType
                    .as_deref()
                    .or(adaptation.mimeType.as_deref())
                    .or(representation.contentType.as_deref())
                    .or(representation.mimeType.as_deref());
                let kind = MediaKind::from_mime_type(mime_type);
                let id = representation.id.clone().unwrap_or_else(|| {
                    format!("{period_index}-{adaptation_index}-{representation_index}")
                });

                let addressed = address_segments(
                    adaptation,
                    representation,
                    &id,
                    &base_url,
                    period_duration,
                )?;

                let position = match by_key.get(&(kind, id.clone())) {
                    Some(position) => *position,
                    None => {
                        let rendition = new_rendition(adaptation, representation, &id, kind);
                        renditions.push(rendition);
                        by_key.insert((kind, id.clone()), renditions.len() - 1);
                        renditions.len() - 1
                    }
                };
                let rendition = &mut renditions[position];
                let section = rendition.periods.len() as u32;
                rendition.periods.push(Period {
                    number: period_index as u32,
                    id: period.id.clone(),
                    start: period_start,
                    duration: period_duration,
                    timescale: addressed.timescale,
                    presentation_time_offset: addressed.presentation_time_offset,
                });
                if let Some(mut init) = addressed.init {
                    let previous = rendition.sections.last().or(rendition.init.as_ref());
                    if section == 0 {
                        rendition.init = Some(init);
                    } else if previous
                        .map_or(true, |p| p.url != init.url || p.byte_range != init.byte_range)
                    {
                        init.index = SegmentIndex::Section(section);
                        rendition.sections.push(init);
                    }
                }
                rendition.timescale = addressed.timescale;
                let offset = rendition.segments.len() as u64;
                rendition
                    .segments
                    .extend(addressed.segments.into_iter().enumerate().map(|(i, mut s)| {
                        s.index = SegmentIndex::Media(offset + i as u64);
                        s.section = section;
                        s
                    }));
            }
        }

        if let Some(duration) = period_duration {
            period_start += duration;
        }
    }

    if renditions.is_empty() {
        return Err(KuraError::ManifestParseError(
            "MPD without representations".to_string(),
        ));
    }
    number_renditions(&mut renditions);

    let duration = total_duration.or_else(|| {
        renditions
            .iter()
            .map(Rendition::duration)
            .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.max(d))))
    });

    Ok(NormalizedManifest {
        renditions,
        duration,
        ..Default::default()
    })
}

fn new_rendition(
    adaptation: &AdaptationSet,
    representation: &Representation,
    id: &str,
    kind: MediaKind,
) -> Rendition {
    let mut rendition = Rendition::new(id, kind);
    rendition.bandwidth = representation.bandwidth.unwrap_or(0);
    rendition.codecs = representation
        .codecs
        .clone()
        .or_else(|| adaptation.codecs.clone());
    rendition.language = representation
        .lang
        .clone()
        .or_else(|| adaptation.lang.clone());
    rendition.resolution = representation
        .width
        .zip(representation.height)
        .map(|(w, h)| (w as u64, h as u64));
    rendition.frame_rate = representation
        .frameRate
        .as_deref()
        .or(adaptation.frameRate.as_deref())
        .and_then(parse_frame_rate);
    if let Some(mime_type) = representation
        .mimeType
        .as_deref()
        .or(adaptation.mimeType.as_deref())
    {
        rendition
            .attributes
            .insert("mime_type".into(), mime_type.to_string());
    }
    rendition.encryption = protection(
        adaptation
            .ContentProtection
            .iter()
            .chain(representation.ContentProtection.iter()),
    );
    rendition
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((n, d)) => {
            let d: f64 = d.parse().ok()?;
            (d != 0.).then_some(n.parse::<f64>().ok()? / d)
        }
        None => s.parse().ok(),
    }
}

fn protection<'a>(
    elements: impl Iterator<Item = &'a ContentProtection>,
) -> Option<EncryptionContext> {
    let mut found = false;
    let mut scheme = None;
    let mut key_id = None;
    for element in elements {
        found = true;
        match element.value.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("cenc" | "cens") => scheme = Some(EncryptionScheme::Cenc),
            Some("cbcs" | "cbc1") => scheme = Some(EncryptionScheme::Cbcs),
            _ => {}
        }
        if key_id.is_none() {
            key_id = element.default_KID.as_deref().map(normalize_kid);
        }
    }
    if !found {
        return None;
    }

    let scheme = scheme.unwrap_or(EncryptionScheme::Cenc);
    let mut context = EncryptionContext::new(scheme);
    context.key_id = key_id;
    context.signalling = Some(
        match scheme {
            EncryptionScheme::Cbcs => "cbcs",
            _ => "cenc",
        }
        .to_string(),
    );
    Some(context)
}

struct Addressed {
    init: Option<Segment>,
    segments: Vec<Segment>,
    timescale: u64,
    presentation_time_offset: u64,
}

fn address_segments(
    adaptation: &AdaptationSet,
    representation: &Representation,
    id: &str,
    base_url: &Url,
    period_duration: Option<f64>,
) -> KuraResult<Addressed> {
    let mut template = Template::new();
    template.insert(Template::REPRESENTATION_ID, id.to_string());
    if let Some(bandwidth) = representation.bandwidth {
        template.insert(Template::BANDWIDTH, bandwidth.to_string());
    }

    let inner_segment_template = representation.SegmentTemplate.as_ref();
    let outer_segment_template = adaptation.SegmentTemplate.as_ref();

    // 1. SegmentTemplate, attributes inherited from the AdaptationSet
    if let Some(segment_template) = inner_segment_template.or(outer_segment_template) {
        let pick = |f: fn(&dash_mpd::SegmentTemplate) -> Option<String>| {
            inner_segment_template
                .and_then(f)
                .or_else(|| outer_segment_template.and_then(f))
        };
        let initialization = pick(|t| t.initialization.clone());
        let media = pick(|t| t.media.clone()).ok_or_else(|| {
            KuraError::ManifestParseError(format!("SegmentTemplate of {id} has no media"))
        })?;
        let timescale = inner_segment_template
            .and_then(|t| t.timescale)
            .or_else(|| outer_segment_template.and_then(|t| t.timescale))
            .unwrap_or(1)
            .max(1);
        let start_number = inner_segment_template
            .and_then(|t| t.startNumber)
            .or_else(|| outer_segment_template.and_then(|t| t.startNumber))
            .unwrap_or(1);
        let presentation_time_offset = inner_segment_template
            .and_then(|t| t.presentationTimeOffset)
            .or_else(|| outer_segment_template.and_then(|t| t.presentationTimeOffset))
            .unwrap_or(0);

        let init = match initialization {
            Some(initialization) => {
                let url = merge_baseurls(base_url, &template.resolve(&initialization))?;
                Some(Segment::new(SegmentIndex::Init, url))
            }
            None => None,
        };

        let mut segments = Vec::new();
        let mut number = start_number;
        if let Some(timeline) = &segment_template.SegmentTimeline {
            let period_end = period_duration.map(|d| (d * timescale as f64) as u64);
            let mut current_time = 0u64;
            for (i, s) in timeline.segments.iter().enumerate() {
                if let Some(t) = s.t {
                    current_time = t;
                }
                let duration = s.d as u64;
                if duration == 0 {
                    return Err(KuraError::ManifestParseError(format!(
                        "zero segment duration in timeline of {id}"
                    )));
                }
                let repeat = match s.r.map(|r| r as i64) {
                    Some(r) if r >= 0 => r as u64,
                    Some(_) => {
                        // repeats until the next S element or the end of the period
                        let end = timeline
                            .segments
                            .get(i + 1)
                            .and_then(|next| next.t)
                            .or(period_end)
                            .ok_or_else(|| {
                                KuraError::ManifestParseError(format!(
                                    "open-ended timeline of {id} without period duration"
                                ))
                            })?;
                        end.saturating_sub(current_time).div_ceil(duration).saturating_sub(1)
                    }
                    None => 0,
                };
                for _ in 0..=repeat {
                    let mut template = template.clone();
                    template
                        .insert(Template::TIME, current_time.to_string())
                        .insert(Template::NUMBER, number.to_string());
                    let url = merge_baseurls(base_url, &template.resolve(&media))?;
                    segments.push(
                        Segment::new(SegmentIndex::Media(0), url)
                            .with_duration(duration as f64 / timescale as f64)
                            .with_time(current_time),
                    );
                    number += 1;
                    current_time += duration;
                }
            }
        } else {
            let duration = inner_segment_template
                .and_then(|t| t.duration)
                .or_else(|| outer_segment_template.and_then(|t| t.duration))
                .map(|d| d as f64)
                .filter(|d| *d > 0.)
                .ok_or_else(|| {
                    KuraError::ManifestParseError(format!(
                        "SegmentTemplate of {id} has neither SegmentTimeline nor duration"
                    ))
                })?;
            let period_duration = period_duration.ok_or_else(|| {
                KuraError::ManifestParseError(format!("duration of the period holding {id} is unknown"))
            })?;
            let segment_duration = duration / timescale as f64;
            let count = (period_duration / segment_duration).ceil() as u64;
            for i in 0..count {
                let mut template = template.clone();
                template
                    .insert(Template::NUMBER, number.to_string())
                    .insert(
                        Template::TIME,
                        ((i as f64 * duration) as u64).to_string(),
                    );
                let url = merge_baseurls(base_url, &template.resolve(&media))?;
                let remaining = period_duration - i as f64 * segment_duration;
                segments.push(
                    Segment::new(SegmentIndex::Media(0), url)
                        .with_duration(segment_duration.min(remaining))
                        .with_time((i as f64 * duration) as u64),
                );
                number += 1;
            }
        }

        return Ok(Addressed {
            init,
            segments,
            timescale,
            presentation_time_offset,
        });
    }

    // 2. SegmentList
    if let Some(segment_list) = &representation.SegmentList {
        let timescale = segment_list.timescale.map(|t| t as u64).unwrap_or(1).max(1);
        let ticks = segment_list.duration.map(|d| d as u64).unwrap_or(0);
        let duration = ticks as f64 / timescale as f64;

        let init = match &segment_list.Initialization {
            Some(initialization) => Some(initialization_segment(
                base_url,
                initialization.sourceURL.as_deref(),
                initialization.range.as_deref(),
                &template,
            )?),
            None => None,
        };

        let mut segments = Vec::new();
        for (i, segment_url) in segment_list.segment_urls.iter().enumerate() {
            let url = match &segment_url.media {
                Some(media) => merge_baseurls(base_url, &template.resolve(media))?,
                None => base_url.clone(),
            };
            let range = segment_url
                .mediaRange
                .as_deref()
                .map(ByteRange::parse_spec)
                .transpose()?;
            segments.push(
                Segment::new(SegmentIndex::Media(0), url)
                    .with_range(range)
                    .with_duration(duration)
                    .with_time(i as u64 * ticks),
            );
        }

        return Ok(Addressed {
            init,
            segments,
            timescale,
            presentation_time_offset: 0,
        });
    }

    // 3. SegmentBase or a bare BaseURL: the whole resource is one segment,
    //    including its initialization and index ranges.
    let segment = Segment::new(SegmentIndex::Media(0), base_url.clone())
        .with_duration(period_duration.unwrap_or(0.));
    Ok(Addressed {
        init: None,
        segments: vec![segment],
        timescale: SYNTH_TIMESCALE,
        presentation_time_offset: 0,
    })
}

fn initialization_segment(
    base_url: &Url,
    source_url: Option<&str>,
    range: Option<&str>,
    template: &Template,
) -> KuraResult<Segment> {
    let url = match source_url {
        Some(source_url) => merge_baseurls(base_url, &template.resolve(source_url))?,
        None => base_url.clone(),
    };
    let range = range.map(ByteRange::parse_spec).transpose()?;
    Ok(Segment::new(SegmentIndex::Init, url).with_range(range))
}

fn content_kind(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
        MediaKind::Subtitle => "text",
    }
}

fn xml_duration(seconds: f64) -> String {
    format!("PT{seconds:.3}S")
}

/// What one rendition contributes to one synthesized period.
struct PeriodView<'a> {
    timescale: u64,
    presentation_time_offset: u64,
    init: Option<&'a Segment>,
    segments: Vec<&'a Segment>,
}

impl<'a> PeriodView<'a> {
    /// The part of `rendition` inside source period `number`. Renditions
    /// without period records are one period with millisecond timing.
    fn of(rendition: &'a Rendition, number: Option<u32>) -> Option<Self> {
        let Some(number) = number else {
            return Some(Self {
                timescale: SYNTH_TIMESCALE,
                presentation_time_offset: 0,
                init: rendition.init.as_ref(),
                segments: rendition.segments.iter().collect(),
            });
        };
        let section = rendition.periods.iter().position(|p| p.number == number)?;
        let period = &rendition.periods[section];
        let segments: Vec<&Segment> = rendition
            .segments
            .iter()
            .filter(|s| s.section as usize == section)
            .collect();
        Some(Self {
            timescale: period.timescale.max(1),
            presentation_time_offset: period.presentation_time_offset,
            init: segments.first().and_then(|s| rendition.init_for(s)),
            segments,
        })
    }
}

fn synthesize(asset: &Asset) -> String {
    let duration = asset.duration.unwrap_or_else(|| {
        asset
            .selected_renditions()
            .map(Rendition::duration)
            .fold(0., f64::max)
    });

    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    _ = writeln!(
        out,
        "<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" xmlns:cenc=\"urn:mpeg:cenc:2013\" profiles=\"urn:mpeg:dash:profile:isoff-main:2011\" type=\"static\" minBufferTime=\"PT2S\" mediaPresentationDuration=\"{}\">",
        xml_duration(duration)
    );

    let mut periods: Vec<&Period> = asset
        .selected_renditions()
        .flat_map(|r| r.periods.iter())
        .collect();
    periods.sort_by_key(|p| p.number);
    periods.dedup_by_key(|p| p.number);

    if periods.is_empty() {
        out.push_str("  <Period id=\"0\" start=\"PT0S\">\n");
        synthesize_period(&mut out, asset, None);
        out.push_str("  </Period>\n");
    }
    for period in periods {
        let id = period.id.clone().unwrap_or_else(|| period.number.to_string());
        _ = write!(
            out,
            "  <Period id=\"{}\" start=\"{}\"",
            escape(id.as_str()),
            xml_duration(period.start)
        );
        if let Some(duration) = period.duration {
            _ = write!(out, " duration=\"{}\"", xml_duration(duration));
        }
        out.push_str(">\n");
        synthesize_period(&mut out, asset, Some(period.number));
        out.push_str("  </Period>\n");
    }

    out.push_str("</MPD>\n");
    out
}

fn synthesize_period(out: &mut String, asset: &Asset, number: Option<u32>) {
    // one adaptation set per kind and language
    let mut sets: Vec<((MediaKind, Option<&str>), Vec<(&Rendition, PeriodView)>)> = Vec::new();
    for rendition in asset.selected_renditions() {
        let Some(view) = PeriodView::of(rendition, number) else {
            continue;
        };
        let key = (rendition.kind, rendition.language.as_deref());
        match sets.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push((rendition, view)),
            None => sets.push((key, vec![(rendition, view)])),
        }
    }

    for (set_index, ((kind, language), members)) in sets.iter().enumerate() {
        let mime_type = members
            .first()
            .and_then(|(r, _)| r.all_segments().next())
            .map(|s| s.format.content_type(*kind))
            .unwrap_or("video/mp4");
        _ = write!(
            out,
            "    <AdaptationSet id=\"{set_index}\" contentType=\"{}\" mimeType=\"{mime_type}\" segmentAlignment=\"true\"",
            content_kind(*kind)
        );
        if let Some(language) = language {
            _ = write!(out, " lang=\"{}\"", escape(*language));
        }
        out.push_str(">\n");

        if let Some(protection) = members.first().and_then(|(r, _)| r.encryption.as_ref()) {
            _ = write!(
                out,
                "      <ContentProtection schemeIdUri=\"urn:mpeg:dash:mp4protection:2011\" value=\"{}\"",
                protection.signalling.as_deref().unwrap_or("cenc")
            );
            if let Some(kid) = &protection.key_id {
                _ = write!(out, " cenc:default_KID=\"{}\"", format_kid(kid));
            }
            out.push_str("/>\n");
        }

        for (rendition, view) in members {
            synthesize_representation(out, rendition, view);
        }
        out.push_str("    </AdaptationSet>\n");
    }
}

fn synthesize_representation(out: &mut String, rendition: &Rendition, view: &PeriodView) {
    _ = write!(
        out,
        "      <Representation id=\"{}\" bandwidth=\"{}\"",
        escape(rendition.id.as_str()),
        rendition.bandwidth
    );
    if let Some(codecs) = &rendition.codecs {
        _ = write!(out, " codecs=\"{}\"", escape(codecs.as_str()));
    }
    if let Some((width, height)) = rendition.resolution {
        _ = write!(out, " width=\"{width}\" height=\"{height}\"");
    }
    out.push_str(">\n");
    _ = write!(out, "        <SegmentList timescale=\"{}\"", view.timescale);
    if view.presentation_time_offset > 0 {
        _ = write!(
            out,
            " presentationTimeOffset=\"{}\"",
            view.presentation_time_offset
        );
    }
    out.push_str(">\n");
    if let Some(init) = view.init {
        _ = writeln!(
            out,
            "          <Initialization sourceURL=\"{}/{}\"/>",
            rendition.index,
            init.local_name()
        );
    }

    // source start times are kept so they match the decode times stored in
    // the segments
    out.push_str("          <SegmentTimeline>\n");
    let mut next = view.presentation_time_offset;
    for segment in &view.segments {
        let duration = (segment.duration * view.timescale as f64).round() as u64;
        let time = segment.time.unwrap_or(next);
        _ = writeln!(out, "            <S t=\"{time}\" d=\"{duration}\"/>");
        next = time + duration;
    }
    out.push_str("          </SegmentTimeline>\n");
    for segment in &view.segments {
        _ = writeln!(
            out,
            "          <SegmentURL media=\"{}/{}\"/>",
            rendition.index,
            segment.local_name()
        );
    }
    out.push_str("        </SegmentList>\n      </Representation>\n");
}

/// `default_KID` in its canonical 8-4-4-4-12 form.
fn format_kid(kid: &str) -> String {
    let kid = normalize_kid(kid);
    if kid.len() != 32 {
        return kid;
    }
    format!(
        "{}-{}-{}-{}-{}",
        &kid[0..8],
        &kid[8..12],
        &kid[12..16],
        &kid[16..20],
        &kid[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/content/manifest.mpd?auth=1").unwrap()
    }

    fn asset_of(manifest: NormalizedManifest) -> Asset {
        let mut renditions = manifest.renditions;
        for rendition in &mut renditions {
            rendition.selected = true;
        }
        Asset {
            id: crate::model::AssetId::new("show").unwrap(),
            url: base(),
            format: StreamFormat::Dash,
            state: crate::model::AssetState::Completed,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            priority: 0,
            sequence: 0,
            description: None,
            duration: manifest.duration,
            renditions,
            retry_count: 0,
            failure: None,
            attributes: manifest.attributes,
        }
    }

    #[test]
    fn test_segment_timeline() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT8S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc" cenc:default_KID="10000000-1000-1000-1000-100000000001" xmlns:cenc="urn:mpeg:cenc:2013"/>
      <SegmentTemplate timescale="1000" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Time$.m4s">
        <SegmentTimeline>
          <S t="0" d="2000" r="2"/>
          <S d="2000"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v1" bandwidth="800000" width="1280" height="720" codecs="avc1.64001f"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest = DashCodec.parse(mpd.as_bytes(), &base()).unwrap();
        assert_eq!(manifest.renditions.len(), 1);

        let rendition = &manifest.renditions[0];
        assert_eq!(rendition.id, "v1");
        assert_eq!(rendition.resolution, Some((1280, 720)));
        assert_eq!(
            rendition.init.as_ref().unwrap().url.as_str(),
            "https://example.com/content/v1/init.mp4?auth=1"
        );
        assert_eq!(rendition.segments.len(), 4);
        assert_eq!(
            rendition.segments[3].url.as_str(),
            "https://example.com/content/v1/6000.m4s?auth=1"
        );
        assert_eq!(rendition.segments[3].index, SegmentIndex::Media(3));

        let protection = rendition.encryption.as_ref().unwrap();
        assert_eq!(protection.scheme, EncryptionScheme::Cenc);
        assert_eq!(
            protection.key_id.as_deref(),
            Some("10000000100010001000100000000001")
        );
    }

    #[test]
    fn test_duration_template_and_periods() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT10S">
  <BaseURL>https://cdn.example.com/media/</BaseURL>
  <Period id="p0" duration="PT6S">
    <AdaptationSet mimeType="audio/mp4" lang="en">
      <SegmentTemplate timescale="10" duration="40" startNumber="5" media="a-$Number%03d$.m4s"/>
      <Representation id="a1" bandwidth="64000"/>
    </AdaptationSet>
  </Period>
  <Period id="p1" duration="PT4S">
    <AdaptationSet mimeType="audio/mp4" lang="en">
      <SegmentTemplate timescale="10" duration="40" media="b-$Number$.m4s"/>
      <Representation id="a1" bandwidth="64000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest = DashCodec.parse(mpd.as_bytes(), &base()).unwrap();
        assert_eq!(manifest.renditions.len(), 1);
        let rendition = &manifest.renditions[0];
        assert_eq!(rendition.kind, MediaKind::Audio);
        assert_eq!(rendition.language.as_deref(), Some("en"));

        let urls: Vec<&str> = rendition.segments.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example.com/media/a-005.m4s",
                "https://cdn.example.com/media/a-006.m4s",
                "https://cdn.example.com/media/b-1.m4s",
            ]
        );
        assert!((rendition.segments[1].duration - 2.0).abs() < 1e-9);
        assert_eq!(manifest.duration, Some(10.));

        let sections: Vec<u32> = rendition.segments.iter().map(|s| s.section).collect();
        assert_eq!(sections, vec![0, 0, 1]);
        assert_eq!(rendition.periods.len(), 2);
        assert_eq!(rendition.periods[1].id.as_deref(), Some("p1"));
        assert_eq!(rendition.periods[1].start, 6.);
    }

    #[test]
    fn test_timeline_offset_is_kept() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT4S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="90000" presentationTimeOffset="900000" initialization="init.mp4" media="$Time$.m4s">
        <SegmentTimeline>
          <S t="900000" d="180000" r="1"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v" bandwidth="500000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest = DashCodec.parse(mpd.as_bytes(), &base()).unwrap();
        let rendition = &manifest.renditions[0];
        assert_eq!(rendition.segments[1].time, Some(1080000));
        assert_eq!(rendition.periods[0].presentation_time_offset, 900000);

        let body = synthesize(&asset_of(manifest));
        assert!(body.contains(
            "<SegmentList timescale=\"90000\" presentationTimeOffset=\"900000\">"
        ));
        assert!(body.contains("<S t=\"900000\" d=\"180000\"/>"));
        assert!(body.contains("<S t=\"1080000\" d=\"180000\"/>"));
        assert!(!body.contains("<S t=\"0\""));
    }

    #[test]
    fn test_each_period_keeps_its_init() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT8S">
  <Period id="main" duration="PT4S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" initialization="main/init.mp4" media="main/$Number$.m4s">
        <SegmentTimeline>
          <S t="0" d="2000" r="1"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v" bandwidth="500000"/>
    </AdaptationSet>
  </Period>
  <Period id="ad" start="PT4S" duration="PT4S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="48000" presentationTimeOffset="96000" initialization="ad/init.mp4" media="ad/$Number$.m4s">
        <SegmentTimeline>
          <S t="96000" d="96000" r="1"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v" bandwidth="500000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest = DashCodec.parse(mpd.as_bytes(), &base()).unwrap();
        assert_eq!(manifest.renditions.len(), 1);
        let rendition = &manifest.renditions[0];
        assert_eq!(rendition.segments.len(), 4);
        assert_eq!(rendition.sections.len(), 1);
        let ad_init = rendition.init_for(&rendition.segments[2]).unwrap();
        assert_eq!(ad_init.index, SegmentIndex::Section(1));
        assert_eq!(
            ad_init.url.as_str(),
            "https://example.com/content/ad/init.mp4?auth=1"
        );
        assert_eq!(
            rendition.init_for(&rendition.segments[1]).unwrap().index,
            SegmentIndex::Init
        );

        let body = synthesize(&asset_of(manifest));
        assert_eq!(body.matches("<Period ").count(), 2);
        assert!(body.contains("<Period id=\"ad\" start=\"PT4.000S\" duration=\"PT4.000S\">"));
        assert!(body.contains("<Initialization sourceURL=\"0/init.mp4\"/>"));
        assert!(body.contains("<Initialization sourceURL=\"0/init-1.mp4\"/>"));
        assert!(body.contains("<S t=\"96000\" d=\"96000\"/>"));
        // each period lists only its own segments
        let ad = &body[body.find("<Period id=\"ad\"").unwrap()..];
        assert!(ad.contains("<SegmentURL media=\"0/2.mp4\"/>"));
        assert!(!ad.contains("<SegmentURL media=\"0/1.mp4\"/>"));
    }

    #[test]
    fn test_segment_list_with_ranges() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT4S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation id="r" bandwidth="1000">
        <BaseURL>video.mp4</BaseURL>
        <SegmentList timescale="1" duration="2">
          <Initialization range="0-99"/>
          <SegmentURL mediaRange="100-599"/>
          <SegmentURL mediaRange="600-999"/>
        </SegmentList>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest = DashCodec.parse(mpd.as_bytes(), &base()).unwrap();
        let rendition = &manifest.renditions[0];
        let init = rendition.init.as_ref().unwrap();
        assert_eq!(init.byte_range, Some(ByteRange::new(0, Some(100))));
        assert_eq!(rendition.segments.len(), 2);
        assert_eq!(
            rendition.segments[1].byte_range,
            Some(ByteRange::new(600, Some(400)))
        );
        assert_eq!(rendition.segments[1].length, Some(400));
    }

    #[test]
    fn test_dynamic_mpd_is_rejected() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic"><Period/></MPD>"#;
        assert!(matches!(
            DashCodec.parse(mpd.as_bytes(), &base()),
            Err(KuraError::ManifestParseError(_))
        ));
    }

    #[test]
    fn test_format_kid() {
        assert_eq!(
            format_kid("10000000100010001000100000000001"),
            "10000000-1000-1000-1000-100000000001"
        );
    }
}
