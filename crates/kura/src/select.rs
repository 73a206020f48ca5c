use std::{cmp::Ordering, collections::HashMap};

use crate::{
    error::{KuraError, KuraResult},
    model::{MediaKind, Rendition},
};

/// Chooses which renditions of an asset get downloaded.
///
/// Selection runs before child manifests are loaded, so only the attributes
/// of the root manifest are known. Returns rendition indices.
pub trait RenditionSelector: Send + Sync {
    fn select(&self, renditions: &[Rendition]) -> Vec<u32>;
}

impl<F> RenditionSelector for F
where
    F: Fn(&[Rendition]) -> Vec<u32> + Send + Sync,
{
    fn select(&self, renditions: &[Rendition]) -> Vec<u32> {
        self(renditions)
    }
}

/// Every rendition.
pub struct SelectAll;

impl RenditionSelector for SelectAll {
    fn select(&self, renditions: &[Rendition]) -> Vec<u32> {
        renditions.iter().map(|r| r.index).collect()
    }
}

/// The best video rendition, the best audio rendition of every language and
/// every subtitle.
#[derive(Default)]
pub struct BestQuality;

impl RenditionSelector for BestQuality {
    fn select(&self, renditions: &[Rendition]) -> Vec<u32> {
        best_quality(renditions.iter())
    }
}

/// Like [`BestQuality`], ignoring renditions above `max` bits per second.
/// Falls back to the lowest rendition of a kind if all of them are above.
pub struct BandwidthCeiling(pub u64);

impl RenditionSelector for BandwidthCeiling {
    fn select(&self, renditions: &[Rendition]) -> Vec<u32> {
        let max = self.0;
        let mut allowed: Vec<&Rendition> = renditions
            .iter()
            .filter(|r| r.bandwidth == 0 || r.bandwidth <= max)
            .collect();

        for kind in [MediaKind::Video, MediaKind::Audio] {
            let has_kind = renditions.iter().any(|r| r.kind == kind);
            if has_kind && !allowed.iter().any(|r| r.kind == kind) {
                if let Some(lowest) = renditions
                    .iter()
                    .filter(|r| r.kind == kind)
                    .min_by_key(|r| r.bandwidth)
                {
                    tracing::warn!(
                        id = %lowest.id,
                        bandwidth = lowest.bandwidth,
                        "Every {kind:?} rendition exceeds the bandwidth ceiling, using the lowest."
                    );
                    allowed.push(lowest);
                }
            }
        }

        best_quality(allowed.into_iter())
    }
}

/// Renditions whose id is in the list.
pub struct SelectIds(pub Vec<String>);

impl RenditionSelector for SelectIds {
    fn select(&self, renditions: &[Rendition]) -> Vec<u32> {
        renditions
            .iter()
            .filter(|r| self.0.contains(&r.id))
            .map(|r| r.index)
            .collect()
    }
}

/// Marks the renditions chosen by `selector` as selected.
pub fn apply_selection(
    selector: &dyn RenditionSelector,
    renditions: &mut [Rendition],
) -> KuraResult<()> {
    let chosen = selector.select(renditions);
    if chosen.is_empty() {
        return Err(KuraError::NoRenditionSelected);
    }
    for rendition in renditions.iter_mut() {
        rendition.selected = chosen.contains(&rendition.index);
    }
    tracing::debug!(
        selected = ?renditions
            .iter()
            .filter(|r| r.selected)
            .map(|r| r.id.as_str())
            .collect::<Vec<_>>(),
        "Renditions selected."
    );
    Ok(())
}

/// Resolution first, frame rate then, bandwidth finally.
fn compare_quality(a: &Rendition, b: &Rendition) -> Ordering {
    if let (Some((a_width, _)), Some((b_width, _))) = (a.resolution, b.resolution) {
        if a_width != b_width {
            return a_width.cmp(&b_width);
        }
    }

    if let (Some(a), Some(b)) = (a.frame_rate, b.frame_rate) {
        let a = a as u64;
        let b = b as u64;
        if a != b {
            return a.cmp(&b);
        }
    }

    a.bandwidth.cmp(&b.bandwidth)
}

/// Ties keep the earlier rendition.
fn pick_best<'a>(candidates: impl IntoIterator<Item = &'a Rendition>) -> Option<&'a Rendition> {
    candidates.into_iter().fold(None, |best, r| match best {
        Some(b) if compare_quality(r, b) != Ordering::Greater => Some(b),
        _ => Some(r),
    })
}

fn best_quality<'a>(renditions: impl Iterator<Item = &'a Rendition>) -> Vec<u32> {
    let renditions: Vec<&Rendition> = renditions.collect();
    let mut chosen = Vec::new();

    let video = pick_best(renditions.iter().copied().filter(|r| r.kind == MediaKind::Video));
    if let Some(video) = video {
        chosen.push(video.index);
    }

    // audio belonging to the group the chosen video references, if any
    let audio_group = video.and_then(|v| v.attributes.get("audio"));
    let audio: Vec<&Rendition> = renditions
        .iter()
        .copied()
        .filter(|r| r.kind == MediaKind::Audio)
        .collect();
    let grouped: Vec<&Rendition> = match audio_group {
        Some(group) if audio.iter().any(|r| r.group.as_ref() == Some(group)) => audio
            .into_iter()
            .filter(|r| r.group.as_ref() == Some(group))
            .collect(),
        _ => audio,
    };

    let mut languages: Vec<Option<&str>> = Vec::new();
    let mut by_language: HashMap<Option<&str>, Vec<&Rendition>> = HashMap::new();
    for rendition in grouped {
        let language = rendition.language.as_deref();
        if !languages.contains(&language) {
            languages.push(language);
        }
        by_language.entry(language).or_default().push(rendition);
    }
    for language in languages {
        if let Some(members) = by_language.remove(&language) {
            if let Some(audio) = pick_best(members) {
                chosen.push(audio.index);
            }
        }
    }

    chosen.extend(
        renditions
            .iter()
            .filter(|r| r.kind == MediaKind::Subtitle)
            .map(|r| r.index),
    );
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::number_renditions;

    fn video(id: &str, width: u64, bandwidth: u64) -> Rendition {
        let mut r = Rendition::new(id, MediaKind::Video);
        r.resolution = Some((width, width * 9 / 16));
        r.bandwidth = bandwidth;
        r
    }

    fn audio(id: &str, language: &str, bandwidth: u64) -> Rendition {
        let mut r = Rendition::new(id, MediaKind::Audio);
        r.language = Some(language.to_string());
        r.bandwidth = bandwidth;
        r
    }

    fn sample() -> Vec<Rendition> {
        let mut renditions = vec![
            video("v-low", 640, 800_000),
            video("v-high", 1920, 5_000_000),
            video("v-mid", 1280, 2_500_000),
            audio("a-en-low", "en", 64_000),
            audio("a-en-high", "en", 128_000),
            audio("a-ja", "ja", 96_000),
            Rendition::new("subs", MediaKind::Subtitle),
        ];
        number_renditions(&mut renditions);
        renditions
    }

    fn selected_ids(renditions: &[Rendition]) -> Vec<&str> {
        renditions
            .iter()
            .filter(|r| r.selected)
            .map(|r| r.id.as_str())
            .collect()
    }

    #[test]
    fn test_best_quality() {
        let mut renditions = sample();
        apply_selection(&BestQuality, &mut renditions).unwrap();
        assert_eq!(
            selected_ids(&renditions),
            vec!["v-high", "a-en-high", "a-ja", "subs"]
        );
    }

    #[test]
    fn test_bandwidth_ceiling() {
        let mut renditions = sample();
        apply_selection(&BandwidthCeiling(3_000_000), &mut renditions).unwrap();
        assert_eq!(
            selected_ids(&renditions),
            vec!["v-mid", "a-en-high", "a-ja", "subs"]
        );

        let mut renditions = sample();
        apply_selection(&BandwidthCeiling(100), &mut renditions).unwrap();
        assert!(selected_ids(&renditions).contains(&"v-low"));
        assert!(selected_ids(&renditions).contains(&"a-en-low"));
    }

    #[test]
    fn test_select_ids_and_closure() {
        let mut renditions = sample();
        apply_selection(&SelectIds(vec!["a-ja".into()]), &mut renditions).unwrap();
        assert_eq!(selected_ids(&renditions), vec!["a-ja"]);

        let only_audio = |renditions: &[Rendition]| {
            renditions
                .iter()
                .filter(|r| r.kind == MediaKind::Audio)
                .map(|r| r.index)
                .collect::<Vec<_>>()
        };
        apply_selection(&only_audio, &mut renditions).unwrap();
        assert_eq!(selected_ids(&renditions).len(), 3);

        apply_selection(&SelectAll, &mut renditions).unwrap();
        assert_eq!(selected_ids(&renditions).len(), 7);
    }

    #[test]
    fn test_empty_selection() {
        let mut renditions = sample();
        assert!(matches!(
            apply_selection(&SelectIds(vec!["missing".into()]), &mut renditions),
            Err(KuraError::NoRenditionSelected)
        ));
    }
}
