use url::Url;

use crate::error::KuraResult;

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://")
        || s.starts_with("https://")
        || s.starts_with("file://")
        || s.starts_with("ftp://")
}

/// Resolves `new` against `current`. The query of `current` is carried over
/// unless `new` brings its own, so signed manifest URLs keep working for the
/// segments they reference.
pub(crate) fn merge_baseurls(current: &Url, new: &str) -> KuraResult<Url> {
    if is_absolute_url(new) {
        Ok(Url::parse(new)?)
    } else {
        let mut merged = current.join(new)?;
        if merged.query().is_none() {
            merged.set_query(current.query());
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_baseurls() {
        let base = Url::parse("https://example.com/path/manifest.mpd?auth=secret").unwrap();
        assert_eq!(
            merge_baseurls(&base, "/video42.mp4").unwrap().as_str(),
            "https://example.com/video42.mp4?auth=secret"
        );
        assert_eq!(
            merge_baseurls(&base, "seg/1.m4s?auth=new").unwrap().as_str(),
            "https://example.com/path/seg/1.m4s?auth=new"
        );
        assert_eq!(
            merge_baseurls(&base, "https://cdn.example.com/a.ts")
                .unwrap()
                .as_str(),
            "https://cdn.example.com/a.ts"
        );
    }
}
