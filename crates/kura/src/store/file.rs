use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use bytes::Bytes;

use super::StoreBackend;
use crate::{
    error::KuraResult,
    model::{AssetId, SegmentIndex, StorageKey},
};

const METADATA_FILE: &str = "asset.json";
const LICENSES_FILE: &str = "licenses.json";
const SEGMENT_EXT: &str = "seg";
const TRASH_DIR: &str = ".trash";

/// One directory per asset:
///
/// ```text
/// <root>/<asset>/asset.json
/// <root>/<asset>/licenses.json
/// <root>/<asset>/<rendition>/<index>.seg
/// ```
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn asset_dir(&self, asset: &AssetId) -> PathBuf {
        self.root.join(asset.as_str())
    }

    fn segment_path(&self, key: &StorageKey) -> PathBuf {
        self.asset_dir(&key.asset)
            .join(key.rendition.to_string())
            .join(format!("{}.{SEGMENT_EXT}", key.index))
    }

    /// Writes through a temporary sibling and renames it over the target, so
    /// readers see either the old or the new file.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> KuraResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("{:016x}.tmp", rand::random::<u64>()));
        if let Err(e) = tokio::fs::write(&tmp, data).await {
            _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_optional(path: &Path) -> KuraResult<Option<Bytes>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(data.into())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_trash(&self) {
        let trash = self.root.join(TRASH_DIR);
        if tokio::fs::metadata(&trash).await.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&trash).await {
                tracing::warn!(path = %trash.display(), "Failed to purge deleted assets: {e}");
            }
        }
    }
}

impl StoreBackend for FileBackend {
    async fn write(&self, key: &StorageKey, data: Bytes) -> KuraResult<()> {
        self.write_atomic(&self.segment_path(key), &data).await
    }

    async fn read(&self, key: &StorageKey) -> KuraResult<Option<Bytes>> {
        Self::read_optional(&self.segment_path(key)).await
    }

    async fn remove_asset(&self, asset: &AssetId) -> KuraResult<()> {
        let dir = self.asset_dir(asset);
        let trash = self.root.join(TRASH_DIR);
        tokio::fs::create_dir_all(&trash).await?;

        // after the rename the asset is gone for every reader
        let target = trash.join(uuid::Uuid::new_v4().to_string());
        match tokio::fs::rename(&dir, &target).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = tokio::fs::remove_dir_all(&target).await {
            tracing::warn!(path = %target.display(), "Failed to remove deleted asset: {e}");
        }
        Ok(())
    }

    async fn write_metadata(&self, asset: &AssetId, data: Bytes) -> KuraResult<()> {
        self.write_atomic(&self.asset_dir(asset).join(METADATA_FILE), &data)
            .await
    }

    async fn read_metadata(&self, asset: &AssetId) -> KuraResult<Option<Bytes>> {
        Self::read_optional(&self.asset_dir(asset).join(METADATA_FILE)).await
    }

    async fn write_licenses(&self, asset: &AssetId, data: Bytes) -> KuraResult<()> {
        self.write_atomic(&self.asset_dir(asset).join(LICENSES_FILE), &data)
            .await
    }

    async fn read_licenses(&self, asset: &AssetId) -> KuraResult<Option<Bytes>> {
        Self::read_optional(&self.asset_dir(asset).join(LICENSES_FILE)).await
    }

    async fn list_assets(&self) -> KuraResult<Vec<AssetId>> {
        self.purge_trash().await;

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut assets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = AssetId::new(name) else {
                continue;
            };
            if tokio::fs::metadata(entry.path().join(METADATA_FILE))
                .await
                .is_ok()
            {
                assets.push(id);
            }
        }
        assets.sort();
        Ok(assets)
    }

    async fn list_segments(&self, asset: &AssetId) -> KuraResult<Vec<(StorageKey, u64)>> {
        let mut renditions = match tokio::fs::read_dir(self.asset_dir(asset)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut segments = Vec::new();
        while let Some(rendition) = renditions.next_entry().await? {
            if !rendition.file_type().await?.is_dir() {
                continue;
            }
            let Some(index) = rendition
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };

            let mut files = tokio::fs::read_dir(rendition.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                // leftovers of interrupted writes
                if path.extension().is_some_and(|e| e == "tmp") {
                    _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
                let Some(segment) = path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_suffix(&format!(".{SEGMENT_EXT}")))
                    .and_then(parse_segment_index)
                else {
                    continue;
                };
                let length = file.metadata().await?.len();
                segments.push((StorageKey::new(asset.clone(), index, segment), length));
            }
        }
        segments.sort();
        Ok(segments)
    }

    fn location_hint(&self) -> Option<String> {
        Some(self.root.display().to_string())
    }
}

fn parse_segment_index(s: &str) -> Option<SegmentIndex> {
    match s {
        "init" => Some(SegmentIndex::Init),
        n => match n.strip_prefix("init-") {
            Some(section) => section.parse().ok().map(SegmentIndex::Section),
            None => n.parse().ok().map(SegmentIndex::Media),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_layout_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        let asset = AssetId::new("movie").unwrap();

        let init = StorageKey::new(asset.clone(), 0, SegmentIndex::Init);
        let section = StorageKey::new(asset.clone(), 0, SegmentIndex::Section(1));
        let media = StorageKey::new(asset.clone(), 1, SegmentIndex::Media(12));
        backend.write(&init, Bytes::from_static(b"init")).await.unwrap();
        backend.write(&section, Bytes::from_static(b"init 1")).await.unwrap();
        backend.write(&media, Bytes::from_static(b"media!")).await.unwrap();
        backend
            .write_metadata(&asset, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        backend
            .write_licenses(&asset, Bytes::from_static(b"[]"))
            .await
            .unwrap();

        assert!(dir.path().join("movie/0/init.seg").is_file());
        assert!(dir.path().join("movie/licenses.json").is_file());
        assert!(dir.path().join("movie/0/init-1.seg").is_file());
        assert!(dir.path().join("movie/1/12.seg").is_file());
        assert_eq!(backend.list_assets().await.unwrap(), vec![asset.clone()]);
        assert_eq!(
            backend.list_segments(&asset).await.unwrap(),
            vec![(init.clone(), 4), (section, 6), (media.clone(), 6)]
        );

        backend.remove_asset(&asset).await.unwrap();
        assert!(!dir.path().join("movie").exists());
        assert_eq!(backend.read(&media).await.unwrap(), None);
        assert_eq!(backend.read_licenses(&asset).await.unwrap(), None);
        assert!(backend.list_assets().await.unwrap().is_empty());
        assert!(!dir.path().join(TRASH_DIR).exists());
    }
}
