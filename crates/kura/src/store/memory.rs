use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use parking_lot::Mutex;

use super::StoreBackend;
use crate::{
    error::KuraResult,
    model::{AssetId, SegmentIndex, StorageKey},
};

#[derive(Default)]
struct MemoryAsset {
    segments: BTreeMap<(u32, SegmentIndex), Bytes>,
    metadata: Option<Bytes>,
    licenses: Option<Bytes>,
}

/// Keeps everything in process memory. Deleting an asset drops all of it
/// under one lock.
#[derive(Default)]
pub struct MemoryBackend {
    assets: Mutex<HashMap<AssetId, MemoryAsset>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    async fn write(&self, key: &StorageKey, data: Bytes) -> KuraResult<()> {
        self.assets
            .lock()
            .entry(key.asset.clone())
            .or_default()
            .segments
            .insert((key.rendition, key.index), data);
        Ok(())
    }

    async fn read(&self, key: &StorageKey) -> KuraResult<Option<Bytes>> {
        Ok(self
            .assets
            .lock()
            .get(&key.asset)
            .and_then(|a| a.segments.get(&(key.rendition, key.index)))
            .cloned())
    }

    async fn remove_asset(&self, asset: &AssetId) -> KuraResult<()> {
        self.assets.lock().remove(asset);
        Ok(())
    }

    async fn write_metadata(&self, asset: &AssetId, data: Bytes) -> KuraResult<()> {
        self.assets.lock().entry(asset.clone()).or_default().metadata = Some(data);
        Ok(())
    }

    async fn read_metadata(&self, asset: &AssetId) -> KuraResult<Option<Bytes>> {
        Ok(self
            .assets
            .lock()
            .get(asset)
            .and_then(|a| a.metadata.clone()))
    }

    async fn write_licenses(&self, asset: &AssetId, data: Bytes) -> KuraResult<()> {
        self.assets.lock().entry(asset.clone()).or_default().licenses = Some(data);
        Ok(())
    }

    async fn read_licenses(&self, asset: &AssetId) -> KuraResult<Option<Bytes>> {
        Ok(self
            .assets
            .lock()
            .get(asset)
            .and_then(|a| a.licenses.clone()))
    }

    async fn list_assets(&self) -> KuraResult<Vec<AssetId>> {
        let mut assets: Vec<AssetId> = self
            .assets
            .lock()
            .iter()
            .filter(|(_, a)| a.metadata.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        assets.sort();
        Ok(assets)
    }

    async fn list_segments(&self, asset: &AssetId) -> KuraResult<Vec<(StorageKey, u64)>> {
        Ok(self
            .assets
            .lock()
            .get(asset)
            .map(|a| {
                a.segments
                    .iter()
                    .map(|((rendition, index), data)| {
                        (
                            StorageKey::new(asset.clone(), *rendition, *index),
                            data.len() as u64,
                        )
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
