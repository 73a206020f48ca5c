pub mod file;
pub mod memory;

use std::{collections::HashMap, future::Future, path::PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{KuraError, KuraResult},
    model::{Asset, AssetId, SegmentIndex, StorageKey},
};

pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Raw persistence of segment bytes and asset records.
pub trait StoreBackend: Send + Sync + 'static {
    /// Stores `data` under `key`, replacing what was there.
    fn write(&self, key: &StorageKey, data: Bytes) -> impl Future<Output = KuraResult<()>> + Send;

    fn read(&self, key: &StorageKey) -> impl Future<Output = KuraResult<Option<Bytes>>> + Send;

    /// Removes every segment and the record of `asset` at once.
    fn remove_asset(&self, asset: &AssetId) -> impl Future<Output = KuraResult<()>> + Send;

    fn write_metadata(
        &self,
        asset: &AssetId,
        data: Bytes,
    ) -> impl Future<Output = KuraResult<()>> + Send;

    fn read_metadata(
        &self,
        asset: &AssetId,
    ) -> impl Future<Output = KuraResult<Option<Bytes>>> + Send;

    /// License records of `asset`, kept until the asset is removed.
    fn write_licenses(
        &self,
        asset: &AssetId,
        data: Bytes,
    ) -> impl Future<Output = KuraResult<()>> + Send;

    fn read_licenses(
        &self,
        asset: &AssetId,
    ) -> impl Future<Output = KuraResult<Option<Bytes>>> + Send;

    /// Assets that have a record.
    fn list_assets(&self) -> impl Future<Output = KuraResult<Vec<AssetId>>> + Send;

    /// Stored segments of `asset` with their lengths.
    fn list_segments(
        &self,
        asset: &AssetId,
    ) -> impl Future<Output = KuraResult<Vec<(StorageKey, u64)>>> + Send;

    fn location_hint(&self) -> Option<String> {
        None
    }
}

pub enum Backend {
    Memory(MemoryBackend),
    File(FileBackend),
}

impl Backend {
    pub fn memory() -> Self {
        Self::Memory(MemoryBackend::new())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(FileBackend::new(path.into()))
    }
}

impl StoreBackend for Backend {
    async fn write(&self, key: &StorageKey, data: Bytes) -> KuraResult<()> {
        match self {
            Backend::Memory(backend) => backend.write(key, data).await,
            Backend::File(backend) => backend.write(key, data).await,
        }
    }

    async fn read(&self, key: &StorageKey) -> KuraResult<Option<Bytes>> {
        match self {
            Backend::Memory(backend) => backend.read(key).await,
            Backend::File(backend) => backend.read(key).await,
        }
    }

    async fn remove_asset(&self, asset: &AssetId) -> KuraResult<()> {
        match self {
            Backend::Memory(backend) => backend.remove_asset(asset).await,
            Backend::File(backend) => backend.remove_asset(asset).await,
        }
    }

    async fn write_metadata(&self, asset: &AssetId, data: Bytes) -> KuraResult<()> {
        match self {
            Backend::Memory(backend) => backend.write_metadata(asset, data).await,
            Backend::File(backend) => backend.write_metadata(asset, data).await,
        }
    }

    async fn read_metadata(&self, asset: &AssetId) -> KuraResult<Option<Bytes>> {
        match self {
            Backend::Memory(backend) => backend.read_metadata(asset).await,
            Backend::File(backend) => backend.read_metadata(asset).await,
        }
    }

    async fn write_licenses(&self, asset: &AssetId, data: Bytes) -> KuraResult<()> {
        match self {
            Backend::Memory(backend) => backend.write_licenses(asset, data).await,
            Backend::File(backend) => backend.write_licenses(asset, data).await,
        }
    }

    async fn read_licenses(&self, asset: &AssetId) -> KuraResult<Option<Bytes>> {
        match self {
            Backend::Memory(backend) => backend.read_licenses(asset).await,
            Backend::File(backend) => backend.read_licenses(asset).await,
        }
    }

    async fn list_assets(&self) -> KuraResult<Vec<AssetId>> {
        match self {
            Backend::Memory(backend) => backend.list_assets().await,
            Backend::File(backend) => backend.list_assets().await,
        }
    }

    async fn list_segments(&self, asset: &AssetId) -> KuraResult<Vec<(StorageKey, u64)>> {
        match self {
            Backend::Memory(backend) => backend.list_segments(asset).await,
            Backend::File(backend) => backend.list_segments(asset).await,
        }
    }

    fn location_hint(&self) -> Option<String> {
        match self {
            Backend::Memory(backend) => backend.location_hint(),
            Backend::File(backend) => backend.location_hint(),
        }
    }
}

/// Byte usage of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageReport {
    pub used: u64,
    pub ceiling: Option<u64>,
    /// Bytes per asset, largest first.
    pub assets: Vec<(AssetId, u64)>,
}

/// Chooses an asset to delete when the storage ceiling is reached.
pub trait EvictionHook: Send + Sync + 'static {
    /// `None` gives up, failing the write with `StorageFull`.
    fn choose(&self, report: &StorageReport, requesting: &AssetId, needed: u64)
        -> Option<AssetId>;
}

impl<F> EvictionHook for F
where
    F: Fn(&StorageReport, &AssetId, u64) -> Option<AssetId> + Send + Sync + 'static,
{
    fn choose(
        &self,
        report: &StorageReport,
        requesting: &AssetId,
        needed: u64,
    ) -> Option<AssetId> {
        self(report, requesting, needed)
    }
}

#[derive(Default)]
struct Ledger {
    segments: HashMap<AssetId, HashMap<(u32, SegmentIndex), u64>>,
    used: u64,
    /// Bytes of writes in progress, counted against the ceiling.
    reserved: u64,
}

impl Ledger {
    fn asset_usage(&self, asset: &AssetId) -> u64 {
        self.segments
            .get(asset)
            .map(|s| s.values().sum())
            .unwrap_or_default()
    }
}

/// Bytes counted against the ceiling while a write is running. Released on
/// drop, so an abandoned write gives its share back.
struct Reservation<'a> {
    ledger: &'a Mutex<Ledger>,
    bytes: u64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.ledger.lock().reserved -= self.bytes;
        }
    }
}

/// Segment bytes and asset records keyed by [`StorageKey`], with byte
/// accounting against an optional ceiling. Never evicts on its own.
pub struct SegmentStore {
    backend: Backend,
    ceiling: Option<u64>,
    ledger: Mutex<Ledger>,
}

impl SegmentStore {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            ceiling: None,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn memory() -> Self {
        Self::new(Backend::memory())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(Backend::file(path))
    }

    pub fn ceiling(mut self, ceiling: Option<u64>) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn location_hint(&self) -> Option<String> {
        self.backend.location_hint()
    }

    /// Stores a segment and returns its length. Storing the same key again
    /// replaces the bytes and the accounting.
    pub async fn put(&self, key: &StorageKey, data: Bytes) -> KuraResult<u64> {
        let length = data.len() as u64;
        let growth = {
            let mut ledger = self.ledger.lock();
            let previous = ledger
                .segments
                .get(&key.asset)
                .and_then(|s| s.get(&(key.rendition, key.index)))
                .copied()
                .unwrap_or_default();
            let growth = length.saturating_sub(previous);
            if let Some(ceiling) = self.ceiling {
                let used = ledger.used + ledger.reserved;
                if used + growth > ceiling {
                    return Err(KuraError::StorageFull {
                        used,
                        ceiling,
                        requested: growth,
                    });
                }
            }
            ledger.reserved += growth;
            growth
        };

        let mut reservation = Reservation {
            ledger: &self.ledger,
            bytes: growth,
        };
        self.backend
            .write(key, data)
            .await
            .map_err(into_storage)?;

        let mut ledger = self.ledger.lock();
        ledger.reserved -= std::mem::take(&mut reservation.bytes);
        let previous = ledger
            .segments
            .entry(key.asset.clone())
            .or_default()
            .insert((key.rendition, key.index), length)
            .unwrap_or_default();
        ledger.used = ledger.used + length - previous;
        Ok(length)
    }

    pub async fn get(&self, key: &StorageKey) -> KuraResult<Option<Bytes>> {
        self.backend.read(key).await.map_err(into_storage)
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.stored_len(key).is_some()
    }

    /// Recorded length of a stored segment.
    pub fn stored_len(&self, key: &StorageKey) -> Option<u64> {
        self.ledger
            .lock()
            .segments
            .get(&key.asset)
            .and_then(|s| s.get(&(key.rendition, key.index)))
            .copied()
    }

    /// Removes every segment and the record of `asset`, returning the bytes
    /// freed.
    pub async fn delete_asset(&self, asset: &AssetId) -> KuraResult<u64> {
        self.backend
            .remove_asset(asset)
            .await
            .map_err(into_storage)?;
        let mut ledger = self.ledger.lock();
        let freed = ledger
            .segments
            .remove(asset)
            .map(|s| s.values().sum())
            .unwrap_or_default();
        ledger.used -= freed;
        tracing::info!(%asset, freed, "Asset removed from store.");
        Ok(freed)
    }

    pub async fn write_metadata(&self, asset: &Asset) -> KuraResult<()> {
        let data = serde_json::to_vec_pretty(asset)?;
        self.backend
            .write_metadata(&asset.id, data.into())
            .await
            .map_err(into_storage)
    }

    pub async fn read_metadata(&self, asset: &AssetId) -> KuraResult<Option<Asset>> {
        let Some(data) = self
            .backend
            .read_metadata(asset)
            .await
            .map_err(into_storage)?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Saves the license records of `asset`. They are removed together with
    /// the asset.
    pub async fn write_licenses<T: Serialize>(
        &self,
        asset: &AssetId,
        records: &T,
    ) -> KuraResult<()> {
        let data = serde_json::to_vec_pretty(records)?;
        self.backend
            .write_licenses(asset, data.into())
            .await
            .map_err(into_storage)
    }

    pub async fn read_licenses<T: DeserializeOwned>(
        &self,
        asset: &AssetId,
    ) -> KuraResult<Option<T>> {
        let Some(data) = self
            .backend
            .read_licenses(asset)
            .await
            .map_err(into_storage)?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    pub async fn list_assets(&self) -> KuraResult<Vec<AssetId>> {
        self.backend.list_assets().await.map_err(into_storage)
    }

    /// Rebuilds the accounting of `asset` from what the backend holds and
    /// returns the stored segments.
    pub async fn scan(&self, asset: &AssetId) -> KuraResult<Vec<(StorageKey, u64)>> {
        let segments = self
            .backend
            .list_segments(asset)
            .await
            .map_err(into_storage)?;

        let mut ledger = self.ledger.lock();
        let previous = ledger.asset_usage(asset);
        let entries: HashMap<(u32, SegmentIndex), u64> = segments
            .iter()
            .map(|(key, length)| ((key.rendition, key.index), *length))
            .collect();
        let current: u64 = entries.values().sum();
        ledger.segments.insert(asset.clone(), entries);
        ledger.used = ledger.used - previous + current;
        Ok(segments)
    }

    pub fn usage(&self, asset: &AssetId) -> u64 {
        self.ledger.lock().asset_usage(asset)
    }

    pub fn used(&self) -> u64 {
        self.ledger.lock().used
    }

    pub fn report(&self) -> StorageReport {
        let ledger = self.ledger.lock();
        let mut assets: Vec<(AssetId, u64)> = ledger
            .segments
            .iter()
            .map(|(id, s)| (id.clone(), s.values().sum()))
            .collect();
        assets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        StorageReport {
            used: ledger.used,
            ceiling: self.ceiling,
            assets,
        }
    }
}

fn into_storage(e: KuraError) -> KuraError {
    if e.is_storage() {
        e
    } else {
        KuraError::storage(e)
    }
}
