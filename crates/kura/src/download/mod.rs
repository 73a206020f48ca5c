use std::{num::NonZeroU32, sync::Arc, time::Duration};

use url::Url;

use crate::{
    error::KuraResult,
    event::EventSink,
    license::{AnchoredClock, KeyManager, KeyUriClient},
    manifest::CodecRegistry,
    model::{Asset, AssetId, AssetState, StreamFormat},
    select::{BestQuality, RenditionSelector},
    store::{EvictionHook, SegmentStore},
    util::{
        http::HttpClient,
        transport::{HttpTransport, Transport},
    },
};

mod engine;
pub(crate) mod queue;
pub mod throttle;

use engine::{EngineOptions, Inner};
pub use throttle::{BandwidthLimit, Throttle};

/// An asset to download.
#[derive(Clone)]
pub struct DownloadRequest {
    pub url: Url,
    pub id: Option<AssetId>,
    /// Manifest format, detected from the response when absent.
    pub format: Option<StreamFormat>,
    /// Lower values are downloaded first.
    pub priority: i32,
    pub description: Option<String>,
    /// Overrides the engine's selector for this asset.
    pub selector: Option<Arc<dyn RenditionSelector>>,
}

impl DownloadRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            id: None,
            format: None,
            priority: 0,
            description: None,
            selector: None,
        }
    }

    pub fn id(mut self, id: AssetId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn format(mut self, format: StreamFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn selector(mut self, selector: impl RenditionSelector + 'static) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }
}

/// Downloads assets into a [`SegmentStore`] with a fixed pool of workers.
///
/// Cloning is cheap; all clones drive the same engine. Call
/// [`shutdown`](Self::shutdown) before dropping the last clone, otherwise
/// the workers keep running.
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<Inner>,
}

impl DownloadEngine {
    pub fn builder() -> DownloadEngineBuilder {
        DownloadEngineBuilder::new()
    }

    /// Parses the manifest, selects renditions and queues the asset.
    ///
    /// An id that belongs to a failed or cancelled asset is taken over, and
    /// segments it already stored are reused.
    pub async fn enqueue(&self, request: DownloadRequest) -> KuraResult<AssetId> {
        self.inner.enqueue(request).await
    }

    pub async fn pause(&self, asset: &AssetId) -> KuraResult<()> {
        self.inner.pause(asset).await
    }

    pub async fn resume(&self, asset: &AssetId) -> KuraResult<()> {
        self.inner.resume(asset).await
    }

    pub async fn cancel(&self, asset: &AssetId) -> KuraResult<()> {
        self.inner.cancel(asset).await
    }

    /// Stops the asset's transfers, then removes its segments, record and
    /// licenses.
    pub async fn delete(&self, asset: &AssetId) -> KuraResult<()> {
        self.inner.delete(asset).await
    }

    pub fn asset(&self, asset: &AssetId) -> Option<Asset> {
        self.inner.asset(asset)
    }

    /// All known assets in enqueue order.
    pub fn assets(&self) -> Vec<Asset> {
        self.inner.assets_where(|_| true)
    }

    pub fn completed_assets(&self) -> Vec<Asset> {
        self.inner
            .assets_where(|a| a.state == AssetState::Completed)
    }

    /// Assets that still have work to do, paused ones included.
    pub fn pending_assets(&self) -> Vec<Asset> {
        self.inner.assets_where(|a| !a.state.is_terminal())
    }

    pub fn is_playable(&self, asset: &AssetId) -> bool {
        self.inner
            .asset(asset)
            .is_some_and(|a| a.state == AssetState::Completed && a.is_complete())
    }

    /// Waits until the asset leaves the queued and downloading states.
    pub async fn wait(&self, asset: &AssetId) -> KuraResult<AssetState> {
        self.inner.wait(asset).await
    }

    /// Changes the per-worker bandwidth limit, effective from the next
    /// transfer on.
    pub fn set_bandwidth_limit(&self, bytes_per_second: Option<u64>) {
        self.inner.bandwidth().set(bytes_per_second);
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        self.inner.bandwidth().get()
    }

    pub fn store(&self) -> &Arc<SegmentStore> {
        self.inner.store()
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        self.inner.keys()
    }

    pub fn registry(&self) -> &CodecRegistry {
        self.inner.registry()
    }

    /// Abandons in-flight transfers, waits for the workers and persists every
    /// asset record.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

pub struct DownloadEngineBuilder {
    workers: NonZeroU32,
    per_asset: NonZeroU32,
    retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    attempt_timeout: Option<Duration>,
    persist_interval: usize,
    bandwidth_limit: Option<u64>,

    transport: Option<Arc<dyn Transport>>,
    registry: Option<CodecRegistry>,
    store: Option<Arc<SegmentStore>>,
    keys: Option<Arc<KeyManager>>,
    sinks: Vec<Arc<dyn EventSink>>,
    eviction: Option<Arc<dyn EvictionHook>>,
    selector: Option<Arc<dyn RenditionSelector>>,
}

impl DownloadEngineBuilder {
    pub fn new() -> Self {
        Self {
            workers: NonZeroU32::new(5).unwrap(),
            per_asset: NonZeroU32::new(3).unwrap(),
            retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            attempt_timeout: Some(Duration::from_secs(60)),
            persist_interval: 16,
            bandwidth_limit: None,

            transport: None,
            registry: None,
            store: None,
            keys: None,
            sinks: Vec::new(),
            eviction: None,
            selector: None,
        }
    }

    /// Size of the worker pool shared by all assets.
    pub fn workers(mut self, workers: NonZeroU32) -> Self {
        self.workers = workers;
        self
    }

    /// Transfers a single asset may have in flight at once.
    pub fn per_asset_concurrency(mut self, per_asset: NonZeroU32) -> Self {
        self.per_asset = per_asset;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Delay before the first retry, doubled on each further one up to `max`.
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn persist_interval(mut self, segments: usize) -> Self {
        self.persist_interval = segments.max(1);
        self
    }

    pub fn bandwidth_limit(mut self, bytes_per_second: Option<u64>) -> Self {
        self.bandwidth_limit = bytes_per_second;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn registry(mut self, registry: CodecRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<SegmentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn keys(mut self, keys: Arc<KeyManager>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn sink(mut self, sink: impl EventSink) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn eviction(mut self, hook: impl EvictionHook) -> Self {
        self.eviction = Some(Arc::new(hook));
        self
    }

    pub fn selector(mut self, selector: impl RenditionSelector + 'static) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    /// Starts the workers after loading the asset records found in the
    /// store. Interrupted downloads are queued again.
    pub async fn build(self) -> KuraResult<DownloadEngine> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(HttpClient::new(reqwest::Client::builder())?)),
        };
        let keys = self.keys.unwrap_or_else(|| {
            Arc::new(KeyManager::new(
                Arc::new(KeyUriClient::new(transport.clone())),
                Arc::new(AnchoredClock::system()),
            ))
        });
        let options = EngineOptions {
            workers: self.workers.get() as usize,
            per_asset: self.per_asset.get() as usize,
            retries: self.retries,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
            attempt_timeout: self.attempt_timeout,
            persist_interval: self.persist_interval,
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(SegmentStore::memory()));
        keys.attach(store.clone());

        let inner = Arc::new(Inner::new(
            options,
            transport,
            self.registry.unwrap_or_default(),
            store,
            keys,
            self.sinks,
            self.eviction,
            self.selector.unwrap_or_else(|| Arc::new(BestQuality)),
            BandwidthLimit::new(self.bandwidth_limit),
        ));
        inner.recover().await?;
        inner.spawn_workers();
        Ok(DownloadEngine { inner })
    }
}

impl Default for DownloadEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
