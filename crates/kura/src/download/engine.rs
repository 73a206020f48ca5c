use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    queue::{Job, JobQueue},
    throttle::{BandwidthLimit, Throttle},
    DownloadRequest,
};
use crate::{
    error::{KuraError, KuraResult},
    event::{DownloadEvent, EventKind, EventSink},
    license::KeyManager,
    manifest::{CodecRegistry, ManifestLoader},
    model::{
        Asset, AssetId, AssetState, EncryptionContext, SegmentIndex, StorageKey, TransferState,
    },
    select::{apply_selection, RenditionSelector},
    store::{EvictionHook, SegmentStore},
    util::{
        range::ByteRange,
        transport::{FetchRequest, Transport},
    },
};

#[derive(Debug, Clone)]
pub(crate) struct EngineOptions {
    pub workers: usize,
    pub per_asset: usize,
    pub retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub attempt_timeout: Option<Duration>,
    /// Stored segments between two snapshots of an asset record.
    pub persist_interval: usize,
}

struct Entry {
    asset: Asset,
    cancel: CancellationToken,
    stored_since_persist: usize,
}

#[derive(Default)]
struct Scheduler {
    assets: HashMap<AssetId, Entry>,
    queue: JobQueue,
    next_sequence: u64,
    closed: bool,
}

/// Events waiting to be handed to the sinks.
#[derive(Default)]
struct Outbox {
    events: VecDeque<DownloadEvent>,
    /// Some caller is delivering; it also takes whatever is queued meanwhile.
    draining: bool,
}

/// A job with everything a worker needs to run it without the lock.
struct Task {
    job: Job,
    url: Url,
    range: Option<ByteRange>,
    encryption: Option<EncryptionContext>,
    cancel: CancellationToken,
}

enum Outcome {
    Stored(u64),
    Abandoned,
    Failed(KuraError),
    StorageFailed(KuraError),
}

pub(crate) struct Inner {
    options: EngineOptions,
    transport: Arc<dyn Transport>,
    loader: ManifestLoader,
    store: Arc<SegmentStore>,
    keys: Arc<KeyManager>,
    sinks: Vec<Arc<dyn EventSink>>,
    eviction: Option<Arc<dyn EvictionHook>>,
    selector: Arc<dyn RenditionSelector>,
    bandwidth: BandwidthLimit,

    scheduler: Mutex<Scheduler>,
    outbox: Mutex<Outbox>,
    /// New jobs are available.
    wake: Notify,
    /// A job finished or an asset changed state.
    changed: Notify,
    /// Serializes record snapshots, so the newest one is written last.
    persist_lock: tokio::sync::Mutex<()>,
    delete_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[allow(clippy::too_many_arguments)]
impl Inner {
    pub(crate) fn new(
        options: EngineOptions,
        transport: Arc<dyn Transport>,
        registry: CodecRegistry,
        store: Arc<SegmentStore>,
        keys: Arc<KeyManager>,
        sinks: Vec<Arc<dyn EventSink>>,
        eviction: Option<Arc<dyn EvictionHook>>,
        selector: Arc<dyn RenditionSelector>,
        bandwidth: BandwidthLimit,
    ) -> Self {
        let loader = ManifestLoader::new(transport.clone(), registry).retries(options.retries);
        Self {
            options,
            transport,
            loader,
            store,
            keys,
            sinks,
            eviction,
            selector,
            bandwidth,
            scheduler: Mutex::new(Scheduler::default()),
            outbox: Mutex::new(Outbox::default()),
            wake: Notify::new(),
            changed: Notify::new(),
            persist_lock: tokio::sync::Mutex::new(()),
            delete_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    pub(crate) fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub(crate) fn registry(&self) -> &CodecRegistry {
        self.loader.registry()
    }

    pub(crate) fn bandwidth(&self) -> &BandwidthLimit {
        &self.bandwidth
    }

    /// Queues an event. Usually called with the scheduler locked, so the
    /// sinks only see it on the next `dispatch`.
    fn emit(&self, asset: &AssetId, kind: EventKind) {
        let event = DownloadEvent::new(asset.clone(), kind);
        self.outbox.lock().events.push_back(event);
        self.changed.notify_waiters();
    }

    /// Hands queued events to the sinks in emission order. Must not be called
    /// with the scheduler locked; sinks are free to call back into the engine.
    fn dispatch(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        loop {
            let event = {
                let mut outbox = self.outbox.lock();
                let event = outbox.events.pop_front();
                if event.is_none() {
                    outbox.draining = false;
                }
                event
            };
            let Some(event) = event else {
                break;
            };
            for sink in &self.sinks {
                sink.emit(&event);
            }
        }
    }

    pub(crate) fn spawn_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        for worker in 0..self.options.workers {
            let inner = self.clone();
            workers.push(tokio::spawn(async move { inner.worker_loop(worker).await }));
        }
        tracing::info!(
            workers = self.options.workers,
            per_asset = self.options.per_asset,
            "Download workers started."
        );
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        let throttle = Throttle::new(self.bandwidth.clone());
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shutdown.is_cancelled() {
                break;
            }
            match self.next_task() {
                Some(task) => self.run(task, &throttle).await,
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        tracing::debug!(worker, "Download worker stopped.");
    }

    fn next_task(&self) -> Option<Task> {
        let mut scheduler = self.scheduler.lock();
        let scheduler = &mut *scheduler;
        loop {
            let job = scheduler.queue.pop(self.options.per_asset)?;
            let Some(entry) = scheduler.assets.get_mut(&job.asset) else {
                scheduler.queue.finish(&job);
                continue;
            };
            if entry.asset.state == AssetState::Queued {
                if let Err(e) = entry.asset.transition(AssetState::Downloading) {
                    tracing::warn!("{e}");
                }
                tracing::info!(asset = %job.asset, "Start downloading.");
            }
            if entry.asset.state != AssetState::Downloading {
                scheduler.queue.finish(&job);
                continue;
            }

            let Some(rendition) = entry.asset.rendition(job.rendition) else {
                scheduler.queue.finish(&job);
                continue;
            };
            let Some(segment) = rendition.segment(job.index) else {
                scheduler.queue.finish(&job);
                continue;
            };
            if segment.is_stored() {
                scheduler.queue.finish(&job);
                continue;
            }
            let task = Task {
                url: segment.url.clone(),
                range: segment.byte_range,
                encryption: rendition.encryption_for(segment).cloned(),
                cancel: entry.cancel.clone(),
                job,
            };
            if let Some(segment) = entry.asset.segment_mut(task.job.rendition, task.job.index) {
                segment.state = TransferState::InFlight;
            }
            return Some(task);
        }
    }

    async fn run(&self, task: Task, throttle: &Throttle) {
        let outcome = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => Outcome::Abandoned,
            outcome = self.transfer(&task, throttle) => outcome,
        };
        self.settle(task, outcome).await;
    }

    async fn transfer(&self, task: &Task, throttle: &Throttle) -> Outcome {
        let asset = &task.job.asset;
        if let Some(ctx) = &task.encryption {
            match self.keys.acquire_key(asset, ctx).await {
                Ok(_) => {}
                // an unusable license blocks serving, never downloading
                Err(e @ KuraError::LicenseExpired(_)) => {
                    tracing::warn!(%asset, "Downloading without a valid license: {e}")
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(%asset, "License exchange failed, trying again when served: {e}")
                }
                Err(e) => return Outcome::Failed(e),
            }
        }

        let data = match self.fetch(task, throttle).await {
            Ok(data) => data,
            Err(e) => return Outcome::Failed(e),
        };

        let key = StorageKey::new(asset.clone(), task.job.rendition, task.job.index);
        match self.put(&key, data).await {
            Ok(length) => Outcome::Stored(length),
            Err(e) => Outcome::StorageFailed(e),
        }
    }

    /// Fetches one segment, retrying transient failures and resuming
    /// interrupted bodies with range requests.
    async fn fetch(&self, task: &Task, throttle: &Throttle) -> KuraResult<Bytes> {
        let mut attempt = 0;
        let mut received = BytesMut::new();
        throttle.reset();
        loop {
            let resumed = !received.is_empty();
            let range = if resumed {
                Some(
                    task.range
                        .unwrap_or(ByteRange::new(0, None))
                        .skip(received.len() as u64),
                )
            } else {
                task.range
            };

            let request = FetchRequest::get(task.url.clone())
                .range(range)
                .throttle(throttle.clone());
            let result = match self.options.attempt_timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.transport.fetch(request))
                    .await
                    .unwrap_or(Err(KuraError::Timeout)),
                None => self.transport.fetch(request).await,
            };

            let error = match result {
                Ok(response) => {
                    let body = if resumed && response.partial {
                        received.extend_from_slice(&response.body);
                        received.freeze()
                    } else {
                        response.body
                    };
                    let body = match task.range {
                        // the server ignored the range and sent the whole resource
                        Some(range) if !response.partial => slice_range(body, range),
                        _ => body,
                    };
                    throttle.settle(body.len() as u64).await;
                    return Ok(body);
                }
                Err(KuraError::Interrupted {
                    received: part,
                    partial,
                    reason,
                }) => {
                    if resumed && partial {
                        received.extend_from_slice(&part);
                    } else if !resumed && (partial || task.range.is_none()) {
                        received = BytesMut::from(&part[..]);
                    } else {
                        received.clear();
                    }
                    KuraError::Interrupted {
                        received: Bytes::new(),
                        partial,
                        reason,
                    }
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= self.options.retries {
                tracing::error!(
                    asset = %task.job.asset,
                    url = %task.url,
                    "Processing segment {}/{} failed, max retries exceed. {error}",
                    task.job.rendition,
                    task.job.index
                );
                return Err(error);
            }

            attempt += 1;
            let delay = self.backoff(attempt);
            tracing::warn!(
                asset = %task.job.asset,
                url = %task.url,
                attempt,
                resume_from = received.len(),
                "Processing segment {}/{} failed, retry in {delay:?}. {error}",
                task.job.rendition,
                task.job.index
            );
            self.set_segment_state(&task.job, TransferState::Pending, true);
            tokio::time::sleep(delay).await;
            self.set_segment_state(&task.job, TransferState::InFlight, false);
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.options.backoff_base.as_millis() as u64;
        let exponential = base.saturating_mul(1 << (attempt - 1).min(16));
        let capped = exponential.min(self.options.backoff_max.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }

    fn set_segment_state(&self, job: &Job, state: TransferState, retry: bool) {
        let mut scheduler = self.scheduler.lock();
        if let Some(entry) = scheduler.assets.get_mut(&job.asset) {
            if retry {
                entry.asset.retry_count += 1;
            }
            if let Some(segment) = entry.asset.segment_mut(job.rendition, job.index) {
                segment.state = state;
            }
        }
    }

    /// Stores a segment. When the ceiling is reached the eviction hook may
    /// name an asset to delete, after which the write is tried once more.
    async fn put(&self, key: &StorageKey, data: Bytes) -> KuraResult<u64> {
        let error = match self.store.put(key, data.clone()).await {
            Err(e @ KuraError::StorageFull { .. }) => e,
            result => return result,
        };
        let Some(hook) = &self.eviction else {
            return Err(error);
        };

        let report = self.store.report();
        let Some(victim) = hook.choose(&report, &key.asset, data.len() as u64) else {
            return Err(error);
        };
        if victim == key.asset {
            return Err(error);
        }

        tracing::info!(asset = %key.asset, %victim, "Storage ceiling reached, evicting.");
        match self.delete(&victim).await {
            // evicted by a concurrent transfer
            Ok(_) | Err(KuraError::UnknownAsset(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.put(key, data).await
    }

    async fn settle(&self, task: Task, outcome: Outcome) {
        let job = task.job;
        let mut persist = false;
        {
            let mut scheduler = self.scheduler.lock();
            let scheduler = &mut *scheduler;
            scheduler.queue.finish(&job);

            let Some(entry) = scheduler.assets.get_mut(&job.asset) else {
                self.changed.notify_waiters();
                return;
            };
            let asset = &mut entry.asset;
            match outcome {
                Outcome::Stored(length) => {
                    if let Some(segment) = asset.segment_mut(job.rendition, job.index) {
                        segment.state = TransferState::Stored;
                        segment.stored_bytes = Some(length);
                    }
                    entry.stored_since_persist += 1;
                    tracing::info!(
                        asset = %job.asset,
                        "Processing segment {}/{} finished. ({} / {})",
                        job.rendition,
                        job.index,
                        asset.stored_count(),
                        asset.segment_count()
                    );
                    let progress = progress(asset);
                    self.emit(&job.asset, progress);

                    if entry.asset.state == AssetState::Downloading
                        && scheduler.queue.pending(&job.asset) == 0
                        && scheduler.queue.in_flight(&job.asset) == 0
                        && entry.asset.is_complete()
                    {
                        self.complete(entry);
                        persist = true;
                    } else if entry.stored_since_persist >= self.options.persist_interval {
                        persist = true;
                    }
                }
                Outcome::Abandoned => {
                    if let Some(segment) = asset.segment_mut(job.rendition, job.index) {
                        if !segment.is_stored() {
                            segment.state = TransferState::Pending;
                        }
                    }
                }
                Outcome::Failed(e) => {
                    if let Some(segment) = asset.segment_mut(job.rendition, job.index) {
                        segment.state = TransferState::Failed;
                    }
                    if asset.state == AssetState::Downloading {
                        if let Err(e) = asset.transition(AssetState::Failed) {
                            tracing::warn!("{e}");
                        }
                        asset.failure = Some(e.to_string());
                        entry.cancel.cancel();
                        scheduler.queue.suspend(&job.asset);
                        tracing::error!(asset = %job.asset, "Download failed: {e}");
                        self.emit(
                            &job.asset,
                            EventKind::Failed {
                                reason: e.to_string(),
                            },
                        );
                        persist = true;
                    }
                }
                Outcome::StorageFailed(e) => {
                    if let Some(segment) = asset.segment_mut(job.rendition, job.index) {
                        segment.state = TransferState::Pending;
                    }
                    tracing::error!(asset = %job.asset, "Failed to store segment: {e}");
                    self.emit(
                        &job.asset,
                        EventKind::StorageError {
                            reason: e.to_string(),
                        },
                    );
                    if asset.state == AssetState::Downloading {
                        if let Err(e) = asset.transition(AssetState::Paused) {
                            tracing::warn!("{e}");
                        }
                        scheduler.queue.suspend(&job.asset);
                        self.emit(&job.asset, EventKind::Paused);
                    }
                    persist = true;
                }
            }
        }

        self.dispatch();
        self.wake.notify_waiters();
        self.changed.notify_waiters();
        if persist {
            self.persist(&job.asset).await;
        }
    }

    fn complete(&self, entry: &mut Entry) {
        if entry.asset.state == AssetState::Queued {
            _ = entry.asset.transition(AssetState::Downloading);
        }
        match entry.asset.transition(AssetState::Completed) {
            Ok(_) => {
                tracing::info!(
                    asset = %entry.asset.id,
                    bytes = entry.asset.bytes_stored(),
                    "Download completed."
                );
                let id = entry.asset.id.clone();
                self.emit(&id, EventKind::Completed);
            }
            Err(e) => tracing::warn!("{e}"),
        }
    }

    /// Queues what is left of an asset, or completes it if nothing is.
    fn schedule(&self, scheduler: &mut Scheduler, id: &AssetId) {
        let Some(entry) = scheduler.assets.get_mut(id) else {
            return;
        };
        let pending: Vec<(u32, SegmentIndex)> = entry
            .asset
            .pending_segments()
            .into_iter()
            .filter(|(rendition, index)| {
                entry
                    .asset
                    .segment(*rendition, *index)
                    .is_some_and(|s| s.state != TransferState::InFlight)
            })
            .collect();

        if pending.is_empty()
            && scheduler.queue.in_flight(id) == 0
            && entry.asset.is_complete()
        {
            self.complete(entry);
            return;
        }
        scheduler
            .queue
            .schedule(id, entry.asset.priority, entry.asset.sequence, pending);
        self.wake.notify_waiters();
    }

    async fn persist(&self, id: &AssetId) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let mut scheduler = self.scheduler.lock();
            match scheduler.assets.get_mut(id) {
                Some(entry) => {
                    entry.stored_since_persist = 0;
                    entry.asset.clone()
                }
                None => return,
            }
        };
        if let Err(e) = self.store.write_metadata(&snapshot).await {
            tracing::error!(asset = %id, "Failed to persist asset record: {e}");
        }
    }

    /// Loads the records found in the store, reconciling segment states with
    /// the stored blobs.
    pub(crate) async fn recover(&self) -> KuraResult<()> {
        let mut recovered = Vec::new();
        for id in self.store.list_assets().await? {
            let asset = match self.store.read_metadata(&id).await {
                Ok(Some(asset)) => asset,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(asset = %id, "Skipping unreadable asset record: {e}");
                    continue;
                }
            };
            let stored = self.store.scan(&id).await?;
            if let Err(e) = self.keys.restore(&id).await {
                tracing::warn!(asset = %id, "Failed to restore license records: {e}");
            }
            let mut asset: Asset = asset;
            reconcile(&mut asset, &stored);
            match asset.state {
                AssetState::Downloading => asset.state = AssetState::Queued,
                AssetState::Completed if !asset.is_complete() => {
                    tracing::warn!(asset = %id, "Stored segments are missing.");
                    asset.state = AssetState::Failed;
                    asset.failure = Some("stored segments are missing".to_string());
                }
                _ => {}
            }
            recovered.push(asset);
        }
        recovered.sort_by_key(|a| a.sequence);

        {
            let mut scheduler = self.scheduler.lock();
            let scheduler = &mut *scheduler;
            for asset in recovered {
                self.admit(scheduler, asset);
            }
        }
        self.dispatch();
        Ok(())
    }

    /// Registers a recovered record, queueing it again if it was downloading.
    fn admit(&self, scheduler: &mut Scheduler, mut asset: Asset) {
        asset.sequence = scheduler.next_sequence;
        scheduler.next_sequence += 1;
        let id = asset.id.clone();
        let state = asset.state;
        tracing::info!(asset = %id, %state, stored = asset.stored_count(), "Asset recovered.");
        scheduler.assets.insert(
            id.clone(),
            Entry {
                asset,
                cancel: self.shutdown.child_token(),
                stored_since_persist: 0,
            },
        );
        if state == AssetState::Queued {
            self.schedule(scheduler, &id);
        }
    }

    pub(crate) async fn enqueue(&self, request: DownloadRequest) -> KuraResult<AssetId> {
        if self.shutdown.is_cancelled() {
            return Err(KuraError::Shutdown);
        }
        let id = request.id.clone().unwrap_or_else(AssetId::generate);
        self.check_replaceable(&id)?;

        let loaded = self.loader.load(&request.url, request.format).await?;
        let mut renditions = loaded.manifest.renditions;
        let selector = request.selector.as_ref().unwrap_or(&self.selector);
        apply_selection(selector.as_ref(), &mut renditions)?;
        self.loader
            .resolve_children(loaded.format, &mut renditions)
            .await?;

        let duration = loaded.manifest.duration.or_else(|| {
            renditions
                .iter()
                .filter(|r| r.selected)
                .map(|r| r.duration())
                .reduce(f64::max)
                .filter(|d| *d > 0.)
        });
        let now = Utc::now();
        let mut asset = Asset {
            id: id.clone(),
            url: loaded.url,
            format: loaded.format,
            state: AssetState::Queued,
            created_at: now,
            updated_at: now,
            priority: request.priority,
            sequence: 0,
            description: request.description,
            duration,
            renditions,
            retry_count: 0,
            failure: None,
            attributes: loaded.manifest.attributes,
        };

        // segments left by an earlier attempt under the same id are reused
        let stored = self.store.scan(&id).await?;
        reconcile(&mut asset, &stored);

        {
            let mut scheduler = self.scheduler.lock();
            let scheduler = &mut *scheduler;
            if scheduler.closed {
                return Err(KuraError::Shutdown);
            }
            if let Some(existing) = scheduler.assets.get(&id) {
                if !matches!(
                    existing.asset.state,
                    AssetState::Failed | AssetState::Cancelled
                ) {
                    return Err(KuraError::AssetExists(id));
                }
            }
            asset.sequence = scheduler.next_sequence;
            scheduler.next_sequence += 1;
            tracing::info!(
                asset = %id,
                format = %asset.format,
                segments = asset.segment_count(),
                stored = asset.stored_count(),
                "Asset queued."
            );
            scheduler.assets.insert(
                id.clone(),
                Entry {
                    asset,
                    cancel: self.shutdown.child_token(),
                    stored_since_persist: 0,
                },
            );
            self.emit(&id, EventKind::Queued);
            self.schedule(scheduler, &id);
        }
        self.dispatch();

        self.persist(&id).await;
        Ok(id)
    }

    fn check_replaceable(&self, id: &AssetId) -> KuraResult<()> {
        let scheduler = self.scheduler.lock();
        if scheduler.closed {
            return Err(KuraError::Shutdown);
        }
        match scheduler.assets.get(id) {
            Some(entry)
                if !matches!(
                    entry.asset.state,
                    AssetState::Failed | AssetState::Cancelled
                ) =>
            {
                Err(KuraError::AssetExists(id.clone()))
            }
            _ => Ok(()),
        }
    }

    pub(crate) async fn pause(&self, id: &AssetId) -> KuraResult<()> {
        {
            let mut scheduler = self.scheduler.lock();
            let scheduler = &mut *scheduler;
            let entry = scheduler
                .assets
                .get_mut(id)
                .ok_or_else(|| KuraError::UnknownAsset(id.clone()))?;
            entry.asset.transition(AssetState::Paused)?;
            scheduler.queue.suspend(id);
            tracing::info!(asset = %id, "Download paused.");
            self.emit(id, EventKind::Paused);
        }
        self.dispatch();
        self.persist(id).await;
        Ok(())
    }

    pub(crate) async fn resume(&self, id: &AssetId) -> KuraResult<()> {
        {
            let mut scheduler = self.scheduler.lock();
            let scheduler = &mut *scheduler;
            let entry = scheduler
                .assets
                .get_mut(id)
                .ok_or_else(|| KuraError::UnknownAsset(id.clone()))?;
            if entry.asset.state != AssetState::Paused {
                return Err(KuraError::InvalidTransition {
                    asset: id.clone(),
                    from: entry.asset.state,
                    to: AssetState::Downloading,
                });
            }
            entry.asset.transition(AssetState::Downloading)?;
            tracing::info!(asset = %id, "Download resumed.");
            self.emit(id, EventKind::Resumed);
            self.schedule(scheduler, id);
        }
        self.dispatch();
        self.persist(id).await;
        Ok(())
    }

    pub(crate) async fn cancel(&self, id: &AssetId) -> KuraResult<()> {
        {
            let mut scheduler = self.scheduler.lock();
            let scheduler = &mut *scheduler;
            let entry = scheduler
                .assets
                .get_mut(id)
                .ok_or_else(|| KuraError::UnknownAsset(id.clone()))?;
            entry.asset.transition(AssetState::Cancelled)?;
            entry.cancel.cancel();
            scheduler.queue.suspend(id);
            tracing::info!(asset = %id, "Download cancelled.");
            self.emit(id, EventKind::Cancelled);
        }
        self.dispatch();
        self.persist(id).await;
        Ok(())
    }

    /// Removes an asset in any state together with its segments and licenses.
    pub(crate) async fn delete(&self, id: &AssetId) -> KuraResult<()> {
        let _deleting = self.delete_lock.lock().await;
        {
            let mut scheduler = self.scheduler.lock();
            let scheduler = &mut *scheduler;
            let entry = scheduler
                .assets
                .get(id)
                .ok_or_else(|| KuraError::UnknownAsset(id.clone()))?;
            entry.cancel.cancel();
            scheduler.queue.suspend(id);
        }

        // abandoned transfers settle at their next suspension point
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.scheduler.lock().queue.in_flight(id) == 0 {
                break;
            }
            notified.await;
        }

        self.scheduler.lock().assets.remove(id);

        {
            let _guard = self.persist_lock.lock().await;
            self.keys.forget(id).await;
            self.store.delete_asset(id).await?;
        }
        tracing::info!(asset = %id, "Asset deleted.");
        self.emit(id, EventKind::Deleted);
        self.dispatch();
        Ok(())
    }

    pub(crate) fn asset(&self, id: &AssetId) -> Option<Asset> {
        self.scheduler
            .lock()
            .assets
            .get(id)
            .map(|e| e.asset.clone())
    }

    pub(crate) fn assets_where(&self, filter: impl Fn(&Asset) -> bool) -> Vec<Asset> {
        let mut assets: Vec<Asset> = self
            .scheduler
            .lock()
            .assets
            .values()
            .map(|e| &e.asset)
            .filter(|a| filter(a))
            .cloned()
            .collect();
        assets.sort_by_key(|a| a.sequence);
        assets
    }

    /// Waits until the asset is completed, failed, cancelled or paused.
    pub(crate) async fn wait(&self, id: &AssetId) -> KuraResult<AssetState> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self
                .asset(id)
                .map(|a| a.state)
                .ok_or_else(|| KuraError::UnknownAsset(id.clone()))?;
            if state.is_terminal() || state == AssetState::Paused {
                // events leading up to the state reach the sinks first
                self.dispatch();
                return Ok(state);
            }
            notified.await;
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.scheduler.lock().closed = true;
        self.shutdown.cancel();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("Download worker ended abnormally: {e}");
            }
        }

        let ids: Vec<AssetId> = self.scheduler.lock().assets.keys().cloned().collect();
        for id in ids {
            self.persist(&id).await;
        }
        tracing::info!("Download engine stopped.");
    }
}

fn progress(asset: &Asset) -> EventKind {
    EventKind::Progress {
        bytes_stored: asset.bytes_stored(),
        bytes_total: asset.bytes_total(),
        segments_stored: asset.stored_count(),
        segments_total: asset.segment_count(),
    }
}

/// Cuts `range` out of a complete resource.
fn slice_range(body: Bytes, range: ByteRange) -> Bytes {
    let start = range.offset as usize;
    let end = range
        .length
        .map(|l| start + l as usize)
        .unwrap_or(body.len());
    if end <= body.len() && start <= end {
        body.slice(start..end)
    } else {
        body
    }
}

/// Marks the segments of selected renditions present in the store as stored
/// and resets the rest to pending.
fn reconcile(asset: &mut Asset, stored: &[(StorageKey, u64)]) {
    let stored: HashMap<(u32, SegmentIndex), u64> = stored
        .iter()
        .map(|(key, length)| ((key.rendition, key.index), *length))
        .collect();
    for rendition in asset.renditions.iter_mut().filter(|r| r.selected) {
        let index = rendition.index;
        for segment in rendition.all_segments_mut() {
            match stored.get(&(index, segment.index)) {
                Some(length) if segment.length.map_or(true, |l| l == *length) => {
                    segment.state = TransferState::Stored;
                    segment.stored_bytes = Some(*length);
                }
                _ => {
                    segment.state = TransferState::Pending;
                    segment.stored_bytes = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaKind, Rendition, Segment, StreamFormat};

    #[test]
    fn test_slice_range() {
        let body = Bytes::from_static(b"0123456789");
        assert_eq!(
            slice_range(body.clone(), ByteRange::new(2, Some(3))),
            Bytes::from_static(b"234")
        );
        // out of bounds: keep what arrived
        assert_eq!(slice_range(body.clone(), ByteRange::new(8, Some(5))), body);
    }

    #[test]
    fn test_reconcile() {
        let url = Url::parse("https://example.com/a.ts").unwrap();
        let mut rendition = Rendition::new("v", MediaKind::Video);
        rendition.selected = true;
        rendition.segments = (0..3)
            .map(|i| Segment::new(SegmentIndex::Media(i), url.clone()))
            .collect();
        rendition.segments[2].length = Some(100);
        rendition.segments[1].state = TransferState::InFlight;

        let id = AssetId::new("a").unwrap();
        let mut asset = Asset {
            id: id.clone(),
            url: url.clone(),
            format: StreamFormat::Hls,
            state: AssetState::Downloading,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            priority: 0,
            sequence: 0,
            description: None,
            duration: None,
            renditions: vec![rendition],
            retry_count: 0,
            failure: None,
            attributes: Default::default(),
        };
        reconcile(
            &mut asset,
            &[
                (StorageKey::new(id.clone(), 0, SegmentIndex::Media(0)), 10),
                // truncated blob
                (StorageKey::new(id.clone(), 0, SegmentIndex::Media(2)), 50),
            ],
        );
        let states: Vec<TransferState> = asset.renditions[0]
            .segments
            .iter()
            .map(|s| s.state)
            .collect();
        assert_eq!(
            states,
            vec![
                TransferState::Stored,
                TransferState::Pending,
                TransferState::Pending
            ]
        );
        assert_eq!(asset.bytes_stored(), 10);
    }
}
