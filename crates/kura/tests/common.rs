use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use kura::{
    event::DownloadEvent,
    util::{
        range::ByteRange,
        transport::{FetchRequest, FetchResponse, Transport},
    },
    AssetId, DownloadEngine, DownloadEngineBuilder, EventKind, KuraError, KuraResult,
};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::{mpsc::UnboundedReceiver, Semaphore};
use url::Url;

pub const BASE: &str = "https://cdn.test/";

pub fn url(path: &str) -> Url {
    Url::parse(BASE).unwrap().join(path).unwrap()
}

pub fn init_tracing() {
    _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Default)]
struct Route {
    body: Bytes,
    failures: usize,
    interrupt_at: Option<usize>,
    gate: Option<Arc<Semaphore>>,
}

/// In-process origin with scripted failures, interruptions and gates.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<(String, Option<ByteRange>)>>,
    delay: Mutex<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, path: &str, body: impl Into<Bytes>) {
        self.routes.lock().entry(path.to_string()).or_default().body = body.into();
    }

    /// Answers the next `times` requests for `path` with a 503.
    pub fn fail(&self, path: &str, times: usize) {
        self.routes.lock().entry(path.to_string()).or_default().failures = times;
    }

    /// Breaks the body of the next response for `path` after `at` bytes.
    pub fn interrupt_once(&self, path: &str, at: usize) {
        self.routes.lock().entry(path.to_string()).or_default().interrupt_at = Some(at);
    }

    /// Holds requests for `path` until permits are added to the returned gate.
    pub fn gate(&self, path: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.routes.lock().entry(path.to_string()).or_default().gate = Some(gate.clone());
        gate
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|(p, _)| p == path).count()
    }

    pub fn ranges(&self, path: &str) -> Vec<Option<ByteRange>> {
        self.requests
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, range)| *range)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: FetchRequest) -> KuraResult<FetchResponse> {
        let path = request.url.path().trim_start_matches('/').to_string();
        self.requests.lock().push((path.clone(), request.range));

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let gate = self.routes.lock().get(&path).and_then(|r| r.gate.clone());
        if let Some(gate) = gate {
            gate.acquire().await.map_err(|_| KuraError::Shutdown)?.forget();
        }

        let mut routes = self.routes.lock();
        let route = routes
            .get_mut(&path)
            .ok_or(KuraError::HttpError(StatusCode::NOT_FOUND))?;
        if route.failures > 0 {
            route.failures -= 1;
            return Err(KuraError::HttpError(StatusCode::SERVICE_UNAVAILABLE));
        }

        let (body, partial) = match request.range {
            Some(range) => {
                let len = route.body.len();
                let start = (range.offset as usize).min(len);
                let end = range
                    .length
                    .map(|l| start + l as usize)
                    .unwrap_or(len)
                    .min(len);
                (route.body.slice(start..end), true)
            }
            None => (route.body.clone(), false),
        };
        if let Some(at) = route.interrupt_at.take() {
            return Err(KuraError::Interrupted {
                received: body.slice(..at.min(body.len())),
                partial,
                reason: "connection reset by peer".to_string(),
            });
        }

        Ok(FetchResponse {
            body,
            partial,
            content_type: None,
            date: None,
        })
    }
}

pub fn segment_body(asset: &str, index: usize) -> Bytes {
    let mut body = format!("{asset}:{index}:").into_bytes();
    body.resize(1000, index as u8);
    body.into()
}

/// Registers a VOD media playlist at `{asset}/index.m3u8` with `segments`
/// segments of 1000 bytes each.
pub fn hls_media(transport: &ScriptedTransport, asset: &str, segments: usize) -> Url {
    let mut playlist = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    for i in 0..segments {
        playlist.push_str(&format!("#EXTINF:4.0,\nseg{i}.ts\n"));
        transport.serve(&format!("{asset}/seg{i}.ts"), segment_body(asset, i));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    transport.serve(&format!("{asset}/index.m3u8"), playlist);
    url(&format!("{asset}/index.m3u8"))
}

pub fn builder(transport: Arc<ScriptedTransport>) -> DownloadEngineBuilder {
    init_tracing();
    DownloadEngine::builder()
        .transport(transport)
        .backoff(Duration::from_millis(1), Duration::from_millis(5))
        .attempt_timeout(Some(Duration::from_secs(5)))
}

pub fn drain(receiver: &mut UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

pub fn kinds_of(events: &[DownloadEvent], asset: &AssetId) -> Vec<EventKind> {
    events
        .iter()
        .filter(|e| &e.asset == asset)
        .map(|e| e.kind.clone())
        .collect()
}

/// Polls `condition` until it holds, failing after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn stored(engine: &DownloadEngine, asset: &AssetId) -> usize {
    engine.asset(asset).map(|a| a.stored_count()).unwrap_or_default()
}
