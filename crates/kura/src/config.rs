use std::{num::NonZeroU32, path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    download::DownloadEngineBuilder,
    error::{KuraError, KuraResult},
    license::{
        AnchoredClock, ChainedLicenseClient, KeyManager, KeyUriClient, LicenseClient,
        StaticKeyClient,
    },
    store::SegmentStore,
    util::{
        http::HttpClient,
        transport::{HttpTransport, Transport},
    },
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KuraConfig {
    pub download: DownloadConfig,
    pub storage: StorageConfig,
    pub serve: ServeConfig,
    pub license: LicenseConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub workers: u32,
    pub per_asset_concurrency: u32,
    pub retries: u32,
    /// Milliseconds before the first retry.
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Seconds a single attempt may take. Zero disables the limit.
    pub attempt_timeout_secs: u64,
    /// Bytes per second per worker.
    pub bandwidth_limit: Option<u64>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            per_asset_concurrency: 3,
            retries: 3,
            backoff_ms: 500,
            max_backoff_ms: 30_000,
            attempt_timeout_secs: 60,
            bandwidth_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keeps everything in memory when absent.
    pub path: Option<PathBuf>,
    /// Bytes the store may hold.
    pub ceiling: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Loopback port. Zero picks a free one.
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// `kid:key` pairs separated by `;`.
    pub keys: Option<String>,
    /// Seconds a key fetched from a key URI stays valid.
    pub key_lifetime_secs: Option<u64>,
    pub device: Option<String>,
    /// Server whose `Date` header anchors the license clock.
    pub time_server: Option<url::Url>,
    /// Hex AES-128 key sealing key bytes in saved licenses. Without it saved
    /// licenses fetch their key again after a restart.
    pub sealing_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: Option<String>,
    /// Cookies sent to the origin, in `Set-Cookie` form.
    pub cookies: Vec<CookieConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConfig {
    /// Page the cookie is stored for.
    pub url: url::Url,
    pub value: String,
}

fn non_zero(value: u32, name: &str) -> KuraResult<NonZeroU32> {
    NonZeroU32::new(value).ok_or_else(|| KuraError::ConfigError(format!("{name} must not be 0")))
}

impl KuraConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> KuraResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> KuraResult<Self> {
        let config = toml::from_str(data)?;
        Ok(config)
    }

    pub fn store(&self) -> SegmentStore {
        let store = match &self.storage.path {
            Some(path) => SegmentStore::file(path),
            None => SegmentStore::memory(),
        };
        store.ceiling(self.storage.ceiling)
    }

    /// Client with the configured user agent and cookies.
    pub fn http_client(&self) -> KuraResult<HttpClient> {
        let mut builder = reqwest::Client::builder();
        if let Some(user_agent) = &self.http.user_agent {
            builder = builder.user_agent(user_agent);
        }
        let client = HttpClient::new(builder)?;
        for cookie in &self.http.cookies {
            client.add_cookie(&cookie.value, &cookie.url)?;
        }
        Ok(client)
    }

    /// Static keys first, then key URIs.
    pub async fn keys(&self, transport: Arc<dyn Transport>) -> KuraResult<KeyManager> {
        let clock = AnchoredClock::system();
        if let Some(server) = &self.license.time_server {
            if let Err(e) = clock.sync(transport.as_ref(), server).await {
                tracing::warn!("Failed to synchronize license clock: {e}");
            }
        }

        let mut clients: Vec<Arc<dyn LicenseClient>> = Vec::new();
        if let Some(pairs) = &self.license.keys {
            clients.push(Arc::new(StaticKeyClient::from_pairs(pairs)?));
        }
        clients.push(Arc::new(KeyUriClient::new(transport).lifetime(
            self.license.key_lifetime_secs.map(Duration::from_secs),
        )));
        let client = ChainedLicenseClient::new(clients);
        let sealing_key = match &self.license.sealing_key {
            Some(key) => Some(<[u8; 16]>::try_from(hex::decode(key)?).map_err(|_| {
                KuraError::ConfigError("license.sealing_key must be 16 bytes".to_string())
            })?),
            None => None,
        };
        Ok(KeyManager::new(Arc::new(client), Arc::new(clock))
            .device(self.license.device.clone())
            .sealing_key(sealing_key))
    }

    /// An engine builder carrying every setting of this configuration.
    pub async fn engine_builder(&self) -> KuraResult<DownloadEngineBuilder> {
        let download = &self.download;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(self.http_client()?));
        let keys = self.keys(transport.clone()).await?;
        let timeout = (download.attempt_timeout_secs > 0)
            .then(|| Duration::from_secs(download.attempt_timeout_secs));

        Ok(DownloadEngineBuilder::new()
            .workers(non_zero(download.workers, "download.workers")?)
            .per_asset_concurrency(non_zero(
                download.per_asset_concurrency,
                "download.per_asset_concurrency",
            )?)
            .retries(download.retries)
            .backoff(
                Duration::from_millis(download.backoff_ms),
                Duration::from_millis(download.max_backoff_ms),
            )
            .attempt_timeout(timeout)
            .bandwidth_limit(download.bandwidth_limit)
            .transport(transport)
            .store(Arc::new(self.store()))
            .keys(Arc::new(keys)))
    }
}
