use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use url::Url;

use super::KeyMaterial;
use crate::{
    error::{KuraError, KuraResult},
    model::{normalize_kid, AssetId, EncryptionScheme},
    util::transport::{FetchRequest, Transport},
};

/// What a license exchange is asked for.
#[derive(Debug, Clone)]
pub struct LicenseRequest {
    pub asset: AssetId,
    /// Normalized key id, when the stream signals one.
    pub key_id: Option<String>,
    pub scheme: EncryptionScheme,
    pub key_uri: Option<Url>,
    /// PSSH box or protection header, base64 encoded.
    pub init_data: Option<String>,
    /// Opaque device binding configured on the key manager.
    pub device: Option<String>,
    /// Secure time at which the request was made.
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LicenseGrant {
    pub key: KeyMaterial,
    /// `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub renewable: bool,
}

/// The collaborator that turns a key reference into key material.
#[async_trait]
pub trait LicenseClient: Send + Sync + 'static {
    async fn acquire(&self, request: &LicenseRequest) -> KuraResult<LicenseGrant>;

    /// Called once when a cached license has expired.
    async fn renew(&self, request: &LicenseRequest) -> KuraResult<LicenseGrant> {
        self.acquire(request).await
    }
}

/// Fetches raw 16-byte AES-128 keys from the key URI.
pub struct KeyUriClient {
    transport: Arc<dyn Transport>,
    lifetime: Option<Duration>,
}

impl KeyUriClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            lifetime: None,
        }
    }

    /// Keys fetched by this client expire after `lifetime` and are renewed by
    /// fetching the key URI again.
    pub fn lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.lifetime = lifetime;
        self
    }
}

#[async_trait]
impl LicenseClient for KeyUriClient {
    async fn acquire(&self, request: &LicenseRequest) -> KuraResult<LicenseGrant> {
        let Some(uri) = &request.key_uri else {
            return Err(KuraError::LicenseDenied(format!(
                "{} key of asset {} has no key URI",
                request.scheme_name(),
                request.asset
            )));
        };
        if request.scheme != EncryptionScheme::Aes128 {
            return Err(KuraError::LicenseDenied(format!(
                "key URI {uri} does not serve {} keys",
                request.scheme_name()
            )));
        }

        tracing::debug!(asset = %request.asset, %uri, "Fetching key.");
        let response = match self.transport.fetch(FetchRequest::get(uri.clone())).await {
            Ok(response) => response,
            Err(KuraError::HttpError(status)) if status.is_client_error() => {
                return Err(KuraError::LicenseDenied(format!("{uri} answered {status}")));
            }
            Err(e) => return Err(e),
        };
        if response.body.len() != 16 {
            return Err(KuraError::LicenseDenied(format!(
                "{uri} returned a {} byte key, expected 16",
                response.body.len()
            )));
        }

        let expires_at = self
            .lifetime
            .and_then(|l| TimeDelta::from_std(l).ok())
            .map(|l| request.now + l);
        Ok(LicenseGrant {
            key: KeyMaterial::new(response.body.to_vec()),
            expires_at,
            renewable: true,
        })
    }
}

/// Keys configured by hand, as `kid:key` pairs or one key for streams that
/// signal no key id.
#[derive(Default)]
pub struct StaticKeyClient {
    keys: HashMap<String, KeyMaterial>,
    default_key: Option<KeyMaterial>,
}

impl StaticKeyClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `<kid>:<key>;<kid>:<key>;...`, both hex encoded.
    pub fn from_pairs(pairs: &str) -> KuraResult<Self> {
        let mut client = Self::new();
        for pair in pairs.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once(':') {
                Some((kid, key)) if is_valid_kid_key_pair(kid, key) => {
                    client.keys.insert(normalize_kid(kid), KeyMaterial::new(hex::decode(key)?));
                }
                _ => tracing::warn!("Ignored invalid key format: {pair}"),
            }
        }
        if client.keys.is_empty() {
            return Err(KuraError::ConfigError(
                "no valid kid:key pair found".to_string(),
            ));
        }
        Ok(client)
    }

    pub fn insert(&mut self, kid: &str, key: &str) -> KuraResult<&mut Self> {
        if !is_valid_kid_key_pair(kid, key) {
            return Err(KuraError::InvalidHexKey(kid.to_string()));
        }
        self.keys
            .insert(normalize_kid(kid), KeyMaterial::new(hex::decode(key)?));
        Ok(self)
    }

    /// Hex encoded key used when the stream carries no key id.
    pub fn default_key(mut self, key: &str) -> KuraResult<Self> {
        let key = key.strip_prefix("0x").unwrap_or(key);
        let bytes = hex::decode(key)?;
        if bytes.len() != 16 {
            return Err(KuraError::InvalidHexKey(format!(
                "expected 32 hex digits, got {}",
                key.len()
            )));
        }
        self.default_key = Some(KeyMaterial::new(bytes));
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.default_key.is_none()
    }
}

#[async_trait]
impl LicenseClient for StaticKeyClient {
    async fn acquire(&self, request: &LicenseRequest) -> KuraResult<LicenseGrant> {
        let key = match &request.key_id {
            Some(kid) => self.keys.get(kid).or(self.default_key.as_ref()),
            None => self.default_key.as_ref(),
        };
        match key {
            Some(key) => Ok(LicenseGrant {
                key: key.clone(),
                expires_at: None,
                renewable: false,
            }),
            None => Err(KuraError::LicenseDenied(format!(
                "no static key for {}",
                request.key_id.as_deref().unwrap_or("keys without id")
            ))),
        }
    }
}

/// Asks each client in turn, moving on when one denies.
pub struct ChainedLicenseClient {
    clients: Vec<Arc<dyn LicenseClient>>,
}

impl ChainedLicenseClient {
    pub fn new(clients: Vec<Arc<dyn LicenseClient>>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl LicenseClient for ChainedLicenseClient {
    async fn acquire(&self, request: &LicenseRequest) -> KuraResult<LicenseGrant> {
        let mut denials = Vec::new();
        for client in &self.clients {
            match client.acquire(request).await {
                Err(KuraError::LicenseDenied(reason)) => denials.push(reason),
                result => return result,
            }
        }
        Err(KuraError::LicenseDenied(denials.join("; ")))
    }

    async fn renew(&self, request: &LicenseRequest) -> KuraResult<LicenseGrant> {
        let mut denials = Vec::new();
        for client in &self.clients {
            match client.renew(request).await {
                Err(KuraError::LicenseDenied(reason)) => denials.push(reason),
                result => return result,
            }
        }
        Err(KuraError::LicenseDenied(denials.join("; ")))
    }
}

impl LicenseRequest {
    fn scheme_name(&self) -> &'static str {
        match self.scheme {
            EncryptionScheme::Aes128 => "AES-128",
            EncryptionScheme::SampleAes => "SAMPLE-AES",
            EncryptionScheme::Cenc => "cenc",
            EncryptionScheme::Cbcs => "cbcs",
        }
    }
}

fn is_valid_kid_key_pair(kid: &str, key: &str) -> bool {
    let kid = normalize_kid(kid);
    kid.len() == 32
        && key.len() == 32
        && kid.chars().all(|c| c.is_ascii_hexdigit())
        && key.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key_id: Option<&str>) -> LicenseRequest {
        LicenseRequest {
            asset: AssetId::new("asset").unwrap(),
            key_id: key_id.map(normalize_kid),
            scheme: EncryptionScheme::Cenc,
            key_uri: None,
            init_data: None,
            device: None,
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_static_keys() {
        let client = StaticKeyClient::from_pairs(
            "0123456789ABCDEF0123456789abcdef:00112233445566778899aabbccddeeff;broken:pair",
        )
        .unwrap();
        let grant = client
            .acquire(&request(Some("01234567-89ab-cdef-0123-456789abcdef")))
            .await
            .unwrap();
        assert_eq!(grant.key.bytes()[0], 0x00);
        assert_eq!(grant.key.bytes()[15], 0xff);
        assert!(grant.expires_at.is_none());

        assert!(matches!(
            client.acquire(&request(Some("ffffffffffffffffffffffffffffffff"))).await,
            Err(KuraError::LicenseDenied(_))
        ));
        assert!(StaticKeyClient::from_pairs("nothing:valid").is_err());
    }

    #[tokio::test]
    async fn test_chain_falls_through_denials() {
        let empty: Arc<dyn LicenseClient> = Arc::new(StaticKeyClient::new());
        let keys: Arc<dyn LicenseClient> = Arc::new(
            StaticKeyClient::new()
                .default_key("0x000102030405060708090a0b0c0d0e0f")
                .unwrap(),
        );
        let chain = ChainedLicenseClient::new(vec![empty.clone(), keys]);
        let grant = chain.acquire(&request(None)).await.unwrap();
        assert_eq!(grant.key.bytes()[1], 1);

        let chain = ChainedLicenseClient::new(vec![empty]);
        assert!(matches!(
            chain.acquire(&request(None)).await,
            Err(KuraError::LicenseDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_length_is_refused() {
        use wiremock::{matchers::path, Mock, MockServer, ResponseTemplate};

        use crate::util::{http::HttpClient, transport::HttpTransport};

        let server = MockServer::start().await;
        Mock::given(path("/short.key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 8]))
            .mount(&server)
            .await;
        let transport = HttpTransport::new(HttpClient::new(reqwest::Client::builder()).unwrap());
        let client = KeyUriClient::new(Arc::new(transport));

        let mut short = request(None);
        short.scheme = EncryptionScheme::Aes128;
        short.key_uri = Some(Url::parse(&format!("{}/short.key", server.uri())).unwrap());
        assert!(matches!(
            client.acquire(&short).await,
            Err(KuraError::LicenseDenied(_))
        ));

        assert!(matches!(
            StaticKeyClient::new().default_key("00112233"),
            Err(KuraError::InvalidHexKey(_))
        ));
    }
}
