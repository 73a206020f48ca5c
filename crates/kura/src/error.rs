use aes::cipher::block_padding::UnpadError;
use bytes::Bytes;
use thiserror::Error;

use crate::model::{AssetId, AssetState};

#[derive(Error, Debug)]
pub enum KuraError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Request timed out")]
    Timeout,

    /// The response body stopped early. `received` holds what arrived so the
    /// next attempt can resume with a range request. `partial` tells whether
    /// the interrupted response was itself a `206`.
    #[error("Transfer interrupted after {} bytes: {reason}", received.len())]
    Interrupted {
        received: Bytes,
        partial: bool,
        reason: String,
    },

    #[error("Manifest fetch error: {0}")]
    ManifestFetchError(String),

    #[error("Invalid manifest: {0}")]
    ManifestParseError(String),

    #[error("License denied: {0}")]
    LicenseDenied(String),

    #[error("License expired for key {0}")]
    LicenseExpired(String),

    #[error("Invalid hex key: {0}")]
    InvalidHexKey(String),

    #[error("Pkcs7 unpad error")]
    UnpadError(#[from] UnpadError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Storage ceiling reached: {used} of {ceiling} bytes used, {requested} requested")]
    StorageFull {
        used: u64,
        ceiling: u64,
        requested: u64,
    },

    #[error("Asset {asset} is not servable: {reason}")]
    NotServable { asset: AssetId, reason: NotServableReason },

    #[error("Invalid asset id: {0:?}")]
    InvalidAssetId(String),

    #[error("Unknown asset: {0}")]
    UnknownAsset(AssetId),

    #[error("Asset {0} already exists")]
    AssetExists(AssetId),

    #[error("Invalid transition of asset {asset}: {from:?} -> {to:?}")]
    InvalidTransition {
        asset: AssetId,
        from: AssetState,
        to: AssetState,
    },

    #[error("No rendition selected")]
    NoRenditionSelected,

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Download engine has been shut down")]
    Shutdown,

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    TomlError(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotServableReason {
    Unknown,
    Incomplete,
    LicenseInvalid,
    Missing,
    Corrupt,
}

impl std::fmt::Display for NotServableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown asset",
            Self::Incomplete => "download incomplete",
            Self::LicenseInvalid => "license invalid",
            Self::Missing => "no such resource",
            Self::Corrupt => "stored data does not match its record",
        })
    }
}

impl KuraError {
    /// Whether a segment transfer that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Interrupted { .. } => true,
            Self::HttpError(status) => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::RequestError(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            Self::IOError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StorageError(_) | Self::StorageFull { .. })
    }

    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        Self::StorageError(e.to_string())
    }
}

pub type KuraResult<T> = Result<T, KuraError>;
