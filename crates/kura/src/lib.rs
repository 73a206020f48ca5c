pub mod config;
pub mod download;
pub mod error;
pub mod event;
pub mod license;
pub mod manifest;
pub mod model;
pub mod select;
pub mod serve;
pub mod store;
pub mod util;

/// ┌──────────────┐  enqueue  ┌──────────────────┐   put    ┌──────────────┐
/// │   Manifest   ├───────────►  DownloadEngine  ├──────────►  SegmentStore │
/// │    Loader    │           │ [worker × N]     │          │              │
/// └──────────────┘           └────────┬─────────┘          └──────▲───────┘
///                                     │ acquire_key               │ get
///                            ┌────────▼─────────┐          ┌──────┴───────┐
///                            │    KeyManager    ◄──────────┤ OfflineServer│
///                            └──────────────────┘ decrypt  └──────────────┘
pub use download::{DownloadEngine, DownloadEngineBuilder, DownloadRequest};
pub use error::{KuraError, KuraResult};
pub use event::{DownloadEvent, EventKind, EventSink};
pub use model::{Asset, AssetId, AssetState, StreamFormat};
pub use serve::{OfflineServer, ServerHandle};
pub use store::SegmentStore;
pub use util::http::HttpClient;
