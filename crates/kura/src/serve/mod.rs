//! Loopback HTTP endpoint that plays stored assets back.

mod error;
mod responder;

use std::net::{Ipv4Addr, SocketAddr};

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tower_http::trace::TraceLayer;
use url::Url;

pub use error::ServeError;
pub use responder::{Responder, Served};

use crate::{
    download::DownloadEngine,
    error::{KuraError, KuraResult},
    model::AssetId,
};

async fn serve_resource(
    State(responder): State<Responder>,
    Path((asset, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, ServeError> {
    let served = responder.respond(&asset, &path).await?;
    Ok((
        [
            (header::CONTENT_TYPE, served.content_type),
            (header::CACHE_CONTROL, "no-store"),
        ],
        served.body,
    ))
}

pub struct OfflineServer {
    responder: Responder,
    port: u16,
}

impl OfflineServer {
    pub fn new(engine: DownloadEngine) -> Self {
        Self {
            responder: Responder::new(engine),
            port: 0,
        }
    }

    /// Port to listen on. Zero picks a free one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/{asset}/{*path}", get(serve_resource))
            .layer(TraceLayer::new_for_http())
            .with_state(self.responder.clone())
    }

    /// Starts serving on the loopback interface.
    pub async fn start(self) -> KuraResult<ServerHandle> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))).await?;
        let addr = listener.local_addr()?;
        let base_url = Url::parse(&format!("http://{addr}/"))?;
        let router = self.router();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            });
            if let Err(e) = server.await {
                tracing::error!("Offline server stopped: {e}");
            }
        });
        tracing::info!(%addr, "Offline server listening.");

        Ok(ServerHandle {
            addr,
            base_url,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// A running [`OfflineServer`]. Dropping the handle stops the server.
pub struct ServerHandle {
    addr: SocketAddr,
    base_url: Url,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of the root manifest a player should open.
    pub fn manifest_url(&self, engine: &DownloadEngine, asset: &AssetId) -> KuraResult<Url> {
        let record = engine
            .asset(asset)
            .ok_or_else(|| KuraError::UnknownAsset(asset.clone()))?;
        let codec = engine.registry().get(record.format)?;
        Ok(self.asset_url(asset, codec.manifest_name()))
    }

    /// URL of `path` below the asset root.
    pub fn asset_url(&self, asset: &AssetId, path: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(&format!("/{asset}/{path}"));
        url
    }

    /// Stops accepting connections and waits for open ones to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            _ = task.await;
        }
        tracing::info!(addr = %self.addr, "Offline server stopped.");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            _ = tx.send(());
        }
    }
}
