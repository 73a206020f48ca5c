use std::{num::NonZeroU32, path::PathBuf};

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use kura::{
    config::{CookieConfig, KuraConfig},
    event::{ChannelEventSink, TracingEventSink},
    model::StreamFormat,
    select::{BandwidthCeiling, BestQuality, SelectAll, SelectIds},
    AssetId, AssetState, DownloadRequest, EventKind, OfflineServer,
};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug, Clone)]
#[clap(name = "kura", version)]
pub struct KuraArgs {
    /// Configuration file
    #[clap(short, long, env = "KURA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory holding downloaded assets, overrides the configuration
    #[clap(long, global = true)]
    storage: Option<PathBuf>,

    /// Debug output
    #[clap(long, alias = "debug", global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Download a stream for offline playback
    #[clap(visible_alias = "dl")]
    Download(DownloadArgs),
    /// Serve completed assets on the loopback interface
    Serve {
        /// Port to listen on, 0 picks a free one
        #[clap(long)]
        port: Option<u16>,
    },
    /// List known assets
    #[clap(visible_alias = "ls")]
    List,
    /// Delete an asset with all of its data
    #[clap(visible_alias = "rm")]
    Delete { id: AssetId },
}

#[derive(Args, Debug, Clone)]
struct DownloadArgs {
    /// Manifest URL
    url: Url,

    /// hls, dash or smooth. Guessed from the URL when omitted
    #[clap(long)]
    format: Option<StreamFormat>,

    /// Asset id, generated when omitted
    #[clap(long)]
    id: Option<AssetId>,

    /// Lower values are downloaded first
    #[clap(long, default_value = "0")]
    priority: i32,

    #[clap(long)]
    description: Option<String>,

    /// Download every rendition instead of the best one per media kind
    #[clap(long, conflicts_with_all = ["max_bandwidth", "rendition"])]
    all: bool,

    /// Pick the best rendition below this bandwidth
    #[clap(long)]
    max_bandwidth: Option<u64>,

    /// Rendition ids to download
    #[clap(long)]
    rendition: Vec<String>,

    /// Threads limit
    #[clap(long)]
    threads: Option<NonZeroU32>,

    /// Retry limit
    #[clap(long)]
    retries: Option<u32>,

    /// Bytes per second per thread
    #[clap(long)]
    limit_rate: Option<u64>,

    /// Keys in `kid:key` form, separated by `;`
    #[clap(long)]
    key: Option<String>,

    /// Cookies sent with every request to the manifest host
    #[clap(long)]
    cookie: Vec<String>,
}

impl KuraArgs {
    fn config(&self) -> anyhow::Result<KuraConfig> {
        let mut config = match &self.config {
            Some(path) => KuraConfig::load(path)?,
            None => KuraConfig::default(),
        };
        if let Some(storage) = &self.storage {
            config.storage.path = Some(storage.clone());
        }
        if config.storage.path.is_none() {
            bail!("no storage directory configured, pass --storage or set storage.path");
        }
        Ok(config)
    }
}

async fn download(mut config: KuraConfig, args: DownloadArgs) -> anyhow::Result<()> {
    if let Some(threads) = args.threads {
        config.download.workers = threads.get();
    }
    if let Some(retries) = args.retries {
        config.download.retries = retries;
    }
    if args.limit_rate.is_some() {
        config.download.bandwidth_limit = args.limit_rate;
    }
    if args.key.is_some() {
        config.license.keys = args.key.clone();
    }
    config
        .http
        .cookies
        .extend(args.cookie.iter().map(|value| CookieConfig {
            url: args.url.clone(),
            value: value.clone(),
        }));

    let (sink, mut events) = ChannelEventSink::new();
    let engine = config.engine_builder().await?.sink(sink).build().await?;

    let mut request = DownloadRequest::new(args.url).priority(args.priority);
    if let Some(id) = args.id {
        request = request.id(id);
    }
    if let Some(format) = args.format {
        request = request.format(format);
    }
    if let Some(description) = args.description {
        request = request.description(description);
    }
    request = if args.all {
        request.selector(SelectAll)
    } else if !args.rendition.is_empty() {
        request.selector(SelectIds(args.rendition))
    } else if let Some(bandwidth) = args.max_bandwidth {
        request.selector(BandwidthCeiling(bandwidth))
    } else {
        request.selector(BestQuality)
    };

    let id = engine.enqueue(request).await?;
    tracing::info!("Queued {id}");

    let mut interrupted = false;
    let state = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) if event.asset == id => match event.kind {
                    EventKind::Progress { segments_stored, segments_total, .. } => {
                        tracing::info!("Downloaded {segments_stored}/{segments_total} segments");
                    }
                    EventKind::Failed { reason } => tracing::error!("{reason}"),
                    EventKind::StorageError { reason } => tracing::error!("{reason}"),
                    _ => {}
                },
                Some(_) => {}
                None => break engine.wait(&id).await?,
            },
            state = engine.wait(&id) => break state?,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, pausing {id}");
                engine.pause(&id).await?;
                interrupted = true;
                break AssetState::Paused;
            }
        }
    };
    engine.shutdown().await;

    match state {
        AssetState::Completed => {
            println!("{id}");
            Ok(())
        }
        AssetState::Paused if interrupted => Ok(()),
        state => bail!("{id} ended {state}"),
    }
}

async fn serve(config: KuraConfig, port: Option<u16>) -> anyhow::Result<()> {
    let engine = config
        .engine_builder()
        .await?
        .sink(TracingEventSink)
        .build()
        .await?;
    let handle = OfflineServer::new(engine.clone())
        .port(port.unwrap_or(config.serve.port))
        .start()
        .await?;
    tracing::info!("Serving on {}", handle.base_url());

    for asset in engine.completed_assets() {
        println!("{}\t{}", asset.id, handle.manifest_url(&engine, &asset.id)?);
    }

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    engine.shutdown().await;
    Ok(())
}

/// Reads the records straight from the store so nothing resumes.
async fn list(config: &KuraConfig) -> anyhow::Result<()> {
    let store = config.store();
    for id in store.list_assets().await? {
        let Some(asset) = store.read_metadata(&id).await? else {
            continue;
        };
        println!(
            "{}\t{}\t{}\t{:.1}%\t{}",
            asset.id,
            asset.state,
            asset.format,
            asset.fraction_complete() * 100.,
            asset.description.as_deref().unwrap_or(asset.url.as_str()),
        );
    }
    Ok(())
}

async fn delete(config: &KuraConfig, id: &AssetId) -> anyhow::Result<()> {
    let store = config.store();
    if store.read_metadata(id).await?.is_none() {
        bail!("unknown asset {id}");
    }
    let freed = store.delete_asset(id).await?;
    tracing::info!("Deleted {id}, {freed} bytes freed");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = KuraArgs::parse();
    let filter = EnvFilter::builder()
        .with_default_directive(if args.verbose {
            tracing::Level::DEBUG.into()
        } else {
            tracing::Level::INFO.into()
        })
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = args.config()?;
    match args.command {
        Command::Download(download_args) => download(config, download_args).await,
        Command::Serve { port } => serve(config, port).await,
        Command::List => list(&config).await,
        Command::Delete { id } => delete(&config, &id).await,
    }
}
