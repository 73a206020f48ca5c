use std::collections::HashSet;

use bytes::Bytes;

use crate::{
    download::DownloadEngine,
    error::{KuraError, KuraResult, NotServableReason},
    manifest::LocalResource,
    model::{Asset, AssetId, AssetState, EncryptionContext, StorageKey},
};

/// A resolved response body.
#[derive(Debug, Clone)]
pub struct Served {
    pub body: Bytes,
    pub content_type: &'static str,
}

/// Answers player requests for stored assets. Independent of HTTP so it can
/// be driven directly.
#[derive(Clone)]
pub struct Responder {
    engine: DownloadEngine,
}

fn not_servable(asset: &AssetId, reason: NotServableReason) -> KuraError {
    KuraError::NotServable {
        asset: asset.clone(),
        reason,
    }
}

/// Maps license failures, including an unreachable license server, to a
/// 403-style outcome and broken data to a corrupt one. Everything else passes
/// through.
fn license_outcome(asset: &AssetId, error: KuraError) -> KuraError {
    match error {
        KuraError::LicenseDenied(_) | KuraError::LicenseExpired(_) => {
            tracing::warn!(%asset, "Refusing to serve: {error}");
            not_servable(asset, NotServableReason::LicenseInvalid)
        }
        KuraError::HttpError(_)
        | KuraError::Timeout
        | KuraError::Interrupted { .. }
        | KuraError::RequestError(_) => {
            tracing::warn!(%asset, "License server unreachable, refusing to serve: {error}");
            not_servable(asset, NotServableReason::LicenseInvalid)
        }
        KuraError::UnpadError(_) => {
            tracing::error!(%asset, "Stored segment does not decrypt: {error}");
            not_servable(asset, NotServableReason::Corrupt)
        }
        e => e,
    }
}

impl Responder {
    pub fn new(engine: DownloadEngine) -> Self {
        Self { engine }
    }

    /// The asset if it can be served at all.
    fn servable(&self, asset: &str) -> KuraResult<Asset> {
        let id = AssetId::new(asset).map_err(|_| KuraError::InvalidAssetId(asset.to_string()))?;
        let asset = self
            .engine
            .asset(&id)
            .ok_or_else(|| not_servable(&id, NotServableReason::Unknown))?;
        if asset.state != AssetState::Completed || !asset.is_complete() {
            return Err(not_servable(&id, NotServableReason::Incomplete));
        }
        Ok(asset)
    }

    /// Every distinct key of the asset must have a valid license before any of
    /// its manifests is handed out.
    async fn check_licenses(&self, asset: &Asset) -> KuraResult<()> {
        let mut seen = HashSet::new();
        let contexts = asset.selected_renditions().flat_map(|r| {
            r.all_segments()
                .filter_map(move |s| r.encryption_for(s))
        });
        let contexts: Vec<&EncryptionContext> = contexts
            .filter(|ctx| seen.insert(ctx.key_ref()))
            .collect();
        for ctx in contexts {
            self.engine
                .keys()
                .check(&asset.id, ctx)
                .await
                .map_err(|e| license_outcome(&asset.id, e))?;
        }
        Ok(())
    }

    /// Resolves `path` below the asset root.
    pub async fn respond(&self, asset: &str, path: &str) -> KuraResult<Served> {
        let asset = self.servable(asset)?;
        let codec = self.engine.registry().get(asset.format)?;
        let resource = codec
            .resolve(&asset, path)
            .ok_or_else(|| not_servable(&asset.id, NotServableReason::Missing))?;

        match resource {
            LocalResource::Manifest { body, content_type } => {
                self.check_licenses(&asset).await?;
                Ok(Served {
                    body: body.into(),
                    content_type,
                })
            }
            LocalResource::Segment { rendition, index } => {
                let missing = || not_servable(&asset.id, NotServableReason::Missing);
                let rendition = asset.rendition(rendition).ok_or_else(missing)?;
                let segment = rendition.segment(index).ok_or_else(missing)?;

                let key = StorageKey::new(asset.id.clone(), rendition.index, index);
                let data = self.engine.store().get(&key).await?.ok_or_else(missing)?;
                if segment.stored_bytes != Some(data.len() as u64) {
                    tracing::error!(
                        asset = %asset.id,
                        %key,
                        expected = ?segment.stored_bytes,
                        actual = data.len(),
                        "Stored length does not match the record."
                    );
                    return Err(not_servable(&asset.id, NotServableReason::Corrupt));
                }

                let body = match rendition.encryption_for(segment) {
                    Some(ctx) => self
                        .engine
                        .keys()
                        .decrypt(&asset.id, ctx, data)
                        .await
                        .map_err(|e| license_outcome(&asset.id, e))?,
                    None => data,
                };
                Ok(Served {
                    body,
                    content_type: segment.format.content_type(rendition.kind),
                })
            }
        }
    }
}
