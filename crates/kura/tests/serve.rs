use std::{sync::Arc, time::Duration};

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use kura::{
    error::NotServableReason,
    license::{AnchoredClock, KeyManager, KeyUriClient, ManualClock},
    model::{SegmentIndex, StorageKey},
    serve::Responder,
    store::SegmentStore,
    AssetId, AssetState, DownloadRequest, KuraError, OfflineServer,
};
use reqwest::StatusCode;
use url::Url;

use crate::{
    common::{builder, eventually, hls_media, segment_body, stored, url, ScriptedTransport},
    AssertWrapper,
};

const KEY: [u8; 16] = [0x11; 16];

fn encrypt(plain: &[u8], sequence: u64) -> Vec<u8> {
    let iv = (sequence as u128).to_be_bytes();
    cbc::Encryptor::<aes::Aes128>::new(&KEY.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plain)
}

/// AES-128 playlist of `count` segments under `asset/`, keyed by
/// `asset/key.bin`.
fn encrypted_media(transport: &ScriptedTransport, asset: &str, count: u64) -> Url {
    transport.serve(&format!("{asset}/key.bin"), Bytes::from_static(&KEY));
    let mut playlist = String::from(
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n",
    );
    for i in 0..count {
        playlist.push_str(&format!("#EXTINF:4.0,\nseg{i}.ts\n"));
        transport.serve(
            &format!("{asset}/seg{i}.ts"),
            encrypt(&segment_body(asset, i as usize), i),
        );
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    transport.serve(&format!("{asset}/index.m3u8"), playlist);
    url(&format!("{asset}/index.m3u8"))
}

/// Key URI licenses saved with their key sealed.
fn sealed_keys(transport: Arc<ScriptedTransport>) -> Arc<KeyManager> {
    let keys = KeyManager::new(
        Arc::new(KeyUriClient::new(transport)),
        Arc::new(AnchoredClock::system()),
    );
    Arc::new(keys.sealing_key(Some([0x5a; 16])))
}

fn not_servable(result: Result<kura::serve::Served, KuraError>) -> NotServableReason {
    match result {
        Err(KuraError::NotServable { reason, .. }) => reason,
        other => panic!("expected a not servable outcome, got {:?}", other.map(|s| s.body)),
    }
}

#[tokio::test]
async fn test_aes128_is_decrypted_until_license_expires() -> anyhow::Result<()> {
    let transport = ScriptedTransport::new();
    let manifest = encrypted_media(&transport, "enc", 3);

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let keys = KeyManager::new(
        Arc::new(
            KeyUriClient::new(transport.clone()).lifetime(Some(Duration::from_secs(60))),
        ),
        clock.clone(),
    );
    let engine = builder(transport.clone())
        .keys(Arc::new(keys))
        .build()
        .await?;
    let id = engine
        .enqueue(DownloadRequest::new(manifest))
        .await?;
    assert_eq!(engine.wait(&id).await?, AssetState::Completed);
    assert_eq!(transport.calls("enc/key.bin"), 1);
    assert!(engine.keys().has_license(&id));

    // the store keeps what the origin sent
    let stored = engine
        .store()
        .get(&StorageKey::new(id.clone(), 0, SegmentIndex::Media(1)))
        .await?
        .assert_success();
    assert_ne!(stored, segment_body("enc", 1));

    let responder = Responder::new(engine.clone());
    let media = responder.respond(id.as_str(), "0/index.m3u8").await?;
    let media = String::from_utf8(media.body.to_vec())?;
    assert!(!media.contains("EXT-X-KEY"));
    assert!(!media.contains("key.bin"));

    for i in 0..3 {
        let served = responder.respond(id.as_str(), &format!("0/{i}.ts")).await?;
        assert_eq!(served.body, segment_body("enc", i));
    }

    // renewal fails once the license runs out
    transport.fail("enc/key.bin", 100);
    clock.advance(TimeDelta::seconds(120));
    assert_eq!(
        not_servable(responder.respond(id.as_str(), "0/1.ts").await),
        NotServableReason::LicenseInvalid
    );

    let handle = OfflineServer::new(engine.clone()).start().await?;
    let response = reqwest::get(handle.manifest_url(&engine, &id)?).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // deleting drops the license with the data
    engine.delete(&id).await?;
    assert!(!engine.keys().has_license(&id));
    let response = reqwest::get(handle.asset_url(&id, "0/1.ts")).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    handle.shutdown().await;
    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_incomplete_and_corrupt_assets_are_refused() -> anyhow::Result<()> {
    let transport = ScriptedTransport::new();
    let partial = hls_media(&transport, "partial", 3);
    let whole = hls_media(&transport, "whole", 2);
    let _gate = transport.gate("partial/seg2.ts");

    let engine = builder(transport.clone()).build().await?;
    let partial = engine.enqueue(DownloadRequest::new(partial)).await?;
    let whole = engine.enqueue(DownloadRequest::new(whole)).await?;
    assert_eq!(engine.wait(&whole).await?, AssetState::Completed);
    eventually(|| stored(&engine, &partial) == 2).await;

    let handle = OfflineServer::new(engine.clone()).start().await?;
    // stored segments of an unfinished asset stay unreachable
    let response = reqwest::get(handle.asset_url(&partial, "0/0.ts")).await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = reqwest::get(handle.asset_url(&whole, "0/0.ts")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CACHE_CONTROL],
        "no-store"
    );

    // bytes that no longer match the record are never handed out
    engine
        .store()
        .put(
            &StorageKey::new(whole.clone(), 0, SegmentIndex::Media(1)),
            Bytes::from_static(b"truncated"),
        )
        .await?;
    let response = reqwest::get(handle.asset_url(&whole, "0/1.ts")).await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        not_servable(
            Responder::new(engine.clone())
                .respond(whole.as_str(), "0/1.ts")
                .await
        ),
        NotServableReason::Corrupt
    );

    let response = reqwest::get(handle.asset_url(&whole, "0/index.m3u8")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );

    handle.shutdown().await;
    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_restart_serves_encrypted_asset_offline() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let transport = ScriptedTransport::new();
    let manifest = encrypted_media(&transport, "enc", 3);
    let engine = builder(transport.clone())
        .store(SegmentStore::file(dir.path()).into())
        .keys(sealed_keys(transport.clone()))
        .build()
        .await?;
    let id = engine
        .enqueue(DownloadRequest::new(manifest).id(AssetId::new("enc")?))
        .await?;
    assert_eq!(engine.wait(&id).await?, AssetState::Completed);
    engine.shutdown().await;
    let saved = std::fs::read_to_string(dir.path().join("enc/licenses.json"))?;
    assert!(!saved.contains(&hex::encode(KEY)));

    // a new process without any route to the key server
    let transport = ScriptedTransport::new();
    let engine = builder(transport.clone())
        .store(SegmentStore::file(dir.path()).into())
        .keys(sealed_keys(transport.clone()))
        .build()
        .await?;
    assert!(engine.keys().has_license(&id));
    let responder = Responder::new(engine.clone());
    responder.respond(id.as_str(), "0/index.m3u8").await?;
    for i in 0..3 {
        let served = responder.respond(id.as_str(), &format!("0/{i}.ts")).await?;
        assert_eq!(served.body, segment_body("enc", i));
    }
    assert_eq!(transport.calls("enc/key.bin"), 0);

    // the saved licenses go with the asset
    engine.delete(&id).await?;
    assert!(!dir.path().join("enc").exists());
    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_license_server_refuses_to_serve() -> anyhow::Result<()> {
    let transport = ScriptedTransport::new();
    let manifest = encrypted_media(&transport, "down", 2);
    transport.fail("down/key.bin", usize::MAX);

    // the download itself goes on without a license
    let engine = builder(transport.clone()).build().await?;
    let id = engine.enqueue(DownloadRequest::new(manifest)).await?;
    assert_eq!(engine.wait(&id).await?, AssetState::Completed);

    let responder = Responder::new(engine.clone());
    assert_eq!(
        not_servable(responder.respond(id.as_str(), "0/0.ts").await),
        NotServableReason::LicenseInvalid
    );
    assert_eq!(
        not_servable(responder.respond(id.as_str(), "0/index.m3u8").await),
        NotServableReason::LicenseInvalid
    );

    let handle = OfflineServer::new(engine.clone()).start().await?;
    let response = reqwest::get(handle.asset_url(&id, "0/1.ts")).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    handle.shutdown().await;
    engine.shutdown().await;
    Ok(())
}
