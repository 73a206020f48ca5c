use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, OnceLock},
};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{KeyMaterial, LicenseClient, LicenseGrant, LicenseRequest, SecureClock};
use crate::{
    error::{KuraError, KuraResult},
    model::{AssetId, EncryptionContext, EncryptionScheme},
    store::SegmentStore,
};

/// How far a license check may run ahead of its saved copy.
const CHECK_SAVE_SECONDS: i64 = 60;

#[derive(Debug)]
struct LicenseRecord {
    /// Missing after a restore without the sealing key.
    key: Option<KeyMaterial>,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    renewable: bool,
    /// Latest secure time the record was checked at.
    checked_at: DateTime<Utc>,
    saved_check: DateTime<Utc>,
}

impl LicenseRecord {
    fn from_grant(grant: LicenseGrant, now: DateTime<Utc>) -> Self {
        Self {
            key: Some(grant.key),
            acquired_at: now,
            expires_at: grant.expires_at,
            renewable: grant.renewable,
            checked_at: now,
            saved_check: now,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }
}

/// A license record as written to the store. Key bytes only appear sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedLicense {
    key_ref: String,
    /// Hex of IV and AES-128-CBC ciphertext under the sealing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sealed_key: Option<String>,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    renewable: bool,
    checked_at: DateTime<Utc>,
}

impl SavedLicense {
    fn new(key_ref: &str, record: &LicenseRecord, sealing: Option<&[u8; 16]>) -> Self {
        Self {
            key_ref: key_ref.to_string(),
            sealed_key: sealing
                .zip(record.key.as_ref())
                .map(|(sealing, key)| seal(sealing, key)),
            acquired_at: record.acquired_at,
            expires_at: record.expires_at,
            renewable: record.renewable,
            checked_at: record.checked_at,
        }
    }

    fn to_record(&self, sealing: Option<&[u8; 16]>) -> KuraResult<LicenseRecord> {
        let key = match (sealing, &self.sealed_key) {
            (Some(sealing), Some(sealed)) => Some(unseal(sealing, sealed)?),
            _ => None,
        };
        Ok(LicenseRecord {
            key,
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
            renewable: self.renewable,
            checked_at: self.checked_at,
            saved_check: self.checked_at,
        })
    }
}

fn seal(sealing: &[u8; 16], key: &KeyMaterial) -> String {
    let iv: [u8; 16] = rand::random();
    let sealed = cbc::Encryptor::<aes::Aes128>::new(sealing.into(), (&iv).into())
        .encrypt_padded_vec_mut::<Pkcs7>(key.bytes());
    let mut out = iv.to_vec();
    out.extend_from_slice(&sealed);
    hex::encode(out)
}

fn unseal(sealing: &[u8; 16], sealed: &str) -> KuraResult<KeyMaterial> {
    let data = hex::decode(sealed)?;
    if data.len() < 32 {
        return Err(KuraError::InvalidHexKey(sealed.to_string()));
    }
    let (iv, sealed) = data.split_at(16);
    let key = cbc::Decryptor::<aes::Aes128>::new(sealing.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(sealed)?;
    Ok(KeyMaterial::new(key))
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<LicenseRecord>>>;

/// Acquires, caches and renews licenses, one exchange per key at a time.
///
/// Once attached to a store, records are saved next to their asset and
/// restored with it. Key bytes are saved only when a sealing key is set, so
/// without one a restored record keeps its expiry but fetches its key again.
/// The secure time never runs backwards past the last check of any known
/// record.
pub struct KeyManager {
    client: Arc<dyn LicenseClient>,
    clock: Arc<dyn SecureClock>,
    device: Option<String>,
    sealing: Option<[u8; 16]>,
    slots: Mutex<HashMap<(AssetId, String), Slot>>,
    store: OnceLock<Arc<SegmentStore>>,
    saved: Mutex<HashMap<AssetId, BTreeMap<String, SavedLicense>>>,
    save_lock: tokio::sync::Mutex<()>,
    floor: Mutex<Option<DateTime<Utc>>>,
}

impl KeyManager {
    pub fn new(client: Arc<dyn LicenseClient>, clock: Arc<dyn SecureClock>) -> Self {
        Self {
            client,
            clock,
            device: None,
            sealing: None,
            slots: Mutex::new(HashMap::new()),
            store: OnceLock::new(),
            saved: Mutex::new(HashMap::new()),
            save_lock: tokio::sync::Mutex::new(()),
            floor: Mutex::new(None),
        }
    }

    /// Device binding sent with every license request.
    pub fn device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    /// Key that seals key bytes in saved license records.
    pub fn sealing_key(mut self, key: Option<[u8; 16]>) -> Self {
        self.sealing = key;
        self
    }

    pub fn clock(&self) -> &Arc<dyn SecureClock> {
        &self.clock
    }

    /// Saves license records into `store` from now on. A manager saves to
    /// the first store it is attached to.
    pub fn attach(&self, store: Arc<SegmentStore>) {
        if self.store.set(store).is_err() {
            tracing::debug!("Key manager is already attached to a store.");
        }
    }

    /// Secure time, held at the latest time seen so far.
    pub fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut floor = self.floor.lock();
        match *floor {
            Some(floor) if floor > now => floor,
            _ => {
                *floor = Some(now);
                now
            }
        }
    }

    fn raise_floor(&self, time: DateTime<Utc>) {
        let mut floor = self.floor.lock();
        if floor.map_or(true, |f| f < time) {
            *floor = Some(time);
        }
    }

    fn slot(&self, asset: &AssetId, key_ref: String) -> Slot {
        self.slots
            .lock()
            .entry((asset.clone(), key_ref))
            .or_default()
            .clone()
    }

    fn request(&self, asset: &AssetId, ctx: &EncryptionContext) -> LicenseRequest {
        LicenseRequest {
            asset: asset.clone(),
            key_id: ctx.key_id.clone(),
            scheme: ctx.scheme,
            key_uri: ctx.key_uri.clone(),
            init_data: ctx.init_data.clone(),
            device: self.device.clone(),
            now: self.now(),
        }
    }

    /// Writes every record of `asset` to the store. Records of a forgotten
    /// asset are never written again.
    async fn save(&self, asset: &AssetId, key_ref: &str, record: &LicenseRecord) {
        let Some(store) = self.store.get() else {
            return;
        };
        let _guard = self.save_lock.lock().await;
        let forgotten = !self
            .slots
            .lock()
            .contains_key(&(asset.clone(), key_ref.to_string()));
        if forgotten {
            return;
        }
        let records: Vec<SavedLicense> = {
            let mut saved = self.saved.lock();
            let records = saved.entry(asset.clone()).or_default();
            records.insert(
                key_ref.to_string(),
                SavedLicense::new(key_ref, record, self.sealing.as_ref()),
            );
            records.values().cloned().collect()
        };
        match store.write_licenses(asset, &records).await {
            Ok(()) => tracing::debug!(%asset, records = records.len(), "License records saved."),
            Err(e) => tracing::warn!(%asset, "Failed to save license records: {e}"),
        }
    }

    /// Moves the check time of `record` forward, saving it once it ran far
    /// enough ahead of the saved copy.
    async fn touch(
        &self,
        asset: &AssetId,
        key_ref: &str,
        record: &mut LicenseRecord,
        now: DateTime<Utc>,
    ) {
        record.checked_at = record.checked_at.max(now);
        if record.checked_at - record.saved_check >= TimeDelta::seconds(CHECK_SAVE_SECONDS) {
            record.saved_check = record.checked_at;
            self.save(asset, key_ref, record).await;
        }
    }

    /// Loads the saved license records of `asset` and returns how many were
    /// found.
    pub async fn restore(&self, asset: &AssetId) -> KuraResult<usize> {
        let Some(store) = self.store.get() else {
            return Ok(0);
        };
        let Some(saved) = store.read_licenses::<Vec<SavedLicense>>(asset).await? else {
            return Ok(0);
        };

        let mut restored = 0;
        for license in saved {
            self.raise_floor(license.checked_at);
            let record = match license.to_record(self.sealing.as_ref()) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(%asset, key = %license.key_ref, "Saved key does not unseal: {e}");
                    LicenseRecord {
                        key: None,
                        ..license.to_record(None)?
                    }
                }
            };
            let key_ref = license.key_ref.clone();
            *self.slot(asset, key_ref.clone()).lock().await = Some(record);
            self.saved
                .lock()
                .entry(asset.clone())
                .or_default()
                .insert(key_ref, license);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(%asset, restored, "License records restored.");
        }
        Ok(restored)
    }

    /// Returns a valid key for `ctx`. The first call for a key performs the
    /// license exchange; an expired license is renewed once.
    pub async fn acquire_key(
        &self,
        asset: &AssetId,
        ctx: &EncryptionContext,
    ) -> KuraResult<KeyMaterial> {
        let key_ref = ctx.key_ref();
        let slot = self.slot(asset, key_ref.clone());
        let mut record = slot.lock().await;

        let now = self.now();
        if let Some(r) = record.as_mut() {
            self.touch(asset, &key_ref, r, now).await;
            if let Some(key) = r.key.as_ref().filter(|_| !r.is_expired(now)) {
                return Ok(key.clone());
            }
        }
        match record.as_ref() {
            Some(r) if !r.is_expired(now) => {
                // restored without its key: fetched again under the saved terms
                let grant = self.client.acquire(&self.request(asset, ctx)).await?;
                let mut refetched = LicenseRecord::from_grant(grant, now);
                refetched.acquired_at = r.acquired_at;
                refetched.expires_at = earliest(r.expires_at, refetched.expires_at);
                refetched.renewable &= r.renewable;
                tracing::info!(%asset, key = %key_ref, "Key of a restored license fetched again.");
                self.save(asset, &key_ref, &refetched).await;
                let key = refetched.key.clone();
                *record = Some(refetched);
                key.ok_or(KuraError::LicenseExpired(key_ref))
            }
            Some(r) => {
                tracing::info!(
                    %asset,
                    key = %key_ref,
                    acquired_at = %r.acquired_at,
                    "License expired."
                );
                if !r.renewable {
                    return Err(KuraError::LicenseExpired(key_ref));
                }
                match self.client.renew(&self.request(asset, ctx)).await {
                    Ok(grant) => {
                        let renewed = LicenseRecord::from_grant(grant, now);
                        if renewed.is_expired(self.now()) {
                            return Err(KuraError::LicenseExpired(key_ref));
                        }
                        tracing::info!(%asset, key = %key_ref, "License renewed.");
                        self.save(asset, &key_ref, &renewed).await;
                        let key = renewed.key.clone();
                        *record = Some(renewed);
                        key.ok_or(KuraError::LicenseExpired(key_ref))
                    }
                    Err(e) => {
                        tracing::warn!(%asset, key = %key_ref, "Failed to renew license: {e}");
                        Err(KuraError::LicenseExpired(key_ref))
                    }
                }
            }
            None => {
                let grant = self.client.acquire(&self.request(asset, ctx)).await?;
                let acquired = LicenseRecord::from_grant(grant, now);
                if acquired.is_expired(self.now()) {
                    return Err(KuraError::LicenseExpired(key_ref));
                }
                tracing::info!(
                    %asset,
                    key = %key_ref,
                    expires_at = ?acquired.expires_at,
                    "License acquired."
                );
                self.save(asset, &key_ref, &acquired).await;
                let key = acquired.key.clone();
                *record = Some(acquired);
                key.ok_or(KuraError::LicenseExpired(key_ref))
            }
        }
    }

    /// Validates the license of `ctx` without touching any data.
    pub async fn check(&self, asset: &AssetId, ctx: &EncryptionContext) -> KuraResult<()> {
        self.acquire_key(asset, ctx).await.map(|_| ())
    }

    /// Makes stored bytes playable. AES-128 segments are decrypted, schemes
    /// the player decrypts pass through once their license is valid.
    pub async fn decrypt(
        &self,
        asset: &AssetId,
        ctx: &EncryptionContext,
        data: Bytes,
    ) -> KuraResult<Bytes> {
        let key = self.acquire_key(asset, ctx).await?;
        match ctx.scheme {
            EncryptionScheme::Aes128 => {
                let key: &[u8; 16] = key.bytes().try_into().map_err(|_| {
                    KuraError::LicenseDenied(format!(
                        "AES-128 key has {} bytes, expected 16",
                        key.len()
                    ))
                })?;
                let iv = ctx.iv.unwrap_or_default();
                let decrypted = cbc::Decryptor::<aes::Aes128>::new(key.into(), (&iv).into())
                    .decrypt_padded_vec_mut::<Pkcs7>(&data)?;
                Ok(decrypted.into())
            }
            _ => Ok(data),
        }
    }

    /// Drops every license record of `asset`. The saved copy goes with the
    /// asset when the store removes it.
    pub async fn forget(&self, asset: &AssetId) {
        let _guard = self.save_lock.lock().await;
        self.saved.lock().remove(asset);
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|(a, _), _| a != asset);
        let removed = before - slots.len();
        if removed > 0 {
            tracing::debug!(%asset, removed, "License records dropped.");
        }
    }

    pub fn has_license(&self, asset: &AssetId) -> bool {
        self.slots.lock().keys().any(|(a, _)| a == asset)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use aes::cipher::BlockEncryptMut;
    use async_trait::async_trait;
    use chrono::TimeDelta;

    use super::*;
    use crate::license::ManualClock;

    struct CountingClient {
        acquired: AtomicUsize,
        renewed: AtomicUsize,
        renew_fails: bool,
    }

    impl CountingClient {
        fn new(renew_fails: bool) -> Self {
            Self {
                acquired: AtomicUsize::new(0),
                renewed: AtomicUsize::new(0),
                renew_fails,
            }
        }
    }

    #[async_trait]
    impl LicenseClient for CountingClient {
        async fn acquire(&self, request: &LicenseRequest) -> KuraResult<LicenseGrant> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(LicenseGrant {
                key: KeyMaterial::new(vec![1; 16]),
                expires_at: Some(request.now + TimeDelta::hours(1)),
                renewable: true,
            })
        }

        async fn renew(&self, request: &LicenseRequest) -> KuraResult<LicenseGrant> {
            self.renewed.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.renew_fails {
                return Err(KuraError::LicenseDenied("subscription ended".into()));
            }
            Ok(LicenseGrant {
                key: KeyMaterial::new(vec![2; 16]),
                expires_at: Some(request.now + TimeDelta::hours(1)),
                renewable: true,
            })
        }
    }

    fn context() -> EncryptionContext {
        let mut ctx = EncryptionContext::new(EncryptionScheme::Cenc);
        ctx.key_id = Some("00112233445566778899aabbccddeeff".into());
        ctx
    }

    #[tokio::test]
    async fn test_concurrent_acquire_exchanges_once() {
        let client = Arc::new(CountingClient::new(false));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = Arc::new(KeyManager::new(client.clone(), clock.clone()));
        let asset = AssetId::new("a").unwrap();

        let (ctx_a, ctx_b) = (context(), context());
        let (a, b) = tokio::join!(
            manager.acquire_key(&asset, &ctx_a),
            manager.acquire_key(&asset, &ctx_b)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(client.acquired.load(Ordering::SeqCst), 1);

        // expired: renewed once, the concurrent caller sees the renewed key
        clock.advance(TimeDelta::hours(2));
        let (ctx_a, ctx_b) = (context(), context());
        let (a, b) = tokio::join!(
            manager.acquire_key(&asset, &ctx_a),
            manager.acquire_key(&asset, &ctx_b)
        );
        assert_eq!(a.unwrap().bytes(), &[2; 16]);
        assert_eq!(b.unwrap().bytes(), &[2; 16]);
        assert_eq!(client.renewed.load(Ordering::SeqCst), 1);
        assert_eq!(client.acquired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_renewal_is_expired() {
        let client = Arc::new(CountingClient::new(true));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = KeyManager::new(client.clone(), clock.clone());
        let asset = AssetId::new("a").unwrap();

        manager.check(&asset, &context()).await.unwrap();
        clock.advance(TimeDelta::hours(2));
        assert!(matches!(
            manager.check(&asset, &context()).await,
            Err(KuraError::LicenseExpired(_))
        ));

        manager.forget(&asset).await;
        assert!(!manager.has_license(&asset));
        // a fresh exchange after forgetting
        manager.check(&asset, &context()).await.unwrap();
        assert_eq!(client.acquired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_aes128_decrypt() {
        let client = Arc::new(CountingClient::new(false));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = KeyManager::new(client, clock);
        let asset = AssetId::new("a").unwrap();

        let mut ctx = EncryptionContext::new(EncryptionScheme::Aes128);
        ctx.iv = Some([7; 16]);
        let plain = b"segment payload that spans more than one block".to_vec();
        let encrypted = cbc::Encryptor::<aes::Aes128>::new(&[1u8; 16].into(), &[7u8; 16].into())
            .encrypt_padded_vec_mut::<Pkcs7>(&plain);

        let decrypted = manager
            .decrypt(&asset, &ctx, Bytes::from(encrypted))
            .await
            .unwrap();
        assert_eq!(decrypted.as_ref(), plain.as_slice());

        // player-decrypted schemes are left alone
        let data = Bytes::from_static(b"cenc sample");
        assert_eq!(manager.decrypt(&asset, &context(), data.clone()).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_records_survive_a_new_manager() {
        const SEALING: [u8; 16] = [9; 16];
        let store = Arc::new(SegmentStore::memory());
        let client = Arc::new(CountingClient::new(false));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let asset = AssetId::new("a").unwrap();
        let manager = |store: &Arc<SegmentStore>, sealing| {
            let manager = KeyManager::new(client.clone(), clock.clone()).sealing_key(sealing);
            manager.attach(store.clone());
            manager
        };

        manager(&store, Some(SEALING))
            .check(&asset, &context())
            .await
            .unwrap();
        let saved = store
            .read_licenses::<serde_json::Value>(&asset)
            .await
            .unwrap()
            .unwrap()
            .to_string();
        assert!(!saved.contains(&hex::encode([1u8; 16])));

        let restarted = manager(&store, Some(SEALING));
        assert_eq!(restarted.restore(&asset).await.unwrap(), 1);
        assert_eq!(
            restarted.acquire_key(&asset, &context()).await.unwrap().bytes(),
            &[1; 16]
        );
        assert_eq!(client.acquired.load(Ordering::SeqCst), 1);

        // without the sealing key the key is fetched again, the expiry stays
        let unsealed = manager(&store, None);
        unsealed.restore(&asset).await.unwrap();
        unsealed.check(&asset, &context()).await.unwrap();
        assert_eq!(client.acquired.load(Ordering::SeqCst), 2);

        // expired across the restart: renewed, not acquired from scratch
        clock.advance(TimeDelta::hours(2));
        restarted.check(&asset, &context()).await.unwrap();
        assert_eq!(client.renewed.load(Ordering::SeqCst), 1);
        assert_eq!(client.acquired.load(Ordering::SeqCst), 2);

        restarted.forget(&asset).await;
        store.delete_asset(&asset).await.unwrap();
        assert_eq!(manager(&store, None).restore(&asset).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clock_rollback_does_not_revive_a_license() {
        let store = Arc::new(SegmentStore::memory());
        let client = Arc::new(CountingClient::new(true));
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let asset = AssetId::new("a").unwrap();

        let manager = KeyManager::new(client.clone(), clock.clone());
        manager.attach(store.clone());
        manager.check(&asset, &context()).await.unwrap();
        clock.advance(TimeDelta::hours(2));
        assert!(matches!(
            manager.check(&asset, &context()).await,
            Err(KuraError::LicenseExpired(_))
        ));

        clock.set(start);
        assert!(manager.now() >= start + TimeDelta::hours(2));
        assert!(matches!(
            manager.check(&asset, &context()).await,
            Err(KuraError::LicenseExpired(_))
        ));

        // a restarted manager starts from the last saved check
        let manager = KeyManager::new(client, Arc::new(ManualClock::new(start)));
        manager.attach(store);
        manager.restore(&asset).await.unwrap();
        assert!(matches!(
            manager.check(&asset, &context()).await,
            Err(KuraError::LicenseExpired(_))
        ));
    }
}
