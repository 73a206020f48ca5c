//! Keys and licenses of encrypted assets.
//!
//! [`KeyManager`] is the only owner of key material. Licenses are acquired
//! through a [`LicenseClient`], cached per asset and key, and checked against
//! a [`SecureClock`] before any decryption.

mod client;
mod clock;
mod manager;

use std::{fmt, sync::Arc};

pub use client::{
    ChainedLicenseClient, KeyUriClient, LicenseClient, LicenseGrant, LicenseRequest,
    StaticKeyClient,
};
pub use clock::{AnchoredClock, ManualClock, SecureClock};
pub use manager::KeyManager;

/// Decryption key bytes. The bytes never leave the crate and are not printed.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Arc<[u8]>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial(<{} bytes>)", self.0.len())
    }
}
