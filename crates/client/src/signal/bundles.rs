//! Prekey bundle lookup.
//!
//! Fetching a peer's bundle is a server query and lives outside the session
//! layer. The repository only sees the [`BundleFetcher`] trait.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use protocol::crypto::PreKeyBundle;
use protocol::DeviceAddress;
use thiserror::Error;

/// Reason a bundle could not be obtained.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct BundleFetchError(pub String);

/// Looks up prekey bundles for devices without a session.
pub trait BundleFetcher: Send + Sync {
    /// Fetches a fresh bundle for `address`.
    ///
    /// Each call should return a bundle that has not been handed out before.
    fn fetch<'a>(
        &'a self,
        address: &'a DeviceAddress,
    ) -> Pin<Box<dyn Future<Output = Result<PreKeyBundle, BundleFetchError>> + Send + 'a>>;
}

/// Fetcher for offline use: every lookup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBundles;

impl BundleFetcher for NoBundles {
    fn fetch<'a>(
        &'a self,
        address: &'a DeviceAddress,
    ) -> Pin<Box<dyn Future<Output = Result<PreKeyBundle, BundleFetchError>> + Send + 'a>> {
        Box::pin(async move { Err(BundleFetchError(format!("no bundle source for {address}"))) })
    }
}

/// Fetcher backed by preloaded bundles; each fetch hands out the next one.
#[derive(Default)]
pub struct StaticBundles {
    bundles: Mutex<HashMap<DeviceAddress, VecDeque<PreKeyBundle>>>,
}

impl StaticBundles {
    /// Creates an empty fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a bundle for `address`.
    pub fn insert(&self, address: DeviceAddress, bundle: PreKeyBundle) {
        let mut bundles = self
            .bundles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bundles.entry(address).or_default().push_back(bundle);
    }

    /// Number of bundles still queued for `address`.
    pub fn remaining(&self, address: &DeviceAddress) -> usize {
        let bundles = self
            .bundles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bundles.get(address).map_or(0, VecDeque::len)
    }
}

impl BundleFetcher for StaticBundles {
    fn fetch<'a>(
        &'a self,
        address: &'a DeviceAddress,
    ) -> Pin<Box<dyn Future<Output = Result<PreKeyBundle, BundleFetchError>> + Send + 'a>> {
        let next = self
            .bundles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(address)
            .and_then(VecDeque::pop_front);
        Box::pin(async move {
            next.ok_or_else(|| BundleFetchError(format!("no bundle available for {address}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::LocalIdentity;

    #[tokio::test]
    async fn test_static_bundles_hand_out_once() {
        let fetcher = StaticBundles::new();
        let address = DeviceAddress::new("15550001111", 0);
        let local = LocalIdentity::generate(1, 0);
        fetcher.insert(address.clone(), local.bundle(None));
        assert_eq!(fetcher.remaining(&address), 1);

        assert!(fetcher.fetch(&address).await.is_ok());
        let err = fetcher.fetch(&address).await.unwrap_err();
        assert!(err.to_string().contains("15550001111.0"));
    }

    #[tokio::test]
    async fn test_no_bundles_always_fails() {
        let address = DeviceAddress::new("a", 1);
        assert!(NoBundles.fetch(&address).await.is_err());
    }
}
