//! Availability probing of snapshot endpoints.

use async_trait::async_trait;
use tracing::debug;

use super::guard::Endpoint;

/// Decides whether a storage endpoint can currently be used.
///
/// Implementations never fail: any error counts as "unavailable". They must
/// not modify the snapshot.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    /// Returns true if the endpoint is reachable and writable.
    async fn is_available(&self, endpoint: &Endpoint) -> bool;
}

/// Probe that asks the endpoint's store to check itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreProbe;

#[async_trait]
impl AvailabilityProbe for StoreProbe {
    async fn is_available(&self, endpoint: &Endpoint) -> bool {
        match endpoint.store().check_available().await {
            Ok(()) => true,
            Err(e) => {
                debug!("{} endpoint {} unavailable: {e}", endpoint.role(), endpoint.location());
                false
            }
        }
    }
}
