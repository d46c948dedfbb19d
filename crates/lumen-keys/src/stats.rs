//! Read-only statistics over an account's key material, for operators and
//! the external rotation scheduler.

use serde::Serialize;

/// Pre-key pool health relative to the configured low-water mark.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PoolHealth {
    Healthy,
    /// Below the low-water mark; replenishment is due.
    Low,
}

/// Freshness of the active signed pre-key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SignedPreKeyFreshness {
    Current,
    DueForRotation,
    /// No active signed pre-key exists (account not bootstrapped, or the
    /// store lost the record).
    Missing,
}

/// Snapshot of an account's key state. Contains no secret material and is
/// safe to log or export.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub has_identity: bool,
    pub unused_prekeys: usize,
    pub target_pool_size: usize,
    pub low_water_mark: usize,
    pub pool_health: PoolHealth,
    pub signed_prekey: SignedPreKeyFreshness,
}
