// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! The primary's time-bound lease.
//!
//! A lease says "this node is primary until `expires_at`" (unix seconds).
//! Only the node named in `_cluster/PRIMARY` may renew or release it; both
//! operations re-read the marker first, so a node that silently lost the
//! primary role finds out the next time it touches its lease.

use std::sync::Arc;
use std::time::Duration;

use basalt_core::unix_secs;
use tracing::{debug, info};

use crate::error::{ClusterError, Result};
use crate::lock::{parse_lease, parse_primary, DistributedLock, LEASE, PRIMARY};

/// The primary's lease.
pub struct Lease {
    address: String,
    lock: Arc<dyn DistributedLock>,
    duration: Duration,
    low_water: Duration,
    expires_at: i64,
    renewed_at: i64,
}

impl Lease {
    /// Wraps a lease that was just written to the `LEASE` marker.
    pub fn new(
        address: impl Into<String>,
        lock: Arc<dyn DistributedLock>,
        duration: Duration,
        low_water: Duration,
        expires_at: i64,
    ) -> Self {
        Self {
            address: address.into(),
            lock,
            duration,
            low_water,
            expires_at,
            renewed_at: unix_secs(),
        }
    }

    /// Expiry in unix seconds.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Time of the last successful renewal in unix seconds.
    pub fn renewed_at(&self) -> i64 {
        self.renewed_at
    }

    /// Returns true once the expiry has passed.
    pub fn is_expired(&self) -> bool {
        unix_secs() > self.expires_at
    }

    /// Remaining lifetime, zero once expired.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.expires_at - unix_secs()).unwrap_or(0))
    }

    /// Returns true when the lease is still valid but close to expiring.
    pub fn should_renew(&self) -> bool {
        !self.is_expired() && self.ttl() < self.low_water
    }

    /// Extends the lease by its duration.
    ///
    /// Fails with [`ClusterError::LeaseExpired`] if it already expired, and
    /// with [`ClusterError::MarkerMismatch`] if `PRIMARY` no longer names
    /// this node; the caller must then give up the primary role. The new
    /// expiry is read back from disk before it is trusted.
    pub fn renew(&mut self) -> Result<()> {
        let (expires_at, renewed_at) = self.prepare_renewal()?.run()?;
        self.complete_renewal(expires_at, renewed_at);
        Ok(())
    }

    /// Starts a renewal whose marker I/O can run away from the lease.
    ///
    /// Fails with [`ClusterError::LeaseExpired`] if the lease already
    /// expired. Pass the result of [`LeaseRenewal::run`] to
    /// [`complete_renewal`](Self::complete_renewal).
    pub fn prepare_renewal(&self) -> Result<LeaseRenewal> {
        if self.is_expired() {
            return Err(ClusterError::LeaseExpired);
        }
        Ok(LeaseRenewal {
            address: self.address.clone(),
            lock: Arc::clone(&self.lock),
            duration: self.duration,
        })
    }

    /// Records a renewal that reached disk.
    pub fn complete_renewal(&mut self, expires_at: i64, renewed_at: i64) {
        self.expires_at = self.expires_at.max(expires_at);
        self.renewed_at = renewed_at;
        debug!(address = %self.address, expires_at = self.expires_at, "Lease renewed");
    }

    /// Gives up the lease, emptying `PRIMARY` and `LEASE`.
    ///
    /// Fails without touching either marker if `PRIMARY` names another node.
    pub fn release(&mut self) -> Result<()> {
        let mut primary =
            self.lock.try_lock(PRIMARY)?.ok_or(ClusterError::LockHeld(PRIMARY))?;
        self.verify_primary(&primary.read()?)?;

        let mut lease = self.lock.try_lock(LEASE)?.ok_or(ClusterError::LockHeld(LEASE))?;
        primary.truncate()?;
        lease.truncate()?;

        self.expires_at = 0;
        info!(address = %self.address, "Lease released");
        Ok(())
    }

    fn verify_primary(&self, raw: &[u8]) -> Result<()> {
        verify_primary(&self.address, raw)
    }
}

/// The blocking half of a lease renewal.
///
/// Takes the `LEASE` lock, checks that `PRIMARY` still names this node,
/// writes the new expiry and reads it back. Holds no reference to the
/// [`Lease`], so it can run on a blocking thread.
pub struct LeaseRenewal {
    address: String,
    lock: Arc<dyn DistributedLock>,
    duration: Duration,
}

impl LeaseRenewal {
    /// Performs the renewal, returning `(expires_at, renewed_at)`.
    pub fn run(self) -> Result<(i64, i64)> {
        let mut guard = self.lock.try_lock(LEASE)?.ok_or(ClusterError::LockHeld(LEASE))?;
        verify_primary(&self.address, &self.lock.read(PRIMARY)?)?;

        let now = unix_secs();
        let expires_at = now + self.duration.as_secs() as i64;
        guard.write(expires_at.to_string().as_bytes())?;

        let written = parse_lease(&guard.read()?)?;
        if written != Some(expires_at) {
            return Err(ClusterError::InvalidMarker {
                what: LEASE,
                reason: format!("wrote {expires_at}, read back {written:?}"),
            });
        }
        Ok((expires_at, now))
    }
}

fn verify_primary(address: &str, raw: &[u8]) -> Result<()> {
    match parse_primary(raw) {
        Some(found) if found == address => Ok(()),
        found => Err(ClusterError::MarkerMismatch {
            expected: address.to_string(),
            found: found.unwrap_or_default(),
        }),
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("address", &self.address)
            .field("expires_at", &self.expires_at)
            .field("renewed_at", &self.renewed_at)
            .finish()
    }
}

/// Returns the address of the primary if `PRIMARY` names one and `LEASE`
/// has not expired.
pub fn live_primary(lock: &dyn DistributedLock) -> Result<Option<String>> {
    let Some(address) = parse_primary(&lock.read(PRIMARY)?) else {
        return Ok(None);
    };
    match parse_lease(&lock.read(LEASE)?)? {
        Some(expires_at) if unix_secs() <= expires_at => Ok(Some(address)),
        _ => Ok(None),
    }
}
