//! Lock leases handed out by the priority queue.
//!
//! A lease is a time-bounded, token-authenticated claim on the head entry of
//! one discriminator lane. Holding the token is the only proof of ownership.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Opaque, high-entropy lease token (UUIDv4).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    /// Allocate a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl core::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for LeaseToken {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| CoreError::invalid_id(format!("LeaseToken: {e}")))
    }
}

/// The live lease on a discriminator lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockLease {
    pub discriminator: String,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    /// Grant a new lease expiring `expiration` after `now`.
    pub fn grant(discriminator: impl Into<String>, now: DateTime<Utc>, expiration: Duration) -> Self {
        Self {
            discriminator: discriminator.into(),
            token: LeaseToken::generate(),
            expires_at: expires_after(now, expiration),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Same token, pushed-out expiry.
    pub fn renew(&mut self, now: DateTime<Utc>, expiration: Duration) {
        self.expires_at = expires_after(now, expiration);
    }

    pub fn metadata(&self) -> LockMetadata {
        LockMetadata {
            discriminator: self.discriminator.clone(),
            token: self.token,
        }
    }
}

/// What a worker needs to renew, acknowledge, or defer its lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
    pub discriminator: String,
    pub token: LeaseToken,
}

fn expires_after(now: DateTime<Utc>, expiration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(expiration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
