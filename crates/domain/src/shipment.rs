//! Shipment creation locks and provider linkage.
//!
//! A creation lock is a row keyed by order id that serializes calls to the
//! external shipment provider. It lives in the shared store so it survives
//! process crashes and can be released by a process other than its acquirer.

use chrono::{DateTime, Duration, Utc};
use common::OrderId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Opaque single-use token proving ownership of a creation lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CreationToken(Uuid);

impl CreationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CreationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CreationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock status.
///
/// ```text
/// (none) ──► Locked ──┬──► Done
///              ▲      └──► Failed ──► Locked (after re-acquire)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Locked,
    Failed,
    Done,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Locked => "locked",
            LockStatus::Failed => "failed",
            LockStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LockStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "locked" => Ok(LockStatus::Locked),
            "failed" => Ok(LockStatus::Failed),
            "done" => Ok(LockStatus::Done),
            other => Err(DomainError::UnknownStatus {
                kind: "lock status",
                value: other.to_string(),
            }),
        }
    }
}

/// A per-order coordination record for shipment creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationLock {
    pub order_id: OrderId,
    pub creation_token: CreationToken,
    pub status: LockStatus,
    pub lock_acquired_at: DateTime<Utc>,
    pub lock_ttl: Duration,
}

impl CreationLock {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.lock_acquired_at + self.lock_ttl
    }

    /// Returns true if the lock is held and its TTL has not elapsed.
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.status == LockStatus::Locked && self.expires_at() > now
    }
}

/// Identifiers the provider returned for a created shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentLinkage {
    pub shipment_order_id: String,
    pub shipment_id: String,
    pub awb_code: Option<String>,
}

/// Result of trying to acquire a creation lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The caller owns the lock and must finalize or fail it with this token.
    Acquired(CreationToken),
    /// The order already carries provider identifiers.
    AlreadyExists(ShipmentLinkage),
    /// Another caller holds an unexpired lock.
    InProgress,
    /// No order with that id exists.
    OrderMissing,
}
