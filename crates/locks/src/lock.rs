//! Lease records and the conflict matrix

use chrono::{DateTime, Duration, Utc};
use ontos_core::{LockConfig, LockId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of work a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockKind {
    /// Search-index rebuild
    Indexing,
    /// Operational maintenance
    Maintenance,
    /// Schema migration
    Migration,
    /// Backup in progress
    Backup,
    /// Operator-held lock
    Manual,
}

impl LockKind {
    /// Default lease duration for this kind.
    pub fn default_ttl(&self, config: &LockConfig) -> Duration {
        let secs = match self {
            LockKind::Indexing => config.indexing_ttl_secs,
            LockKind::Maintenance => config.maintenance_ttl_secs,
            LockKind::Migration => config.migration_ttl_secs,
            LockKind::Backup => config.backup_ttl_secs,
            LockKind::Manual => config.manual_ttl_secs,
        };
        Duration::seconds(secs as i64)
    }

    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::Indexing => "INDEXING",
            LockKind::Maintenance => "MAINTENANCE",
            LockKind::Migration => "MIGRATION",
            LockKind::Backup => "BACKUP",
            LockKind::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Breadth of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockScope {
    /// Whole branch
    Branch,
    /// One resource type within the branch
    ResourceType,
    /// One specific resource
    Resource,
}

/// Why a lock was released. Recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Holder released it normally
    Released,
    /// Lease expired and auto-release was on
    TtlExpired,
    /// Heartbeats stopped beyond the grace window
    HeartbeatMissed,
    /// Branch entered ERROR state
    ErrorState,
    /// Administrative force unlock
    ForceUnlock,
}

impl ReleaseReason {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Released => "RELEASED",
            ReleaseReason::TtlExpired => "TTL_EXPIRED",
            ReleaseReason::HeartbeatMissed => "HEARTBEAT_MISSED",
            ReleaseReason::ErrorState => "ERROR_STATE",
            ReleaseReason::ForceUnlock => "FORCE_UNLOCK",
        }
    }
}

/// A lease on a branch or resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    /// Lease id
    pub id: LockId,
    /// Branch the lock lives on
    pub branch: String,
    /// What work it protects
    pub kind: LockKind,
    /// How broad it is
    pub scope: LockScope,
    /// Resource type, for `ResourceType` and `Resource` scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Resource id, for `Resource` scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Who holds the lease
    pub holder: String,
    /// Why it was taken
    pub reason: String,
    /// When it was acquired
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses
    pub expires_at: DateTime<Utc>,
    /// Heartbeat period in seconds; 0 disables heartbeating
    pub heartbeat_interval_secs: u64,
    /// Last heartbeat received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Service that sent the last heartbeat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_source: Option<String>,
    /// Whether sweepers may release this lock
    pub auto_release: bool,
}

impl Lock {
    /// The conflict matrix. Two locks conflict iff they are on the same
    /// branch AND:
    /// - either has `Branch` scope, OR
    /// - both are `ResourceType` with the same resource type, OR
    /// - both are `Resource` with the same (resource_type, resource_id).
    ///
    /// Different resource types at `ResourceType` scope never conflict,
    /// which is what allows concurrent indexing of `object_type` and
    /// `link_type` on one branch.
    pub fn conflicts_with(&self, other: &Lock) -> bool {
        if self.branch != other.branch {
            return false;
        }
        if self.scope == LockScope::Branch || other.scope == LockScope::Branch {
            return true;
        }
        if self.scope == LockScope::ResourceType
            && other.scope == LockScope::ResourceType
            && self.resource_type == other.resource_type
        {
            return true;
        }
        if self.scope == LockScope::Resource
            && other.scope == LockScope::Resource
            && self.resource_type == other.resource_type
            && self.resource_id == other.resource_id
        {
            return true;
        }
        false
    }

    /// Lease lapsed by TTL
    pub fn ttl_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Heartbeats stopped beyond the grace window.
    ///
    /// Locks without heartbeating (`heartbeat_interval_secs == 0`) never
    /// expire this way. A lock that never heartbeated is measured from its
    /// acquisition time.
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, grace: u32) -> bool {
        if self.heartbeat_interval_secs == 0 {
            return false;
        }
        let last = self.last_heartbeat.unwrap_or(self.acquired_at);
        let allowed = Duration::seconds((self.heartbeat_interval_secs * grace as u64) as i64);
        now - last > allowed
    }

    /// A lock is live iff its TTL has not lapsed and its heartbeats (when
    /// enabled) are within the grace window.
    pub fn is_live(&self, now: DateTime<Utc>, grace: u32) -> bool {
        !self.ttl_expired(now) && !self.heartbeat_expired(now, grace)
    }

    /// True if this lock freezes writes to the given resource type.
    pub fn covers_resource_type(&self, resource_type: Option<&str>) -> bool {
        match self.scope {
            LockScope::Branch => true,
            LockScope::ResourceType => match (self.resource_type.as_deref(), resource_type) {
                (Some(mine), Some(theirs)) => mine == theirs,
                // A resource-type lock blocks writes of unknown type
                (Some(_), None) => true,
                _ => false,
            },
            // Single-resource locks don't freeze whole types
            LockScope::Resource => false,
        }
    }
}

/// Parameters for a lock acquisition.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Branch to lock
    pub branch: String,
    /// Kind of work
    pub kind: LockKind,
    /// Scope
    pub scope: LockScope,
    /// Resource type (required for `ResourceType`/`Resource` scopes)
    pub resource_type: Option<String>,
    /// Resource id (required for `Resource` scope)
    pub resource_id: Option<String>,
    /// Holder identity
    pub holder: String,
    /// Why
    pub reason: String,
    /// Lease duration; kind default when omitted
    pub ttl: Option<Duration>,
    /// Heartbeat period; heartbeating disabled when omitted
    pub heartbeat_interval: Option<Duration>,
    /// Whether sweepers may release this lock
    pub auto_release: bool,
}

impl AcquireRequest {
    /// Request with required fields; everything else defaulted.
    pub fn new(
        branch: impl Into<String>,
        kind: LockKind,
        scope: LockScope,
        holder: impl Into<String>,
    ) -> Self {
        AcquireRequest {
            branch: branch.into(),
            kind,
            scope,
            resource_type: None,
            resource_id: None,
            holder: holder.into(),
            reason: "Lock acquired".to_string(),
            ttl: None,
            heartbeat_interval: None,
            auto_release: true,
        }
    }

    /// Target a resource type
    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Target a specific resource
    pub fn resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Override the reason
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Override the lease duration
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Enable heartbeating with the given period
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Keep the lock out of sweeper reach
    pub fn no_auto_release(mut self) -> Self {
        self.auto_release = false;
        self
    }
}

/// Heartbeat health classification for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatHealth {
    /// Last heartbeat within one interval
    Healthy,
    /// Behind by more than one interval but within grace
    Warning,
    /// Beyond the grace window
    Critical,
    /// Heartbeating disabled
    Disabled,
}

/// Point-in-time health report for a lock.
#[derive(Debug, Clone)]
pub struct LockHealth {
    /// Lock id
    pub lock_id: LockId,
    /// Heartbeat classification
    pub heartbeat: HeartbeatHealth,
    /// Seconds since the last heartbeat (None when disabled)
    pub seconds_since_heartbeat: Option<i64>,
    /// Seconds until the TTL lapses (0 when already lapsed)
    pub seconds_until_expiry: i64,
    /// TTL already lapsed
    pub ttl_expired: bool,
    /// Heartbeats already beyond grace
    pub heartbeat_expired: bool,
    /// Whether sweepers may release it
    pub auto_release: bool,
}

impl LockHealth {
    /// Compute a health report for a lock at `now`.
    pub fn assess(lock: &Lock, now: DateTime<Utc>, grace: u32) -> Self {
        let (heartbeat, seconds_since_heartbeat) = if lock.heartbeat_interval_secs == 0 {
            (HeartbeatHealth::Disabled, None)
        } else {
            let last = lock.last_heartbeat.unwrap_or(lock.acquired_at);
            let elapsed = (now - last).num_seconds();
            let health = if elapsed <= lock.heartbeat_interval_secs as i64 {
                HeartbeatHealth::Healthy
            } else if !lock.heartbeat_expired(now, grace) {
                HeartbeatHealth::Warning
            } else {
                HeartbeatHealth::Critical
            };
            (health, Some(elapsed))
        };

        LockHealth {
            lock_id: lock.id,
            heartbeat,
            seconds_since_heartbeat,
            seconds_until_expiry: (lock.expires_at - now).num_seconds().max(0),
            ttl_expired: lock.ttl_expired(now),
            heartbeat_expired: lock.heartbeat_expired(now, grace),
            auto_release: lock.auto_release,
        }
    }
}
