//! Lease-based ownership of processors across running instances.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::InstanceId;
use serde::{Deserialize, Serialize};

use crate::{Checkpoint, ProcessorKey, Result};

/// Lease used when the caller does not choose one.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Request to take (or refresh) ownership of a processor.
#[derive(Debug, Clone)]
pub struct TryAcquireLock {
    pub key: ProcessorKey,
    /// Hashed into the numeric advisory lock id.
    pub lock_key: String,
    pub instance_id: InstanceId,
    /// An owner silent for longer than this can be replaced.
    pub lease_timeout: Duration,
}

impl TryAcquireLock {
    pub fn new(key: ProcessorKey, instance_id: InstanceId) -> Self {
        Self {
            lock_key: key.to_string(),
            key,
            instance_id,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    pub fn lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn lock_key(mut self, lock_key: impl Into<String>) -> Self {
        self.lock_key = lock_key.into();
        self
    }
}

/// Outcome of a lock attempt; carries the checkpoint to resume from when acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAcquisition {
    pub acquired: bool,
    pub checkpoint: Option<Checkpoint>,
}

impl LockAcquisition {
    pub fn acquired(checkpoint: Option<Checkpoint>) -> Self {
        Self {
            acquired: true,
            checkpoint,
        }
    }

    pub fn not_acquired() -> Self {
        Self {
            acquired: false,
            checkpoint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorStatus {
    Running,
    Stopped,
}

impl ProcessorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorStatus::Running => "running",
            ProcessorStatus::Stopped => "stopped",
        }
    }
}

/// Who owns a processor and when they last proved to be alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipRecord {
    pub instance_id: InstanceId,
    pub status: ProcessorStatus,
    pub last_updated: DateTime<Utc>,
}

impl OwnershipRecord {
    /// Whether `instance_id` may take this record over at `now`.
    pub fn can_be_taken_by(
        &self,
        instance_id: InstanceId,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> bool {
        if self.instance_id == instance_id || self.status == ProcessorStatus::Stopped {
            return true;
        }
        match chrono::Duration::from_std(lease_timeout) {
            Ok(lease) => now.signed_duration_since(self.last_updated) > lease,
            // a lease too long to represent never expires
            Err(_) => false,
        }
    }
}

/// Advisory mutual exclusion over processors, with lease expiry.
#[async_trait]
pub trait ProcessorLock: Send + Sync {
    /// Succeeds if the processor is free, already owned by this instance (which
    /// refreshes the lease) or owned by an instance whose lease went stale.
    async fn try_acquire(&self, request: TryAcquireLock) -> Result<LockAcquisition>;

    /// Marks the processor stopped if `instance_id` still owns it.
    async fn release(
        &self,
        key: &ProcessorKey,
        lock_key: &str,
        instance_id: InstanceId,
    ) -> Result<bool>;
}

/// Source of "now" for lease bookkeeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(instance_id: InstanceId, status: ProcessorStatus, at: DateTime<Utc>) -> OwnershipRecord {
        OwnershipRecord {
            instance_id,
            status,
            last_updated: at,
        }
    }

    #[test]
    fn owner_can_always_refresh() {
        let clock = ManualClock::default();
        let owner = InstanceId::new();
        let record = record(owner, ProcessorStatus::Running, clock.now());
        assert!(record.can_be_taken_by(owner, clock.now(), DEFAULT_LEASE_TIMEOUT));
    }

    #[test]
    fn other_instance_waits_for_lease_expiry() {
        let clock = ManualClock::default();
        let record = record(InstanceId::new(), ProcessorStatus::Running, clock.now());
        let other = InstanceId::new();

        clock.advance(Duration::from_secs(299));
        assert!(!record.can_be_taken_by(other, clock.now(), DEFAULT_LEASE_TIMEOUT));

        clock.advance(Duration::from_secs(2));
        assert!(record.can_be_taken_by(other, clock.now(), DEFAULT_LEASE_TIMEOUT));
    }

    #[test]
    fn stopped_processor_is_free() {
        let clock = ManualClock::default();
        let record = record(InstanceId::new(), ProcessorStatus::Stopped, clock.now());
        assert!(record.can_be_taken_by(InstanceId::new(), clock.now(), DEFAULT_LEASE_TIMEOUT));
    }

    #[test]
    fn try_acquire_defaults() {
        let key = ProcessorKey::new("carts");
        let request = TryAcquireLock::new(key.clone(), InstanceId::new());
        assert_eq!(request.lock_key, "global:carts:v1");
        assert_eq!(request.lease_timeout, Duration::from_secs(300));
    }
}
