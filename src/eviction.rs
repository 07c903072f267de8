//! Entry bookkeeping and the age/idle rules that remove entries from a pool

use std::time::{Duration, Instant, SystemTime};

/// Removal rules applied to free pool entries
///
/// # Examples
///
/// ```
/// use courier_core::EvictionPolicy;
/// use std::time::Duration;
///
/// let policy = EvictionPolicy {
///     expire_period: Some(Duration::from_secs(3600)),
///     idle_period: None,
/// };
/// assert!(policy.expires());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Hard age limit, measured from allocation
    pub expire_period: Option<Duration>,

    /// Idle time after which a free entry may be shrunk
    pub idle_period: Option<Duration>,
}

impl EvictionPolicy {
    pub fn expires(&self) -> bool {
        self.expire_period.is_some()
    }
}

/// One managed object plus its pool bookkeeping.
///
/// The object is moved out while the entry is checked out, so `object` is
/// `Some` exactly when the entry is free.
#[derive(Debug)]
pub(crate) struct PooledEntry<O> {
    pub id: usize,
    pub object: Option<O>,
    pub created_at: Instant,
    pub released_at: Instant,
    pub created_wall: SystemTime,
}

impl<O> PooledEntry<O> {
    pub fn new(id: usize, object: O) -> Self {
        let now = Instant::now();
        Self {
            id,
            object: Some(object),
            created_at: now,
            released_at: now,
            created_wall: SystemTime::now(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.object.is_some()
    }

    pub fn in_use(&self) -> bool {
        self.object.is_none()
    }

    /// Take the object out and mark the entry in use.
    pub fn capture(&mut self) -> Option<O> {
        self.object.take()
    }

    /// Put the object back and mark the entry free.
    pub fn release(&mut self, object: O) {
        self.object = Some(object);
        self.released_at = Instant::now();
    }

    /// Put a captured object back without touching its idle time.
    pub fn restore(&mut self, object: O) {
        self.object = Some(object);
    }

    pub fn is_expired(&self, policy: &EvictionPolicy, now: Instant) -> bool {
        policy
            .expire_period
            .is_some_and(|period| now.saturating_duration_since(self.created_at) > period)
    }

    pub fn is_obsolete(&self, policy: &EvictionPolicy, now: Instant) -> bool {
        self.is_free()
            && policy
                .idle_period
                .is_some_and(|period| now.saturating_duration_since(self.released_at) > period)
    }

    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            id: self.id,
            in_use: self.in_use(),
            age: self.created_at.elapsed(),
            idle: self.is_free().then(|| self.released_at.elapsed()),
            created: self.created_wall,
        }
    }
}

/// Diagnostic snapshot of a pool entry
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub id: usize,
    pub in_use: bool,
    pub age: Duration,
    /// Time since release, `None` while checked out
    pub idle: Option<Duration>,
    pub created: SystemTime,
}
