//! Per-identifier cache backing the [`Resolver`](super::Resolver).
//!
//! Uses a `DashMap` so that readers take a shard-local lock only for the
//! duration of copying a `ConnectionInfo` out, and the refresh task takes
//! an exclusive lock on the same shard only while swapping an entry.

use std::time::{Duration, SystemTime};

use dashmap::DashMap;

use crate::control_plane::ConnectionInfo;
use crate::error::ResolveError;
use crate::instance_id::InstanceId;

use super::REFRESH_SAFETY_MARGIN;

struct CacheEntry {
    result: Result<ConnectionInfo, ResolveError>,
    expires_at: SystemTime,
}

impl CacheEntry {
    fn is_fresh(&self, now: SystemTime) -> bool {
        self.result.is_ok() && self.expires_at > now
    }
}

pub(super) struct InstanceCache {
    entries: DashMap<InstanceId, CacheEntry>,
    refresh_tasks_started: DashMap<InstanceId, ()>,
}

impl InstanceCache {
    pub(super) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            refresh_tasks_started: DashMap::new(),
        }
    }

    pub(super) fn get_if_fresh(&self, id: &InstanceId) -> Option<ConnectionInfo> {
        let now = SystemTime::now();
        let entry = self.entries.get(id)?;
        if entry.is_fresh(now) {
            entry.result.as_ref().ok().cloned()
        } else {
            None
        }
    }

    /// True if the currently cached entry is a still-valid `ConnectionInfo`
    /// (used to decide whether a fresh refresh failure should be allowed to
    /// clobber it).
    pub(super) fn has_unexpired(&self, id: &InstanceId) -> bool {
        self.get_if_fresh(id).is_some()
    }

    pub(super) fn put(&self, id: InstanceId, result: Result<ConnectionInfo, ResolveError>) {
        let expires_at = match &result {
            Ok(info) => info.not_after,
            // An error entry is immediately expired: the next access (lazy
            // mode) or the next tick (background mode) retries right away.
            Err(_) => SystemTime::now(),
        };
        self.entries.insert(id, CacheEntry { result, expires_at });
    }

    /// How long a background refresh task should sleep before its next
    /// attempt: `not_after - REFRESH_SAFETY_MARGIN`, clamped to zero, or
    /// `None` if there is no valid entry to time against yet.
    pub(super) fn time_until_refresh(&self, id: &InstanceId) -> Option<Duration> {
        let entry = self.entries.get(id)?;
        let info = entry.result.as_ref().ok()?;
        let refresh_at = info
            .not_after
            .checked_sub(REFRESH_SAFETY_MARGIN)
            .unwrap_or(info.not_after);
        Some(
            refresh_at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Returns `true` the first time it is called for a given identifier,
    /// `false` on every subsequent call — lets the resolver spawn at most
    /// one background refresh task per identifier.
    pub(super) fn mark_task_started(&self, id: &InstanceId) -> bool {
        self.refresh_tasks_started.insert(id.clone(), ()).is_none()
    }
}
