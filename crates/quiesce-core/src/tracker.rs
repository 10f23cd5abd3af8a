//! Tracking of ad-hoc application activity.
//!
//! Not everything that makes the UI transient deserves a named idling
//! resource. A dispatched closure, a one-off animation or a single request can
//! be tracked here instead: [`AppStateTracker::track_activity`] hands back an
//! [`ActivityId`], and the app is idle (as far as the tracker is concerned)
//! once every id has been untracked again.
//!
//! The tracked set is guarded by a mutex and mirrored into an atomic pending
//! counter that is updated under the same lock. Off-thread readers such as
//! the driver-side idle poll read only that counter, so they always observe a
//! value the set actually had.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

use crate::idling::BusyResource;

/// Identifier of a tracked activity. Allocated ids increase monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(pub u64);

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a tracked activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Pending,
    Completed,
}

/// One in-flight unit of application work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedActivity {
    pub id: ActivityId,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub status: ActivityStatus,
}

/// Errors raised by the tracker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackingError {
    /// The id is already tracked and has not completed.
    #[error("invalid tracking state: activity {id} ({kind}) is already being tracked")]
    InvalidTrackingState { id: ActivityId, kind: String },
}

/// The set of in-flight activities.
#[derive(Debug)]
pub struct AppStateTracker {
    next_id: AtomicU64,
    pending: AtomicUsize,
    activities: Mutex<BTreeMap<ActivityId, TrackedActivity>>,
}

impl Default for AppStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStateTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            activities: Mutex::new(BTreeMap::new()),
        }
    }

    /// Starts tracking a new activity of the given kind.
    pub fn track_activity(&self, kind: impl Into<String>) -> Result<ActivityId, TrackingError> {
        let id = ActivityId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.track_activity_with_id(id, kind)
    }

    /// Starts tracking an activity under a caller-chosen id.
    ///
    /// Fails with [`TrackingError::InvalidTrackingState`] if `id` is still
    /// pending. Later allocated ids are kept above `id`.
    pub fn track_activity_with_id(
        &self,
        id: ActivityId,
        kind: impl Into<String>,
    ) -> Result<ActivityId, TrackingError> {
        let kind = kind.into();
        let mut activities = self.activities.lock();
        if let Some(existing) = activities.get(&id) {
            warn!(id = %id, kind = %existing.kind, "activity tracked twice");
            return Err(TrackingError::InvalidTrackingState {
                id,
                kind: existing.kind.clone(),
            });
        }
        self.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
        trace!(id = %id, kind = %kind, "tracking activity");
        activities.insert(
            id,
            TrackedActivity {
                id,
                kind,
                created_at: Utc::now(),
                status: ActivityStatus::Pending,
            },
        );
        self.pending.store(activities.len(), Ordering::SeqCst);
        Ok(id)
    }

    /// Tracks an activity for as long as the returned guard lives.
    pub fn track_scoped(&self, kind: impl Into<String>) -> Result<ActivityGuard<'_>, TrackingError> {
        let id = self.track_activity(kind)?;
        Ok(ActivityGuard { tracker: self, id })
    }

    /// Stops tracking `id` and returns the completed activity.
    ///
    /// Unknown ids are a no-op that is logged as an anomaly.
    pub fn untrack_activity(&self, id: ActivityId) -> Option<TrackedActivity> {
        let mut activities = self.activities.lock();
        let removed = activities.remove(&id);
        self.pending.store(activities.len(), Ordering::SeqCst);
        drop(activities);

        match removed {
            Some(mut activity) => {
                trace!(id = %id, kind = %activity.kind, "activity completed");
                activity.status = ActivityStatus::Completed;
                Some(activity)
            }
            None => {
                warn!(id = %id, "untracking an activity that is not tracked");
                None
            }
        }
    }

    /// Returns `true` if nothing is tracked.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    /// Number of pending activities.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Kinds of all pending activities, oldest id first.
    pub fn active_activity_kinds(&self) -> Vec<String> {
        self.activities
            .lock()
            .values()
            .map(|activity| activity.kind.clone())
            .collect()
    }

    /// Copy of every pending activity, oldest id first.
    pub fn activities(&self) -> Vec<TrackedActivity> {
        self.activities.lock().values().cloned().collect()
    }

    /// Pending activities in the shared diagnostic shape.
    pub fn busy_resources(&self) -> Vec<BusyResource> {
        self.activities
            .lock()
            .values()
            .map(|activity| BusyResource::new(format!("{} #{}", activity.kind, activity.id), "activity"))
            .collect()
    }

    /// Forgets every pending activity.
    pub fn clear(&self) {
        let mut activities = self.activities.lock();
        activities.clear();
        self.pending.store(0, Ordering::SeqCst);
    }
}

/// Scope guard returned by [`AppStateTracker::track_scoped`].
#[must_use = "the activity is untracked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ActivityGuard<'a> {
    tracker: &'a AppStateTracker,
    id: ActivityId,
}

impl ActivityGuard<'_> {
    pub fn id(&self) -> ActivityId {
        self.id
    }
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.tracker.untrack_activity(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tracker_is_idle() {
        let tracker = AppStateTracker::new();
        assert!(tracker.is_idle());
        assert!(tracker.active_activity_kinds().is_empty());
    }

    #[test]
    fn track_and_untrack() {
        let tracker = AppStateTracker::new();
        let id = tracker.track_activity("dispatch").unwrap();
        assert!(!tracker.is_idle());
        assert_eq!(tracker.active_activity_kinds(), vec!["dispatch"]);

        let done = tracker.untrack_activity(id).unwrap();
        assert_eq!(done.status, ActivityStatus::Completed);
        assert_eq!(done.kind, "dispatch");
        assert!(tracker.is_idle());
    }

    #[test]
    fn ids_increase_monotonically() {
        let tracker = AppStateTracker::new();
        let a = tracker.track_activity("a").unwrap();
        let b = tracker.track_activity("b").unwrap();
        tracker.untrack_activity(a);
        let c = tracker.track_activity("c").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn reusing_an_active_id_fails() {
        let tracker = AppStateTracker::new();
        let id = tracker.track_activity_with_id(ActivityId(7), "network").unwrap();
        let err = tracker.track_activity_with_id(id, "animation").unwrap_err();
        assert_eq!(
            err,
            TrackingError::InvalidTrackingState {
                id: ActivityId(7),
                kind: "network".to_string(),
            }
        );
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn completed_id_may_be_tracked_again() {
        let tracker = AppStateTracker::new();
        tracker.track_activity_with_id(ActivityId(3), "a").unwrap();
        tracker.untrack_activity(ActivityId(3));
        assert!(tracker.track_activity_with_id(ActivityId(3), "a").is_ok());
    }

    #[test]
    fn allocated_ids_skip_external_ids() {
        let tracker = AppStateTracker::new();
        tracker.track_activity_with_id(ActivityId(10), "external").unwrap();
        let next = tracker.track_activity("local").unwrap();
        assert!(next > ActivityId(10));
    }

    #[test]
    fn untracking_unknown_id_is_noop() {
        let tracker = AppStateTracker::new();
        tracker.track_activity("a").unwrap();
        assert!(tracker.untrack_activity(ActivityId(999)).is_none());
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn scoped_guard_untracks_on_drop() {
        let tracker = AppStateTracker::new();
        {
            let guard = tracker.track_scoped("animation").unwrap();
            assert!(!tracker.is_idle());
            assert_eq!(tracker.activities()[0].id, guard.id());
        }
        assert!(tracker.is_idle());
    }

    #[test]
    fn busy_resources_report_activities() {
        let tracker = AppStateTracker::new();
        let id = tracker.track_activity("dispatch").unwrap();
        assert_eq!(
            tracker.busy_resources(),
            vec![BusyResource::new(format!("dispatch #{id}"), "activity")]
        );
    }

    #[test]
    fn clear_resets_pending_counter() {
        let tracker = AppStateTracker::new();
        tracker.track_activity("a").unwrap();
        tracker.track_activity("b").unwrap();
        tracker.clear();
        assert!(tracker.is_idle());
        assert!(tracker.activities().is_empty());
    }
}
