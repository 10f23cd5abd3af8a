//! Process-scoped synchronization state.
//!
//! A [`SyncEngine`] bundles everything one process needs to synchronize with
//! its UI: the idling resource registry, the activity tracker, the UI thread
//! and the synchronizer in front of it. It is created explicitly at process
//! start and torn down explicitly with [`SyncEngine::shutdown`], so tests can
//! run side by side with engines of their own.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::idling::{BusyResource, IdlingResource, IdlingResourceRegistry};
use crate::synchronizer::{AppState, SyncError, Synchronizer};
use crate::tracker::AppStateTracker;
use crate::ui_thread::{UiHandle, UiThread};

/// The synchronization engine of one process.
pub struct SyncEngine {
    registry: Arc<IdlingResourceRegistry>,
    tracker: Arc<AppStateTracker>,
    synchronizer: Synchronizer,
    ui_thread: Option<UiThread>,
}

impl SyncEngine {
    /// Spawns the UI thread and starts with an empty registry and tracker.
    pub fn start(config: SyncConfig) -> std::io::Result<Self> {
        let ui_thread = UiThread::spawn()?;
        let registry = Arc::new(IdlingResourceRegistry::new());
        let tracker = Arc::new(AppStateTracker::new());
        let app = AppState::new(registry.clone(), tracker.clone());
        let synchronizer = Synchronizer::new(ui_thread.handle(), app, config);
        info!(
            poll_interval_ms = synchronizer.config().poll_interval_ms,
            synchronization_enabled = synchronizer.config().synchronization_enabled,
            "sync engine started"
        );
        Ok(Self {
            registry,
            tracker,
            synchronizer,
            ui_thread: Some(ui_thread),
        })
    }

    /// Registers an idling resource. Returns `true` if it replaced an
    /// existing registration with the same name.
    pub fn register_idling_resource<R: IdlingResource + 'static>(&self, resource: &Arc<R>) -> bool {
        self.registry.register(resource)
    }

    /// Removes the idling resource called `name`. Returns `false` if there
    /// was none.
    pub fn deregister_idling_resource(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    /// Runs `body` on the UI thread once the app is idle.
    ///
    /// This is the entry point for anything on the driver side that wants to
    /// look at or change UI state.
    pub async fn synchronize_and_run<F, T>(&self, body: F, timeout: Duration) -> Result<T, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.synchronizer.execute_sync(body, timeout).await
    }

    /// Everything keeping the app busy right now.
    pub fn currently_busy_resources(&self) -> Vec<BusyResource> {
        self.synchronizer.busy_resources()
    }

    pub fn is_idle(&self) -> bool {
        self.synchronizer.is_idle()
    }

    pub fn registry(&self) -> &Arc<IdlingResourceRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<AppStateTracker> {
        &self.tracker
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    /// Handle for posting application work to the UI thread.
    pub fn ui(&self) -> UiHandle {
        self.synchronizer.ui_handle().clone()
    }

    /// Forgets every registered resource and tracked activity.
    ///
    /// Meant for use between test runs that share an engine.
    pub fn reset(&self) {
        let resources = self.registry.len();
        let activities = self.tracker.pending_count();
        if activities > 0 {
            warn!(activities, "resetting with activities still pending");
        }
        self.registry.clear();
        self.tracker.clear();
        info!(resources, activities, "sync engine reset");
    }

    /// Clears all state and stops the UI thread. Tasks still queued fail
    /// with [`SyncError::UiThreadStopped`].
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(ui_thread) = self.ui_thread.take() {
            self.reset();
            ui_thread.shutdown();
            info!("sync engine stopped");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("registry", &self.registry)
            .field("tracker", &self.tracker)
            .field("synchronizer", &self.synchronizer)
            .field("running", &self.ui_thread.is_some())
            .finish()
    }
}
