//! Identifier-to-instance lookup for exported objects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{BridgeError, Dispatch, DistantObject, ObjectId, ObjectRef};

struct Entry {
    object: Weak<dyn DistantObject>,
    class_name: String,
    dispatch: Dispatch,
}

/// The objects one process makes invocable from the other.
///
/// Exported objects are held weakly and looked up on every call. Roots are
/// the exception: the table owns them so a fresh client always has somewhere
/// to start.
pub struct ObjectTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<ObjectId, Entry>>,
    roots: RwLock<HashMap<String, (ObjectId, Arc<dyn DistantObject>)>>,
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
            roots: RwLock::new(HashMap::new()),
        }
    }

    /// Exports `object` and returns its handle.
    ///
    /// Exporting the same live object again under the same dispatch role
    /// returns the handle it already has. Each role gets its own handle, so
    /// an object exported for both roles runs the way the handle it was
    /// reached through says.
    pub fn export<O: DistantObject + 'static>(&self, object: &Arc<O>, dispatch: Dispatch) -> ObjectRef {
        let dynamic: Arc<dyn DistantObject> = object.clone();
        self.export_dyn(&dynamic, dispatch)
    }

    /// [`export`](Self::export) for an object already behind a trait object.
    pub fn export_dyn(&self, object: &Arc<dyn DistantObject>, dispatch: Dispatch) -> ObjectRef {
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.object.strong_count() > 0);

        let existing = entries.iter().find_map(|(id, entry)| {
            entry
                .object
                .upgrade()
                .filter(|live| entry.dispatch == dispatch && Arc::ptr_eq(live, object))
                .map(|_| ObjectRef {
                    id: *id,
                    class_name: entry.class_name.clone(),
                })
        });
        if let Some(handle) = existing {
            return handle;
        }

        let id = ObjectId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let class_name = object.class_name().to_string();
        trace!(id = %id, class_name = %class_name, ?dispatch, "object exported");
        entries.insert(
            id,
            Entry {
                object: Arc::downgrade(object),
                class_name: class_name.clone(),
                dispatch,
            },
        );
        ObjectRef { id, class_name }
    }

    /// Publishes `object` under `name` and keeps it alive.
    pub fn publish_root<O: DistantObject + 'static>(
        &self,
        name: impl Into<String>,
        object: Arc<O>,
        dispatch: Dispatch,
    ) -> ObjectRef {
        self.publish_root_dyn(name, object, dispatch)
    }

    /// [`publish_root`](Self::publish_root) for an object already behind a
    /// trait object.
    pub fn publish_root_dyn(
        &self,
        name: impl Into<String>,
        object: Arc<dyn DistantObject>,
        dispatch: Dispatch,
    ) -> ObjectRef {
        let name = name.into();
        let handle = self.export_dyn(&object, dispatch);
        debug!(name = %name, id = %handle.id, "root object published");
        self.roots.write().insert(name, (handle.id, object));
        handle
    }

    /// Stops publishing the root `name`. Proxies to it go stale once nothing
    /// else holds the object.
    pub fn withdraw_root(&self, name: &str) -> bool {
        self.roots.write().remove(name).is_some()
    }

    /// Handle of the root published under `name`.
    pub fn root(&self, name: &str) -> Result<ObjectRef, BridgeError> {
        let roots = self.roots.read();
        let (id, object) = roots
            .get(name)
            .ok_or_else(|| BridgeError::UnknownRoot(name.to_string()))?;
        Ok(ObjectRef {
            id: *id,
            class_name: object.class_name().to_string(),
        })
    }

    pub fn root_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.roots.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Looks up a live object and its dispatch role.
    ///
    /// Unknown ids and dropped objects both fail with
    /// [`BridgeError::RemoteReferenceStale`].
    pub fn resolve(&self, id: ObjectId) -> Result<(Arc<dyn DistantObject>, Dispatch), BridgeError> {
        let entries = self.entries.read();
        entries
            .get(&id)
            .and_then(|entry| entry.object.upgrade().map(|object| (object, entry.dispatch)))
            .ok_or(BridgeError::RemoteReferenceStale { id })
    }

    /// Number of live handles, roots included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.object.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every export and root.
    pub fn clear(&self) {
        self.roots.write().clear();
        self.entries.write().clear();
    }
}

impl std::fmt::Debug for ObjectTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTable")
            .field("roots", &self.root_names())
            .field("live", &self.len())
            .finish()
    }
}
