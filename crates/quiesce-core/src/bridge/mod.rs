//! Cross-process bridge for distant objects.
//!
//! Each process that wants its objects driven from the other side publishes
//! them in an [`ObjectTable`](table::ObjectTable) and serves it with a
//! [`BridgeHost`](host::BridgeHost). The other process connects with a
//! [`BridgeClient`](client::BridgeClient) and receives
//! [`DistantObjectProxy`](proxy::DistantObjectProxy) handles: an object id plus
//! the connection, resolved against the table on every call.
//!
//! The table never keeps exported objects alive (roots excepted). A proxy
//! whose object has been dropped fails with
//! [`BridgeError::RemoteReferenceStale`].
//!
//! Objects exported with [`Dispatch::UiThread`] are invoked through the
//! [`Synchronizer`](crate::synchronizer::Synchronizer), so remote callers
//! only ever touch UI state on the UI thread and only once the app is idle.

pub mod client;
pub mod host;
pub mod protocol;
pub mod proxy;
pub mod table;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::synchronizer::SyncError;
use crate::tracker::TrackingError;

pub use client::{BridgeClient, BridgeClientConfig};
pub use host::{BridgeHost, HostHandle};
pub use protocol::{BridgeRequest, BridgeResponse, ErrorKind, FrameError, RemoteError};
pub use proxy::DistantObjectProxy;
pub use table::ObjectTable;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The object behind a proxy no longer exists.
    #[error("remote reference {id} is stale")]
    RemoteReferenceStale { id: ObjectId },

    /// The connection to the other process is down.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The remote method raised an error.
    #[error("remote invocation of `{method}` failed: {message}")]
    RemoteInvocationError { method: String, message: String },

    /// No root object is published under this name.
    #[error("unknown root object `{0}`")]
    UnknownRoot(String),

    /// The peer sent something this side does not understand.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Synchronizing with the remote UI thread failed.
    #[error(transparent)]
    Synchronization(#[from] SyncError),

    /// The frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Returns `true` for failures of the connection itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, BridgeError::TransportUnavailable(_) | BridgeError::Io(_))
    }
}

// ---------------------------------------------------------------------------
// Object model
// ---------------------------------------------------------------------------

/// Identifier of an exported object, unique within one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Wire handle for an exported object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub class_name: String,
}

/// Result of a remote invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RemoteValue {
    Null,
    Data(Value),
    Object(ObjectRef),
}

impl RemoteValue {
    /// Wraps any serializable value.
    pub fn data(value: impl Serialize) -> Result<Self, InvokeError> {
        serde_json::to_value(value)
            .map(RemoteValue::Data)
            .map_err(|e| InvokeError::Failed(e.to_string()))
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            RemoteValue::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            RemoteValue::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Plain JSON rendering, with objects shown as their handle.
    pub fn to_json(&self) -> Value {
        match self {
            RemoteValue::Null => Value::Null,
            RemoteValue::Data(value) => value.clone(),
            RemoteValue::Object(object) => serde_json::json!({
                "object": object.id.0,
                "class_name": object.class_name,
            }),
        }
    }
}

/// Which thread an exported object's methods run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// Run through the synchronizer: on the UI thread, once idle.
    UiThread,
    /// Run on a blocking worker without waiting for idle.
    Background,
}

/// Error raised by a [`DistantObject`] method.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("no method `{0}`")]
    UnknownMethod(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("{0}")]
    Failed(String),

    /// The method tried to track an activity that is already tracked.
    #[error(transparent)]
    Tracking(#[from] TrackingError),
}

/// An object that can be invoked from the other process.
pub trait DistantObject: Send + Sync {
    /// Name reported to the remote side, analogous to a class name.
    fn class_name(&self) -> &str;

    /// Invokes `method` with JSON `args`.
    ///
    /// `cx` lets a method hand back further objects as proxies.
    fn invoke(
        &self,
        method: &str,
        args: &[Value],
        cx: &InvocationContext,
    ) -> Result<RemoteValue, InvokeError>;
}

/// Per-call context given to [`DistantObject::invoke`].
#[derive(Clone)]
pub struct InvocationContext {
    table: std::sync::Arc<ObjectTable>,
}

impl InvocationContext {
    pub(crate) fn new(table: std::sync::Arc<ObjectTable>) -> Self {
        Self { table }
    }

    /// Exports `object` and returns it as a value for the caller.
    ///
    /// The table holds it weakly; the caller of this method must keep it
    /// alive for the proxy to stay valid.
    pub fn export<O: DistantObject + 'static>(
        &self,
        object: &std::sync::Arc<O>,
        dispatch: Dispatch,
    ) -> RemoteValue {
        RemoteValue::Object(self.table.export(object, dispatch))
    }
}

/// Returns the string argument at `index`.
pub fn str_arg<'a>(args: &'a [Value], index: usize) -> Result<&'a str, InvokeError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| InvokeError::BadArguments(format!("argument {index} must be a string")))
}

/// Returns the unsigned integer argument at `index`.
pub fn u64_arg(args: &[Value], index: usize) -> Result<u64, InvokeError> {
    args.get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| InvokeError::BadArguments(format!("argument {index} must be a non-negative integer")))
}
