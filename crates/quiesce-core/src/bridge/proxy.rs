use std::time::Duration;

use serde_json::Value;

use super::{BridgeClient, BridgeError, ObjectId, ObjectRef, RemoteValue};

/// Handle to an object living in the other process.
///
/// Holds only the object's id and the connection. Nothing is kept alive on
/// the remote side: every call looks the id up again, and fails with
/// [`BridgeError::RemoteReferenceStale`] once the object is gone.
#[derive(Debug, Clone)]
pub struct DistantObjectProxy {
    client: BridgeClient,
    object: ObjectRef,
}

impl DistantObjectProxy {
    pub(crate) fn new(client: BridgeClient, object: ObjectRef) -> Self {
        Self { client, object }
    }

    pub fn id(&self) -> ObjectId {
        self.object.id
    }

    pub fn class_name(&self) -> &str {
        &self.object.class_name
    }

    pub fn object_ref(&self) -> &ObjectRef {
        &self.object
    }

    /// Confirms the remote object is still alive.
    pub async fn resolve(&self) -> Result<ObjectRef, BridgeError> {
        self.client.resolve(self.object.id).await
    }

    /// Calls `method` with the host's default synchronization timeout.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<RemoteValue, BridgeError> {
        self.client.invoke(self.object.id, method, args, None).await
    }

    /// Calls `method`, allowing the host at most `timeout` to reach idle.
    pub async fn invoke_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<RemoteValue, BridgeError> {
        self.client.invoke(self.object.id, method, args, Some(timeout)).await
    }

    /// Calls a method that returns another object and wraps it as a proxy.
    pub async fn invoke_object(&self, method: &str, args: Vec<Value>) -> Result<DistantObjectProxy, BridgeError> {
        match self.invoke(method, args).await? {
            RemoteValue::Object(object) => Ok(self.client.proxy(object)),
            other => Err(BridgeError::RemoteInvocationError {
                method: method.to_string(),
                message: format!("expected an object, got {}", other.to_json()),
            }),
        }
    }
}

impl PartialEq for DistantObjectProxy {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object && self.client.addr() == other.client.addr()
    }
}
