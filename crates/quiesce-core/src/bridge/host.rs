//! Serving an [`ObjectTable`] to the other process.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use quiesce_core::bridge::{BridgeHost, ObjectTable};
//! use quiesce_core::config::SyncConfig;
//! use quiesce_core::engine::SyncEngine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SyncEngine::start(SyncConfig::default())?;
//! let table = Arc::new(ObjectTable::new());
//! let host = BridgeHost::new(table, engine.synchronizer().clone());
//! let handle = host.bind("127.0.0.1:7357").await?;
//! println!("serving on {}", handle.local_addr());
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, info_span, warn, Instrument};

use super::protocol::{read_message, write_message, BridgeRequest, BridgeResponse, FrameError, RemoteError};
use super::{
    BridgeError, Dispatch, DistantObject, InvocationContext, InvokeError, ObjectId, ObjectRef, ObjectTable,
    RemoteValue,
};
use crate::synchronizer::{SyncError, Synchronizer};

/// Serves bridge requests against one object table.
#[derive(Clone)]
pub struct BridgeHost {
    state: Arc<HostState>,
}

struct HostState {
    table: Arc<ObjectTable>,
    synchronizer: Option<Synchronizer>,
    default_timeout: Duration,
}

impl BridgeHost {
    /// A host for a process with a UI thread. [`Dispatch::UiThread`] objects
    /// are invoked through `synchronizer`.
    pub fn new(table: Arc<ObjectTable>, synchronizer: Synchronizer) -> Self {
        let default_timeout = synchronizer.default_timeout();
        Self {
            state: Arc::new(HostState {
                table,
                synchronizer: Some(synchronizer),
                default_timeout,
            }),
        }
    }

    /// A host for a process without a UI thread, such as the driver exporting
    /// test-side objects. Only [`Dispatch::Background`] objects can be
    /// invoked, and the host always reports itself idle.
    pub fn without_ui(table: Arc<ObjectTable>) -> Self {
        Self {
            state: Arc::new(HostState {
                table,
                synchronizer: None,
                default_timeout: Duration::ZERO,
            }),
        }
    }

    pub fn table(&self) -> &Arc<ObjectTable> {
        &self.state.table
    }

    /// Binds `addr` and starts serving.
    pub async fn bind(self, addr: &str) -> Result<HostHandle, BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener)
    }

    /// Starts the accept loop on an already bound listener.
    pub fn serve(self, listener: TcpListener) -> Result<HostHandle, BridgeError> {
        let local_addr = listener.local_addr()?;
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        info!(%local_addr, "bridge host listening");

        let join_handle = tokio::spawn(async move {
            Self::accept_loop(listener, self.state, token_clone).await;
        });

        Ok(HostHandle {
            local_addr,
            cancel_token,
            join_handle,
        })
    }

    /// Answers a single request. Failures become [`BridgeResponse::Error`].
    pub async fn handle_request(&self, request: BridgeRequest) -> BridgeResponse {
        self.state.handle_request(request).await
    }

    async fn accept_loop(listener: TcpListener, state: Arc<HostState>, cancel_token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let state = state.clone();
                            let cancel_token = cancel_token.clone();
                            tokio::spawn(async move {
                                let span = info_span!("bridge_client", %peer);
                                if let Err(e) = handle_client(stream, state, cancel_token).instrument(span).await {
                                    debug!(error = %e, "client disconnected");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
        info!("bridge host stopped");
    }
}

/// Running bridge host. Dropping it leaves the host running; use
/// [`stop`](Self::stop) or [`cancel`](Self::cancel).
pub struct HostHandle {
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl HostHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes every connection, then waits for the loop.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        let _ = self.join_handle.await;
    }

    /// Stops the host without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<HostState>,
    cancel_token: CancellationToken,
) -> Result<(), FrameError> {
    let (mut reader, mut writer) = stream.into_split();
    debug!("client connected");

    loop {
        let request = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            request = read_message::<_, BridgeRequest>(&mut reader) => request,
        };

        let response = match request {
            Ok(Some(request)) => state.handle_request(request).await,
            Ok(None) => break,
            Err(FrameError::Json(e)) => {
                warn!(error = %e, "undecodable request");
                BridgeResponse::Error(RemoteError::from_error(&BridgeError::BadRequest(e.to_string())))
            }
            Err(e) => return Err(e),
        };
        write_message(&mut writer, &response).await?;
    }
    debug!("client closed");
    Ok(())
}

impl HostState {
    async fn handle_request(&self, request: BridgeRequest) -> BridgeResponse {
        let span = debug_span!("bridge_call", method = request.name());
        async {
            match self.dispatch(request).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(error = %e, "request failed");
                    BridgeResponse::Error(RemoteError::from_error(&e))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, request: BridgeRequest) -> Result<BridgeResponse, BridgeError> {
        let timeout = request.timeout().unwrap_or(self.default_timeout);
        match request {
            BridgeRequest::Ping => Ok(BridgeResponse::Pong),
            BridgeRequest::Root { name } => Ok(BridgeResponse::Object {
                object: self.table.root(&name)?,
            }),
            BridgeRequest::Resolve { object } => {
                let (live, _) = self.table.resolve(object)?;
                Ok(BridgeResponse::Object {
                    object: ObjectRef {
                        id: object,
                        class_name: live.class_name().to_string(),
                    },
                })
            }
            BridgeRequest::Invoke {
                object,
                method,
                args,
                ..
            } => {
                let value = self.invoke(object, method, args, timeout).await?;
                Ok(BridgeResponse::Value { value })
            }
            BridgeRequest::WaitForIdle { .. } => {
                if let Some(synchronizer) = &self.synchronizer {
                    synchronizer.wait_for_idle(timeout).await?;
                }
                Ok(BridgeResponse::Idle)
            }
            BridgeRequest::BusyResources => Ok(BridgeResponse::Busy {
                resources: self
                    .synchronizer
                    .as_ref()
                    .map(Synchronizer::busy_resources)
                    .unwrap_or_default(),
            }),
        }
    }

    async fn invoke(
        &self,
        id: ObjectId,
        method: String,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<RemoteValue, BridgeError> {
        let (object, dispatch) = self.table.resolve(id)?;
        // Resolved again where it runs, so an object dropped while the call
        // waits for idle is reported stale.
        let object = Arc::downgrade(&object);
        let cx = InvocationContext::new(self.table.clone());
        debug!(object = %id, method = %method, ?dispatch, "invoking");

        match dispatch {
            Dispatch::UiThread => {
                let synchronizer = self.synchronizer.as_ref().ok_or_else(|| {
                    BridgeError::RemoteInvocationError {
                        method: method.clone(),
                        message: "this process has no UI thread".to_string(),
                    }
                })?;
                let name = method.clone();
                synchronizer
                    .execute_sync(move || invoke_live(&object, id, &method, &args, &cx), timeout)
                    .await
                    .map_err(|e| map_sync_error(e, name))?
            }
            Dispatch::Background => {
                let name = method.clone();
                tokio::task::spawn_blocking(move || invoke_live(&object, id, &method, &args, &cx))
                    .await
                    .map_err(|e| BridgeError::RemoteInvocationError {
                        method: name,
                        message: e.to_string(),
                    })?
            }
        }
    }
}

fn invoke_live(
    object: &Weak<dyn DistantObject>,
    id: ObjectId,
    method: &str,
    args: &[Value],
    cx: &InvocationContext,
) -> Result<RemoteValue, BridgeError> {
    let object = object.upgrade().ok_or(BridgeError::RemoteReferenceStale { id })?;
    object.invoke(method, args, cx).map_err(|e| match e {
        InvokeError::Tracking(e) => BridgeError::Synchronization(SyncError::InvalidTrackingState(e)),
        other => BridgeError::RemoteInvocationError {
            method: method.to_string(),
            message: other.to_string(),
        },
    })
}

/// A panic inside the remote method is an invocation error like any other.
fn map_sync_error(err: SyncError, method: String) -> BridgeError {
    match err {
        SyncError::TaskFailed(message) => BridgeError::RemoteInvocationError { method, message },
        other => BridgeError::Synchronization(other),
    }
}
