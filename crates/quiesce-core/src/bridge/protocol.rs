//! Wire protocol between bridge clients and hosts.
//!
//! # Frame Structure (Little Endian)
//!
//! ```text
//! [Header: 4 bytes LE u32 len] [Payload: len bytes of JSON]
//! ```
//!
//! The `len` field counts the payload only, never the header. Frames larger
//! than [`MAX_FRAME_LEN`] are rejected on both sides.
//!
//! Payloads are [`BridgeRequest`] and [`BridgeResponse`] documents tagged by
//! `type`. Exactly one request is in flight per connection.
//!
//! # Example
//!
//! ```
//! use quiesce_core::bridge::protocol::{encode_message, read_frame_length, BridgeRequest};
//!
//! let frame = encode_message(&BridgeRequest::Ping).unwrap();
//! let header: [u8; 4] = frame[..4].try_into().unwrap();
//! assert_eq!(read_frame_length(&header) as usize, frame.len() - 4);
//! ```

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{BridgeError, ObjectId, ObjectRef, RemoteValue};
use crate::idling::BusyResource;
use crate::synchronizer::SyncError;
use crate::tracker::{ActivityId, TrackingError};

/// Largest accepted payload.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while framing messages.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The declared payload length exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    TooLarge(u64),

    /// The payload is not a valid message.
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The stream failed mid-frame.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A request from a bridge client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeRequest {
    /// Liveness check.
    Ping,

    /// Look up a published root object.
    Root { name: String },

    /// Check that an object is still alive.
    Resolve { object: ObjectId },

    /// Call a method on an object.
    Invoke {
        object: ObjectId,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
        /// Synchronization timeout for UI-thread objects; the host's default
        /// when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Wait until the host application is idle.
    WaitForIdle {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Report what is keeping the host application busy.
    BusyResources,
}

impl BridgeRequest {
    /// Short name used in spans and logs.
    pub fn name(&self) -> &'static str {
        match self {
            BridgeRequest::Ping => "ping",
            BridgeRequest::Root { .. } => "root",
            BridgeRequest::Resolve { .. } => "resolve",
            BridgeRequest::Invoke { .. } => "invoke",
            BridgeRequest::WaitForIdle { .. } => "wait_for_idle",
            BridgeRequest::BusyResources => "busy_resources",
        }
    }

    /// The synchronization timeout the request asks the host to honor.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            BridgeRequest::Invoke { timeout_ms, .. } | BridgeRequest::WaitForIdle { timeout_ms } => {
                timeout_ms.map(Duration::from_millis)
            }
            _ => None,
        }
    }
}

/// A response from a bridge host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeResponse {
    Pong,
    Object { object: ObjectRef },
    Value { value: RemoteValue },
    Idle,
    Busy { resources: Vec<BusyResource> },
    Error(RemoteError),
}

/// Category of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StaleReference,
    Invocation,
    SynchronizationTimeout,
    Reentrant,
    UnknownRoot,
    BadRequest,
    InvalidTrackingState,
}

/// A failure as carried on the wire.
///
/// Enough detail travels with it to rebuild the same [`BridgeError`] variant
/// on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waited_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub busy: Vec<BusyResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_kind: Option<String>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            object: None,
            method: None,
            waited_ms: None,
            busy: Vec::new(),
            activity: None,
            activity_kind: None,
        }
    }

    /// Describes `err` for the wire.
    pub fn from_error(err: &BridgeError) -> Self {
        let message = err.to_string();
        match err {
            BridgeError::RemoteReferenceStale { id } => Self {
                object: Some(*id),
                ..Self::new(ErrorKind::StaleReference, message)
            },
            BridgeError::RemoteInvocationError { method, message } => Self {
                method: Some(method.clone()),
                ..Self::new(ErrorKind::Invocation, message.clone())
            },
            BridgeError::UnknownRoot(name) => Self::new(ErrorKind::UnknownRoot, name.clone()),
            BridgeError::Synchronization(SyncError::SynchronizationTimeout { waited, busy }) => {
                Self {
                    waited_ms: Some(waited.as_millis() as u64),
                    busy: busy.clone(),
                    ..Self::new(ErrorKind::SynchronizationTimeout, message)
                }
            }
            BridgeError::Synchronization(SyncError::ReentrantSynchronizationError) => {
                Self::new(ErrorKind::Reentrant, message)
            }
            BridgeError::Synchronization(SyncError::InvalidTrackingState(
                TrackingError::InvalidTrackingState { id, kind },
            )) => Self {
                activity: Some(*id),
                activity_kind: Some(kind.clone()),
                ..Self::new(ErrorKind::InvalidTrackingState, message)
            },
            BridgeError::Synchronization(other) => Self::new(ErrorKind::Invocation, other.to_string()),
            BridgeError::BadRequest(detail) => Self::new(ErrorKind::BadRequest, detail.clone()),
            BridgeError::TransportUnavailable(_) | BridgeError::Protocol(_) | BridgeError::Io(_) => {
                Self::new(ErrorKind::BadRequest, message)
            }
        }
    }

    /// Rebuilds the error raised on the remote side.
    pub fn into_error(self) -> BridgeError {
        match self.kind {
            ErrorKind::StaleReference => match self.object {
                Some(id) => BridgeError::RemoteReferenceStale { id },
                None => BridgeError::BadRequest(self.message),
            },
            ErrorKind::Invocation => BridgeError::RemoteInvocationError {
                method: self.method.unwrap_or_default(),
                message: self.message,
            },
            ErrorKind::SynchronizationTimeout => {
                BridgeError::Synchronization(SyncError::SynchronizationTimeout {
                    waited: Duration::from_millis(self.waited_ms.unwrap_or_default()),
                    busy: self.busy,
                })
            }
            ErrorKind::Reentrant => {
                BridgeError::Synchronization(SyncError::ReentrantSynchronizationError)
            }
            ErrorKind::InvalidTrackingState => match (self.activity, self.activity_kind) {
                (Some(id), Some(kind)) => BridgeError::Synchronization(SyncError::InvalidTrackingState(
                    TrackingError::InvalidTrackingState { id, kind },
                )),
                _ => BridgeError::BadRequest(self.message),
            },
            ErrorKind::UnknownRoot => BridgeError::UnknownRoot(self.message),
            ErrorKind::BadRequest => BridgeError::BadRequest(self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Prefix `payload` with its 4-byte LE length header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Read the payload length from a 4-byte LE header.
pub fn read_frame_length(header: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*header)
}

/// Serialize `message` into a complete frame.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(FrameError::TooLarge(payload.len() as u64));
    }
    Ok(encode_frame(&payload))
}

/// Write `message` as one frame and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_message(message)?;
    trace!(frame_bytes = frame.len(), "writing frame");
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it.
///
/// Returns `Ok(None)` if the peer closed the connection cleanly before a new
/// frame started. A close partway through the header is an I/O error.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("connection closed after {filled} of 4 header bytes"),
            )));
        }
        filled += n;
    }
    let len = read_frame_length(&header);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len as u64));
    }

    let mut payload = vec![0u8; len as usize];
    trace!(payload_bytes = len, "reading frame");
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_header_counts_payload_only() {
        let frame = encode_frame(b"abc");
        assert_eq!(&frame[..4], &[3, 0, 0, 0]);
        assert_eq!(&frame[4..], b"abc");
    }

    #[test]
    fn request_wire_shape() {
        let request = BridgeRequest::Invoke {
            object: ObjectId(3),
            method: "set_label".into(),
            args: vec![json!("Done")],
            timeout_ms: Some(1000),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "type": "Invoke",
                "object": 3,
                "method": "set_label",
                "args": ["Done"],
                "timeout_ms": 1000,
            })
        );
        assert_eq!(request.timeout(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn invoke_args_default_to_empty() {
        let request: BridgeRequest =
            serde_json::from_value(json!({"type": "Invoke", "object": 1, "method": "tap"})).unwrap();
        assert_eq!(
            request,
            BridgeRequest::Invoke {
                object: ObjectId(1),
                method: "tap".into(),
                args: vec![],
                timeout_ms: None,
            }
        );
    }

    #[test]
    fn error_response_is_flat() {
        let response = BridgeResponse::Error(RemoteError::new(ErrorKind::UnknownRoot, "window"));
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"type": "Error", "kind": "unknown_root", "message": "window"})
        );
    }

    #[test]
    fn stale_reference_survives_the_wire() {
        let wire = RemoteError::from_error(&BridgeError::RemoteReferenceStale { id: ObjectId(9) });
        let json = serde_json::to_string(&BridgeResponse::Error(wire)).unwrap();
        let BridgeResponse::Error(decoded) = serde_json::from_str(&json).unwrap() else {
            panic!("expected error response");
        };
        assert!(matches!(
            decoded.into_error(),
            BridgeError::RemoteReferenceStale { id: ObjectId(9) }
        ));
    }

    #[test]
    fn synchronization_timeout_keeps_busy_set() {
        let err = BridgeError::Synchronization(SyncError::SynchronizationTimeout {
            waited: Duration::from_millis(1000),
            busy: vec![BusyResource::new("network", "counter")],
        });
        match RemoteError::from_error(&err).into_error() {
            BridgeError::Synchronization(SyncError::SynchronizationTimeout { waited, busy }) => {
                assert_eq!(waited, Duration::from_millis(1000));
                assert_eq!(busy, vec![BusyResource::new("network", "counter")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_tracking_state_keeps_activity() {
        let err = BridgeError::Synchronization(SyncError::InvalidTrackingState(
            TrackingError::InvalidTrackingState {
                id: ActivityId(4),
                kind: "network".into(),
            },
        ));
        let wire = RemoteError::from_error(&err);
        assert_eq!(
            serde_json::to_value(&wire).unwrap()["kind"],
            json!("invalid_tracking_state")
        );
        match wire.into_error() {
            BridgeError::Synchronization(SyncError::InvalidTrackingState(
                TrackingError::InvalidTrackingState { id, kind },
            )) => {
                assert_eq!(id, ActivityId(4));
                assert_eq!(kind, "network");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invocation_error_keeps_method() {
        let err = BridgeError::RemoteInvocationError {
            method: "tap".into(),
            message: "button disabled".into(),
        };
        match RemoteError::from_error(&err).into_error() {
            BridgeError::RemoteInvocationError { method, message } => {
                assert_eq!(method, "tap");
                assert_eq!(message, "button disabled");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_round_trip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_message(&mut client, &BridgeRequest::Root { name: "app".into() })
            .await
            .unwrap();
        let received: Option<BridgeRequest> = read_message(&mut server).await.unwrap();
        assert_eq!(received, Some(BridgeRequest::Root { name: "app".into() }));
    }

    #[tokio::test]
    async fn clean_eof_reads_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let received: Option<BridgeRequest> = read_message(&mut server).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[7, 0]).await.unwrap();
        drop(client);
        let err = read_message::<_, BridgeRequest>(&mut server).await.unwrap_err();
        match err {
            FrameError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn too_large_message_names_the_limit() {
        let err = FrameError::TooLarge(20_000_000);
        assert_eq!(
            err.to_string(),
            format!("frame of 20000000 bytes exceeds the {MAX_FRAME_LEN} byte limit")
        );
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_le_bytes())
            .await
            .unwrap();
        let err = read_message::<_, BridgeRequest>(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }
}
