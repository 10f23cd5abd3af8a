//! Driver-side connection to a [`BridgeHost`](super::BridgeHost).
//!
//! One TCP connection carries one request at a time. A read timeout or I/O
//! error drops the stream so a late response can never be mistaken for the
//! answer to the next request; the next call dials again, with a bounded
//! number of retries, and reports [`BridgeError::TransportUnavailable`] when
//! the host cannot be reached.
//!
//! # Example
//!
//! ```no_run
//! use quiesce_core::bridge::{BridgeClient, BridgeClientConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = BridgeClient::connect("127.0.0.1:7357", BridgeClientConfig::default()).await?;
//! let app = client.root("app").await?;
//! let label = app.invoke("get_label", vec![]).await?;
//! println!("{label:?}");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, debug_span, warn, Instrument};

use super::protocol::{read_message, write_message, BridgeRequest, BridgeResponse, FrameError};
use super::{BridgeError, DistantObjectProxy, ObjectId, ObjectRef, RemoteValue};
use crate::config::SyncConfig;
use crate::idling::BusyResource;

/// Extra time a call waits beyond the synchronization timeout it carries, so
/// the host gets to report its own timeout first.
const READ_MARGIN: Duration = Duration::from_secs(5);

/// Delay before the first re-dial; doubles on each further attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on the delay between two dials.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Transport settings for a [`BridgeClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeClientConfig {
    pub connect_timeout: Duration,
    /// Read timeout for calls that carry no synchronization timeout.
    pub call_timeout: Duration,
    /// Re-dials after the first failed connect.
    pub connect_retries: u32,
}

impl Default for BridgeClientConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for BridgeClientConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            call_timeout: config.call_timeout(),
            connect_retries: config.connect_retries,
        }
    }
}

/// Maps a framing failure on an open stream to the caller-facing taxonomy.
fn map_frame_error(err: FrameError) -> BridgeError {
    match err {
        FrameError::Io(e) => BridgeError::TransportUnavailable(e.to_string()),
        other => BridgeError::Protocol(other),
    }
}

/// Cloneable client for one bridge host. Clones share the connection.
#[derive(Clone)]
pub struct BridgeClient {
    addr: Arc<str>,
    config: BridgeClientConfig,
    stream: Arc<Mutex<Option<TcpStream>>>,
}

impl BridgeClient {
    /// A client for `addr` that dials on first use.
    pub fn new(addr: impl Into<String>, config: BridgeClientConfig) -> Self {
        Self {
            addr: Arc::from(addr.into()),
            config,
            stream: Arc::new(Mutex::new(None)),
        }
    }

    /// Dials `addr` and checks the host answers.
    pub async fn connect(addr: impl Into<String>, config: BridgeClientConfig) -> Result<Self, BridgeError> {
        let client = Self::new(addr, config);
        client.ping().await?;
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns `true` if a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Closes the connection. The next call dials again.
    pub async fn disconnect(&self) {
        self.stream.lock().await.take();
    }

    pub async fn ping(&self) -> Result<(), BridgeError> {
        match self.call(&BridgeRequest::Ping).await? {
            BridgeResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Proxy for the root object published under `name`.
    pub async fn root(&self, name: &str) -> Result<DistantObjectProxy, BridgeError> {
        match self.call(&BridgeRequest::Root { name: name.to_string() }).await? {
            BridgeResponse::Object { object } => Ok(self.proxy(object)),
            other => Err(unexpected(other)),
        }
    }

    /// Proxy for an object handle received from the host.
    pub fn proxy(&self, object: ObjectRef) -> DistantObjectProxy {
        DistantObjectProxy::new(self.clone(), object)
    }

    /// Waits until the host application is idle.
    pub async fn wait_for_idle(&self, timeout: Option<Duration>) -> Result<(), BridgeError> {
        let request = BridgeRequest::WaitForIdle {
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        match self.call(&request).await? {
            BridgeResponse::Idle => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// What is keeping the host application busy.
    pub async fn busy_resources(&self) -> Result<Vec<BusyResource>, BridgeError> {
        match self.call(&BridgeRequest::BusyResources).await? {
            BridgeResponse::Busy { resources } => Ok(resources),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn resolve(&self, object: ObjectId) -> Result<ObjectRef, BridgeError> {
        match self.call(&BridgeRequest::Resolve { object }).await? {
            BridgeResponse::Object { object } => Ok(object),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn invoke(
        &self,
        object: ObjectId,
        method: &str,
        args: Vec<serde_json::Value>,
        sync_timeout: Option<Duration>,
    ) -> Result<RemoteValue, BridgeError> {
        let request = BridgeRequest::Invoke {
            object,
            method: method.to_string(),
            args,
            timeout_ms: sync_timeout.map(|t| t.as_millis() as u64),
        };
        match self.call(&request).await? {
            BridgeResponse::Value { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Sends `request` and returns the host's answer. Error responses are
    /// turned back into the [`BridgeError`] the host raised.
    pub async fn call(&self, request: &BridgeRequest) -> Result<BridgeResponse, BridgeError> {
        let read_timeout = request
            .timeout()
            .map_or(self.config.call_timeout, |sync_timeout| sync_timeout + READ_MARGIN);
        let span = debug_span!("bridge_call", method = request.name());
        async {
            let mut guard = self.stream.lock().await;
            if guard.is_none() {
                *guard = Some(self.dial().await?);
            }
            let Some(stream) = guard.as_mut() else {
                return Err(BridgeError::TransportUnavailable("not connected".into()));
            };

            let exchange = timeout(read_timeout, async {
                write_message(stream, request).await?;
                read_message::<_, BridgeResponse>(stream).await
            })
            .await;

            let response = match exchange {
                Ok(Ok(Some(response))) => response,
                Ok(Ok(None)) => {
                    guard.take();
                    return Err(BridgeError::TransportUnavailable(format!(
                        "{} closed the connection",
                        self.addr
                    )));
                }
                Ok(Err(e)) => {
                    // The stream is likely broken, drop it to prevent reuse.
                    guard.take();
                    return Err(map_frame_error(e));
                }
                Err(_) => {
                    // The host may still answer later; a stream with a stale
                    // response in it must not be reused.
                    guard.take();
                    return Err(BridgeError::TransportUnavailable(format!(
                        "no response from {} within {}ms",
                        self.addr,
                        read_timeout.as_millis()
                    )));
                }
            };

            match response {
                BridgeResponse::Error(remote) => Err(remote.into_error()),
                other => Ok(other),
            }
        }
        .instrument(span)
        .await
    }

    async fn dial(&self) -> Result<TcpStream, BridgeError> {
        let attempts = self.config.connect_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!(addr = %self.addr, attempt, "connecting to bridge host");
            match timeout(self.config.connect_timeout, TcpStream::connect(&*self.addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!("connected to bridge host");
                    return Ok(stream);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("connect timed out after {}ms", self.config.connect_timeout.as_millis())
                }
            }
            if attempt < attempts {
                warn!(addr = %self.addr, attempt, error = %last_error, "connect failed, retrying");
                tokio::time::sleep(retry_delay(attempt)).await;
            }
        }

        Err(BridgeError::TransportUnavailable(format!("{}: {last_error}", self.addr)))
    }
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("addr", &self.addr)
            .field("config", &self.config)
            .finish()
    }
}

/// Delay after failed dial number `attempt` (1-based).
fn retry_delay(attempt: u32) -> Duration {
    2u32.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| RETRY_BACKOFF.checked_mul(factor))
        .map_or(MAX_RETRY_BACKOFF, |delay| delay.min(MAX_RETRY_BACKOFF))
}

fn unexpected(response: BridgeResponse) -> BridgeError {
    BridgeError::BadRequest(format!("unexpected response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn quick_config() -> BridgeClientConfig {
        BridgeClientConfig {
            connect_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_millis(300),
            connect_retries: 1,
        }
    }

    /// Helper: a server that answers each request on one connection with the
    /// given responses, in order.
    async fn mock_host(responses: Vec<BridgeResponse>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for response in responses {
                let _request: BridgeRequest = read_message(&mut stream).await.unwrap().unwrap();
                write_message(&mut stream, &response).await.unwrap();
            }
            // Keep the connection open until the client hangs up.
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        addr
    }

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        assert_eq!(retry_delay(1), Duration::from_millis(100));
        assert_eq!(retry_delay(2), Duration::from_millis(200));
        assert_eq!(retry_delay(4), Duration::from_millis(800));
        assert_eq!(retry_delay(7), MAX_RETRY_BACKOFF);
        assert_eq!(retry_delay(40), MAX_RETRY_BACKOFF);
        assert_eq!(retry_delay(u32::MAX), MAX_RETRY_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn many_retries_end_in_transport_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = BridgeClient::new(
            addr,
            BridgeClientConfig {
                connect_retries: 40,
                ..quick_config()
            },
        );
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, BridgeError::TransportUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn ping_via_mock_host() {
        let addr = mock_host(vec![BridgeResponse::Pong]).await;
        let client = BridgeClient::connect(addr, quick_config()).await.unwrap();
        assert!(client.is_connected().await);
        client.disconnect().await;
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn remote_error_is_reconstructed() {
        let addr = mock_host(vec![BridgeResponse::Error(
            crate::bridge::RemoteError::new(crate::bridge::ErrorKind::UnknownRoot, "window"),
        )])
        .await;
        let client = BridgeClient::new(addr, quick_config());
        let err = client.root("window").await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownRoot(name) if name == "window"));
    }

    #[tokio::test]
    async fn nothing_listening_is_transport_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = BridgeClient::connect(addr, quick_config()).await.unwrap_err();
        assert!(matches!(err, BridgeError::TransportUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn silent_host_times_out_and_drops_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let client = BridgeClient::new(addr, quick_config());
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, BridgeError::TransportUnavailable(_)), "{err:?}");
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn host_hanging_up_is_transport_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let client = BridgeClient::new(addr, quick_config());
        let err = client.ping().await.unwrap_err();
        assert!(err.is_transport(), "{err:?}");
    }

    #[test]
    fn config_follows_sync_config() {
        let config = BridgeClientConfig::from(&SyncConfig {
            connect_timeout_ms: 250,
            call_timeout_ms: 1000,
            connect_retries: 4,
            ..SyncConfig::default()
        });
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.call_timeout, Duration::from_secs(1));
        assert_eq!(config.connect_retries, 4);
    }
}
