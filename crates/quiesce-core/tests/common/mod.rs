//! Shared test helpers for quiesce-core integration tests.
//!
//! Provides a fake busy resource, an engine with a short poll interval, and a
//! small fake application exported over a real bridge host on a random port.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use quiesce_core::bridge::{
    str_arg, BridgeClient, BridgeClientConfig, BridgeHost, Dispatch, DistantObject, HostHandle,
    InvocationContext, InvokeError, ObjectTable, RemoteValue,
};
use quiesce_core::config::SyncConfig;
use quiesce_core::engine::SyncEngine;
use quiesce_core::idling::IdlingResource;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine polling every 100ms.
pub fn engine() -> SyncEngine {
    SyncEngine::start(SyncConfig {
        poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
        ..SyncConfig::default()
    })
    .unwrap()
}

// ---------------------------------------------------------------------------
// Fake busy resource
// ---------------------------------------------------------------------------

/// An idling resource whose state the test flips by hand.
pub struct FakeResource {
    name: String,
    busy: AtomicBool,
}

impl FakeResource {
    pub fn busy(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            busy: AtomicBool::new(true),
        })
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

impl IdlingResource for FakeResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "fake"
    }

    fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Fake application
// ---------------------------------------------------------------------------

/// A dialog the app can open and close. Closing drops it.
pub struct Dialog {
    title: String,
}

impl DistantObject for Dialog {
    fn class_name(&self) -> &str {
        "Dialog"
    }

    fn invoke(&self, method: &str, _args: &[Value], _cx: &InvocationContext) -> Result<RemoteValue, InvokeError> {
        match method {
            "title" => RemoteValue::data(&self.title),
            other => Err(InvokeError::UnknownMethod(other.to_string())),
        }
    }
}

/// Root object of the fake application.
#[derive(Default)]
pub struct FakeApp {
    label: Mutex<String>,
    dialog: Mutex<Option<Arc<Dialog>>>,
}

impl DistantObject for FakeApp {
    fn class_name(&self) -> &str {
        "FakeApp"
    }

    fn invoke(&self, method: &str, args: &[Value], cx: &InvocationContext) -> Result<RemoteValue, InvokeError> {
        match method {
            "get_label" => RemoteValue::data(self.label.lock().clone()),
            "set_label" => {
                *self.label.lock() = str_arg(args, 0)?.to_string();
                Ok(RemoteValue::Null)
            }
            "open_dialog" => {
                let dialog = Arc::new(Dialog {
                    title: str_arg(args, 0)?.to_string(),
                });
                let value = cx.export(&dialog, Dispatch::UiThread);
                *self.dialog.lock() = Some(dialog);
                Ok(value)
            }
            "close_dialog" => {
                self.dialog.lock().take();
                Ok(RemoteValue::Null)
            }
            "fail" => Err(InvokeError::Failed("requested failure".into())),
            other => Err(InvokeError::UnknownMethod(other.to_string())),
        }
    }
}

/// An engine, the fake app published as root `app`, and a running host.
pub struct HostFixture {
    pub engine: SyncEngine,
    pub app: Arc<FakeApp>,
    pub handle: HostHandle,
}

impl HostFixture {
    pub async fn start() -> Self {
        let engine = engine();
        let table = Arc::new(ObjectTable::new());
        let app = Arc::new(FakeApp::default());
        table.publish_root("app", app.clone(), Dispatch::UiThread);
        let handle = BridgeHost::new(table, engine.synchronizer().clone())
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        Self { engine, app, handle }
    }

    pub fn addr(&self) -> String {
        self.handle.local_addr().to_string()
    }

    pub async fn client(&self) -> BridgeClient {
        BridgeClient::connect(self.addr(), quick_client_config()).await.unwrap()
    }
}

pub fn quick_client_config() -> BridgeClientConfig {
    BridgeClientConfig {
        connect_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_secs(5),
        connect_retries: 1,
    }
}
