//! Demo application objects exported by the host.
//!
//! `app` stands in for a screen of UI state and is only touched on the UI
//! thread. `diagnostics` answers from a background worker so a driver can see
//! what the app is busy with while a synchronized call is still waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use quiesce_core::bridge::{str_arg, u64_arg, DistantObject, InvocationContext, InvokeError, RemoteValue};
use quiesce_core::idling::{CountingResource, TimedResource};
use quiesce_core::synchronizer::AppState;
use quiesce_core::tracker::{ActivityId, AppStateTracker};
use quiesce_core::ui_thread::UiHandle;

/// Root object `app`.
pub struct DemoApp {
    label: Mutex<String>,
    taps: AtomicU64,
    network: Arc<CountingResource>,
    animation: Arc<TimedResource>,
    tracker: Arc<AppStateTracker>,
    ui: UiHandle,
}

impl DemoApp {
    pub fn new(
        ui: UiHandle,
        tracker: Arc<AppStateTracker>,
        network: Arc<CountingResource>,
        animation: Arc<TimedResource>,
    ) -> Self {
        Self {
            label: Mutex::new(String::new()),
            taps: AtomicU64::new(0),
            network,
            animation,
            tracker,
            ui,
        }
    }

    /// Keeps `network` busy for `ms`, finishing on the UI thread like a
    /// completion callback would.
    fn start_request(&self, ms: u64) -> Result<RemoteValue, InvokeError> {
        let request = self.network.busy();
        self.ui
            .post_delayed(Duration::from_millis(ms), move || {
                drop(request);
                debug!(ms, "request finished");
            })
            .map_err(|e| InvokeError::Failed(e.to_string()))?;
        info!(ms, in_flight = self.network.count(), "request started");
        Ok(RemoteValue::Null)
    }

    /// Tracks externally numbered work `id` for `ms`.
    fn begin_work(&self, id: ActivityId, ms: u64) -> Result<RemoteValue, InvokeError> {
        let id = self.tracker.track_activity_with_id(id, "work")?;
        let tracker = self.tracker.clone();
        if let Err(e) = self.ui.post_delayed(Duration::from_millis(ms), move || {
            tracker.untrack_activity(id);
        }) {
            self.tracker.untrack_activity(id);
            return Err(InvokeError::Failed(e.to_string()));
        }
        RemoteValue::data(id.0)
    }
}

impl DistantObject for DemoApp {
    fn class_name(&self) -> &str {
        "DemoApp"
    }

    fn invoke(&self, method: &str, args: &[Value], _cx: &InvocationContext) -> Result<RemoteValue, InvokeError> {
        match method {
            "get_label" => RemoteValue::data(self.label.lock().clone()),
            "set_label" => {
                *self.label.lock() = str_arg(args, 0)?.to_string();
                Ok(RemoteValue::Null)
            }
            "tap" => RemoteValue::data(self.taps.fetch_add(1, Ordering::SeqCst) + 1),
            "start_request" => self.start_request(u64_arg(args, 0)?),
            "begin_work" => self.begin_work(ActivityId(u64_arg(args, 0)?), u64_arg(args, 1)?),
            "animate" => {
                self.animation.extend(Duration::from_millis(u64_arg(args, 0)?));
                Ok(RemoteValue::Null)
            }
            other => Err(InvokeError::UnknownMethod(other.to_string())),
        }
    }
}

/// Root object `diagnostics`.
pub struct Diagnostics {
    app: AppState,
}

impl Diagnostics {
    pub fn new(app: AppState) -> Self {
        Self { app }
    }
}

impl DistantObject for Diagnostics {
    fn class_name(&self) -> &str {
        "Diagnostics"
    }

    fn invoke(&self, method: &str, _args: &[Value], _cx: &InvocationContext) -> Result<RemoteValue, InvokeError> {
        match method {
            "busy" => RemoteValue::data(self.app.busy_resources()),
            "is_idle" => RemoteValue::data(self.app.is_idle()),
            other => Err(InvokeError::UnknownMethod(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiesce_core::bridge::{BridgeHost, BridgeRequest, BridgeResponse, Dispatch, ObjectTable};
    use quiesce_core::config::SyncConfig;
    use quiesce_core::engine::SyncEngine;
    use serde_json::json;
    use std::time::Instant;

    struct Fixture {
        engine: SyncEngine,
        host: BridgeHost,
        _network: Arc<CountingResource>,
        _animation: Arc<TimedResource>,
    }

    fn fixture() -> Fixture {
        let engine = SyncEngine::start(SyncConfig {
            poll_interval_ms: 10,
            ..SyncConfig::default()
        })
        .unwrap();
        let network = Arc::new(CountingResource::new("network"));
        let animation = Arc::new(TimedResource::with_kind("animation", "animation"));
        engine.register_idling_resource(&network);
        engine.register_idling_resource(&animation);

        let table = Arc::new(ObjectTable::new());
        let app = Arc::new(DemoApp::new(
            engine.ui(),
            engine.tracker().clone(),
            network.clone(),
            animation.clone(),
        ));
        table.publish_root("app", app, Dispatch::UiThread);
        let diagnostics = Arc::new(Diagnostics::new(engine.synchronizer().app_state().clone()));
        table.publish_root("diagnostics", diagnostics, Dispatch::Background);
        let host = BridgeHost::new(table, engine.synchronizer().clone());
        Fixture {
            engine,
            host,
            _network: network,
            _animation: animation,
        }
    }

    async fn call(host: &BridgeHost, root: &str, method: &str, args: Vec<Value>) -> BridgeResponse {
        let BridgeResponse::Object { object } = host.handle_request(BridgeRequest::Root { name: root.into() }).await
        else {
            panic!("root {root} missing");
        };
        host.handle_request(BridgeRequest::Invoke {
            object: object.id,
            method: method.into(),
            args,
            timeout_ms: Some(2000),
        })
        .await
    }

    fn value(response: BridgeResponse) -> Value {
        match response {
            BridgeResponse::Value { value } => value.to_json(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn label_and_taps() {
        let f = fixture();
        call(&f.host, "app", "set_label", vec![json!("Hello")]).await;
        assert_eq!(value(call(&f.host, "app", "get_label", vec![]).await), json!("Hello"));
        assert_eq!(value(call(&f.host, "app", "tap", vec![]).await), json!(1));
        assert_eq!(value(call(&f.host, "app", "tap", vec![]).await), json!(2));
    }

    #[tokio::test]
    async fn request_keeps_the_next_call_waiting() {
        let f = fixture();
        call(&f.host, "app", "start_request", vec![json!(300)]).await;
        assert!(!f.engine.is_idle());

        let busy = value(call(&f.host, "diagnostics", "busy", vec![]).await);
        assert_eq!(busy[0]["name"], json!("network"));

        let start = Instant::now();
        call(&f.host, "app", "get_label", vec![]).await;
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(value(call(&f.host, "diagnostics", "is_idle", vec![]).await), json!(true));
    }

    #[tokio::test]
    async fn animation_reports_its_kind() {
        let f = fixture();
        call(&f.host, "app", "animate", vec![json!(500)]).await;
        let busy = f.engine.currently_busy_resources();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].name, "animation");
        assert_eq!(busy[0].kind, "animation");
    }

    #[tokio::test]
    async fn tracked_work_holds_the_app_busy() {
        let f = fixture();
        assert_eq!(
            value(call(&f.host, "app", "begin_work", vec![json!(7), json!(300)]).await),
            json!(7)
        );
        let busy = f.engine.currently_busy_resources();
        assert_eq!(busy[0].name, "work #7");
        assert_eq!(busy[0].kind, "activity");

        let start = Instant::now();
        call(&f.host, "app", "tap", vec![]).await;
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(f.engine.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn bad_arguments_are_rejected() {
        let f = fixture();
        let response = call(&f.host, "app", "start_request", vec![json!("soon")]).await;
        assert!(matches!(response, BridgeResponse::Error(_)), "{response:?}");
        assert!(f.engine.is_idle());
    }
}
