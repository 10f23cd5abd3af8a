//! Driver-to-application round trips over a real TCP bridge.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use quiesce_core::bridge::{BridgeClient, BridgeError, BridgeHost, Dispatch, ObjectTable, RemoteValue};
use quiesce_core::synchronizer::SyncError;

use common::{quick_client_config, FakeApp, FakeResource, HostFixture};

#[tokio::test]
async fn invoke_root_methods() {
    let fixture = HostFixture::start().await;
    let client = fixture.client().await;
    let app = client.root("app").await.unwrap();
    assert_eq!(app.class_name(), "FakeApp");

    app.invoke("set_label", vec![json!("Signed in")]).await.unwrap();
    let label = app.invoke("get_label", vec![]).await.unwrap();
    assert_eq!(label, RemoteValue::Data(json!("Signed in")));
}

#[tokio::test]
async fn returned_objects_become_proxies() {
    let fixture = HostFixture::start().await;
    let client = fixture.client().await;
    let app = client.root("app").await.unwrap();

    let dialog = app.invoke_object("open_dialog", vec![json!("Confirm")]).await.unwrap();
    assert_eq!(dialog.class_name(), "Dialog");
    assert_eq!(
        dialog.invoke("title", vec![]).await.unwrap(),
        RemoteValue::Data(json!("Confirm"))
    );
    assert_eq!(dialog.resolve().await.unwrap().id, dialog.id());
}

#[tokio::test]
async fn stale_proxy_fails_instead_of_hanging() {
    let fixture = HostFixture::start().await;
    let client = fixture.client().await;
    let app = client.root("app").await.unwrap();
    let dialog = app.invoke_object("open_dialog", vec![json!("Delete?")]).await.unwrap();

    app.invoke("close_dialog", vec![]).await.unwrap();

    let start = Instant::now();
    let err = dialog.invoke("title", vec![]).await.unwrap_err();
    assert!(
        matches!(err, BridgeError::RemoteReferenceStale { id } if id == dialog.id()),
        "{err:?}"
    );
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        dialog.resolve().await,
        Err(BridgeError::RemoteReferenceStale { .. })
    ));
}

#[tokio::test]
async fn remote_failures_are_invocation_errors() {
    let fixture = HostFixture::start().await;
    let client = fixture.client().await;
    let app = client.root("app").await.unwrap();

    match app.invoke("fail", vec![]).await.unwrap_err() {
        BridgeError::RemoteInvocationError { method, message } => {
            assert_eq!(method, "fail");
            assert_eq!(message, "requested failure");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        client.root("settings").await,
        Err(BridgeError::UnknownRoot(name)) if name == "settings"
    ));
}

#[tokio::test]
async fn busy_application_times_out_across_the_bridge() {
    let fixture = HostFixture::start().await;
    let network = FakeResource::busy("network");
    fixture.engine.register_idling_resource(&network);

    let client = fixture.client().await;
    let app = client.root("app").await.unwrap();
    let err = app
        .invoke_with_timeout("get_label", vec![], Duration::from_millis(300))
        .await
        .unwrap_err();
    match err {
        BridgeError::Synchronization(SyncError::SynchronizationTimeout { busy, .. }) => {
            assert_eq!(busy.len(), 1);
            assert_eq!(busy[0].name, "network");
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(client.busy_resources().await.unwrap()[0].name, "network");
    network.set_busy(false);
    client.wait_for_idle(Some(Duration::from_secs(2))).await.unwrap();
    assert!(client.busy_resources().await.unwrap().is_empty());
}

#[tokio::test]
async fn host_going_away_is_transport_unavailable() {
    let fixture = HostFixture::start().await;
    let client = fixture.client().await;
    let app = client.root("app").await.unwrap();

    let HostFixture { engine, handle, .. } = fixture;
    handle.stop().await;

    let err = app.invoke("get_label", vec![]).await.unwrap_err();
    assert!(err.is_transport(), "{err:?}");
    // The next call re-dials and still finds nobody listening.
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, BridgeError::TransportUnavailable(_)), "{err:?}");
    drop(engine);
}

#[tokio::test]
async fn test_side_objects_served_without_ui_thread() {
    let table = Arc::new(ObjectTable::new());
    table.publish_root("recorder", Arc::new(FakeApp::default()), Dispatch::Background);
    let handle = BridgeHost::without_ui(table).bind("127.0.0.1:0").await.unwrap();

    let client = BridgeClient::connect(handle.local_addr().to_string(), quick_client_config())
        .await
        .unwrap();
    let recorder = client.root("recorder").await.unwrap();
    recorder.invoke("set_label", vec![json!("step 1")]).await.unwrap();
    assert_eq!(
        recorder.invoke("get_label", vec![]).await.unwrap(),
        RemoteValue::Data(json!("step 1"))
    );
    handle.stop().await;
}

#[tokio::test]
async fn clients_share_one_host() {
    let fixture = HostFixture::start().await;
    let first = fixture.client().await;
    let second = fixture.client().await;

    first
        .root("app")
        .await
        .unwrap()
        .invoke("set_label", vec![json!("shared")])
        .await
        .unwrap();
    let label = second
        .root("app")
        .await
        .unwrap()
        .invoke("get_label", vec![])
        .await
        .unwrap();
    assert_eq!(label, RemoteValue::Data(json!("shared")));
}
