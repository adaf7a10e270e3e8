//! Stub-socket driver tests against a mock in-app hook.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use common::{mock_stub_agent, RecordingDriver, StubReply};
use uixt_core::driver::{AutomationDriver, DriverError, ErrorKind};
use uixt_core::geometry::{Point, Size};
use uixt_core::info::LoginCredentials;
use uixt_core::options::ActionOptions;
use uixt_core::stub_driver::StubDriver;
use uixt_core::stub_protocol::StubCommand;

fn base(forward_port: u16) -> Arc<RecordingDriver> {
    Arc::new(RecordingDriver::with_forward_port(
        Size::new(1080.0, 1920.0),
        Size::new(1080.0, 1920.0),
        forward_port,
    ))
}

fn echo_hook(req: &uixt_core::stub_protocol::RequestFrame) -> StubReply {
    match &req.command {
        StubCommand::Ping => StubReply::Result(json!("pong")),
        StubCommand::DumpView { format } => {
            StubReply::Result(json!(format!("<tree format={}/>", format.as_deref().unwrap_or("xml"))))
        }
        StubCommand::InvokeStatic { class, method, args } => {
            StubReply::Result(json!({ "called": format!("{class}.{method}"), "args": args }))
        }
        StubCommand::IsLogin => StubReply::Result(json!({ "isLogin": true, "uid": 7, "nickname": "qa" })),
        StubCommand::Login { password, .. } if password.as_deref() == Some("wrong") => {
            StubReply::Result(json!(false))
        }
        StubCommand::Login { .. } => StubReply::Result(Value::Null),
        StubCommand::Logout => StubReply::Result(Value::Null),
    }
}

#[tokio::test]
async fn test_setup_forwards_device_port_and_connects() {
    let (addr, connections) = mock_stub_agent(echo_hook).await;
    let stub = StubDriver::new(base(addr.port()), 32111);

    stub.setup().await.unwrap();
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    let opts = ActionOptions::new().with_custom("format", json!("json"));
    assert_eq!(stub.source(&opts).await.unwrap(), "<tree format=json/>");
}

#[tokio::test]
async fn test_invoke_static_is_recorded_in_history() {
    let (addr, _) = mock_stub_agent(echo_hook).await;
    let stub = StubDriver::with_address(base(0), addr);
    stub.setup().await.unwrap();

    let value = stub
        .invoke_static("AppConfig", "reload", vec![json!(1), json!("fast")])
        .await
        .unwrap();
    assert_eq!(value, json!({ "called": "AppConfig.reload", "args": [1, "fast"] }));

    let history = stub.session().request_history().await;
    let last = history.last().unwrap();
    assert_eq!(last.method, "SOCKET");
    assert_eq!(last.target, "invokeStatic");
    assert!(last.success);
}

#[tokio::test]
async fn test_dropped_connection_reconnects_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let (addr, connections) = {
        let drops = drops.clone();
        mock_stub_agent(move |req| match &req.command {
            StubCommand::InvokeStatic { .. } if drops.fetch_add(1, Ordering::SeqCst) == 0 => StubReply::Drop,
            _ => echo_hook(req),
        })
        .await
    };
    let stub = StubDriver::with_address(base(0), addr);
    stub.setup().await.unwrap();

    let value = stub.invoke_static("A", "b", vec![]).await.unwrap();
    assert_eq!(value["called"], "A.b");
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_remote_error_is_a_backend_failure() {
    let (addr, connections) = mock_stub_agent(|req| match &req.command {
        StubCommand::InvokeStatic { .. } => StubReply::Error("no such class".into()),
        _ => echo_hook(req),
    })
    .await;
    let stub = StubDriver::with_address(base(0), addr);
    stub.setup().await.unwrap();

    let err = stub.invoke_static("Missing", "x", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
    assert!(err.to_string().contains("no such class"));
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    let history = stub.session().request_history().await;
    assert!(!history.last().unwrap().success);
}

#[tokio::test]
async fn test_login_confirms_status() {
    let (addr, _) = mock_stub_agent(echo_hook).await;
    let stub = StubDriver::with_address(base(0), addr);
    stub.setup().await.unwrap();

    let credentials = LoginCredentials {
        phone: Some("13800000000".into()),
        captcha: Some("1234".into()),
        password: None,
    };
    let info = stub.login(&credentials).await.unwrap();
    assert!(info.is_login);
    assert_eq!(info.uid.as_deref(), Some("7"));

    let rejected = LoginCredentials {
        password: Some("wrong".into()),
        ..credentials
    };
    let err = stub.login(&rejected).await.unwrap_err();
    assert!(matches!(err, DriverError::CommandFailed(_)));

    stub.logout().await.unwrap();
}

#[tokio::test]
async fn test_gestures_go_to_base_driver() {
    let (addr, _) = mock_stub_agent(echo_hook).await;
    let recording = base(0);
    let stub = StubDriver::with_address(recording.clone(), addr);
    stub.setup().await.unwrap();

    stub.tap_xy(0.25, 0.5, &ActionOptions::new()).await.unwrap();
    assert_eq!(recording.taps(), vec![Point::new(270.0, 960.0)]);
    assert_eq!(stub.screenshot().await.unwrap()[..4], b"\x89PNG"[..]);
}

#[tokio::test]
async fn test_unreachable_hook_fails_setup() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let stub = StubDriver::with_address(base(0), addr);
    let err = stub.setup().await.unwrap_err();
    assert!(err.is_transport());
}
