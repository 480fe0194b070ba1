mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use toolhub::connection::ConnectionState;
use toolhub::error::ErrorKind;
use toolhub::tools::ToolCallRequest;
use toolhub::Hub;

use common::{fast_config, subprocess_descriptor, wait_until};

async fn hub_with(dir: &TempDir, servers: &[(&str, &[&str])]) -> Hub {
    let hub = Hub::start(fast_config(dir.path())).await.unwrap();
    for (name, args) in servers {
        hub.add_server(&subprocess_descriptor(name, args)).await.unwrap();
    }
    hub
}

#[tokio::test]
async fn echo_server_round_trip() {
    let dir = TempDir::new().unwrap();
    let hub = hub_with(&dir, &[("s1", &[])]).await;

    let names: Vec<String> = hub.catalog().iter().map(|t| t.qualified_name.clone()).collect();
    assert!(names.contains(&"s1.echo".to_string()), "{names:?}");
    assert!(names.contains(&"s1.sleep".to_string()));

    let result = hub.call_tool("s1.echo", json!({"text": "hi"})).await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.payload, Some(json!({"text": "hi"})));
    hub.shutdown().await;
}

#[tokio::test]
async fn remote_failure_is_relayed_as_structured_error() {
    let dir = TempDir::new().unwrap();
    let hub = hub_with(&dir, &[("s1", &[])]).await;

    let result = hub.call_tool("s1.fail", json!({})).await;
    assert!(!result.success);
    let error = result.error.expect("error body");
    assert_eq!(error.kind, ErrorKind::Remote);
    assert!(error.message.contains("tool_error"), "{}", error.message);
    hub.shutdown().await;
}

#[tokio::test]
async fn timed_out_calls_return_promptly_and_leave_session_usable() {
    let dir = TempDir::new().unwrap();
    let hub = hub_with(&dir, &[("slow", &[])]).await;

    for _ in 0..5 {
        let started = Instant::now();
        let result = hub
            .call(ToolCallRequest::new(
                "slow.sleep",
                json!({"ms": 5_000}),
                Duration::from_millis(200),
            ))
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    }

    let result = hub.call_tool("slow.echo", json!({"after": "timeouts"})).await;
    assert!(result.success, "{result:?}");
    assert_eq!(
        hub.list_servers().unwrap()[0].state,
        Some(ConnectionState::Ready)
    );
    hub.shutdown().await;
}

#[tokio::test]
async fn disable_lets_in_flight_call_finish_and_rejects_new_ones() {
    let dir = TempDir::new().unwrap();
    let hub = Arc::new(hub_with(&dir, &[("s1", &[])]).await);

    let in_flight = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            hub.call(ToolCallRequest::new(
                "s1.sleep",
                json!({"ms": 300}),
                Duration::from_secs(5),
            ))
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    hub.disable_server("s1").await.unwrap();

    let started = Instant::now();
    let rejected = hub.call_tool("s1.echo", json!({})).await;
    assert_eq!(rejected.error_kind(), Some(ErrorKind::Unavailable));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(!hub.catalog().iter().any(|t| t.owning_server == "s1"));

    let finished = in_flight.await.unwrap();
    assert!(finished.success, "{finished:?}");
    assert_eq!(finished.payload, Some(json!({"slept_ms": 300})));
    hub.shutdown().await;
}

#[tokio::test]
async fn adding_a_server_does_not_wait_for_another_to_drain() {
    let dir = TempDir::new().unwrap();
    let hub = Arc::new(hub_with(&dir, &[("a", &[])]).await);

    let in_flight = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            hub.call(ToolCallRequest::new(
                "a.sleep",
                json!({"ms": 1_500}),
                Duration::from_secs(5),
            ))
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let disabling = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move { hub.disable_server("a").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    hub.add_server(&subprocess_descriptor("b", &[])).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert!(hub.call_tool("b.echo", json!({})).await.success);
    assert!(!disabling.is_finished(), "a should still be draining");

    disabling.await.unwrap().unwrap();
    assert!(in_flight.await.unwrap().success);
    hub.shutdown().await;
}

#[tokio::test]
async fn stalled_server_does_not_delay_another() {
    let dir = TempDir::new().unwrap();
    let hub = Arc::new(hub_with(&dir, &[("a", &[]), ("b", &[])]).await);

    let stalled = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            hub.call(ToolCallRequest::new(
                "a.sleep",
                json!({"ms": 2_000}),
                Duration::from_secs(5),
            ))
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let quick = hub.call_tool("b.echo", json!({"n": 1})).await;
    assert!(quick.success);
    assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
    assert!(!stalled.is_finished());

    assert!(stalled.await.unwrap().success);
    hub.shutdown().await;
}

#[tokio::test]
async fn crashed_subprocess_is_reopened() {
    let dir = TempDir::new().unwrap();
    let hub = hub_with(&dir, &[("crashy", &["--exit-after", "1"])]).await;

    assert!(hub.call_tool("crashy.echo", json!({"n": 1})).await.success);

    let lost = hub.call_tool("crashy.echo", json!({"n": 2})).await;
    assert!(!lost.success);
    assert!(
        matches!(lost.error_kind(), Some(ErrorKind::Transport) | Some(ErrorKind::Unavailable)),
        "{lost:?}"
    );

    let hub_ref = &hub;
    let recovered = wait_until(Duration::from_secs(5), || async move {
        hub_ref.call_tool("crashy.echo", json!({"n": 3})).await.success
    })
    .await;
    assert!(recovered, "connection was not re-established");
    hub.shutdown().await;
}

#[tokio::test]
async fn unknown_command_never_becomes_ready() {
    let dir = TempDir::new().unwrap();
    let hub = Hub::start(fast_config(dir.path())).await.unwrap();
    hub.add_server(
        &json!({
            "name": "ghost",
            "description": "missing binary",
            "command": "toolhub-no-such-binary",
        })
        .to_string(),
    )
    .await
    .unwrap();

    let hub_ref = &hub;
    let degraded = wait_until(Duration::from_secs(3), || async move {
        hub_ref.list_servers().unwrap()[0].state == Some(ConnectionState::Degraded)
    })
    .await;
    assert!(degraded);
    let result = hub.call_tool("ghost.echo", json!({})).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Unavailable));
    assert_eq!(hub.health().unwrap().reachable, 0);
    hub.shutdown().await;
}
