// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log streaming and command injection tests.

mod common;

use std::time::Duration;

use bronto_agent::runtime::MockRuntime;
use bronto_agent::{Error, LogStream};
use common::{Harness, memory_harness, test_config};
use futures::StreamExt;

const WAIT: Duration = Duration::from_secs(2);

async fn running_harness(runtime: MockRuntime) -> Harness {
    let h = memory_harness(runtime);
    h.manager.add_instance(1, test_config("/srv/a")).await.unwrap();
    h.manager.start_instance(1).await.unwrap();
    h
}

async fn next(stream: &mut LogStream) -> Option<String> {
    tokio::time::timeout(WAIT, stream.next_line())
        .await
        .expect("log stream stalled")
}

/// Write a line to the stdout of instance 1.
async fn emit(h: &Harness, line: &str) {
    let container_id = h.container_id(1).await;
    h.runtime.emit_output(&container_id, line).await;
}

// ============================================================================
// Logs
// ============================================================================

#[tokio::test]
async fn test_logs_stream_lines_in_order() {
    let h = running_harness(MockRuntime::new()).await;
    let mut logs = h.manager.logs(1).await.unwrap();
    assert_eq!(logs.instance_id(), 1);

    emit(&h, "[Server thread/INFO]: Starting minecraft server").await;
    emit(&h, "[Server thread/INFO]: Done (3.2s)!").await;

    assert_eq!(
        next(&mut logs).await.as_deref(),
        Some("[Server thread/INFO]: Starting minecraft server")
    );
    assert_eq!(
        next(&mut logs).await.as_deref(),
        Some("[Server thread/INFO]: Done (3.2s)!")
    );
}

#[tokio::test]
async fn test_logs_include_stderr() {
    let h = running_harness(MockRuntime::new()).await;
    let mut logs = h.manager.logs(1).await.unwrap();
    let container_id = h.container_id(1).await;

    h.runtime
        .emit_error(&container_id, "WARN Can't keep up!")
        .await;

    assert_eq!(next(&mut logs).await.as_deref(), Some("WARN Can't keep up!"));
}

#[tokio::test]
async fn test_logs_as_stream() {
    let h = running_harness(MockRuntime::new()).await;
    let logs = h.manager.logs(1).await.unwrap();

    emit(&h, "a").await;
    emit(&h, "b").await;
    let container_id = h.container_id(1).await;
    h.runtime.exit_container(&container_id).await;

    let lines: Vec<String> = tokio::time::timeout(WAIT, logs.collect())
        .await
        .expect("stream should end when the server exits");
    assert_eq!(lines, vec!["a", "b"]);
}

#[tokio::test]
async fn test_logs_require_running_instance() {
    let h = memory_harness(MockRuntime::new());

    assert!(matches!(h.manager.logs(1).await, Err(Error::DoesNotExist(1))));

    h.manager.add_instance(1, test_config("/srv/a")).await.unwrap();
    assert!(matches!(h.manager.logs(1).await, Err(Error::IsNotRunning(1))));
    assert_eq!(h.runtime.attach_calls(), 0);
}

#[tokio::test]
async fn test_stop_ends_log_stream() {
    let h = running_harness(MockRuntime::new()).await;
    let mut logs = h.manager.logs(1).await.unwrap();

    h.manager.stop_instance(1).await.unwrap();

    assert_eq!(next(&mut logs).await, None);
}

#[tokio::test]
async fn test_shutdown_ends_log_streams() {
    let h = running_harness(MockRuntime::new()).await;
    let mut first = h.manager.logs(1).await.unwrap();
    let mut second = h.manager.logs(1).await.unwrap();

    h.manager.shutdown();

    assert_eq!(next(&mut first).await, None);
    assert_eq!(next(&mut second).await, None);
}

#[tokio::test]
async fn test_closed_stream_ends_only_itself() {
    let h = running_harness(MockRuntime::new()).await;
    let mut kept = h.manager.logs(1).await.unwrap();
    let mut closed = h.manager.logs(1).await.unwrap();

    closed.close();
    assert_eq!(next(&mut closed).await, None);

    emit(&h, "still here").await;
    assert_eq!(next(&mut kept).await.as_deref(), Some("still here"));
}

// ============================================================================
// Attach limits
// ============================================================================

#[tokio::test]
async fn test_attach_limit_reached() {
    // Harness allows two sessions per instance.
    let h = running_harness(MockRuntime::new()).await;
    let first = h.manager.logs(1).await.unwrap();
    let _second = h.manager.logs(1).await.unwrap();

    let err = h.manager.logs(1).await.unwrap_err();
    assert!(matches!(err, Error::AttachLimitReached(1)));
    assert_eq!(err.http_status(), 409);
    assert!(matches!(
        h.manager.send_command(1, "list").await,
        Err(Error::AttachLimitReached(1))
    ));

    drop(first);
    let reopened = tokio::time::timeout(WAIT, async {
        loop {
            match h.manager.logs(1).await {
                Ok(stream) => return stream,
                Err(Error::AttachLimitReached(_)) => tokio::task::yield_now().await,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    })
    .await;
    assert!(reopened.is_ok(), "dropping a stream should release its permit");
}

#[tokio::test]
async fn test_single_attach_runtime() {
    let h = running_harness(MockRuntime::new().without_multiplexed_attach()).await;
    let _logs = h.manager.logs(1).await.unwrap();

    assert!(matches!(
        h.manager.logs(1).await,
        Err(Error::AttachLimitReached(1))
    ));
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::test]
async fn test_send_command_writes_one_line() {
    let h = running_harness(MockRuntime::new()).await;
    let container_id = h.container_id(1).await;

    for (sent, text) in ["say hello", "list\n", "stop\r\n"].into_iter().enumerate() {
        h.manager.send_command(1, text).await.unwrap();
        h.runtime
            .wait_for_commands(&container_id, sent + 1, WAIT)
            .await;
    }

    let received = h.runtime.received_commands(&container_id).await;
    assert_eq!(received, vec!["say hello", "list", "stop"]);
    assert_eq!(h.runtime.attach_calls(), 3);
}

#[tokio::test]
async fn test_send_command_releases_permit() {
    let h = running_harness(MockRuntime::new().without_multiplexed_attach()).await;

    for _ in 0..3 {
        h.manager.send_command(1, "list").await.unwrap();
    }
}

#[tokio::test]
async fn test_send_command_requires_running_instance() {
    let h = memory_harness(MockRuntime::new());

    assert!(matches!(
        h.manager.send_command(1, "list").await,
        Err(Error::DoesNotExist(1))
    ));

    h.manager.add_instance(1, test_config("/srv/a")).await.unwrap();
    let err = h.manager.send_command(1, "list").await.unwrap_err();
    assert!(matches!(err, Error::IsNotRunning(1)));
    assert_eq!(h.runtime.attach_calls(), 0);
}
