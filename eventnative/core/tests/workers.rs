//! Worker lifecycle against the real `template-worker` binary.

mod common;

use common::{event, worker_config};
use eventnative_core::{
    smart_parse, CounterReporter, Error, ExecutorBuilder, ExecutorConfig, ExecutorKind, Health,
    TemplateExecutor, TransportKind,
};
use eventnative_core::retry::RetryConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SPIN: &str = "$.spin ? (() => { while (true) {} })() : $.id";

async fn worker(expression: &str, config: ExecutorConfig) -> TemplateExecutor {
    ExecutorBuilder::new()
        .name("worker-test")
        .expression(expression)
        .config(Arc::new(config))
        .prefer_native(false)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_fallback_to_worker() {
    for transport in [TransportKind::Pipe, TransportKind::SharedMemory] {
        let config = worker_config(transport);
        let executor = smart_parse("double", "return $.items.map(i => i * 2)", Some(&config))
            .await
            .unwrap();
        let expected = match transport {
            TransportKind::Pipe => ExecutorKind::Pipe,
            TransportKind::SharedMemory => ExecutorKind::SharedMemory,
        };
        assert_eq!(executor.kind(), expected);
        assert_eq!(executor.health(), Health::Ready);
        assert_eq!(executor.worker_pids().len(), 1);
        assert_eq!(
            executor
                .process_event(&event(json!({"items": [1, 2, 3]})))
                .await
                .unwrap(),
            json!([2, 4, 6])
        );
        executor.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    for transport in [TransportKind::Pipe, TransportKind::SharedMemory] {
        let mut config = worker_config(transport);
        config.worker.pool_size = 2;
        let executor = worker("({id: $.id, square: $.id * $.id})", config).await;
        assert_eq!(executor.worker_pids().len(), 2);

        let requests = (0..200u64).map(|id| {
            let executor = &executor;
            async move {
                let result = executor.process_event(&event(json!({ "id": id }))).await;
                (id, result)
            }
        });
        for (id, result) in futures_util::future::join_all(requests).await {
            assert_eq!(result.unwrap(), json!({"id": id, "square": id * id}));
        }
        executor.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_evaluation_error_keeps_worker() {
    let counter = Arc::new(CounterReporter::new());
    let executor = ExecutorBuilder::new()
        .name("nested")
        .expression("$.a.b")
        .config(Arc::new(worker_config(TransportKind::Pipe)))
        .reporter(counter.clone())
        .prefer_native(false)
        .build()
        .await
        .unwrap();
    let pids = executor.worker_pids();
    assert!(matches!(
        executor.process_event(&event(json!({}))).await,
        Err(Error::Evaluation { .. })
    ));
    assert_eq!(
        executor.process_event(&event(json!({"a": {"b": 5}}))).await.unwrap(),
        json!(5)
    );
    assert_eq!(executor.worker_pids(), pids);
    assert_eq!(counter.count("evaluation"), 1);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_worker_rejects_invalid_script() {
    let result = ExecutorBuilder::new()
        .name("broken")
        .expression("return {{{")
        .config(Arc::new(worker_config(TransportKind::Pipe)))
        .build()
        .await;
    assert!(matches!(result, Err(Error::Compilation { .. })));
}

#[tokio::test]
async fn test_crashed_worker_is_respawned() {
    let counter = Arc::new(CounterReporter::new());
    let executor = ExecutorBuilder::new()
        .name("crash")
        .expression("$.id")
        .config(Arc::new(worker_config(TransportKind::Pipe)))
        .reporter(counter.clone())
        .prefer_native(false)
        .build()
        .await
        .unwrap();
    let pid = executor.worker_pids()[0];

    kill(pid);

    let mut recovered = None;
    for attempt in 0..50u64 {
        match executor.process_event(&event(json!({ "id": attempt }))).await {
            Ok(value) => {
                recovered = Some((attempt, value));
                break;
            }
            Err(err) => {
                assert!(
                    matches!(err, Error::WorkerLost { .. } | Error::Transport { .. }),
                    "unexpected error: {err}"
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    let (attempt, value) = recovered.expect("worker was not respawned");
    assert_eq!(value, json!(attempt));
    let new_pids = executor.worker_pids();
    assert_eq!(new_pids.len(), 1);
    assert_ne!(new_pids[0], pid);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_close_fails_outstanding_requests() {
    let executor = Arc::new(worker(SPIN, worker_config(TransportKind::Pipe)).await);
    let pid = executor.worker_pids()[0];

    let stuck = tokio::spawn({
        let executor = Arc::clone(&executor);
        async move { executor.process_event(&event(json!({"spin": true}))).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    executor.close().await.unwrap();
    assert!(matches!(stuck.await.unwrap(), Err(Error::Closed)));
    executor.close().await.unwrap();
    assert_eq!(executor.health(), Health::Dead);
    assert!(executor.worker_pids().is_empty());
    assert!(matches!(
        executor.process_event(&event(json!({"id": 1}))).await,
        Err(Error::Closed)
    ));

    // The spinning worker ignored the shutdown frame and was killed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let alive = std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .unwrap()
        .success();
    assert!(!alive);
}

fn kill(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

/// Starts `count` requests that spin inside the worker.
fn spinning(
    executor: &Arc<TemplateExecutor>,
    count: usize,
) -> Vec<tokio::task::JoinHandle<Result<serde_json::Value, Error>>> {
    (0..count)
        .map(|_| {
            let executor = Arc::clone(executor);
            tokio::spawn(async move { executor.process_event(&event(json!({"spin": true}))).await })
        })
        .collect()
}

#[tokio::test]
async fn test_killed_worker_fails_every_pending_request() {
    for transport in [TransportKind::Pipe, TransportKind::SharedMemory] {
        let counter = Arc::new(CounterReporter::new());
        let executor = Arc::new(
            ExecutorBuilder::new()
                .name("killed")
                .expression(SPIN)
                .config(Arc::new(worker_config(transport)))
                .reporter(counter.clone())
                .prefer_native(false)
                .build()
                .await
                .unwrap(),
        );
        let pid = executor.worker_pids()[0];

        let pending = spinning(&executor, 4);
        tokio::time::sleep(Duration::from_millis(200)).await;
        kill(pid);

        for request in futures_util::future::join_all(pending).await {
            assert!(matches!(request.unwrap(), Err(Error::WorkerLost { .. })));
        }
        assert!(counter.count("worker_lost") >= 4);

        assert_eq!(
            executor.process_event(&event(json!({"id": 11}))).await.unwrap(),
            json!(11)
        );
        assert_ne!(executor.worker_pids(), vec![pid]);
        executor.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_close_fails_every_pending_request() {
    let executor = Arc::new(worker(SPIN, worker_config(TransportKind::SharedMemory)).await);

    let pending = spinning(&executor, 4);
    tokio::time::sleep(Duration::from_millis(200)).await;
    executor.close().await.unwrap();

    for request in futures_util::future::join_all(pending).await {
        assert!(matches!(request.unwrap(), Err(Error::Closed)));
    }
}

#[tokio::test]
async fn test_respawn_budget_is_exhausted() {
    let dir = tempfile::TempDir::new().unwrap();
    let marker = dir.path().join("started");
    let script = dir.path().join("worker-once.sh");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\nif [ -e '{marker}' ]; then exit 1; fi\ntouch '{marker}'\nexec '{worker}' \"$@\"\n",
            marker = marker.display(),
            worker = env!("CARGO_BIN_EXE_template-worker"),
        ),
    )
    .unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut config = worker_config(TransportKind::Pipe);
    config.worker.command = Some(script);
    config.retry = Some(RetryConfig {
        max_attempts: 2,
        initial_backoff_ms: 10,
        max_backoff_ms: 10,
    });
    let counter = Arc::new(CounterReporter::new());
    let executor = ExecutorBuilder::new()
        .name("once")
        .expression("$.id")
        .config(Arc::new(config))
        .reporter(counter.clone())
        .prefer_native(false)
        .build()
        .await
        .unwrap();
    assert_eq!(
        executor.process_event(&event(json!({"id": 1}))).await.unwrap(),
        json!(1)
    );
    kill(executor.worker_pids()[0]);

    let mut exhausted = None;
    for _ in 0..50 {
        match executor.process_event(&event(json!({"id": 2}))).await {
            Err(Error::RespawnExhausted { attempts, .. }) => {
                exhausted = Some(attempts);
                break;
            }
            Err(Error::WorkerLost { .. }) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(exhausted, Some(2));
    assert_eq!(counter.count("handshake"), 2);

    // A failed slot fails fast instead of spawning again.
    assert!(matches!(
        executor.process_event(&event(json!({"id": 3}))).await,
        Err(Error::RespawnExhausted { attempts: 2, .. })
    ));
    assert_eq!(counter.count("handshake"), 2);
    assert_eq!(counter.count("respawn_exhausted"), 2);
    assert_eq!(executor.health(), Health::Dead);
    assert!(executor.worker_pids().is_empty());
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_oversized_response_over_pipe() {
    let mut config = worker_config(TransportKind::Pipe);
    config.max_frame_bytes = 4092;
    let executor = worker("[$, $, $, $]", config).await;
    let pid = executor.worker_pids()[0];

    let large = event(json!({"payload": "x".repeat(1500)}));
    match executor.process_event(&large).await {
        Err(Error::Evaluation { message }) => assert!(message.contains("4092"), "{message}"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(
        executor.process_event(&event(json!({"a": 1}))).await.unwrap(),
        json!([{"a": 1}, {"a": 1}, {"a": 1}, {"a": 1}])
    );
    assert_eq!(executor.worker_pids(), vec![pid]);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_timeouts_recycle_worker() {
    let mut config = worker_config(TransportKind::SharedMemory);
    config.request_timeout_ms = 200;
    config.degraded_after_timeouts = 1;
    config.recycle_after_timeouts = 2;
    let counter = Arc::new(CounterReporter::new());
    let executor = ExecutorBuilder::new()
        .name("spin")
        .expression(SPIN)
        .config(Arc::new(config))
        .reporter(counter.clone())
        .build()
        .await
        .unwrap();
    let pid = executor.worker_pids()[0];

    let spin = event(json!({"spin": true}));
    assert!(matches!(executor.process_event(&spin).await, Err(Error::Timeout { .. })));
    assert_eq!(executor.health(), Health::Degraded);
    assert!(matches!(executor.process_event(&spin).await, Err(Error::Timeout { .. })));
    assert_eq!(counter.count("timeout"), 2);

    assert_eq!(
        executor.process_event(&event(json!({"id": 7}))).await.unwrap(),
        json!(7)
    );
    assert_ne!(executor.worker_pids()[0], pid);
    assert_eq!(executor.health(), Health::Ready);
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_frame_too_large_for_segment() {
    let mut config = worker_config(TransportKind::SharedMemory);
    config.segment_capacity = 4096;
    let executor = worker("$.payload.length", config).await;

    let large = event(json!({"payload": "x".repeat(10_000)}));
    assert!(matches!(
        executor.process_event(&large).await,
        Err(Error::FrameTooLarge { capacity: 4092, .. })
    ));
    assert_eq!(
        executor
            .process_event(&event(json!({"payload": "xyz"})))
            .await
            .unwrap(),
        json!(3)
    );
    executor.close().await.unwrap();
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let mut config = worker_config(TransportKind::Pipe);
    config.worker.command = Some("/nonexistent/template-worker".into());
    let result = smart_parse("calls", "$.items.map(i => i)", Some(&config)).await;
    assert!(matches!(result, Err(Error::Spawn { .. })));
}
