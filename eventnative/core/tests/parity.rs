//! Native plans and worker processes must agree on every expression the
//! native compiler accepts.

mod common;

use common::{event, worker_config};
use eventnative_core::{ExecutorBuilder, ExecutorKind, TemplateExecutor, TransportKind};
use serde_json::{json, Value};
use std::sync::Arc;

const EXPRESSIONS: &[&str] = &[
    "return {...$, hello: $.id}",
    "$.user?.name",
    "$.user?.address.city",
    "[$.id, ...$.items, 'tail']",
    "{b: 1, a: $.id, 2: 'two', 1: 'one', nested: {...$.user}}",
    "return $['items'][1]",
    "{len: $.items.length, first: $.name[0], chars: [...$.name]}",
    "{big: $.big, ratio: $.ratio, negative: -0.5, exp: 1e3}",
    "return $.id;",
];

/// Accepted by the worker but discarded as statements; never planned natively.
const STATEMENTS: &[&str] = &["$.id;", "{a: $.id};"];

fn events() -> Vec<Value> {
    vec![
        json!({"id": 1, "name": "ann", "items": [1, 2, 3], "big": 9007199254740993u64, "ratio": 0.1,
               "user": {"name": "Ann", "address": {"city": "Oslo"}}}),
        json!({"id": "x", "name": "bob", "items": ["a", null], "big": 10, "ratio": 2.5, "user": null}),
        json!({"name": "", "items": [], "user": {"name": null, "address": {}}, "extra": {"z": 1, "0": 2}}),
    ]
}

async fn outcomes(executor: &TemplateExecutor) -> Vec<Result<Value, String>> {
    let mut outcomes = Vec::new();
    for value in events() {
        let outcome = executor
            .process_event(&event(value))
            .await
            .map_err(|err| err.kind().to_string());
        outcomes.push(outcome);
    }
    outcomes
}

async fn assert_parity(transport: TransportKind) {
    let config = Arc::new(worker_config(transport));
    for expression in EXPRESSIONS {
        let native = ExecutorBuilder::new()
            .name("parity")
            .expression(*expression)
            .build()
            .await
            .unwrap();
        assert_eq!(native.kind(), ExecutorKind::Native, "{}", expression);

        let worker = ExecutorBuilder::new()
            .name("parity")
            .expression(*expression)
            .config(Arc::clone(&config))
            .prefer_native(false)
            .build()
            .await
            .unwrap();
        assert!(!worker.is_native());

        assert_eq!(outcomes(&native).await, outcomes(&worker).await, "{}", expression);
        worker.close().await.unwrap();
    }

    for statement in STATEMENTS {
        let defaulted = ExecutorBuilder::new()
            .name("statement")
            .expression(*statement)
            .config(Arc::clone(&config))
            .build()
            .await
            .unwrap();
        assert!(!defaulted.is_native(), "{}", statement);

        let forced = ExecutorBuilder::new()
            .name("statement")
            .expression(*statement)
            .config(Arc::clone(&config))
            .prefer_native(false)
            .build()
            .await
            .unwrap();
        let results = outcomes(&defaulted).await;
        assert!(results.iter().all(|outcome| outcome == &Ok(Value::Null)), "{}", statement);
        assert_eq!(results, outcomes(&forced).await, "{}", statement);
        defaulted.close().await.unwrap();
        forced.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_native_matches_pipe_worker() {
    assert_parity(TransportKind::Pipe).await;
}

#[tokio::test]
async fn test_native_matches_shared_memory_worker() {
    assert_parity(TransportKind::SharedMemory).await;
}

#[tokio::test]
async fn test_key_order_follows_javascript() {
    let native = ExecutorBuilder::new()
        .name("order")
        .expression("{b: 1, 10: 'ten', a: 2, 2: 'two'}")
        .build()
        .await
        .unwrap();
    let result = native.process_event(&event(json!({}))).await.unwrap();
    let keys: Vec<&String> = result.as_object().unwrap().keys().collect();
    assert_eq!(keys, ["2", "10", "b", "a"]);
}
