use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use eventnative_core::config::{DEFAULT_WORKER_BINARY, WORKER_COMMAND_ENV};
use eventnative_core::{ExecutorBuilder, ExecutorConfig, TemplateExecutor, TransportKind};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;

const EXPRESSION: &str = "return {...$, hello: $.id}";

fn bench_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Benches run from `target/<profile>/deps`; the worker sits one level up.
fn worker_binary() -> PathBuf {
    if let Some(command) = std::env::var_os(WORKER_COMMAND_ENV) {
        return PathBuf::from(command);
    }
    let exe = std::env::current_exe().expect("bench executable path");
    let deps = exe.parent().expect("bench directory");
    deps.parent().unwrap_or(deps).join(DEFAULT_WORKER_BINARY)
}

fn executor(rt: &Runtime, transport: Option<TransportKind>) -> TemplateExecutor {
    let mut config = ExecutorConfig::default();
    config.worker.command = Some(worker_binary());
    let builder = ExecutorBuilder::new().name("bench").expression(EXPRESSION);
    let builder = match transport {
        Some(transport) => builder
            .config(Arc::new(config.with_transport(transport)))
            .prefer_native(false),
        None => builder.config(Arc::new(config)),
    };
    rt.block_on(builder.build()).expect("executor")
}

fn bench_executors(c: &mut Criterion) {
    let rt = bench_runtime();
    let event = eventnative_core::event::from_value(serde_json::json!({
        "id": "0f1e2d3c",
        "event_type": "pageview",
        "url": "https://example.com/path?q=1",
        "user": {"anonymous_id": "a1b2", "hash_id": "c3d4"},
        "items": [1, 2, 3, 4, 5],
    }))
    .expect("event");

    let cases = [
        ("native", executor(&rt, None)),
        ("pipe", executor(&rt, Some(TransportKind::Pipe))),
        ("shared_memory", executor(&rt, Some(TransportKind::SharedMemory))),
    ];

    let mut group = c.benchmark_group("process_event");
    for (name, executor) in &cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &event, |b, event| {
            b.to_async(&rt).iter(|| async {
                let result = executor.process_event(event).await.expect("result");
                black_box(result);
            });
        });
    }
    group.finish();

    c.bench_function("smart_parse_native", |b| {
        b.to_async(&rt).iter(|| async {
            let executor = eventnative_core::smart_parse("bench", EXPRESSION, None)
                .await
                .expect("executor");
            black_box(executor.kind());
        });
    });

    for (_, executor) in &cases {
        rt.block_on(executor.close()).expect("close");
    }
}

criterion_group!(benches, bench_executors);
criterion_main!(benches);
