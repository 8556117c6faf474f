use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use conductor_runtime::{
    memory_transport, start_activity, Activity, ActivityResult, Choice, Continuation,
    ExecutionContext, ExecutionMode, Install, Interrupt, Message, Outbound, RuntimeApp, RuntimeError,
    RuntimeEventKind, Scope, Sequence, SessionListener, SessionReport, SpawnerBuilder,
    TerminationCause, Throw, CORRELATION_ERROR,
};

struct Pause(Duration);

#[async_trait]
impl Activity for Pause {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        tokio::time::sleep(self.0).await;
        ctx.checkpoint()
    }
}

struct UntilKilled;

#[async_trait]
impl Activity for UntilKilled {
    async fn run(&self, ctx: &ExecutionContext) -> ActivityResult {
        ctx.killed().await;
        Err(Interrupt::Killed)
    }
}

struct Mark {
    label: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Activity for Mark {
    async fn run(&self, _ctx: &ExecutionContext) -> ActivityResult {
        self.log.lock().push(self.label);
        Ok(())
    }
}

struct Pong;

#[async_trait]
impl Continuation for Pong {
    async fn resume(&self, ctx: &ExecutionContext, message: Message) -> ActivityResult {
        ctx.reply(&message, json!("pong")).await
    }
}

#[derive(Default)]
struct CauseRecorder {
    causes: Mutex<Vec<TerminationCause>>,
}

#[async_trait]
impl SessionListener for CauseRecorder {
    async fn on_session_executed(&self, report: &SessionReport) -> Result<(), String> {
        self.causes.lock().push(report.cause.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_sequential_spawn_complete_trace() {
    let handle = start_activity(
        ExecutionMode::Sequential,
        Arc::new(Pause(Duration::from_millis(10))),
    );
    let mut events = handle.subscribe_events();

    handle
        .on_inbound_start(Message::correlated("start", 1, json!(null)))
        .await
        .unwrap();
    let second = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .on_inbound_start(Message::correlated("start", 2, json!(null)))
                .await
        })
    };

    let mut trace = Vec::new();
    while trace.len() < 4 {
        match events.recv().await.unwrap().kind {
            RuntimeEventKind::SessionSpawned { correlation_id, .. } => {
                trace.push(("spawn", correlation_id))
            }
            RuntimeEventKind::SessionCompleted { correlation_id, .. } => {
                trace.push(("complete", correlation_id))
            }
            _ => {}
        }
    }
    assert_eq!(
        trace,
        vec![
            ("spawn", Some(1)),
            ("complete", Some(1)),
            ("spawn", Some(2)),
            ("complete", Some(2)),
        ]
    );
    assert!(second.await.unwrap().is_ok());
    handle.shutdown().await.unwrap();
    assert_eq!(handle.active_session_count(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_every_mode() {
    for mode in [
        ExecutionMode::Single,
        ExecutionMode::Concurrent,
        ExecutionMode::Sequential,
    ] {
        let handle = start_activity(mode, Arc::new(Pause(Duration::from_millis(5))));
        if mode != ExecutionMode::Single {
            for correlation_id in 0..3 {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let _ = handle
                        .on_inbound_start(Message::correlated("start", correlation_id, json!(null)))
                        .await;
                });
            }
            tokio::task::yield_now().await;
        }

        handle.shutdown().await.unwrap();
        assert_eq!(handle.active_session_count(), 0, "mode {mode}");
        assert!(handle.running_state().is_idle());
        assert!(!handle.is_accepting());
    }
}

#[tokio::test]
async fn test_single_mode_surfaces_unhandled_fault() {
    let handle = start_activity(ExecutionMode::Single, Arc::new(Throw::named("Boom")));
    match handle.shutdown().await {
        Err(RuntimeError::UnhandledFault(fault)) => assert_eq!(fault.name(), "Boom"),
        other => panic!("expected unhandled fault, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_mode_handled_fault_is_not_surfaced() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let body = Scope::new(
        "work",
        Sequence::default()
            .then(Install::new().fault(
                "Boom",
                Mark {
                    label: "handled",
                    log: log.clone(),
                },
            ))
            .then(Throw::named("Boom")),
    );
    let handle = start_activity(ExecutionMode::Single, Arc::new(body));
    handle.shutdown().await.unwrap();
    assert_eq!(*log.lock(), vec!["handled"]);
}

#[tokio::test]
async fn test_concurrent_unhandled_fault_only_ends_its_session() {
    let recorder = Arc::new(CauseRecorder::default());
    let handle = SpawnerBuilder::new(ExecutionMode::Concurrent)
        .listener(recorder.clone())
        .start(Arc::new(Throw::named("Boom")));
    handle
        .on_inbound_start(Message::new("start", json!(null)))
        .await
        .unwrap();
    handle.shutdown().await.unwrap();

    let causes = recorder.causes.lock().clone();
    assert_eq!(causes.len(), 1);
    assert_eq!(causes[0].unhandled_fault().map(|f| f.name()), Some("Boom"));
}

#[tokio::test]
async fn test_grace_kill_runs_compensation() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let body = Scope::new(
        "work",
        Sequence::default()
            .then(Install::new().compensation(Mark {
                label: "compensated",
                log: log.clone(),
            }))
            .then(UntilKilled),
    );
    let handle = SpawnerBuilder::new(ExecutionMode::Concurrent)
        .shutdown_grace(Duration::from_millis(10))
        .start(Arc::new(body));
    handle
        .on_inbound_start(Message::new("start", json!(null)))
        .await
        .unwrap();

    handle.shutdown().await.unwrap();
    assert_eq!(handle.active_session_count(), 0);
    assert_eq!(*log.lock(), vec!["compensated"]);
}

#[tokio::test]
async fn test_memory_transport_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conductor.yaml");
    std::fs::write(
        &path,
        "version: 1\nruntime:\n  execution_mode: concurrent\n  start_operations: [start]\n",
    )
    .unwrap();

    let (mut client, server) = memory_transport(8);
    let outbound: Arc<dyn Outbound> = server.outbound.clone();
    let body = Choice::new().on("ping", Pong);
    let app = RuntimeApp::from_config_path_with(
        &path,
        Arc::new(body),
        Some(outbound),
        Vec::new(),
    )
    .unwrap();
    let serving = tokio::spawn(async move { app.serve(server.inbound).await });

    client
        .send(Message::correlated("start", 1, json!(null)))
        .await
        .unwrap();
    client
        .send(Message::correlated("ping", 1, json!(null)))
        .await
        .unwrap();
    let reply = client.recv().await.unwrap();
    assert_eq!(reply.correlation_id, Some(1));
    assert_eq!(reply.payload, json!("pong"));

    client
        .send(Message::correlated("ping", 99, json!(null)))
        .await
        .unwrap();
    let rejected = client.recv().await.unwrap();
    assert_eq!(rejected.correlation_id, Some(99));
    assert_eq!(rejected.fault.map(|f| f.name().to_string()), Some(CORRELATION_ERROR.to_string()));

    client.close_inbound();
    let stats = serving.await.unwrap().unwrap();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.rejected, 1);
}
