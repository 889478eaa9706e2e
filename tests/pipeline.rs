use futures::future::BoxFuture;
use pipeline_worker_lib::markers::{FileMarkerStore, SharedMarkerStore};
use pipeline_worker_lib::pipeline::{
    wait_for_exit, ExecutionContext, PipeConfig, PipelineError, RunnerRegistry, Stage,
    StageConfig, StageFault, StageRegistry,
};
use pipeline_worker_lib::queue::{QueueConfig, QueueRegistry};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type Seen = Arc<Mutex<Vec<(String, u64)>>>;

/// Records `(tag, sequence_id)` for every context that reaches it.
struct Recorder {
    id: String,
    tag: String,
    seen: Seen,
}

impl Stage for Recorder {
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
        Box::pin(async move {
            self.seen
                .lock()
                .expect("recorder lock")
                .push((self.tag.clone(), ctx.sequence_id));
            Ok(())
        })
    }
}

/// Panics on contexts carrying the `explode` attribute.
struct Exploder {
    id: String,
}

impl Stage for Exploder {
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(&'a self, ctx: &'a mut ExecutionContext) -> BoxFuture<'a, Result<(), StageFault>> {
        Box::pin(async move {
            if ctx.contains("explode") {
                panic!("exploded on message {}", ctx.sequence_id);
            }
            Ok(())
        })
    }
}

fn stage_registry(seen: &Seen) -> Arc<StageRegistry> {
    let mut stages = StageRegistry::with_builtins();
    stages.register(
        "explode",
        |config: &StageConfig| -> Result<Arc<dyn Stage>, PipelineError> {
            Ok(Arc::new(Exploder {
                id: config.id.clone(),
            }) as Arc<dyn Stage>)
        },
    );
    let seen = Arc::clone(seen);
    stages.register(
        "record",
        move |config: &StageConfig| -> Result<Arc<dyn Stage>, PipelineError> {
            let tag = config.params["tag"].as_str().unwrap_or("default").to_string();
            Ok(Arc::new(Recorder {
                id: config.id.clone(),
                tag,
                seen: Arc::clone(&seen),
            }) as Arc<dyn Stage>)
        },
    );
    Arc::new(stages)
}

fn open_queues(root: &Path) -> Arc<QueueRegistry> {
    let markers: SharedMarkerStore = Arc::new(FileMarkerStore::new(root.join("markers")));
    Arc::new(
        QueueRegistry::open_all(root, &[QueueConfig::new("events")], markers)
            .expect("open queues"),
    )
}

fn pipe(concurrency: usize, tag: &str) -> PipeConfig {
    serde_json::from_value(json!({
        "name": "index",
        "concurrency": concurrency,
        "input_queue": "events",
        "stages": [
            {"id": "reject_poison", "kind": "fail", "params": {"when_attribute": "poison"}},
            {"id": "record", "kind": "record", "params": {"tag": tag}}
        ]
    }))
    .expect("pipe config")
}

fn publish(queues: &QueueRegistry, sequence_id: u64, poison: bool) {
    let mut ctx = ExecutionContext::new(sequence_id);
    if poison {
        ctx.set("poison", json!(true));
    }
    queues
        .get("events")
        .expect("queue")
        .append(&ctx.encode().expect("encode"))
        .expect("append");
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn recorded(seen: &Seen) -> Vec<(String, u64)> {
    let mut entries = seen.lock().expect("recorder lock").clone();
    entries.sort();
    entries
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn faulted_messages_do_not_stop_the_pool() {
    let dir = TempDir::new().expect("tempdir");
    let queues = open_queues(dir.path());
    let seen: Seen = Arc::default();
    let mut runners =
        RunnerRegistry::from_config(&[pipe(3, "a")], stage_registry(&seen), Arc::clone(&queues))
            .expect("runners");
    runners.start_all().await.expect("start");

    for id in 0..20u64 {
        publish(&queues, id, id % 5 == 0);
    }

    let store = queues.get("events").expect("queue");
    eventually("every message consumed", || store.depth() == 0).await;
    eventually("clean messages recorded", || seen.lock().expect("lock").len() == 16).await;

    let reports = wait_for_exit(runners.stop_all()).await;
    assert_eq!(reports.len(), 3);
    let reports: Vec<_> = reports
        .into_iter()
        .map(|report| report.expect("clean worker exit"))
        .collect();
    assert_eq!(reports.iter().map(|r| r.executions).sum::<u64>(), 20);
    assert_eq!(reports.iter().map(|r| r.faults).sum::<u64>(), 4);

    // Each clean message was executed by exactly one worker.
    let expected: Vec<_> = (0..20u64)
        .filter(|id| id % 5 != 0)
        .map(|id| ("a".to_string(), id))
        .collect();
    assert_eq!(recorded(&seen), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_keeps_going_after_a_stage_panics() {
    let dir = TempDir::new().expect("tempdir");
    let queues = open_queues(dir.path());
    let seen: Seen = Arc::default();
    let config: PipeConfig = serde_json::from_value(json!({
        "name": "index",
        "concurrency": 1,
        "input_queue": "events",
        "stages": [
            {"id": "explode", "kind": "explode"},
            {"id": "record", "kind": "record", "params": {"tag": "solo"}}
        ]
    }))
    .expect("pipe config");
    let mut runners =
        RunnerRegistry::from_config(&[config], stage_registry(&seen), Arc::clone(&queues))
            .expect("runners");
    runners.start_all().await.expect("start");

    let store = queues.get("events").expect("queue");
    for id in 0..6u64 {
        let mut ctx = ExecutionContext::new(id);
        if id == 2 || id == 4 {
            ctx.set("explode", json!(true));
        }
        store.append(&ctx.encode().expect("encode")).expect("append");
    }

    eventually("every message consumed", || store.depth() == 0).await;
    eventually("survivors recorded", || seen.lock().expect("lock").len() == 4).await;

    let reports = wait_for_exit(runners.stop_all()).await;
    assert_eq!(reports.len(), 1);
    let report = reports
        .into_iter()
        .next()
        .expect("one worker")
        .expect("clean worker exit");
    assert_eq!(report.index, 0);
    assert_eq!(report.executions, 6);
    assert_eq!(report.faults, 2);

    let ids: Vec<u64> = recorded(&seen).into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, vec![0, 1, 3, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_right_after_start_exits_every_worker_cleanly() {
    let dir = TempDir::new().expect("tempdir");
    let queues = open_queues(dir.path());
    let seen: Seen = Arc::default();
    let mut runners =
        RunnerRegistry::from_config(&[pipe(4, "a")], stage_registry(&seen), queues)
            .expect("runners");

    runners.start_all().await.expect("start");
    assert_eq!(runners.get("index").expect("runner").worker_count(), 4);
    let handles = runners.stop_all();
    assert_eq!(handles.len(), 4);

    for result in wait_for_exit(handles).await {
        let report = result.expect("clean exit");
        assert_eq!(report.executions, 0);
    }
    assert!(recorded(&seen).is_empty());
    assert!(!runners.is_started());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_message_ends_only_the_worker_that_read_it() {
    let dir = TempDir::new().expect("tempdir");
    let queues = open_queues(dir.path());
    let seen: Seen = Arc::default();
    let mut runners =
        RunnerRegistry::from_config(&[pipe(2, "a")], stage_registry(&seen), Arc::clone(&queues))
            .expect("runners");
    runners.start_all().await.expect("start");

    let store = queues.get("events").expect("queue");
    store.append(b"not json").expect("append");
    eventually("garbage consumed", || store.depth() == 0).await;

    publish(&queues, 7, false);
    eventually("survivor processed the next message", || {
        seen.lock().expect("lock").len() == 1
    })
    .await;

    let results = wait_for_exit(runners.stop_all()).await;
    let failures: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0], PipelineError::Decode { .. }));
    assert_eq!(recorded(&seen), vec![("a".to_string(), 7)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_resumes_after_the_last_committed_message() {
    let dir = TempDir::new().expect("tempdir");
    let seen: Seen = Arc::default();
    {
        let queues = open_queues(dir.path());
        let mut runners = RunnerRegistry::from_config(
            &[pipe(2, "first")],
            stage_registry(&seen),
            Arc::clone(&queues),
        )
        .expect("runners");
        runners.start_all().await.expect("start");
        for id in 0..5u64 {
            publish(&queues, id, false);
        }
        eventually("first batch recorded", || seen.lock().expect("lock").len() == 5).await;
        wait_for_exit(runners.stop_all()).await;
    }

    let queues = open_queues(dir.path());
    for id in 5..8u64 {
        publish(&queues, id, false);
    }
    let mut runners = RunnerRegistry::from_config(
        &[pipe(2, "second")],
        stage_registry(&seen),
        Arc::clone(&queues),
    )
    .expect("runners");
    runners.start_all().await.expect("start");
    eventually("second batch recorded", || seen.lock().expect("lock").len() == 8).await;
    wait_for_exit(runners.stop_all()).await;

    let second: Vec<u64> = recorded(&seen)
        .into_iter()
        .filter(|(tag, _)| tag == "second")
        .map(|(_, id)| id)
        .collect();
    assert_eq!(second, vec![5, 6, 7]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn update_swaps_stages_without_redelivery() {
    let dir = TempDir::new().expect("tempdir");
    let queues = open_queues(dir.path());
    let seen: Seen = Arc::default();
    let mut runners =
        RunnerRegistry::from_config(&[pipe(2, "old")], stage_registry(&seen), Arc::clone(&queues))
            .expect("runners");
    runners.start_all().await.expect("start");

    publish(&queues, 1, false);
    eventually("old config ran", || seen.lock().expect("lock").len() == 1).await;

    let previous = runners.update(pipe(3, "new")).await.expect("update");
    assert_eq!(previous.len(), 2);
    wait_for_exit(previous).await;
    assert_eq!(runners.get("index").expect("runner").worker_count(), 3);

    publish(&queues, 2, false);
    eventually("new config ran", || seen.lock().expect("lock").len() == 2).await;
    wait_for_exit(runners.stop_all()).await;

    assert_eq!(
        recorded(&seen),
        vec![("new".to_string(), 2), ("old".to_string(), 1)]
    );
}

#[tokio::test]
async fn updating_an_unknown_stage_kind_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let queues = open_queues(dir.path());
    let seen: Seen = Arc::default();
    let mut runners =
        RunnerRegistry::from_config(&[], stage_registry(&seen), Arc::clone(&queues))
            .expect("runners");

    let mut config = pipe(1, "x");
    config.stages.push(StageConfig {
        id: "translate".to_string(),
        kind: "translate".to_string(),
        params: json!({}),
    });
    assert!(matches!(
        runners.update(config).await,
        Err(PipelineError::UnknownStage { .. })
    ));
    assert!(runners.stop("index").is_err());
}
