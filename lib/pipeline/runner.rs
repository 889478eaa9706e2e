use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{ExecutionContext, ExecutionOutcome, PipeConfig, Pipeline, PipelineError, StageRegistry};
use crate::logging::format_error_report;
use crate::queue::{QueueConsumer, QueueRegistry};
use crate::server::monitoring::{PipelineLabels, PIPELINE_METRICS};

/// What a worker did before it exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub index: usize,
    pub executions: u64,
    pub faults: u64,
}

/// A spawned worker and its single-use shutdown signal.
pub struct WorkerHandle {
    index: usize,
    shutdown: CancellationToken,
    join: JoinHandle<Result<WorkerReport, PipelineError>>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn signal(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the worker task to end.
    pub async fn wait(self) -> Result<WorkerReport, PipelineError> {
        self.join.await?
    }
}

/// Awaits every handle, for callers that need a full drain after `stop`.
pub async fn wait_for_exit(handles: Vec<WorkerHandle>) -> Vec<Result<WorkerReport, PipelineError>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.wait().await);
    }
    results
}

struct WorkerContext {
    index: usize,
    pipeline_name: String,
    threshold: Option<Duration>,
    pipeline: Arc<Pipeline>,
    consumer: Arc<QueueConsumer>,
    shutdown: CancellationToken,
}

/// Worker pool for one configured pipeline.
pub struct PipeRunner {
    config: PipeConfig,
    stages: Arc<StageRegistry>,
    queues: Arc<QueueRegistry>,
    consumer: Option<Arc<QueueConsumer>>,
    workers: Vec<WorkerHandle>,
}

impl PipeRunner {
    pub fn new(config: PipeConfig, stages: Arc<StageRegistry>, queues: Arc<QueueRegistry>) -> Self {
        Self {
            config,
            stages,
            queues,
            consumer: None,
            workers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawns `concurrency` workers on the input queue.
    ///
    /// A disabled pipeline is a logged no-op. Stages and the queue are resolved
    /// before any worker is spawned, so a bad config starts nothing.
    pub async fn start(&mut self, config: PipeConfig) -> Result<(), PipelineError> {
        if self.is_running() {
            return Err(PipelineError::AlreadyStarted(self.config.name.clone()));
        }
        self.config = config;
        if !self.config.enabled {
            debug!(
                event = "pipeline_disabled",
                pipeline = %self.config.name,
                "Pipeline is disabled; not starting"
            );
            return Ok(());
        }
        self.config.validate()?;

        let pipeline = Arc::new(self.stages.build(&self.config)?);
        let consumer = self.consumer_for_config().await?;
        let threshold = (self.config.threshold_ms > 0)
            .then(|| Duration::from_millis(self.config.threshold_ms));

        let workers_alive = PIPELINE_METRICS.get().map(|metrics| {
            metrics
                .workers_alive
                .get_or_create(&PipelineLabels::new(&self.config.name))
                .clone()
        });
        for index in 0..self.config.concurrency {
            trace!(
                event = "pipeline_worker_starting",
                pipeline = %self.config.name,
                worker = index,
                "Starting worker"
            );
            let shutdown = CancellationToken::new();
            let ctx = WorkerContext {
                index,
                pipeline_name: self.config.name.clone(),
                threshold,
                pipeline: Arc::clone(&pipeline),
                consumer: Arc::clone(&consumer),
                shutdown: shutdown.clone(),
            };
            self.workers.push(WorkerHandle {
                index,
                shutdown,
                join: tokio::spawn(supervise_worker(ctx)),
            });
            // Workers from a previous start may still be draining; each one decrements on exit.
            if let Some(gauge) = &workers_alive {
                gauge.inc();
            }
        }

        info!(
            event = "pipeline_started",
            pipeline = %self.config.name,
            input_queue = %self.config.input_queue,
            workers = self.config.concurrency,
            "Pipeline started"
        );
        Ok(())
    }

    /// Reuses the consumer across restarts of the same queue and group, so
    /// workers still finishing after `stop` share a cursor with the new ones.
    async fn consumer_for_config(&mut self) -> Result<Arc<QueueConsumer>, PipelineError> {
        if let Some(consumer) = &self.consumer {
            if consumer.queue() == self.config.input_queue
                && consumer.group() == self.config.consumer_group()
            {
                return Ok(Arc::clone(consumer));
            }
        }
        let store = self.queues.get(&self.config.input_queue)?;
        let consumer = Arc::new(store.register_consumer(self.config.consumer_group()).await?);
        self.consumer = Some(Arc::clone(&consumer));
        Ok(consumer)
    }

    /// Signals every worker once and returns without waiting for them.
    ///
    /// In-flight executions may still finish afterwards; the returned handles
    /// let a caller wait for that.
    pub fn stop(&mut self) -> Vec<WorkerHandle> {
        if self.workers.is_empty() {
            debug!(
                event = "pipeline_not_running",
                pipeline = %self.config.name,
                "Stop requested for a pipeline with no workers"
            );
            return Vec::new();
        }
        let workers = std::mem::take(&mut self.workers);
        for worker in &workers {
            worker.signal();
            debug!(
                event = "pipeline_worker_signalled",
                pipeline = %self.config.name,
                worker = worker.index,
                "Sent exit signal"
            );
        }
        info!(
            event = "pipeline_stopped",
            pipeline = %self.config.name,
            workers = workers.len(),
            "Pipeline stop signalled"
        );
        workers
    }

    /// `stop` followed by `start(config)`. Callers serialise calls per runner.
    pub async fn update(&mut self, config: PipeConfig) -> Result<Vec<WorkerHandle>, PipelineError> {
        let previous = self.stop();
        self.start(config).await?;
        Ok(previous)
    }
}

async fn supervise_worker(ctx: WorkerContext) -> Result<WorkerReport, PipelineError> {
    let pipeline_name = ctx.pipeline_name.clone();
    let index = ctx.index;
    let result = run_worker(ctx).await;

    if let Some(metrics) = PIPELINE_METRICS.get() {
        metrics
            .workers_alive
            .get_or_create(&PipelineLabels::new(&pipeline_name))
            .dec();
    }
    match &result {
        Ok(report) => trace!(
            event = "pipeline_worker_exited",
            pipeline = %pipeline_name,
            worker = index,
            executions = report.executions,
            faults = report.faults,
            "Worker exited"
        ),
        Err(err) => error!(
            event = "pipeline_worker_failed",
            pipeline = %pipeline_name,
            worker = index,
            error = %err,
            error_report = %format_error_report(err),
            "Worker exited with a fatal error"
        ),
    }
    result
}

async fn run_worker(ctx: WorkerContext) -> Result<WorkerReport, PipelineError> {
    let labels = PipelineLabels::new(&ctx.pipeline_name);
    let mut report = WorkerReport {
        index: ctx.index,
        executions: 0,
        faults: 0,
    };

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => return Ok(report),
            _ = ctx.consumer.wait_for_message() => {}
        }

        // Another worker may have taken the message first.
        let Some(message) = ctx.consumer.pop().await? else {
            continue;
        };

        let mut context = match ExecutionContext::decode(&message) {
            Ok(context) => context,
            Err(source) => {
                if let Some(metrics) = PIPELINE_METRICS.get() {
                    metrics.decode_failures.get_or_create(&labels).inc();
                }
                return Err(PipelineError::Decode {
                    pipeline: ctx.pipeline_name.clone(),
                    source,
                });
            }
        };
        trace!(
            event = "pipeline_message_received",
            pipeline = %ctx.pipeline_name,
            worker = ctx.index,
            sequence_id = context.sequence_id,
            "Message received"
        );

        report.executions += 1;
        match ctx.pipeline.execute(&mut context).await {
            ExecutionOutcome::Completed => {
                if let Some(metrics) = PIPELINE_METRICS.get() {
                    metrics.executions_completed.get_or_create(&labels).inc();
                }
            }
            ExecutionOutcome::Faulted { stage_id, fault } => {
                report.faults += 1;
                if let Some(metrics) = PIPELINE_METRICS.get() {
                    metrics.executions_faulted.get_or_create(&labels).inc();
                }
                error!(
                    event = "pipeline_stage_faulted",
                    pipeline = %ctx.pipeline_name,
                    worker = ctx.index,
                    stage = %stage_id,
                    sequence_id = context.sequence_id,
                    error = %fault,
                    context = %context.snapshot(),
                    "Stage fault; message discarded"
                );
            }
        }

        if let Some(threshold) = ctx.threshold {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => return Ok(report),
                _ = tokio::time::sleep(threshold) => {}
            }
        }
    }
}

/// Every configured pipeline runner, keyed by pipeline name.
pub struct RunnerRegistry {
    runners: BTreeMap<String, PipeRunner>,
    stages: Arc<StageRegistry>,
    queues: Arc<QueueRegistry>,
    started: bool,
}

impl RunnerRegistry {
    /// Validates every pipeline up front: names are unique, each config is
    /// well-formed, reads a known queue and only uses registered stage kinds.
    pub fn from_config(
        configs: &[PipeConfig],
        stages: Arc<StageRegistry>,
        queues: Arc<QueueRegistry>,
    ) -> Result<Self, PipelineError> {
        let mut runners = BTreeMap::new();
        for config in configs {
            config.validate()?;
            stages.build(config)?;
            queues.get(&config.input_queue)?;
            if runners.contains_key(&config.name) {
                return Err(PipelineError::InvalidConfig(format!(
                    "pipeline [{}] declared twice",
                    config.name
                )));
            }
            runners.insert(
                config.name.clone(),
                PipeRunner::new(config.clone(), Arc::clone(&stages), Arc::clone(&queues)),
            );
        }
        Ok(Self {
            runners,
            stages,
            queues,
            started: false,
        })
    }

    pub fn get(&self, name: &str) -> Option<&PipeRunner> {
        self.runners.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub async fn start_all(&mut self) -> Result<(), PipelineError> {
        if self.started {
            error!(
                event = "pipelines_already_started",
                "Pipeline framework already started; stop it first"
            );
            return Err(PipelineError::AlreadyStarted("all pipelines".to_string()));
        }
        for runner in self.runners.values_mut() {
            let config = runner.config().clone();
            runner.start(config).await?;
        }
        self.started = true;
        Ok(())
    }

    /// Signals every runner's workers; returns their handles without waiting.
    pub fn stop_all(&mut self) -> Vec<WorkerHandle> {
        if !self.started {
            warn!(event = "pipelines_not_started", "Pipeline framework is not started");
        }
        self.started = false;
        self.runners
            .values_mut()
            .flat_map(|runner| runner.stop())
            .collect()
    }

    /// Restarts one pipeline with a new config, adding it if it is new.
    pub async fn update(&mut self, config: PipeConfig) -> Result<Vec<WorkerHandle>, PipelineError> {
        config.validate()?;
        self.stages.build(&config)?;
        self.queues.get(&config.input_queue)?;
        let runner = self
            .runners
            .entry(config.name.clone())
            .or_insert_with(|| {
                PipeRunner::new(config.clone(), Arc::clone(&self.stages), Arc::clone(&self.queues))
            });
        runner.update(config).await
    }

    pub fn stop(&mut self, name: &str) -> Result<Vec<WorkerHandle>, PipelineError> {
        self.runners
            .get_mut(name)
            .map(PipeRunner::stop)
            .ok_or_else(|| PipelineError::UnknownPipeline(name.to_string()))
    }
}
