use crate::{
    adapter::{AdapterRegistry, ClusterProbe},
    availability::{cluster_gate_stage, AvailabilityRegistry},
    cli::Cli,
    config::{Config, RuntimeConfig},
    db::{build_db_pool, run_migrations},
    logging::{format_error_report, init_logging},
    markers::{FileMarkerStore, PgMarkerStore, SharedMarkerStore},
    pipeline::{wait_for_exit, RunnerRegistry, StageRegistry},
    queue::{CompactionManager, QueueRegistry},
    server::setup_server_with_addr,
    state::AppState,
};
use dotenv::dotenv;
use std::error::Error as StdError;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MARKERS_DIR: &str = "markers";

/// Resolves once SIGTERM or SIGINT arrives.
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!(event = "signal_received", signal = "SIGTERM", "SIGTERM received, shutting down.");
        }
        _ = sigint.recv() => {
            info!(event = "signal_received", signal = "SIGINT", "SIGINT received, shutting down.");
        }
    }
    Ok(())
}

fn report_failure(event: &'static str, message: &str, err: &(dyn StdError + 'static)) -> i32 {
    let error_report = format_error_report(err);
    error!(
        event = event,
        error = %err,
        error_report = %error_report,
        "{message}"
    );
    eprintln!("{message}: {err}");
    eprintln!("{error_report}");
    1
}

async fn build_marker_store(config: &Config) -> Result<SharedMarkerStore, Box<dyn StdError + Send + Sync>> {
    match &config.database_url {
        Some(db_url) => {
            let migrate_url = db_url.clone();
            tokio::task::spawn_blocking(move || run_migrations(&migrate_url)).await??;
            let pool = build_db_pool(db_url).await?;
            info!(event = "marker_store_selected", backend = "postgres", "Using Postgres marker store");
            Ok(Arc::new(PgMarkerStore::new(pool)))
        }
        None => {
            let root = config.data_dir.join(MARKERS_DIR);
            info!(
                event = "marker_store_selected",
                backend = "file",
                root = %root.display(),
                "Using file marker store"
            );
            Ok(Arc::new(FileMarkerStore::new(root)))
        }
    }
}

/// Runs queues, pipelines, compaction and cluster probes until a shutdown signal.
pub async fn run_worker(args: Cli, logging_mode: &str) -> i32 {
    dotenv().ok();

    let logging_context = init_logging("pipeline_worker", logging_mode, "info");
    let run_span = tracing::info_span!(
        "worker_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id,
        build_version = %logging_context.build_version,
        build_commit = %logging_context.build_commit
    );
    let _run_guard = run_span.enter();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };
    if let Some(path) = args.config {
        config.runtime_config_path = path;
    }
    if let Some(addr) = args.server_addr {
        config.server_addr = addr;
    }

    let runtime = match RuntimeConfig::load(&config.runtime_config_path) {
        Ok(runtime) => runtime,
        Err(err) => return report_failure("runtime_config_invalid", "invalid runtime config", &err),
    };
    info!(
        event = "worker_starting",
        queues = runtime.queues.len(),
        pipelines = runtime.pipelines.len(),
        clusters = runtime.clusters.len(),
        "starting pipeline worker"
    );

    let markers = match build_marker_store(&config).await {
        Ok(markers) => markers,
        Err(err) => {
            return report_failure("marker_store_failed", "failed to open marker store", err.as_ref())
        }
    };

    let queues = match QueueRegistry::open_all(&config.data_dir, &runtime.queues, markers) {
        Ok(queues) => Arc::new(queues),
        Err(err) => return report_failure("queue_open_failed", "failed to open queues", &err),
    };

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(Arc::clone(&queues), shutdown.clone()));
    let server_handle = match setup_server_with_addr(Arc::clone(&state), config.server_addr).await {
        Ok(handle) => handle,
        Err(err) => {
            return report_failure(
                "metrics_server_start_failed",
                "failed to start monitoring server",
                &err,
            )
        }
    };

    let availability = Arc::new(AvailabilityRegistry::new());
    for cluster in &runtime.clusters {
        availability.register_cluster(&cluster.name, cluster.enabled, true);
    }

    let mut stages = StageRegistry::with_builtins();
    stages.register("cluster_available", cluster_gate_stage(Arc::clone(&availability)));
    let stages = Arc::new(stages);

    let mut runners = match RunnerRegistry::from_config(&runtime.pipelines, stages, Arc::clone(&queues)) {
        Ok(runners) => runners,
        Err(err) => {
            shutdown.cancel();
            return report_failure("pipeline_config_invalid", "invalid pipeline config", &err);
        }
    };
    if let Err(err) = runners.start_all().await {
        shutdown.cancel();
        return report_failure("pipelines_start_failed", "failed to start pipelines", &err);
    }

    let mut compaction_tasks = if args.no_compaction {
        info!(event = "compaction_disabled", "Compaction disabled by flag");
        JoinSet::new()
    } else {
        CompactionManager::new(Arc::clone(&queues)).spawn(config.compaction_interval, shutdown.clone())
    };

    let adapters = Arc::new(AdapterRegistry::default());
    let mut probe_tasks = JoinSet::new();
    for cluster in runtime.clusters.iter().filter(|cluster| cluster.enabled) {
        let probe = Arc::new(ClusterProbe::new(
            cluster.clone(),
            Arc::clone(&adapters),
            Arc::clone(&availability),
        ));
        probe_tasks.spawn(probe.run(shutdown.clone()));
    }

    if let Err(err) = wait_for_shutdown_signal().await {
        warn!(
            event = "signal_handler_failed",
            error = %err,
            "Could not install signal handlers; shutting down"
        );
    }

    let reports = wait_for_exit(runners.stop_all()).await;
    let failed_workers = reports.iter().filter(|report| report.is_err()).count();
    info!(
        event = "pipelines_stopped",
        workers = reports.len(),
        failed_workers,
        "All pipeline workers exited"
    );

    shutdown.cancel();
    while compaction_tasks.join_next().await.is_some() {}
    while probe_tasks.join_next().await.is_some() {}
    if let Err(err) = server_handle.await {
        warn!(event = "server_join_failed", error = %err, "Monitoring server task failed");
    }

    info!(event = "worker_stopped", "pipeline worker stopped");
    0
}
