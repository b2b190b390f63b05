use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use taskpulse_events::{EventBus, InMemoryEventBus, PipelineSignal};
use taskpulse_infra::jobs::{
    InMemoryJobStore, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobStore, PostgresJobStore,
};
use taskpulse_infra::notify::{
    Dispatcher, MemoryTransport, SendGridTransport, SmtpTransport, Transport, TransportError,
};
use taskpulse_infra::schema;
use taskpulse_infra::tasks::{InMemoryTaskSource, PostgresTaskSource, TaskSource};
use taskpulse_infra::workflow::{
    InMemoryWorkflowStore, PostgresWorkflowStore, WakeScanner, WakeScannerConfig, WakeScannerHandle,
    WorkflowConfig, WorkflowEngine, WorkflowStore,
};
use taskpulse_infra::{AssignmentHandler, Pipeline, SignalBus};

use crate::config::{AppConfig, TransportSettings};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("mail transport: {0}")]
    Transport(#[from] TransportError),
}

/// Everything the router and the background loops share.
#[derive(Clone)]
pub struct AppServices {
    pub queue: String,
    pub transport: &'static str,
    pub jobs: Arc<dyn JobStore>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub pipeline: Pipeline,
    pub signals: SignalBus,
    executor: JobExecutor,
    scanner: WakeScanner,
}

/// Background loops started by [`AppServices::start`].
pub struct Background {
    executor: JobExecutorHandle,
    scanner: WakeScannerHandle,
    signal_log: JoinHandle<()>,
}

impl Background {
    /// Stop the loops; in-flight jobs and scans finish first.
    pub async fn shutdown(self) {
        self.scanner.shutdown().await;
        self.executor.shutdown().await;
        self.signal_log.abort();
        info!("background workers stopped");
    }
}

/// Wire stores and transport from configuration.
///
/// `DATABASE_URL` selects the Postgres stores; without it everything lives
/// in memory and is lost on restart.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, ServiceError> {
    let transport = build_transport(config)?;

    let Some(url) = &config.database_url else {
        warn!("DATABASE_URL not set; using in-memory stores (dev/test only)");
        return Ok(AppServices::in_memory(config, Arc::new(InMemoryTaskSource::new()), transport));
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    schema::ensure_schema(&pool).await?;
    info!("using Postgres stores");

    Ok(AppServices::assemble(
        config,
        Arc::new(PostgresJobStore::new(pool.clone())),
        Arc::new(PostgresWorkflowStore::new(pool.clone())),
        Arc::new(PostgresTaskSource::new(pool)),
        transport,
    ))
}

/// The one place a transport implementation is chosen.
pub fn build_transport(config: &AppConfig) -> Result<Arc<dyn Transport>, ServiceError> {
    let transport: Arc<dyn Transport> = match &config.transport {
        TransportSettings::Smtp(smtp) => Arc::new(SmtpTransport::new(smtp)?),
        TransportSettings::SendGrid(sendgrid) => Arc::new(SendGridTransport::new(sendgrid.clone())?),
        TransportSettings::Memory => {
            warn!("memory mail transport selected; notifications are recorded, not delivered");
            Arc::new(MemoryTransport::new())
        }
    };
    Ok(transport)
}

impl AppServices {
    /// In-memory stores around the given task source and transport.
    pub fn in_memory(config: &AppConfig, tasks: Arc<dyn TaskSource>, transport: Arc<dyn Transport>) -> Self {
        Self::assemble(
            config,
            InMemoryJobStore::arc(),
            InMemoryWorkflowStore::arc(),
            tasks,
            transport,
        )
    }

    fn assemble(
        config: &AppConfig,
        jobs: Arc<dyn JobStore>,
        workflows: Arc<dyn WorkflowStore>,
        tasks: Arc<dyn TaskSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let signals: SignalBus = Arc::new(InMemoryEventBus::new());
        let dispatcher = Dispatcher::new(transport)
            .with_timeout(config.handler_timeout)
            .with_offset(config.due_date_offset);

        let engine = WorkflowEngine::new(
            workflows.clone(),
            tasks.clone(),
            dispatcher.clone(),
            WorkflowConfig {
                lease: config.workflow_lease,
                step_retry_delay: config.step_retry_delay,
                due_date_offset: config.due_date_offset,
                ..Default::default()
            },
        )
        .with_signals(signals.clone());

        let executor = JobExecutor::new(
            jobs.clone(),
            Arc::new(AssignmentHandler::new(dispatcher.clone())),
            JobExecutorConfig::for_queue(config.queue.clone())
                .with_concurrency(config.worker_concurrency)
                .with_lease(config.job_lease)
                .with_handler_timeout(config.handler_timeout),
        )
        .with_signals(signals.clone());

        let scanner = WakeScanner::new(
            engine.clone(),
            WakeScannerConfig {
                interval: config.scan_interval,
                batch: config.scan_batch,
            },
        );

        let pipeline = Pipeline::new(jobs.clone(), engine, tasks, config.queue.clone(), config.job_policy.clone());

        Self {
            queue: config.queue.clone(),
            transport: dispatcher.transport_name(),
            jobs,
            workflows,
            pipeline,
            signals,
            executor,
            scanner,
        }
    }

    /// Spawn the worker pool, the wake scanner and the signal logger.
    pub fn start(&self) -> Background {
        Background {
            signal_log: spawn_signal_logger(&self.signals),
            executor: self.executor.clone().spawn(),
            scanner: self.scanner.clone().spawn(),
        }
    }
}

/// Log every pipeline signal. Dead letters are warnings: they need an
/// operator.
fn spawn_signal_logger(bus: &SignalBus) -> JoinHandle<()> {
    let sub = bus.subscribe();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(250));
        loop {
            tick.tick().await;
            for signal in sub.drain() {
                log_signal(signal);
            }
        }
    })
}

fn log_signal(signal: PipelineSignal) {
    match signal {
        PipelineSignal::JobDeadLettered {
            queue,
            job_id,
            attempts,
            reason,
        } => warn!(%queue, %job_id, attempts, %reason, "job dead-lettered"),
        PipelineSignal::JobCompleted { queue, job_id } => info!(%queue, %job_id, "job completed"),
        PipelineSignal::InstanceCompleted {
            instance_id,
            task_id,
            reminded,
        } => info!(%instance_id, %task_id, reminded, "workflow completed"),
        PipelineSignal::InstanceCancelled {
            instance_id,
            task_id,
            reason,
        } => info!(%instance_id, %task_id, %reason, "workflow cancelled"),
    }
}
