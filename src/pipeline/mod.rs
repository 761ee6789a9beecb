//! Pipeline assembly.
//!
//! Wires the object store, event router, work queues and handlers together:
//!
//! ```text
//! put ─▶ ObjectCreated ─▶ ingestion ─▶ EmailReceived ─▶ parse-queue ─▶ parsing
//!   ─▶ EmailParsed ─▶ match-queue ─▶ matching ─▶ SupplierMatched ─▶ result-queue
//!   ─▶ finalizer
//! ```
//!
//! Terminal failures from any consumer are emitted as `TaskFailed` and routed
//! to the diagnostics queue.

pub mod catalog;

pub use catalog::{build_extractor, catalog_vocabulary, load_supplier_catalog};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::ApiState;
use crate::config::{PipelineConfig, QueueNames, QueuePolicy};
use crate::error::{ConfigError, Error};
use crate::events::{DetailType, EventPattern, EventRouter, SOURCE};
use crate::extract::Extractor;
use crate::handlers::{
    DiagnosticsHandler, DiagnosticsLog, IngestionHandler, MatchingHandler, ParsingHandler, ResultFinalizer,
    TaskHandler, spawn_consumer, spawn_ingestion,
};
use crate::matching::build_strategy;
use crate::queue::{AlarmLog, QueueStats, WorkQueue};
use crate::storage::{LocalObjectStore, ObjectCreated, ObjectStore};
use crate::store::{LibSqlStore, ResultStore};

/// Buffered object notifications before `put` waits on ingestion.
const NOTIFICATION_BUFFER: usize = 1024;

/// The pipeline's work queues, each paired with a dead-letter queue.
#[derive(Clone)]
pub struct Queues {
    pub parse: Arc<WorkQueue>,
    pub matching: Arc<WorkQueue>,
    pub result: Arc<WorkQueue>,
    pub diagnostics: Arc<WorkQueue>,
}

impl Queues {
    pub fn new(names: &QueueNames, policy: QueuePolicy, alarms: &Arc<AlarmLog>) -> Self {
        let with_dead_letter = |name: &str| {
            let dead_letter = WorkQueue::new(QueueNames::dead_letter_name(name), policy, None, Arc::clone(alarms));
            WorkQueue::new(name, policy, Some(dead_letter), Arc::clone(alarms))
        };
        Self {
            parse: with_dead_letter(&names.parse),
            matching: with_dead_letter(&names.matching),
            result: with_dead_letter(&names.result),
            diagnostics: with_dead_letter(&names.diagnostics),
        }
    }

    /// Work queues in pipeline order.
    pub fn all(&self) -> [&Arc<WorkQueue>; 4] {
        [&self.parse, &self.matching, &self.result, &self.diagnostics]
    }

    /// Every work queue followed by its dead-letter queue.
    pub fn with_dead_letters(&self) -> Vec<Arc<WorkQueue>> {
        self.all()
            .into_iter()
            .flat_map(|q| std::iter::once(Arc::clone(q)).chain(q.dead_letter_queue().cloned()))
            .collect()
    }
}

/// Injected pieces; `Pipeline::start` builds the file-backed defaults.
pub struct Components {
    pub objects: Arc<dyn ObjectStore>,
    /// Receiving end of the object store's notification channel.
    pub notifications: mpsc::Receiver<ObjectCreated>,
    pub store: Arc<dyn ResultStore>,
    pub extractor: Arc<dyn Extractor>,
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

/// A running pipeline.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn ResultStore>,
    router: Arc<EventRouter>,
    queues: Queues,
    alarms: Arc<AlarmLog>,
    diagnostics: Arc<DiagnosticsLog>,
    workers: Vec<Worker>,
    ingestion: JoinHandle<()>,
    stop_ingestion: Arc<Notify>,
}

impl Pipeline {
    /// Open the local object store and libSQL database named in `config`,
    /// load the supplier catalog and start every handler.
    pub async fn start(config: PipelineConfig) -> Result<Self, Error> {
        let (tx, notifications) = mpsc::channel(NOTIFICATION_BUFFER);
        let objects = LocalObjectStore::open(&config.object_root, config.bucket.clone())
            .await?
            .with_notifications(tx);

        if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ConfigError::Io)?;
        }
        let store = LibSqlStore::new_local(&config.db_path, config.tables.clone()).await?;
        if let Some(path) = &config.supplier_catalog {
            load_supplier_catalog(&store, path).await?;
        }
        let vocabulary = catalog_vocabulary(&store).await?;
        let extractor = build_extractor(&config, vocabulary)?;

        Self::start_with(
            config,
            Components {
                objects: Arc::new(objects),
                notifications,
                store: Arc::new(store),
                extractor,
            },
        )
        .await
    }

    /// Start the pipeline over injected components.
    pub async fn start_with(config: PipelineConfig, components: Components) -> Result<Self, Error> {
        let config = Arc::new(config);
        let Components {
            objects,
            notifications,
            store,
            extractor,
        } = components;

        let alarms = Arc::new(AlarmLog::new());
        let queues = Queues::new(&config.queues, config.queue_policy, &alarms);
        let router = Arc::new(EventRouter::new(config.event_bus_name.clone(), config.region.clone()));
        let routes = [
            ("email-received", DetailType::EmailReceived, &queues.parse),
            ("email-parsed", DetailType::EmailParsed, &queues.matching),
            ("supplier-matched", DetailType::SupplierMatched, &queues.result),
            ("task-failed", DetailType::TaskFailed, &queues.diagnostics),
        ];
        for (name, detail_type, target) in routes {
            let pattern = EventPattern::from_value(json!({
                "source": [SOURCE],
                "detail-type": [detail_type.as_str()],
            }))?;
            router.add_rule(name, pattern, Arc::clone(target)).await?;
        }

        let diagnostics = Arc::new(DiagnosticsLog::new());
        let handlers: [(Arc<WorkQueue>, Arc<dyn TaskHandler>); 4] = [
            (
                Arc::clone(&queues.parse),
                Arc::new(ParsingHandler::new(
                    Arc::clone(&objects),
                    Arc::clone(&store),
                    extractor,
                    Arc::clone(&router),
                    config.handlers.extraction_timeout,
                )),
            ),
            (
                Arc::clone(&queues.matching),
                Arc::new(MatchingHandler::new(
                    Arc::clone(&store),
                    build_strategy(config.matching.strategy),
                    Arc::clone(&router),
                    config.matching,
                )),
            ),
            (
                Arc::clone(&queues.result),
                Arc::new(ResultFinalizer::new(Arc::clone(&store))),
            ),
            (
                Arc::clone(&queues.diagnostics),
                Arc::new(DiagnosticsHandler::new(Arc::clone(&diagnostics))),
            ),
        ];
        let workers = handlers
            .into_iter()
            .map(|(queue, handler)| {
                let name = handler.name();
                let (handle, shutdown) = spawn_consumer(queue, handler, Arc::clone(&router), config.handlers);
                Worker { name, handle, shutdown }
            })
            .collect();

        let ingestion_handler = Arc::new(IngestionHandler::new(Arc::clone(&router), config.ingest_prefix.clone()));
        let (ingestion, stop_ingestion) = spawn_ingestion(notifications, Arc::clone(&ingestion_handler));
        ingestion_handler.reconcile(objects.as_ref(), store.as_ref()).await?;

        info!(
            bus = %config.event_bus_name,
            bucket = %objects.bucket(),
            strategy = %config.matching.strategy,
            max_receive_count = config.queue_policy.max_receive_count,
            "Pipeline started"
        );

        Ok(Self {
            config,
            objects,
            store,
            router,
            queues,
            alarms,
            diagnostics,
            workers,
            ingestion,
            stop_ingestion,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    pub fn alarms(&self) -> &Arc<AlarmLog> {
        &self.alarms
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsLog> {
        &self.diagnostics
    }

    /// Stats for every work queue and dead-letter queue.
    pub async fn queue_stats(&self) -> Vec<QueueStats> {
        let queues = self.queues.with_dead_letters();
        join_all(queues.iter().map(|q| q.stats())).await
    }

    /// Shared state for the HTTP API.
    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: Arc::clone(&self.store),
            objects: Arc::clone(&self.objects),
            queues: self.queues.with_dead_letters(),
            alarms: Arc::clone(&self.alarms),
            diagnostics: Arc::clone(&self.diagnostics),
            ingest_prefix: self.config.ingest_prefix.clone(),
        }
    }

    /// Stop ingestion, then every consumer after its in-flight invocations finish.
    ///
    /// Notifications already buffered are still turned into events. Messages
    /// still queued stay where they are; an email left without an outcome is
    /// re-ingested the next time the pipeline starts.
    pub async fn shutdown(self) {
        self.stop_ingestion.notify_one();
        if let Err(e) = self.ingestion.await {
            warn!(error = %e, "Ingestion exited abnormally");
        }

        for worker in &self.workers {
            worker.shutdown.store(true, Ordering::Relaxed);
        }
        let stopped = join_all(
            self.workers
                .into_iter()
                .map(|worker| async move { (worker.name, worker.handle.await) }),
        )
        .await;
        for (name, result) in stopped {
            if let Err(e) = result {
                warn!(handler = name, error = %e, "Consumer exited abnormally");
            }
        }
        info!("Pipeline stopped");
    }
}
