use futures::future::join_all;
use serde::Serialize;
use sled::Db;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::collaborators::{
    BusExecutionStarter, BusParentResumer, ExecutionStarter, ParentResumer,
};
use crate::core::config::SchedulerConfig;
use crate::core::errors::{Result, SchedulerError};
use crate::lock::SledLockService;
use crate::pubsub::{BroadcastEventBus, EventBus, SDK_RESPONSE_TOPIC};
use crate::router::{publish_sdk_response, SdkResponseEventType, SdkResponseListener, SdkResponseRouter};
use crate::scheduler::{
    MaxConcurrentChildScheduler, ReconciliationSweep, SpawnChildProcessor, SpawnChildrenProcessor,
};
use crate::storage::SledStorage;
use crate::waiter::{CallbackRegistry, RecoveryStats, WaitNotifyEngine};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Wires storage, locks, the wait/notify engine and the processors
/// together, and runs the background loops that drive them.
pub struct OrchestrationRuntime {
    config: SchedulerConfig,
    db: Db,
    bus: Arc<dyn EventBus>,
    storage: Arc<SledStorage>,
    engine: Arc<WaitNotifyEngine>,
    scheduler: Arc<MaxConcurrentChildScheduler>,
    spawn_child: Arc<SpawnChildProcessor>,
    spawn_children: Arc<SpawnChildrenProcessor>,
    dispatcher: Arc<CallbackRegistry>,
    router: Arc<SdkResponseRouter>,
    sweep: Arc<ReconciliationSweep>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl OrchestrationRuntime {
    pub fn builder() -> OrchestrationRuntimeBuilder {
        OrchestrationRuntimeBuilder::new()
    }

    /// Recover in-flight callbacks, then start the delivery worker, the SDK
    /// response listener and the reconciliation loop
    pub async fn start(&self) -> Result<RecoveryStats> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::internal("runtime already started"));
        }

        let recovered = self.engine.recover().await?;
        info!(
            scanned = recovered.scanned,
            requeued = recovered.requeued,
            repaired = recovered.repaired,
            "Recovery complete"
        );

        let listener = Arc::new(SdkResponseListener::new(
            self.router.clone(),
            self.bus.clone(),
            self.config.max_delivery_attempts,
            self.config.retry_strategy.clone(),
        ));
        // subscribe before returning so no event published after start is missed
        let receiver = self.bus.subscribe(SDK_RESPONSE_TOPIC);

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(self.engine.clone().run(
            self.dispatcher.clone(),
            self.config.notify_poll_interval(),
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(
            listener.run(receiver, self.shutdown_tx.subscribe()),
        ));
        handles.push(tokio::spawn(self.sweep.clone().run(
            self.config.reconcile_interval(),
            self.config.reconcile_after(),
            self.shutdown_tx.subscribe(),
        )));

        info!(publisher = %self.config.publisher_name, "Orchestration runtime started");
        Ok(recovered)
    }

    /// Stop the background loops and flush storage
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating shutdown");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Background task ended abnormally");
                    }
                }
            }
            Err(_) => warn!("Background tasks did not stop in time"),
        }

        self.db.flush_async().await?;
        info!("Shutdown complete");
        Ok(())
    }

    /// Publish an SDK response event for this runtime's router
    pub async fn submit<T: Serialize + Sync>(
        &self,
        event_type: SdkResponseEventType,
        plan_execution_id: &str,
        event: &T,
    ) -> Result<String> {
        publish_sdk_response(
            self.bus.as_ref(),
            &self.config.publisher_name,
            event_type,
            plan_execution_id,
            event,
        )
        .await
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn storage(&self) -> &Arc<SledStorage> {
        &self.storage
    }

    pub fn engine(&self) -> &Arc<WaitNotifyEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<MaxConcurrentChildScheduler> {
        &self.scheduler
    }

    pub fn spawn_child_processor(&self) -> &Arc<SpawnChildProcessor> {
        &self.spawn_child
    }

    pub fn spawn_children_processor(&self) -> &Arc<SpawnChildrenProcessor> {
        &self.spawn_children
    }

    pub fn dispatcher(&self) -> &Arc<CallbackRegistry> {
        &self.dispatcher
    }

    pub fn router(&self) -> &Arc<SdkResponseRouter> {
        &self.router
    }

    pub fn sweep(&self) -> &Arc<ReconciliationSweep> {
        &self.sweep
    }
}

/// Builder for `OrchestrationRuntime`
pub struct OrchestrationRuntimeBuilder {
    config: SchedulerConfig,
    bus: Option<Arc<dyn EventBus>>,
    starter: Option<Arc<dyn ExecutionStarter>>,
    resumer: Option<Arc<dyn ParentResumer>>,
}

impl OrchestrationRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            bus: None,
            starter: None,
            resumer: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_starter(mut self, starter: Arc<dyn ExecutionStarter>) -> Self {
        self.starter = Some(starter);
        self
    }

    pub fn with_resumer(mut self, resumer: Arc<dyn ParentResumer>) -> Self {
        self.resumer = Some(resumer);
        self
    }

    pub fn build(self) -> Result<OrchestrationRuntime> {
        let config = self.config;
        config.validate()?;

        let db = match &config.storage_path {
            Some(path) => {
                info!(path = %path.display(), "Opening scheduler storage");
                sled::open(path)?
            }
            None => sled::Config::new().temporary(true).open()?,
        };

        let bus: Arc<dyn EventBus> = match self.bus {
            Some(bus) => bus,
            None => Arc::new(BroadcastEventBus::new(config.bus_capacity)),
        };
        let starter: Arc<dyn ExecutionStarter> = match self.starter {
            Some(starter) => starter,
            None => Arc::new(BusExecutionStarter::new(bus.clone(), config.publisher_name.clone())),
        };
        let resumer: Arc<dyn ParentResumer> = match self.resumer {
            Some(resumer) => resumer,
            None => Arc::new(BusParentResumer::new(bus.clone(), config.publisher_name.clone())),
        };

        let storage = Arc::new(SledStorage::new(&db)?);
        let locks = Arc::new(SledLockService::new(&db, config.lock_retry_interval())?);
        let engine = Arc::new(WaitNotifyEngine::new(
            &db,
            config.max_delivery_attempts,
            config.retry_strategy.clone(),
        )?);

        let scheduler = Arc::new(MaxConcurrentChildScheduler::new(
            storage.clone(),
            locks,
            starter,
            engine.clone(),
            &config,
        ));
        let spawn_child = Arc::new(SpawnChildProcessor::new(
            storage.clone(),
            bus.clone(),
            engine.clone(),
            config.publisher_name.clone(),
        ));
        let spawn_children = Arc::new(SpawnChildrenProcessor::new(
            storage.clone(),
            storage.clone(),
            bus.clone(),
            engine.clone(),
            resumer.clone(),
            config.clone(),
        ));
        let dispatcher = Arc::new(CallbackRegistry::new(scheduler.clone(), resumer));
        let router = Arc::new(SdkResponseRouter::standard(
            spawn_child.clone(),
            spawn_children.clone(),
            engine.clone(),
            scheduler.clone(),
        ));
        let sweep = Arc::new(ReconciliationSweep::new(
            storage.clone(),
            storage.clone(),
            bus.clone(),
            engine.clone(),
            config.publisher_name.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(OrchestrationRuntime {
            config,
            db,
            bus,
            storage,
            engine,
            scheduler,
            spawn_child,
            spawn_children,
            dispatcher,
            router,
            sweep,
            started: AtomicBool::new(false),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        })
    }
}

impl Default for OrchestrationRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
