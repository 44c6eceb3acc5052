//! # Runtime Assembly
//!
//! Wires configuration, storage, and the core components into one
//! runnable unit: the scheduler loop, the trace reaper, and the
//! rate-limit/idempotency sweeps, all stopping together on shutdown.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::actionlog::ActionLog;
use crate::config::AgentCoreConfig;
use crate::error::Result;
use crate::healing::{DiagnosticCollaborator, SelfHealingLoop};
use crate::idempotency::IdempotencyManager;
use crate::models::{NewTask, Task};
use crate::orchestration::Scheduler;
use crate::registry::TaskHandlerRegistry;
use crate::resilience::RateLimiter;
use crate::storage::memory::InMemoryStorage;
use crate::storage::postgres::PostgresStorage;
use crate::storage::{IdempotencyStore, RuleStore, TaskStore, TraceStore};
use crate::trace::TraceManager;

/// Storage trait objects for every concern the core persists
pub struct RuntimeStores {
    pub tasks: Arc<dyn TaskStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub rules: Arc<dyn RuleStore>,
    pub traces: Arc<dyn TraceStore>,
}

impl RuntimeStores {
    /// Concurrent-map storage for embedded use and tests
    pub fn in_memory() -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        Self {
            tasks: storage.clone(),
            idempotency: storage.clone(),
            rules: storage.clone(),
            traces: storage,
        }
    }

    /// SQLx-backed storage for multi-process deployments
    pub fn postgres(storage: PostgresStorage) -> Self {
        let storage = Arc::new(storage);
        Self {
            tasks: storage.clone(),
            idempotency: storage.clone(),
            rules: storage.clone(),
            traces: storage,
        }
    }
}

/// The assembled execution runtime
pub struct AgentRuntime {
    config: AgentCoreConfig,
    tasks: Arc<dyn TaskStore>,
    registry: Arc<TaskHandlerRegistry>,
    rate_limiter: Arc<RateLimiter>,
    idempotency: Arc<IdempotencyManager>,
    traces: Arc<TraceManager>,
    action_log: Arc<ActionLog>,
    healing: Arc<SelfHealingLoop>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
}

impl AgentRuntime {
    pub fn new(
        config: AgentCoreConfig,
        stores: RuntimeStores,
        diagnostic: Arc<dyn DiagnosticCollaborator>,
    ) -> Self {
        let registry = Arc::new(TaskHandlerRegistry::new());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let idempotency = Arc::new(IdempotencyManager::new(
            stores.idempotency,
            config.idempotency.default_ttl(),
        ));
        let traces = Arc::new(TraceManager::new(stores.traces, config.trace.clone()));
        let action_log = Arc::new(ActionLog::new(config.action_log.clone()));
        let healing = Arc::new(SelfHealingLoop::new(stores.rules, diagnostic));

        let scheduler = Arc::new(Scheduler::new(
            config.executor.clone(),
            stores.tasks.clone(),
            Arc::clone(&registry),
            Arc::clone(&rate_limiter),
            Arc::clone(&idempotency),
            Arc::clone(&traces),
            Arc::clone(&action_log),
            Arc::clone(&healing),
        ));

        Self {
            config,
            tasks: stores.tasks,
            registry,
            rate_limiter,
            idempotency,
            traces,
            action_log,
            healing,
            scheduler,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AgentCoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskHandlerRegistry> {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyManager> {
        &self.idempotency
    }

    pub fn traces(&self) -> &Arc<TraceManager> {
        &self.traces
    }

    pub fn action_log(&self) -> &Arc<ActionLog> {
        &self.action_log
    }

    pub fn healing(&self) -> &Arc<SelfHealingLoop> {
        &self.healing
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    /// Enqueue a task produced by a workflow definition or schedule
    pub async fn submit_task(&self, new_task: NewTask) -> Result<Task> {
        let task = self.tasks.create_task(new_task).await?;
        debug!(task_id = %task.id, task_type = %task.task_type, "task submitted");
        Ok(task)
    }

    /// Task status lookup by id
    pub async fn task_status(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.tasks.find_task(task_id).await
    }

    /// Cancel a queued task, or signal a running one cooperatively
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool> {
        self.scheduler.cancel_task(task_id).await
    }

    /// Spawn the scheduler loop, trace reaper, and periodic sweeps.
    /// Returns the join handles; all loops stop on [`shutdown`].
    ///
    /// [`shutdown`]: AgentRuntime::shutdown
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let scheduler = Arc::clone(&self.scheduler);
        let token = self.shutdown.child_token();
        handles.push(tokio::spawn(async move {
            scheduler.run(token).await;
        }));

        let traces = Arc::clone(&self.traces);
        let token = self.shutdown.child_token();
        let reaper_interval =
            std::time::Duration::from_secs(self.config.trace.reaper_interval_seconds.max(1));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        traces.reap_stale().await;
                        traces.evict_expired();
                    }
                }
            }
        }));

        let rate_limiter = Arc::clone(&self.rate_limiter);
        let idempotency = Arc::clone(&self.idempotency);
        let token = self.shutdown.child_token();
        let sweep_interval = std::time::Duration::from_secs(
            self.config.rate_limits.sweep_interval_seconds.max(1),
        );
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        rate_limiter.prune_idle();
                        if let Err(err) = idempotency.sweep_expired().await {
                            tracing::warn!(error = %err, "idempotency sweep failed");
                        }
                    }
                }
            }
        }));

        info!("agent runtime started");
        handles
    }

    /// Stop every loop started by [`start`](AgentRuntime::start)
    pub fn shutdown(&self) {
        info!("agent runtime shutdown requested");
        self.shutdown.cancel();
    }
}
