//! Reference-counted owner of the single live orchestrator.
//!
//! [`OrchestratorManager`] tracks consumers by [`ConsumerHandle`],
//! serialises initialization through one shared future, and destroys the
//! [`Orchestrator`] exactly when the last consumer releases it.
//!
//! Lifecycle: `Uninitialized -> Initializing(shared future) -> Ready`,
//! back to `Uninitialized` on failure or teardown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use genorch_core::adapter::TransportAdapter;
use genorch_core::api::GenerationApi;
use genorch_core::events::AdapterEvent;

use crate::error::OrchestratorError;
use crate::facade::GenerationFacade;
use crate::handlers::run_event_loop;
use crate::state::{lock, OrchestratorState};
use crate::status_controller::StatusControllerRegistry;

// ---------------------------------------------------------------------------
// Factory seam
// ---------------------------------------------------------------------------

/// What a factory gets to build a transport adapter.
pub struct TransportContext {
    /// The adapter reports everything through this channel.
    pub events: mpsc::UnboundedSender<AdapterEvent>,
    pub history_limit: usize,
    pub poll_interval_ms: u64,
}

/// Builds the backend collaborators for an orchestrator.
#[async_trait]
pub trait OrchestratorFactory: Send + Sync {
    /// Identifies the backend. Status controllers are shared per target.
    fn target(&self) -> String;

    fn api(&self) -> Arc<dyn GenerationApi>;

    /// Create and start a transport adapter. Called once per
    /// initialization attempt.
    async fn create_transport(
        &self,
        ctx: TransportContext,
    ) -> Result<Arc<dyn TransportAdapter>, OrchestratorError>;
}

// ---------------------------------------------------------------------------
// Consumers and options
// ---------------------------------------------------------------------------

/// Opaque token for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(u64);

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Unregistered again if initialization fails.
    pub consumer: Option<ConsumerHandle>,
    pub history_limit: Option<i64>,
    pub poll_interval_ms: Option<u64>,
    pub status_poll_interval: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Module state plus the task scope of one orchestrator lifetime.
pub struct Orchestrator {
    state: Arc<OrchestratorState>,
    api: Arc<dyn GenerationApi>,
    scope: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Orchestrator {
    fn new(state: OrchestratorState, api: Arc<dyn GenerationApi>) -> Self {
        Self {
            state: Arc::new(state),
            api,
            scope: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> &Arc<OrchestratorState> {
        &self.state
    }

    pub fn api(&self) -> &Arc<dyn GenerationApi> {
        &self.api
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn initialize(
        self: Arc<Self>,
        factory: Arc<dyn OrchestratorFactory>,
        options: InitOptions,
    ) -> Result<(), OrchestratorError> {
        if self.is_destroyed() {
            return Err(OrchestratorError::Destroyed);
        }
        let state = &self.state;

        let history_limit = match options.history_limit {
            Some(limit) => state.with_results_mut(|r| r.set_history_limit(limit)),
            None => state.with_results(|r| r.history_limit()),
        };
        if let Some(interval_ms) = options.poll_interval_ms {
            state.transport().set_poll_interval(interval_ms);
        }
        if let Some(interval) = options.status_poll_interval {
            state.status().set_poll_interval(interval);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = factory
            .create_transport(TransportContext {
                events: tx,
                history_limit,
                poll_interval_ms: state.transport().poll_interval_ms(),
            })
            .await?;
        if self.is_destroyed() {
            adapter.clear();
            return Err(OrchestratorError::Destroyed);
        }
        state.transport().attach(adapter);

        let handler = tokio::spawn(run_event_loop(Arc::clone(state), rx, self.scope.child_token()));
        lock(&self.tasks).push(handler);

        match self.api.fetch_recent_results(history_limit).await {
            Ok(results) => state.with_results_mut(|r| r.set_results(results)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load recent results");
                self.rollback();
                return Err(OrchestratorError::Initialization(format!(
                    "failed to load recent results: {e}"
                )));
            }
        }

        match self.api.list_jobs().await {
            Ok(jobs) => state.with_queue_mut(|q| q.set_jobs(jobs)),
            Err(e) => tracing::warn!(error = %e, "Failed to load queue; waiting for live updates"),
        }

        if let Err(e) = state.status().ensure_hydrated().await {
            tracing::warn!(error = %e, "Initial status fetch failed");
        }
        state.status().start_polling();

        if self.is_destroyed() {
            self.rollback();
            return Err(OrchestratorError::Destroyed);
        }

        tracing::info!(
            history_limit,
            results = state.with_results(|r| r.results().len()),
            jobs = state.with_queue(|q| q.len()),
            "Orchestrator initialized",
        );
        Ok(())
    }

    /// Undo a partial initialization so the next attempt starts clean.
    fn rollback(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.state.status().stop_polling();
        self.state.transport().detach();
        self.state.reset();
    }

    /// Tear down every task and connection. Runs at most once.
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scope.cancel();
        self.rollback();
        tracing::info!("Orchestrator destroyed");
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

type InitFuture = Shared<BoxFuture<'static, Result<(), OrchestratorError>>>;

enum Lifecycle {
    Uninitialized,
    Initializing(InitFuture),
    Ready,
}

struct ManagerInner {
    orchestrator: Option<Arc<Orchestrator>>,
    lifecycle: Lifecycle,
    consumers: HashSet<ConsumerHandle>,
}

pub struct OrchestratorManager {
    factory: Arc<dyn OrchestratorFactory>,
    registry: StatusControllerRegistry,
    inner: Mutex<ManagerInner>,
    next_consumer: AtomicU64,
}

impl OrchestratorManager {
    pub fn new(factory: Arc<dyn OrchestratorFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            registry: StatusControllerRegistry::new(),
            inner: Mutex::new(ManagerInner {
                orchestrator: None,
                lifecycle: Lifecycle::Uninitialized,
                consumers: HashSet::new(),
            }),
            next_consumer: AtomicU64::new(1),
        })
    }

    /// Register a consumer and hand it a facade.
    pub fn acquire(self: &Arc<Self>) -> GenerationFacade {
        let consumer = self.register_read_only_consumer();
        GenerationFacade::new(Arc::clone(self), consumer)
    }

    pub fn status_controllers(&self) -> &StatusControllerRegistry {
        &self.registry
    }

    /// The live orchestrator, creating its state if needed. Does not
    /// initialize it.
    pub fn ensure_orchestrator(&self) -> Arc<Orchestrator> {
        let mut inner = lock(&self.inner);
        self.ensure_orchestrator_locked(&mut inner)
    }

    fn ensure_orchestrator_locked(&self, inner: &mut ManagerInner) -> Arc<Orchestrator> {
        if let Some(orchestrator) = &inner.orchestrator {
            return Arc::clone(orchestrator);
        }
        let api = self.factory.api();
        let status = self.registry.controller_for(&self.factory.target(), Arc::clone(&api));
        let orchestrator = Arc::new(Orchestrator::new(OrchestratorState::new(status), api));
        inner.orchestrator = Some(Arc::clone(&orchestrator));
        tracing::debug!("Created orchestrator");
        orchestrator
    }

    pub fn orchestrator(&self) -> Option<Arc<Orchestrator>> {
        lock(&self.inner).orchestrator.clone()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(lock(&self.inner).lifecycle, Lifecycle::Ready)
    }

    pub fn is_initializing(&self) -> bool {
        matches!(lock(&self.inner).lifecycle, Lifecycle::Initializing(_))
    }

    /// Initialize the orchestrator, or join the initialization already in
    /// flight. Every concurrent caller gets the same outcome.
    pub async fn ensure_initialized(&self, options: InitOptions) -> Result<(), OrchestratorError> {
        let consumer = options.consumer;
        let fut = {
            let mut inner = lock(&self.inner);
            let joined = match &inner.lifecycle {
                Lifecycle::Ready => return Ok(()),
                Lifecycle::Initializing(fut) => Some(fut.clone()),
                Lifecycle::Uninitialized => None,
            };
            match joined {
                Some(fut) => fut,
                None => {
                    let orchestrator = self.ensure_orchestrator_locked(&mut inner);
                    let factory = Arc::clone(&self.factory);
                    let fut = orchestrator.initialize(factory, options).boxed().shared();
                    inner.lifecycle = Lifecycle::Initializing(fut.clone());
                    fut
                }
            }
        };

        let result = fut.clone().await;
        self.settle(&fut, &result);

        if let Err(e) = &result {
            tracing::warn!(error = %e, "Orchestrator initialization failed");
            if let Some(consumer) = consumer {
                self.unregister_read_only_consumer(consumer);
            }
        }
        result
    }

    /// Move out of `Initializing` once `fut` has resolved, unless a newer
    /// attempt already replaced it.
    fn settle(&self, fut: &InitFuture, result: &Result<(), OrchestratorError>) {
        let mut inner = lock(&self.inner);
        if let Lifecycle::Initializing(current) = &inner.lifecycle {
            if current.ptr_eq(fut) {
                inner.lifecycle = match result {
                    Ok(()) => Lifecycle::Ready,
                    Err(_) => Lifecycle::Uninitialized,
                };
            }
        }
    }

    // ---- consumers ----

    pub fn register_read_only_consumer(&self) -> ConsumerHandle {
        let handle = ConsumerHandle(self.next_consumer.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner).consumers.insert(handle);
        tracing::debug!(consumer = handle.0, "Registered consumer");
        handle
    }

    /// Put back a handle dropped by a failed initialization.
    pub(crate) fn reregister_consumer(&self, handle: ConsumerHandle) {
        if lock(&self.inner).consumers.insert(handle) {
            tracing::debug!(consumer = handle.0, "Re-registered consumer");
        }
    }

    /// Returns `true` if the handle was registered.
    pub fn unregister_read_only_consumer(&self, handle: ConsumerHandle) -> bool {
        lock(&self.inner).consumers.remove(&handle)
    }

    pub fn has_active_consumers(&self) -> bool {
        !lock(&self.inner).consumers.is_empty()
    }

    pub fn consumer_count(&self) -> usize {
        lock(&self.inner).consumers.len()
    }

    /// Unregister `handle` and destroy the orchestrator if no consumer is
    /// left. Waits for any in-flight initialization first; its error is
    /// ignored. Returns `true` if this call destroyed the orchestrator.
    pub async fn release_if_last_consumer(&self, handle: ConsumerHandle) -> bool {
        self.unregister_read_only_consumer(handle);

        let orchestrator = loop {
            let pending = {
                let mut inner = lock(&self.inner);
                let pending = match &inner.lifecycle {
                    Lifecycle::Initializing(fut) => Some(fut.clone()),
                    _ => None,
                };
                match pending {
                    Some(fut) => fut,
                    None => {
                        if !inner.consumers.is_empty() {
                            return false;
                        }
                        inner.lifecycle = Lifecycle::Uninitialized;
                        break inner.orchestrator.take();
                    }
                }
            };
            let result = pending.clone().await;
            self.settle(&pending, &result);
        };

        match orchestrator {
            Some(orchestrator) => {
                orchestrator.destroy();
                true
            }
            None => false,
        }
    }
}

impl Drop for OrchestratorManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(orchestrator) = inner.orchestrator.take() {
            orchestrator.destroy();
        }
    }
}
