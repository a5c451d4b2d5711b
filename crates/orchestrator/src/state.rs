//! The orchestrator's module state.
//!
//! Every module sits behind a `std::sync` lock that is only taken inside
//! short synchronous sections, never across an `.await`. A poisoned lock
//! is recovered rather than propagated so one panicking task cannot wedge
//! every consumer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use genorch_core::queue::JobQueue;
use genorch_core::results::ResultHistory;

use crate::commands::CommandRunner;
use crate::status_controller::SystemStatusController;
use crate::transport::TransportModule;

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct OrchestratorState {
    queue: RwLock<JobQueue>,
    results: RwLock<ResultHistory>,
    transport: TransportModule,
    status: Arc<SystemStatusController>,
    commands: CommandRunner,
}

impl OrchestratorState {
    pub fn new(status: Arc<SystemStatusController>) -> Self {
        Self {
            queue: RwLock::new(JobQueue::new()),
            results: RwLock::new(ResultHistory::default()),
            transport: TransportModule::new(),
            status,
            commands: CommandRunner::new(),
        }
    }

    pub fn with_queue<R>(&self, f: impl FnOnce(&JobQueue) -> R) -> R {
        f(&read(&self.queue))
    }

    pub fn with_queue_mut<R>(&self, f: impl FnOnce(&mut JobQueue) -> R) -> R {
        f(&mut write(&self.queue))
    }

    pub fn with_results<R>(&self, f: impl FnOnce(&ResultHistory) -> R) -> R {
        f(&read(&self.results))
    }

    pub fn with_results_mut<R>(&self, f: impl FnOnce(&mut ResultHistory) -> R) -> R {
        f(&mut write(&self.results))
    }

    /// Run `f` with both the queue and the results locked, in that order.
    pub fn with_queue_and_results<R>(&self, f: impl FnOnce(&mut JobQueue, &mut ResultHistory) -> R) -> R {
        let mut queue = write(&self.queue);
        let mut results = write(&self.results);
        f(&mut queue, &mut results)
    }

    pub fn transport(&self) -> &TransportModule {
        &self.transport
    }

    pub fn status(&self) -> &Arc<SystemStatusController> {
        &self.status
    }

    pub fn commands(&self) -> &CommandRunner {
        &self.commands
    }

    /// Drop jobs, results and transport counters. The history limit and
    /// poll interval survive.
    pub fn reset(&self) {
        self.with_queue_mut(|queue| *queue = JobQueue::new());
        self.with_results_mut(|results| {
            let limit = results.history_limit();
            *results = ResultHistory::new(limit);
        });
        self.transport.reset();
        self.status.reset_status();
    }
}
