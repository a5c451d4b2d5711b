//! Shared, reference-counted generation orchestrator.
//!
//! Consumers call [`OrchestratorManager::acquire`](manager::OrchestratorManager::acquire)
//! to get a [`GenerationFacade`](facade::GenerationFacade). The manager
//! initializes one [`Orchestrator`](manager::Orchestrator) for all of them
//! and tears it down when the last consumer releases.

pub mod backend;
pub mod commands;
pub mod config;
pub mod error;
pub mod facade;
pub mod handlers;
pub mod manager;
pub mod state;
pub mod status_controller;
pub mod transport;
