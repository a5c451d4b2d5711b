//! Generation orchestrator core: the synchronous state modules.
//!
//! Everything in this crate is free of I/O. The orchestrator crate wraps
//! these modules behind locks and feeds them from a transport adapter.
//!
//! - [`queue`]: in-flight jobs indexed by UI id and backend id.
//! - [`results`]: capped, most-recent-first generation history.
//! - [`system_status`]: backend status record with readiness flags.
//! - [`transport`]: connection phase state machine and metrics.
//! - [`events`]: loosely-typed inbound adapter events.
//! - [`adapter`] / [`api`]: the external collaborator traits.

pub mod adapter;
pub mod api;
pub mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod results;
pub mod system_status;
pub mod transport;
pub mod types;
