//! Execution gateway core.
//!
//! Order admission with layered safety gates, deterministic idempotency ids,
//! soft position reservations, TWAP slicing with timed dispatch, webhook
//! ingestion with causal (CAS) merging, and startup reconciliation against
//! the broker. Transport, auth, and the broker wire protocol live outside
//! this crate behind the seams in `broker`, `coordinator`, and `ledger`.

pub mod admission;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fat_finger;
pub mod ids;
pub mod ledger;
pub mod market;
pub mod models;
pub mod modification;
pub mod pnl;
pub mod reconciliation;
pub mod recovery;
pub mod reservation;
pub mod scheduler;
pub mod slicer;
pub mod webhook;

pub use admission::OrderAdmission;
pub use broker::{BrokerClient, BrokerError};
pub use config::GatewayConfig;
pub use coordinator::{CircuitBreaker, Coordinator, KillSwitch, MemoryCoordinator};
pub use error::GatewayError;
pub use fat_finger::FatFingerValidator;
pub use ledger::{Ledger, SqliteLedger};
pub use modification::ModificationEngine;
pub use reconciliation::StartupReconciler;
pub use recovery::RecoveryManager;
pub use reservation::PositionReservation;
pub use scheduler::SliceScheduler;
pub use slicer::TwapSlicer;
pub use webhook::WebhookIngestor;
