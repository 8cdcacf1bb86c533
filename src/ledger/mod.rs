//! Transactional record store seam.
//!
//! Orders, positions, modifications, and slice plans persist through this
//! trait. Implementations must commit every multi-row consequence of a single
//! event atomically; the bundled [`SqliteLedger`] is the reference store.

mod sqlite;

pub use sqlite::SqliteLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{
    ModificationRecord, ModificationStatus, Order, OrderRequest, OrderStatus, Position,
    SlicingPlan, SourcePriority,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Unique-constraint violation; admission resolves these as idempotent
    /// replays.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Broker-authoritative status update to merge into an order row.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub client_order_id: String,
    pub status: OrderStatus,
    pub broker_updated_at: DateTime<Utc>,
    pub source_priority: SourcePriority,
    pub filled_qty: Option<Decimal>,
    pub filled_avg_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
    pub broker_order_id: Option<String>,
}

/// Fill identity and per-fill price for position accounting.
#[derive(Debug, Clone)]
pub struct FillEvent {
    /// Broker idempotency tag; replays of the same id are ignored.
    pub fill_id: String,
    /// Price of this fill; falls back to `filled_avg_price` when absent.
    pub price: Option<Decimal>,
}

/// What a merge actually changed.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The CAS tuple dominated and the order row was updated.
    pub status_applied: bool,
    /// A new, advancing fill was recorded and the position row updated.
    pub fill_applied: bool,
    pub order: Order,
    pub position: Option<Position>,
}

/// Single-transaction completion of a broker-confirmed replacement.
#[derive(Debug, Clone)]
pub struct FinalizeModification {
    pub modification_id: String,
    pub new_broker_order_id: Option<String>,
    /// Fully formed replacement order row; linkage metadata is written by
    /// the ledger.
    pub replacement: Order,
    pub original_client_order_id: String,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_order(&self, order: &Order) -> Result<(), LedgerError>;

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<Order>, LedgerError>;

    /// Record broker acceptance of a freshly submitted order.
    async fn update_order_broker_id(
        &self,
        client_order_id: &str,
        broker_order_id: &str,
        status: OrderStatus,
    ) -> Result<(), LedgerError>;

    /// CAS status merge without fill side effects. Returns whether the
    /// update dominated and was applied.
    async fn update_order_status_cas(&self, update: &StatusUpdate) -> Result<bool, LedgerError>;

    /// CAS status merge plus, when `fill` is present and advancing, the
    /// position update and metadata fill appendage — all in one transaction.
    async fn apply_broker_update(
        &self,
        update: &StatusUpdate,
        fill: Option<&FillEvent>,
    ) -> Result<MergeOutcome, LedgerError>;

    /// Persist a parent order, its child slices, and the schedule rows in
    /// one transaction. `Duplicate` when the parent id already exists.
    async fn create_slice_plan(
        &self,
        plan: &SlicingPlan,
        template: &OrderRequest,
        strategy_id: &str,
    ) -> Result<(), LedgerError>;

    async fn get_slices_by_parent_id(
        &self,
        parent_order_id: &str,
    ) -> Result<Vec<Order>, LedgerError>;

    /// Mark all not-yet-submitted children canceled. Returns how many rows
    /// changed.
    async fn cancel_pending_slices(&self, parent_order_id: &str) -> Result<u64, LedgerError>;

    async fn get_position_by_symbol(
        &self,
        symbol: &str,
    ) -> Result<Option<Position>, LedgerError>;

    /// Reconciliation gap closure: overwrite the local balance with the
    /// broker's authoritative view.
    async fn sync_position_from_broker(
        &self,
        symbol: &str,
        qty: Decimal,
        avg_entry_price: Decimal,
    ) -> Result<(), LedgerError>;

    /// Persist a pending modification, allocating its sequence number in the
    /// same transaction. Returns the sequence.
    async fn insert_pending_modification(
        &self,
        record: &ModificationRecord,
    ) -> Result<i64, LedgerError>;

    async fn get_modification_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ModificationRecord>, LedgerError>;

    async fn update_modification_status(
        &self,
        modification_id: &str,
        status: ModificationStatus,
        error_message: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Completion transaction: record completed, original replaced,
    /// replacement inserted and linked.
    async fn finalize_modification(
        &self,
        args: &FinalizeModification,
    ) -> Result<(), LedgerError>;

    async fn get_pending_modifications_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ModificationRecord>, LedgerError>;

    /// Orders in a non-terminal status, oldest first.
    async fn get_active_orders(&self) -> Result<Vec<Order>, LedgerError>;
}
