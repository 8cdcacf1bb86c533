//! SQLite-backed ledger.
//!
//! Single connection behind a mutex, WAL mode, explicit transactions. The
//! connection lock doubles as the row lock: every merge runs read-decide-write
//! inside one transaction while holding it.

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::{debug, warn};

use super::{
    FillEvent, FinalizeModification, Ledger, LedgerError, MergeOutcome, StatusUpdate,
};
use crate::models::{
    ExecutionStyle, ModificationRecord, ModificationStatus, Order, OrderRequest, OrderStatus,
    OrderType, Position, Side, SlicingPlan, SourcePriority, TimeInForce,
};
use crate::pnl;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    client_order_id   TEXT PRIMARY KEY,
    strategy_id       TEXT NOT NULL,
    symbol            TEXT NOT NULL,
    side              TEXT NOT NULL,
    qty               TEXT NOT NULL,
    order_type        TEXT NOT NULL,
    limit_price       TEXT,
    stop_price        TEXT,
    time_in_force     TEXT NOT NULL,
    execution_style   TEXT NOT NULL DEFAULT 'instant',
    status            TEXT NOT NULL,
    status_rank       INTEGER NOT NULL,
    broker_order_id   TEXT,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    parent_order_id   TEXT,
    slice_num         INTEGER,
    total_slices      INTEGER,
    scheduled_time    TEXT,
    filled_qty        TEXT NOT NULL DEFAULT '0',
    filled_avg_price  TEXT,
    filled_at         TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    submitted_at      TEXT,
    broker_updated_at TEXT,
    source_priority   INTEGER NOT NULL DEFAULT 1,
    metadata          TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_orders_parent ON orders(parent_order_id);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_parent_slice
    ON orders(parent_order_id, slice_num)
    WHERE parent_order_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS positions (
    symbol          TEXT PRIMARY KEY,
    qty             TEXT NOT NULL,
    avg_entry_price TEXT NOT NULL,
    realized_pl     TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    last_trade_at   TEXT
);

CREATE TABLE IF NOT EXISTS modifications (
    modification_id          TEXT PRIMARY KEY,
    original_client_order_id TEXT NOT NULL,
    new_client_order_id      TEXT NOT NULL,
    idempotency_key          TEXT NOT NULL UNIQUE,
    changes                  TEXT NOT NULL,
    status                   TEXT NOT NULL,
    error_message            TEXT,
    seq                      INTEGER NOT NULL,
    modified_at              TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_modifications_status ON modifications(status, modified_at);

CREATE TABLE IF NOT EXISTS slice_schedule (
    parent_order_id TEXT NOT NULL,
    slice_num       INTEGER NOT NULL,
    client_order_id TEXT NOT NULL,
    scheduled_time  TEXT NOT NULL,
    status          TEXT NOT NULL,
    PRIMARY KEY (parent_order_id, slice_num)
);
"#;

const ORDER_COLS: &str = "client_order_id, strategy_id, symbol, side, qty, order_type, \
     limit_price, stop_price, time_in_force, execution_style, status, status_rank, \
     broker_order_id, retry_count, parent_order_id, slice_num, total_slices, scheduled_time, \
     filled_qty, filled_avg_price, filled_at, created_at, updated_at, submitted_at, \
     broker_updated_at, source_priority, metadata";

#[derive(Debug)]
struct ColumnDecodeError(String);

impl std::fmt::Display for ColumnDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "column decode error: {}", self.0)
    }
}

impl std::error::Error for ColumnDecodeError {}

fn decode_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(ColumnDecodeError(msg)),
    )
}

fn parse_dec(idx: usize, s: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(s).map_err(|e| decode_err(idx, format!("bad decimal {s:?}: {e}")))
}

fn parse_dec_opt(idx: usize, s: Option<String>) -> rusqlite::Result<Option<Decimal>> {
    s.map(|v| parse_dec(idx, &v)).transpose()
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| decode_err(idx, format!("bad timestamp {s:?}: {e}")))
}

fn parse_ts_opt(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(idx, &v)).transpose()
}

fn dec_s(d: Decimal) -> String {
    d.to_string()
}

fn dec_opt_s(d: Option<Decimal>) -> Option<String> {
    d.map(|v| v.to_string())
}

fn ts_s(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn ts_opt_s(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts_s)
}

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    let side: String = row.get(3)?;
    let order_type: String = row.get(5)?;
    let tif: String = row.get(8)?;
    let style: String = row.get(9)?;
    let status: String = row.get(10)?;
    let metadata: String = row.get(26)?;

    Ok(Order {
        client_order_id: row.get(0)?,
        strategy_id: row.get(1)?,
        symbol: row.get(2)?,
        side: Side::parse(&side).ok_or_else(|| decode_err(3, format!("bad side {side:?}")))?,
        qty: parse_dec(4, &row.get::<_, String>(4)?)?,
        order_type: OrderType::parse(&order_type)
            .ok_or_else(|| decode_err(5, format!("bad order_type {order_type:?}")))?,
        limit_price: parse_dec_opt(6, row.get(6)?)?,
        stop_price: parse_dec_opt(7, row.get(7)?)?,
        time_in_force: TimeInForce::parse(&tif)
            .ok_or_else(|| decode_err(8, format!("bad time_in_force {tif:?}")))?,
        execution_style: ExecutionStyle::parse(&style)
            .ok_or_else(|| decode_err(9, format!("bad execution_style {style:?}")))?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| decode_err(10, format!("bad status {status:?}")))?,
        broker_order_id: row.get(12)?,
        retry_count: row.get(13)?,
        parent_order_id: row.get(14)?,
        slice_num: row.get(15)?,
        total_slices: row.get(16)?,
        scheduled_time: parse_ts_opt(17, row.get(17)?)?,
        filled_qty: parse_dec(18, &row.get::<_, String>(18)?)?,
        filled_avg_price: parse_dec_opt(19, row.get(19)?)?,
        filled_at: parse_ts_opt(20, row.get(20)?)?,
        created_at: parse_ts(21, &row.get::<_, String>(21)?)?,
        updated_at: parse_ts(22, &row.get::<_, String>(22)?)?,
        submitted_at: parse_ts_opt(23, row.get(23)?)?,
        broker_updated_at: parse_ts_opt(24, row.get(24)?)?,
        source_priority: SourcePriority::from_i64(row.get(25)?),
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| decode_err(26, format!("bad metadata: {e}")))?,
    })
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        symbol: row.get(0)?,
        qty: parse_dec(1, &row.get::<_, String>(1)?)?,
        avg_entry_price: parse_dec(2, &row.get::<_, String>(2)?)?,
        realized_pl: parse_dec(3, &row.get::<_, String>(3)?)?,
        updated_at: parse_ts(4, &row.get::<_, String>(4)?)?,
        last_trade_at: parse_ts_opt(5, row.get(5)?)?,
    })
}

fn row_to_modification(row: &Row<'_>) -> rusqlite::Result<ModificationRecord> {
    let status: String = row.get(5)?;
    let changes: String = row.get(4)?;
    Ok(ModificationRecord {
        modification_id: row.get(0)?,
        original_client_order_id: row.get(1)?,
        new_client_order_id: row.get(2)?,
        idempotency_key: row.get(3)?,
        changes: serde_json::from_str(&changes)
            .map_err(|e| decode_err(4, format!("bad changes: {e}")))?,
        status: ModificationStatus::parse(&status)
            .ok_or_else(|| decode_err(5, format!("bad status {status:?}")))?,
        error_message: row.get(6)?,
        seq: row.get(7)?,
        modified_at: parse_ts(8, &row.get::<_, String>(8)?)?,
    })
}

fn map_constraint(e: rusqlite::Error, what: &str) -> LedgerError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return LedgerError::Duplicate(what.to_string());
        }
    }
    LedgerError::Storage(anyhow::Error::new(e).context(format!("insert {what}")))
}

fn insert_order(conn: &Connection, order: &Order) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT INTO orders ({ORDER_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)"),
        params![
            order.client_order_id,
            order.strategy_id,
            order.symbol,
            order.side.as_str(),
            dec_s(order.qty),
            order.order_type.as_str(),
            dec_opt_s(order.limit_price),
            dec_opt_s(order.stop_price),
            order.time_in_force.as_str(),
            order.execution_style.as_str(),
            order.status.as_str(),
            order.status.rank(),
            order.broker_order_id,
            order.retry_count,
            order.parent_order_id,
            order.slice_num,
            order.total_slices,
            ts_opt_s(order.scheduled_time),
            dec_s(order.filled_qty),
            dec_opt_s(order.filled_avg_price),
            ts_opt_s(order.filled_at),
            ts_s(order.created_at),
            ts_s(order.updated_at),
            ts_opt_s(order.submitted_at),
            ts_opt_s(order.broker_updated_at),
            order.source_priority.as_i64(),
            order.metadata.to_string(),
        ],
    )?;
    Ok(())
}

fn get_order(conn: &Connection, client_order_id: &str) -> rusqlite::Result<Option<Order>> {
    conn.query_row(
        &format!("SELECT {ORDER_COLS} FROM orders WHERE client_order_id = ?1"),
        params![client_order_id],
        row_to_order,
    )
    .optional()
}

fn get_position(conn: &Connection, symbol: &str) -> rusqlite::Result<Option<Position>> {
    conn.query_row(
        "SELECT symbol, qty, avg_entry_price, realized_pl, updated_at, last_trade_at \
         FROM positions WHERE symbol = ?1",
        params![symbol],
        row_to_position,
    )
    .optional()
}

fn upsert_position(conn: &Connection, position: &Position) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO positions (symbol, qty, avg_entry_price, realized_pl, updated_at, last_trade_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(symbol) DO UPDATE SET \
             qty = excluded.qty, \
             avg_entry_price = excluded.avg_entry_price, \
             realized_pl = excluded.realized_pl, \
             updated_at = excluded.updated_at, \
             last_trade_at = excluded.last_trade_at",
        params![
            position.symbol,
            dec_s(position.qty),
            dec_s(position.avg_entry_price),
            dec_s(position.realized_pl),
            ts_s(position.updated_at),
            ts_opt_s(position.last_trade_at),
        ],
    )?;
    Ok(())
}

/// SQLite [`Ledger`] implementation.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn new(db_path: &str) -> AnyResult<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        Self::init(conn)
    }

    pub fn in_memory() -> AnyResult<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AnyResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL).context("create ledger schema")?;
        Ok(SqliteLedger {
            conn: Mutex::new(conn),
        })
    }

    /// Fill ids already recorded in the order's metadata.
    fn metadata_has_fill(metadata: &serde_json::Value, fill_id: &str) -> bool {
        metadata
            .get("fills")
            .and_then(|f| f.as_array())
            .map(|fills| {
                fills
                    .iter()
                    .any(|f| f.get("fill_id").and_then(|v| v.as_str()) == Some(fill_id))
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn create_order(&self, order: &Order) -> Result<(), LedgerError> {
        let conn = self.conn.lock();
        insert_order(&conn, order)
            .map_err(|e| map_constraint(e, &format!("order {}", order.client_order_id)))
    }

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<Order>, LedgerError> {
        let conn = self.conn.lock();
        get_order(&conn, client_order_id)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("get order")))
    }

    async fn update_order_broker_id(
        &self,
        client_order_id: &str,
        broker_order_id: &str,
        status: OrderStatus,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let conn = self.conn.lock();
        // A webhook may already have advanced the order (fast fill) between
        // dispatch and this write; never move the status backwards.
        let changed = conn
            .execute(
                "UPDATE orders SET broker_order_id = ?2, \
                 status = CASE WHEN status_rank < ?4 THEN ?3 ELSE status END, \
                 status_rank = CASE WHEN status_rank < ?4 THEN ?4 ELSE status_rank END, \
                 submitted_at = COALESCE(submitted_at, ?5), updated_at = ?5 \
                 WHERE client_order_id = ?1",
                params![
                    client_order_id,
                    broker_order_id,
                    status.as_str(),
                    status.rank(),
                    ts_s(now),
                ],
            )
            .map_err(|e| {
                LedgerError::Storage(anyhow::Error::new(e).context("update broker id"))
            })?;
        if changed == 0 {
            return Err(LedgerError::NotFound(client_order_id.to_string()));
        }
        Ok(())
    }

    async fn update_order_status_cas(&self, update: &StatusUpdate) -> Result<bool, LedgerError> {
        self.apply_broker_update(update, None)
            .await
            .map(|outcome| outcome.status_applied)
    }

    async fn apply_broker_update(
        &self,
        update: &StatusUpdate,
        fill: Option<&FillEvent>,
    ) -> Result<MergeOutcome, LedgerError> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("begin merge")))?;

        let stored = get_order(&tx, &update.client_order_id)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("read order")))?
            .ok_or_else(|| LedgerError::NotFound(update.client_order_id.clone()))?;

        let incoming = (
            update.status.rank(),
            update.broker_updated_at,
            update.source_priority.as_i64(),
        );
        // Terminal orders only move through explicit replacement linkage.
        let terminal_block = stored.status.is_terminal() && update.status != stored.status;
        let status_applied = incoming > stored.cas_tuple() && !terminal_block;

        let mut fill_applied = false;
        let mut position = None;
        let mut metadata = stored.metadata.clone();

        if let Some(fill) = fill {
            let incoming_filled = update.filled_qty.unwrap_or(Decimal::ZERO);
            let delta = incoming_filled - stored.filled_qty;
            let duplicate = Self::metadata_has_fill(&metadata, &fill.fill_id);
            let price = fill.price.or(update.filled_avg_price);

            if duplicate || delta <= Decimal::ZERO {
                debug!(
                    client_order_id = %update.client_order_id,
                    fill_id = %fill.fill_id,
                    "ignoring replayed or non-advancing fill"
                );
            } else if let Some(price) = price {
                let filled_at = update.filled_at.unwrap_or(update.broker_updated_at);
                let mut pos = get_position(&tx, &stored.symbol)
                    .map_err(|e| {
                        LedgerError::Storage(anyhow::Error::new(e).context("read position"))
                    })?
                    .unwrap_or_else(|| Position::flat(&stored.symbol, now));
                pnl::apply_fill(&mut pos, stored.side, delta, price, filled_at);
                upsert_position(&tx, &pos).map_err(|e| {
                    LedgerError::Storage(anyhow::Error::new(e).context("write position"))
                })?;

                let fills = metadata
                    .as_object_mut()
                    .map(|obj| {
                        obj.entry("fills")
                            .or_insert_with(|| serde_json::Value::Array(Vec::new()))
                    })
                    .and_then(|v| v.as_array_mut());
                if let Some(fills) = fills {
                    fills.push(serde_json::json!({
                        "fill_id": fill.fill_id,
                        "qty": delta.to_string(),
                        "price": price.to_string(),
                        "filled_at": ts_s(filled_at),
                    }));
                }

                position = Some(pos);
                fill_applied = true;
            } else {
                warn!(
                    client_order_id = %update.client_order_id,
                    fill_id = %fill.fill_id,
                    "fill event carries no usable price; position not updated"
                );
            }
        }

        if status_applied || fill_applied {
            let new_status = if status_applied { update.status } else { stored.status };
            let new_priority = if status_applied {
                update.source_priority
            } else {
                stored.source_priority
            };
            let new_broker_ts = if status_applied {
                Some(update.broker_updated_at)
            } else {
                stored.broker_updated_at
            };
            let new_filled = update
                .filled_qty
                .map(|q| q.max(stored.filled_qty))
                .unwrap_or(stored.filled_qty);

            tx.execute(
                "UPDATE orders SET status = ?2, status_rank = ?3, source_priority = ?4, \
                 broker_updated_at = ?5, filled_qty = ?6, filled_avg_price = ?7, \
                 filled_at = ?8, broker_order_id = COALESCE(?9, broker_order_id), \
                 metadata = ?10, updated_at = ?11 \
                 WHERE client_order_id = ?1",
                params![
                    update.client_order_id,
                    new_status.as_str(),
                    new_status.rank(),
                    new_priority.as_i64(),
                    ts_opt_s(new_broker_ts),
                    dec_s(new_filled),
                    dec_opt_s(update.filled_avg_price.or(stored.filled_avg_price)),
                    ts_opt_s(update.filled_at.or(stored.filled_at)),
                    update.broker_order_id,
                    metadata.to_string(),
                    ts_s(now),
                ],
            )
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("merge order")))?;
        }

        let order = get_order(&tx, &update.client_order_id)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("reread order")))?
            .ok_or_else(|| LedgerError::NotFound(update.client_order_id.clone()))?;

        tx.commit()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("commit merge")))?;

        Ok(MergeOutcome {
            status_applied,
            fill_applied,
            order,
            position,
        })
    }

    async fn create_slice_plan(
        &self,
        plan: &SlicingPlan,
        template: &OrderRequest,
        strategy_id: &str,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("begin plan")))?;

        let parent = Order {
            client_order_id: plan.parent_order_id.clone(),
            strategy_id: strategy_id.to_string(),
            symbol: plan.symbol.clone(),
            side: plan.side,
            qty: Decimal::from(plan.total_qty),
            order_type: template.order_type,
            limit_price: template.limit_price,
            stop_price: template.stop_price,
            time_in_force: template.time_in_force,
            execution_style: ExecutionStyle::Twap,
            status: OrderStatus::PendingNew,
            broker_order_id: None,
            retry_count: 0,
            parent_order_id: None,
            slice_num: None,
            total_slices: Some(plan.total_slices),
            scheduled_time: None,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            filled_at: None,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            broker_updated_at: None,
            source_priority: SourcePriority::Manual,
            metadata: serde_json::json!({}),
        };
        insert_order(&tx, &parent)
            .map_err(|e| map_constraint(e, &format!("twap parent {}", plan.parent_order_id)))?;

        for slice in &plan.slices {
            let child = Order {
                client_order_id: slice.client_order_id.clone(),
                qty: Decimal::from(slice.qty),
                parent_order_id: Some(plan.parent_order_id.clone()),
                slice_num: Some(slice.slice_num),
                total_slices: None,
                scheduled_time: Some(slice.scheduled_time),
                ..parent.clone()
            };
            insert_order(&tx, &child).map_err(|e| {
                map_constraint(e, &format!("twap slice {}", slice.client_order_id))
            })?;

            tx.execute(
                "INSERT INTO slice_schedule (parent_order_id, slice_num, client_order_id, scheduled_time, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    plan.parent_order_id,
                    slice.slice_num,
                    slice.client_order_id,
                    ts_s(slice.scheduled_time),
                    slice.status.as_str(),
                ],
            )
            .map_err(|e| map_constraint(e, "slice schedule row"))?;
        }

        tx.commit()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("commit plan")))
    }

    async fn get_slices_by_parent_id(
        &self,
        parent_order_id: &str,
    ) -> Result<Vec<Order>, LedgerError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {ORDER_COLS} FROM orders WHERE parent_order_id = ?1 ORDER BY slice_num"
            ))
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("prepare slices")))?;
        let rows = stmt
            .query_map(params![parent_order_id], row_to_order)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("query slices")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("read slices")))
    }

    async fn cancel_pending_slices(&self, parent_order_id: &str) -> Result<u64, LedgerError> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("begin cancel")))?;

        let changed = tx
            .execute(
                "UPDATE orders SET status = 'canceled', status_rank = ?3, updated_at = ?2 \
                 WHERE parent_order_id = ?1 AND status = 'pending_new' AND broker_order_id IS NULL",
                params![parent_order_id, ts_s(now), OrderStatus::Canceled.rank()],
            )
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("cancel slices")))?;
        tx.execute(
            "UPDATE slice_schedule SET status = 'canceled' \
             WHERE parent_order_id = ?1 AND status = 'pending_new'",
            params![parent_order_id],
        )
        .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("cancel schedule")))?;

        tx.commit()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("commit cancel")))?;
        Ok(changed as u64)
    }

    async fn get_position_by_symbol(
        &self,
        symbol: &str,
    ) -> Result<Option<Position>, LedgerError> {
        let conn = self.conn.lock();
        get_position(&conn, symbol)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("get position")))
    }

    async fn sync_position_from_broker(
        &self,
        symbol: &str,
        qty: Decimal,
        avg_entry_price: Decimal,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let conn = self.conn.lock();
        let existing = get_position(&conn, symbol)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("read position")))?;
        let position = Position {
            symbol: symbol.to_string(),
            qty,
            avg_entry_price,
            // Realized P&L is local bookkeeping; the broker snapshot does not
            // carry it, so keep what we have.
            realized_pl: existing.as_ref().map(|p| p.realized_pl).unwrap_or_default(),
            updated_at: now,
            last_trade_at: existing.and_then(|p| p.last_trade_at),
        };
        upsert_position(&conn, &position)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("sync position")))
    }

    async fn insert_pending_modification(
        &self,
        record: &ModificationRecord,
    ) -> Result<i64, LedgerError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("begin mod")))?;

        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM modifications",
                [],
                |row| row.get(0),
            )
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("alloc seq")))?;

        tx.execute(
            "INSERT INTO modifications (modification_id, original_client_order_id, \
             new_client_order_id, idempotency_key, changes, status, error_message, seq, modified_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.modification_id,
                record.original_client_order_id,
                record.new_client_order_id,
                record.idempotency_key,
                record.changes.to_string(),
                record.status.as_str(),
                record.error_message,
                seq,
                ts_s(record.modified_at),
            ],
        )
        .map_err(|e| map_constraint(e, &format!("modification {}", record.modification_id)))?;

        tx.commit()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("commit mod")))?;
        Ok(seq)
    }

    async fn get_modification_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ModificationRecord>, LedgerError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT modification_id, original_client_order_id, new_client_order_id, \
             idempotency_key, changes, status, error_message, seq, modified_at \
             FROM modifications WHERE idempotency_key = ?1",
            params![idempotency_key],
            row_to_modification,
        )
        .optional()
        .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("get modification")))
    }

    async fn update_modification_status(
        &self,
        modification_id: &str,
        status: ModificationStatus,
        error_message: Option<&str>,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE modifications SET status = ?2, error_message = ?3, modified_at = ?4 \
                 WHERE modification_id = ?1",
                params![
                    modification_id,
                    status.as_str(),
                    error_message,
                    ts_s(Utc::now()),
                ],
            )
            .map_err(|e| {
                LedgerError::Storage(anyhow::Error::new(e).context("update modification"))
            })?;
        if changed == 0 {
            return Err(LedgerError::NotFound(modification_id.to_string()));
        }
        Ok(())
    }

    async fn finalize_modification(
        &self,
        args: &FinalizeModification,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("begin finalize")))?;

        tx.execute(
            "UPDATE modifications SET status = 'completed', error_message = NULL, modified_at = ?2 \
             WHERE modification_id = ?1",
            params![args.modification_id, ts_s(now)],
        )
        .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("complete mod")))?;

        // Mark the original replaced and link it to its successor.
        let original = get_order(&tx, &args.original_client_order_id)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("read original")))?
            .ok_or_else(|| LedgerError::NotFound(args.original_client_order_id.clone()))?;
        let mut original_meta = original.metadata.clone();
        if let Some(obj) = original_meta.as_object_mut() {
            obj.insert(
                "replaced_by".to_string(),
                serde_json::Value::String(args.replacement.client_order_id.clone()),
            );
        }
        tx.execute(
            "UPDATE orders SET status = 'replaced', status_rank = ?2, source_priority = ?3, \
             metadata = ?4, updated_at = ?5 WHERE client_order_id = ?1",
            params![
                args.original_client_order_id,
                OrderStatus::Replaced.rank(),
                SourcePriority::Manual.as_i64(),
                original_meta.to_string(),
                ts_s(now),
            ],
        )
        .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("mark replaced")))?;

        let mut replacement = args.replacement.clone();
        replacement.broker_order_id = args
            .new_broker_order_id
            .clone()
            .or(replacement.broker_order_id);
        if let Some(obj) = replacement.metadata.as_object_mut() {
            obj.insert(
                "replaced_from".to_string(),
                serde_json::Value::String(args.original_client_order_id.clone()),
            );
        }
        if let Err(e) = insert_order(&tx, &replacement) {
            // The replacement may already exist from a concurrent recovery
            // pass; that is fine.
            match map_constraint(e, "replacement order") {
                LedgerError::Duplicate(_) => {}
                other => return Err(other),
            }
        }

        tx.commit()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("commit finalize")))
    }

    async fn get_pending_modifications_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ModificationRecord>, LedgerError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT modification_id, original_client_order_id, new_client_order_id, \
                 idempotency_key, changes, status, error_message, seq, modified_at \
                 FROM modifications WHERE status = 'pending' AND modified_at < ?1 \
                 ORDER BY seq",
            )
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("prepare pending")))?;
        let rows = stmt
            .query_map(params![ts_s(cutoff)], row_to_modification)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("query pending")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("read pending")))
    }

    async fn get_active_orders(&self) -> Result<Vec<Order>, LedgerError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {ORDER_COLS} FROM orders \
                 WHERE status IN ('pending_new', 'new', 'accepted', 'partially_filled') \
                 ORDER BY created_at"
            ))
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("prepare active")))?;
        let rows = stmt
            .query_map([], row_to_order)
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("query active")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| LedgerError::Storage(anyhow::Error::new(e).context("read active")))
    }
}
