//! End-to-end admission, slicing, webhook, and modification flows against an
//! in-memory ledger, in-process coordinator, and a scriptable mock broker.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use exec_gateway::broker::{
    BrokerAck, BrokerClient, BrokerError, BrokerOrder, BrokerPosition, OrderQueryStatus, Quote,
    ReplaceParams,
};
use exec_gateway::config::GatewayConfig;
use exec_gateway::coordinator::{CircuitBreaker, Coordinator, KillSwitch, MemoryCoordinator};
use exec_gateway::error::GatewayError;
use exec_gateway::fat_finger::{FatFingerThresholds, FatFingerValidator};
use exec_gateway::ids::generate_client_order_id;
use exec_gateway::ledger::{Ledger, SqliteLedger};
use exec_gateway::market::PriceCache;
use exec_gateway::models::{
    AuthContext, ExecutionStyle, ModifyRequest, OrderRequest, OrderStatus, OrderType, Side,
    TimeInForce,
};
use exec_gateway::modification::ModificationEngine;
use exec_gateway::reconciliation::StartupReconciler;
use exec_gateway::recovery::RecoveryManager;
use exec_gateway::reservation::PositionReservation;
use exec_gateway::scheduler::{SchedulerConfig, SliceScheduler};
use exec_gateway::slicer::TwapRequest;
use exec_gateway::webhook::{sign_body, WebhookIngestor};
use exec_gateway::OrderAdmission;

// ----------------------------------------------------------------------
// Mock broker
// ----------------------------------------------------------------------

#[derive(Default)]
struct MockBroker {
    submits: Mutex<Vec<(String, OrderRequest)>>,
    replaces: Mutex<Vec<(String, String)>>,
    cancels: Mutex<Vec<String>>,
    submit_failure: Mutex<Option<BrokerError>>,
    positions: Mutex<HashMap<String, BrokerPosition>>,
    open_orders: Mutex<Vec<BrokerOrder>>,
    position_failure: Mutex<bool>,
}

impl MockBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn submit_count(&self) -> usize {
        self.submits.lock().len()
    }

    fn fail_submits_with(&self, err: Option<BrokerError>) {
        *self.submit_failure.lock() = err;
    }

    fn set_position(&self, symbol: &str, qty: Decimal) {
        self.positions.lock().insert(
            symbol.to_string(),
            BrokerPosition {
                symbol: symbol.to_string(),
                qty,
                avg_entry_price: dec!(100),
            },
        );
    }

    fn fail_position_lookups(&self, fail: bool) {
        *self.position_failure.lock() = fail;
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn submit_order(
        &self,
        req: &OrderRequest,
        client_order_id: &str,
    ) -> Result<BrokerAck, BrokerError> {
        if let Some(err) = self.submit_failure.lock().clone() {
            return Err(err);
        }
        let mut submits = self.submits.lock();
        submits.push((client_order_id.to_string(), req.clone()));
        Ok(BrokerAck {
            id: format!("brk-{}", submits.len()),
            status: OrderStatus::Accepted,
            client_order_id: client_order_id.to_string(),
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        self.cancels.lock().push(broker_order_id.to_string());
        Ok(())
    }

    async fn replace_order(
        &self,
        broker_order_id: &str,
        _params: &ReplaceParams,
        new_client_order_id: &str,
    ) -> Result<BrokerAck, BrokerError> {
        let mut replaces = self.replaces.lock();
        replaces.push((broker_order_id.to_string(), new_client_order_id.to_string()));
        Ok(BrokerAck {
            id: format!("brk-r{}", replaces.len()),
            status: OrderStatus::Accepted,
            client_order_id: new_client_order_id.to_string(),
        })
    }

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<BrokerOrder>, BrokerError> {
        Ok(self
            .open_orders
            .lock()
            .iter()
            .find(|o| o.client_order_id == client_order_id)
            .cloned())
    }

    async fn get_open_position(
        &self,
        symbol: &str,
    ) -> Result<Option<BrokerPosition>, BrokerError> {
        if *self.position_failure.lock() {
            return Err(BrokerError::Connection("position endpoint down".into()));
        }
        Ok(self.positions.lock().get(symbol).cloned())
    }

    async fn get_orders(
        &self,
        _status: OrderQueryStatus,
        _limit: u32,
        _after: Option<DateTime<Utc>>,
    ) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(self.open_orders.lock().clone())
    }

    async fn get_latest_quotes(
        &self,
        _symbols: &[String],
    ) -> Result<HashMap<String, Quote>, BrokerError> {
        Ok(HashMap::new())
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Gateway {
    admission: OrderAdmission,
    modification: ModificationEngine,
    ingestor: WebhookIngestor,
    recovery: Arc<RecoveryManager>,
    reconciler: Arc<StartupReconciler>,
    scheduler: Arc<SliceScheduler>,
    coordinator: Arc<MemoryCoordinator>,
    ledger: Arc<SqliteLedger>,
    broker: Arc<MockBroker>,
    config: GatewayConfig,
}

async fn gateway(dry_run: bool, reconciled: bool) -> Gateway {
    let mut config = GatewayConfig {
        dry_run,
        ..GatewayConfig::default()
    };
    // Most scenarios run without fat-finger limits; the breach test sets its
    // own thresholds.
    config.fat_finger_defaults = FatFingerThresholds::default();

    let ledger: Arc<SqliteLedger> = Arc::new(SqliteLedger::in_memory().unwrap());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let broker = MockBroker::new();

    let recovery = Arc::new(RecoveryManager::new(Some(
        coordinator.clone() as Arc<dyn Coordinator>
    )));
    recovery
        .initialize_kill_switch(|| KillSwitch::new(coordinator.clone()))
        .await
        .expect("kill switch init");
    recovery
        .initialize_circuit_breaker(|| CircuitBreaker::new(coordinator.clone()))
        .await
        .expect("breaker init");
    recovery
        .initialize_position_reservation(|| {
            PositionReservation::new(
                coordinator.clone(),
                Duration::from_secs(config.reservation_ttl_secs),
            )
        })
        .await
        .expect("reservation init");

    let reconciler = Arc::new(StartupReconciler::new(
        ledger.clone(),
        broker.clone(),
        coordinator.clone(),
        config.reconciliation_timeout_secs,
    ));
    if reconciled {
        reconciler.mark_complete();
    }

    let scheduler = Arc::new(SliceScheduler::new(
        ledger.clone(),
        broker.clone(),
        coordinator.clone(),
        recovery.clone(),
        reconciler.clone(),
        SchedulerConfig {
            dry_run,
            max_position_qty: config.max_position_qty,
            slice_max_retries: config.slice_max_retries,
        },
    ));
    recovery.set_slice_scheduler(scheduler.clone());

    let fat_finger = Arc::new(FatFingerValidator::new(
        config.fat_finger_defaults.clone(),
        config.fat_finger_overrides.clone(),
    ));

    let admission = OrderAdmission::new(
        config.clone(),
        ledger.clone(),
        Some(broker.clone() as Arc<dyn BrokerClient>),
        coordinator.clone(),
        recovery.clone(),
        reconciler.clone(),
        fat_finger,
        None,
        Arc::new(PriceCache::new()),
    );

    let modification = ModificationEngine::new(
        ledger.clone(),
        broker.clone(),
        coordinator.clone(),
        recovery.clone(),
        Duration::from_millis(config.modification_lock_timeout_ms),
        config.max_position_qty,
    );

    let ingestor = WebhookIngestor::new(
        ledger.clone(),
        coordinator.clone(),
        config.webhook_secret.clone(),
    );

    Gateway {
        admission,
        modification,
        ingestor,
        recovery,
        reconciler,
        scheduler,
        coordinator,
        ledger,
        broker,
        config,
    }
}

fn market_order(symbol: &str, side: Side, qty: u32) -> OrderRequest {
    OrderRequest {
        symbol: symbol.to_string(),
        side,
        qty,
        order_type: OrderType::Market,
        limit_price: None,
        stop_price: None,
        time_in_force: TimeInForce::Day,
        execution_style: ExecutionStyle::Instant,
    }
}

fn auth() -> AuthContext {
    AuthContext::service("tests")
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn dry_run_submission_skips_broker_and_reservation() {
    let gw = gateway(true, true).await;
    let order = market_order("AAPL", Side::Buy, 10);

    let response = gw.admission.submit(&order, &auth()).await.unwrap();

    let expected_id = generate_client_order_id(&order, &gw.config.strategy_id, None);
    assert_eq!(response.client_order_id, expected_id);
    assert_eq!(response.status, OrderStatus::DryRun);
    assert!(response.message.contains("DRY_RUN"));
    assert_eq!(gw.broker.submit_count(), 0);
    assert_eq!(gw.coordinator.active_reservation_count("AAPL"), 0);

    let stored = gw
        .ledger
        .get_order_by_client_id(&expected_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, OrderStatus::DryRun);
}

#[tokio::test]
async fn repeated_submission_is_idempotent() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);

    let first = gw.admission.submit(&order, &auth()).await.unwrap();
    let second = gw.admission.submit(&order, &auth()).await.unwrap();
    let third = gw.admission.submit(&order, &auth()).await.unwrap();

    assert_eq!(first.client_order_id, second.client_order_id);
    assert_eq!(second.client_order_id, third.client_order_id);
    assert_eq!(gw.broker.submit_count(), 1);
    assert!(second.message.contains("idempotent"));
    assert!(third.message.contains("idempotent"));
}

#[tokio::test]
async fn concurrent_identical_submissions_create_one_order() {
    let gw = Arc::new(gateway(false, true).await);
    let order = market_order("MSFT", Side::Buy, 25);

    let a = {
        let gw = gw.clone();
        let order = order.clone();
        tokio::spawn(async move { gw.admission.submit(&order, &auth()).await })
    };
    let b = {
        let gw = gw.clone();
        let order = order.clone();
        tokio::spawn(async move { gw.admission.submit(&order, &auth()).await })
    };

    let ra = a.await.unwrap().unwrap();
    let rb = b.await.unwrap().unwrap();
    assert_eq!(ra.client_order_id, rb.client_order_id);
    assert_eq!(gw.broker.submit_count(), 1);
}

#[tokio::test]
async fn no_admission_while_safety_mechanism_unavailable() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);

    // Coordinator outage: the kill-switch probe fails, the request fails
    // closed, and the availability flag latches.
    gw.coordinator.set_unavailable(true);
    let err = gw.admission.submit(&order, &auth()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Unavailable(_)));
    assert!(gw.recovery.needs_recovery());

    // The outage ends but the flag still blocks until recovery runs.
    gw.coordinator.set_unavailable(false);
    let err = gw.admission.submit(&order, &auth()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Unavailable(_)));
    assert_eq!(gw.broker.submit_count(), 0);
}

#[tokio::test]
async fn kill_switch_and_breaker_block_orders() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);

    gw.coordinator
        .engage_kill_switch("test halt", "ops", None)
        .await
        .unwrap();
    let err = gw.admission.submit(&order, &auth()).await.unwrap_err();
    assert!(matches!(err, GatewayError::SafetyGate(_)));

    gw.coordinator.disengage_kill_switch("ops", None).await.unwrap();
    gw.coordinator.trip_circuit_breaker("volatility").await.unwrap();
    let err = gw.admission.submit(&order, &auth()).await.unwrap_err();
    assert!(matches!(err, GatewayError::SafetyGate(_)));

    gw.coordinator.reset_circuit_breaker().await.unwrap();
    assert!(gw.admission.submit(&order, &auth()).await.is_ok());
}

#[tokio::test]
async fn quarantined_symbol_is_refused() {
    let gw = gateway(false, true).await;
    gw.coordinator
        .quarantine_symbol("GME", Duration::from_secs(60))
        .await
        .unwrap();

    let err = gw
        .admission
        .submit(&market_order("GME", Side::Buy, 10), &auth())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::SafetyGate(_)));
    assert!(gw
        .admission
        .submit(&market_order("AAPL", Side::Buy, 10), &auth())
        .await
        .is_ok());
}

#[tokio::test]
async fn fat_finger_breach_reports_thresholds_and_actuals() {
    let mut gw = gateway(false, true).await;
    // Rebuild admission with a qty limit in force.
    let fat_finger = Arc::new(FatFingerValidator::new(
        FatFingerThresholds {
            max_qty: Some(10_000),
            ..Default::default()
        },
        HashMap::new(),
    ));
    gw.admission = OrderAdmission::new(
        gw.config.clone(),
        gw.ledger.clone(),
        Some(gw.broker.clone() as Arc<dyn BrokerClient>),
        gw.coordinator.clone(),
        gw.recovery.clone(),
        gw.reconciler.clone(),
        fat_finger,
        None,
        Arc::new(PriceCache::new()),
    );

    let err = gw
        .admission
        .submit(&market_order("AAPL", Side::Buy, 10_001), &auth())
        .await
        .unwrap_err();
    match err {
        GatewayError::FatFinger { reason, report } => {
            assert!(reason.contains("qty"));
            let breaches = report["breaches"].as_array().unwrap();
            assert!(breaches
                .iter()
                .any(|b| b["breach_type"] == "qty" && b["limit"] == "10000"));
        }
        other => panic!("expected FatFinger, got {other:?}"),
    }
    // Nothing reserved, nothing submitted.
    assert_eq!(gw.coordinator.active_reservation_count("AAPL"), 0);
    assert_eq!(gw.broker.submit_count(), 0);
}

#[tokio::test]
async fn broker_transport_error_releases_reservation_and_is_retriable() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);

    gw.broker
        .fail_submits_with(Some(BrokerError::Connection("timeout".into())));
    let err = gw.admission.submit(&order, &auth()).await.unwrap_err();
    assert!(matches!(err, GatewayError::BrokerTransport(_)));
    assert!(err.is_retriable());
    assert_eq!(gw.coordinator.active_reservation_count("AAPL"), 0);

    // Retry with the same parameters resolves against the persisted row.
    gw.broker.fail_submits_with(None);
    let response = gw.admission.submit(&order, &auth()).await.unwrap();
    assert!(response.message.contains("idempotent"));
}

#[tokio::test]
async fn broker_rejection_marks_order_rejected() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);

    gw.broker
        .fail_submits_with(Some(BrokerError::Rejection("outside market hours".into())));
    let err = gw.admission.submit(&order, &auth()).await.unwrap_err();
    assert!(matches!(err, GatewayError::BrokerRejection(_)));

    let id = generate_client_order_id(&order, &gw.config.strategy_id, None);
    let stored = gw.ledger.get_order_by_client_id(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Rejected);
    assert_eq!(gw.coordinator.active_reservation_count("AAPL"), 0);
}

#[tokio::test]
async fn twap_plan_persists_and_cancels() {
    let gw = gateway(false, true).await;
    let req = TwapRequest {
        symbol: "AAPL".to_string(),
        side: Side::Buy,
        qty: 103,
        duration_minutes: 5,
        interval_seconds: 60,
        order_type: OrderType::Market,
        limit_price: None,
        stop_price: None,
        time_in_force: TimeInForce::Day,
        trade_date: NaiveDate::from_ymd_opt(2024, 10, 17),
    };

    let outcome = gw.admission.submit_sliced(&req, &auth()).await.unwrap();
    assert!(!outcome.already_existed);
    let plan = &outcome.plan;
    let qtys: Vec<u32> = plan.slices.iter().map(|s| s.qty).collect();
    assert_eq!(qtys, vec![21, 21, 21, 20, 20]);
    for pair in plan.slices.windows(2) {
        assert!(pair[1].scheduled_time > pair[0].scheduled_time);
    }

    let parent = gw
        .ledger
        .get_order_by_client_id(&plan.parent_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.total_slices, Some(5));
    assert!(parent.scheduled_time.is_none());

    // Retrying the same request returns the stored plan.
    let retry = gw.admission.submit_sliced(&req, &auth()).await.unwrap();
    assert!(retry.already_existed);
    assert_eq!(retry.plan.parent_order_id, plan.parent_order_id);

    // Slices 0 and 1 get submitted, then the rest are canceled.
    for slice in &plan.slices[..2] {
        gw.ledger
            .update_order_broker_id(&slice.client_order_id, "brk-x", OrderStatus::Accepted)
            .await
            .unwrap();
    }
    let canceled = gw
        .scheduler
        .cancel_remaining_slices(&plan.parent_order_id)
        .await
        .unwrap();
    assert_eq!(canceled, 3);

    let slices = gw
        .ledger
        .get_slices_by_parent_id(&plan.parent_order_id)
        .await
        .unwrap();
    assert_eq!(slices[0].status, OrderStatus::Accepted);
    assert_eq!(slices[2].status, OrderStatus::Canceled);
    assert_eq!(slices[4].status, OrderStatus::Canceled);
}

#[tokio::test]
async fn twap_rejected_on_single_order_endpoint() {
    let gw = gateway(false, true).await;
    let mut order = market_order("AAPL", Side::Buy, 100);
    order.execution_style = ExecutionStyle::Twap;
    let err = gw.admission.submit(&order, &auth()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)));
}

#[tokio::test]
async fn reduce_only_gate_during_reconciliation() {
    let gw = gateway(false, false).await;
    gw.broker.set_position("AAPL", dec!(100));

    // Selling 30 against a +100 broker position shrinks it: allowed.
    let sell = gw
        .admission
        .submit(&market_order("AAPL", Side::Sell, 30), &auth())
        .await;
    assert!(sell.is_ok(), "reduce-only sell refused: {sell:?}");

    // Buying 10 would grow the position: blocked.
    let err = gw
        .admission
        .submit(&market_order("AAPL", Side::Buy, 10), &auth())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::SafetyGate(_)));

    // Authoritative position unavailable: both directions fail closed.
    gw.broker.fail_position_lookups(true);
    for side in [Side::Buy, Side::Sell] {
        let err = gw
            .admission
            .submit(&market_order("AAPL", side, 5), &auth())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }
}

#[tokio::test]
async fn reconciliation_override_opens_the_gate() {
    let gw = gateway(false, false).await;
    gw.broker.set_position("AAPL", dec!(0));

    let err = gw
        .admission
        .submit(&market_order("AAPL", Side::Buy, 10), &auth())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::SafetyGate(_)));

    gw.coordinator
        .set_reconciliation_override("ops", "verified manually", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(gw
        .admission
        .submit(&market_order("AAPL", Side::Buy, 10), &auth())
        .await
        .is_ok());
}

#[tokio::test]
async fn webhook_fill_flows_into_position_and_survives_replay() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);
    let response = gw.admission.submit(&order, &auth()).await.unwrap();

    let body = serde_json::json!({
        "event": "fill",
        "timestamp": "2024-10-17T16:30:05Z",
        "fill_id": "f-1",
        "price": "150.25",
        "order": {
            "client_order_id": response.client_order_id,
            "status": "filled",
            "filled_qty": "10",
            "filled_avg_price": "150.25",
            "updated_at": "2024-10-17T16:30:05Z",
        }
    })
    .to_string()
    .into_bytes();

    let first = gw.ingestor.ingest(&body, None).await.unwrap();
    assert!(first.status_applied && first.fill_applied);

    let replay = gw.ingestor.ingest(&body, None).await.unwrap();
    assert!(!replay.status_applied && !replay.fill_applied);

    let position = gw.ledger.get_position_by_symbol("AAPL").await.unwrap().unwrap();
    assert_eq!(position.qty, dec!(10));
    assert_eq!(position.avg_entry_price, dec!(150.25));

    // Late, earlier-stamped accepted event cannot roll the fill back.
    let stale = serde_json::json!({
        "event": "order_update",
        "timestamp": "2024-10-17T16:30:00Z",
        "order": {
            "client_order_id": response.client_order_id,
            "status": "accepted",
            "updated_at": "2024-10-17T16:30:00Z",
        }
    })
    .to_string()
    .into_bytes();
    let outcome = gw.ingestor.ingest(&stale, None).await.unwrap();
    assert!(!outcome.status_applied);
    assert_eq!(outcome.status, OrderStatus::Filled);
}

#[tokio::test]
async fn signed_webhook_round_trip() {
    let mut gw = gateway(false, true).await;
    gw.ingestor = WebhookIngestor::new(
        gw.ledger.clone(),
        gw.coordinator.clone(),
        "hunter2".to_string(),
    );
    let order = market_order("AAPL", Side::Buy, 5);
    let response = gw.admission.submit(&order, &auth()).await.unwrap();

    let body = serde_json::json!({
        "event": "order_update",
        "order": { "client_order_id": response.client_order_id, "status": "new" }
    })
    .to_string()
    .into_bytes();

    assert!(gw.ingestor.ingest(&body, Some("00ff")).await.is_err());
    let sig = sign_body("hunter2", &body);
    assert!(gw.ingestor.ingest(&body, Some(&sig)).await.is_ok());
}

#[tokio::test]
async fn modification_replaces_order_idempotently() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);
    let response = gw.admission.submit(&order, &auth()).await.unwrap();
    let original_id = response.client_order_id.clone();

    let changes = ModifyRequest {
        qty: Some(5),
        ..Default::default()
    };
    let modify = gw
        .modification
        .modify(&original_id, &changes, "idem-1", &auth())
        .await
        .unwrap();
    assert_eq!(
        modify.status,
        exec_gateway::models::ModificationStatus::Completed
    );

    let original = gw
        .ledger
        .get_order_by_client_id(&original_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.status, OrderStatus::Replaced);
    let replacement = gw
        .ledger
        .get_order_by_client_id(&modify.new_client_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replacement.qty, dec!(5));
    assert_eq!(
        replacement.metadata["replaced_from"].as_str().unwrap(),
        original_id
    );

    // Same idempotency key replays the completed modification; the broker
    // sees exactly one replace.
    let replay = gw
        .modification
        .modify(&original_id, &changes, "idem-1", &auth())
        .await
        .unwrap();
    assert_eq!(replay.new_client_order_id, modify.new_client_order_id);
    assert!(replay.message.contains("idempotent"));
    assert_eq!(gw.broker.replaces.lock().len(), 1);
}

#[tokio::test]
async fn risk_reducing_modification_bypasses_kill_switch() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);
    let response = gw.admission.submit(&order, &auth()).await.unwrap();

    gw.coordinator
        .engage_kill_switch("halt", "ops", None)
        .await
        .unwrap();

    // Qty decrease passes despite the halt.
    let reduce = gw
        .modification
        .modify(
            &response.client_order_id,
            &ModifyRequest {
                qty: Some(4),
                ..Default::default()
            },
            "idem-reduce",
            &auth(),
        )
        .await;
    assert!(reduce.is_ok(), "risk-reducing modify refused: {reduce:?}");

    // A price change is not risk-reducing and gets blocked.
    let order2 = market_order("MSFT", Side::Buy, 10);
    gw.coordinator.disengage_kill_switch("ops", None).await.unwrap();
    let response2 = gw.admission.submit(&order2, &auth()).await.unwrap();
    gw.coordinator
        .engage_kill_switch("halt", "ops", None)
        .await
        .unwrap();
    let err = gw
        .modification
        .modify(
            &response2.client_order_id,
            &ModifyRequest {
                qty: Some(12),
                ..Default::default()
            },
            "idem-grow",
            &auth(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::SafetyGate(_)));
}

#[tokio::test]
async fn cross_strategy_lookup_reports_not_found() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);
    let response = gw.admission.submit(&order, &auth()).await.unwrap();

    let outsider = AuthContext {
        user_id: "other".to_string(),
        strategy_scope: Some("someone_else".to_string()),
    };
    let err = gw
        .admission
        .get_order(&response.client_order_id, &outsider)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)));
}

#[tokio::test]
async fn cancel_terminal_order_is_a_noop() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);
    let response = gw.admission.submit(&order, &auth()).await.unwrap();

    let first = gw
        .admission
        .cancel_order(&response.client_order_id, &auth())
        .await
        .unwrap();
    assert_eq!(first.status, OrderStatus::Canceled);

    let second = gw
        .admission
        .cancel_order(&response.client_order_id, &auth())
        .await
        .unwrap();
    assert!(second.message.contains("terminal"));
}

#[tokio::test]
async fn file_backed_ledger_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.db");
    let path = path.to_str().unwrap();

    let now = Utc::now();
    let order = exec_gateway::models::Order {
        client_order_id: "9".repeat(24),
        strategy_id: "alpha_baseline".to_string(),
        symbol: "AAPL".to_string(),
        side: Side::Buy,
        qty: dec!(10),
        order_type: OrderType::Market,
        limit_price: None,
        stop_price: None,
        time_in_force: TimeInForce::Day,
        execution_style: ExecutionStyle::Instant,
        status: OrderStatus::PendingNew,
        broker_order_id: None,
        retry_count: 0,
        parent_order_id: None,
        slice_num: None,
        total_slices: None,
        scheduled_time: None,
        filled_qty: dec!(0),
        filled_avg_price: None,
        filled_at: None,
        created_at: now,
        updated_at: now,
        submitted_at: None,
        broker_updated_at: None,
        source_priority: exec_gateway::models::SourcePriority::Manual,
        metadata: serde_json::json!({}),
    };

    {
        let ledger = SqliteLedger::new(path).unwrap();
        ledger.create_order(&order).await.unwrap();
    }

    // A fresh process opening the same file sees the committed row.
    let ledger = SqliteLedger::new(path).unwrap();
    let stored = ledger
        .get_order_by_client_id(&order.client_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.symbol, "AAPL");
    assert_eq!(stored.qty, dec!(10));
    assert_eq!(stored.status, OrderStatus::PendingNew);
}

#[tokio::test]
async fn pending_modification_recovers_from_broker_state() {
    let gw = gateway(false, true).await;
    let order = market_order("AAPL", Side::Buy, 10);
    let response = gw.admission.submit(&order, &auth()).await.unwrap();
    let original_id = response.client_order_id.clone();

    // Simulate a replace whose finalization was lost: a pending record old
    // enough to be stale, with the replacement alive at the broker.
    let new_id = exec_gateway::ids::replacement_order_id(&original_id, "idem-lost", None);
    let record = exec_gateway::models::ModificationRecord {
        modification_id: "mod-lost".to_string(),
        original_client_order_id: original_id.clone(),
        new_client_order_id: new_id.clone(),
        idempotency_key: "idem-lost".to_string(),
        changes: serde_json::json!({ "qty": ["10", "5"] }),
        status: exec_gateway::models::ModificationStatus::Pending,
        error_message: None,
        seq: 0,
        modified_at: Utc::now() - chrono::Duration::minutes(10),
    };
    gw.ledger.insert_pending_modification(&record).await.unwrap();
    gw.broker.open_orders.lock().push(BrokerOrder {
        id: "brk-recovered".to_string(),
        client_order_id: new_id.clone(),
        symbol: "AAPL".to_string(),
        side: Side::Buy,
        qty: dec!(5),
        status: OrderStatus::Accepted,
        filled_qty: dec!(0),
        filled_avg_price: None,
        limit_price: None,
        stop_price: None,
        updated_at: Some(Utc::now()),
    });

    let recovered = gw
        .reconciler
        .reconcile_pending_modifications(chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let original = gw
        .ledger
        .get_order_by_client_id(&original_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.status, OrderStatus::Replaced);
    let replacement = gw.ledger.get_order_by_client_id(&new_id).await.unwrap().unwrap();
    assert_eq!(replacement.qty, dec!(5));
    assert_eq!(replacement.broker_order_id.as_deref(), Some("brk-recovered"));
}
