//! Recovery manager.
//!
//! Single authority for the availability of the safety mechanisms. Every
//! component flag starts unavailable and is cleared only after a successful
//! liveness probe; any runtime failure re-flags it. Handlers never touch
//! component references directly — they ask this manager, which fails closed
//! when an instance is missing.
//!
//! Recovery order: KillSwitch -> CircuitBreaker -> PositionReservation ->
//! SliceScheduler. The scheduler is not a safety mechanism; it is restarted
//! opportunistically whenever the kill switch and breaker are healthy.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::coordinator::{CircuitBreaker, Coordinator, KillSwitch};
use crate::reservation::PositionReservation;
use crate::scheduler::SliceScheduler;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Factories used to rebuild components after a coordinator outage.
#[derive(Default)]
pub struct RecoveryFactories {
    pub kill_switch: Option<Factory<KillSwitch>>,
    pub circuit_breaker: Option<Factory<CircuitBreaker>>,
    pub position_reservation: Option<Factory<PositionReservation>>,
    pub slice_scheduler: Option<Factory<Arc<SliceScheduler>>>,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub kill_switch_recovered: bool,
    pub circuit_breaker_recovered: bool,
    pub position_reservation_recovered: bool,
    pub slice_scheduler_recovered: bool,
    /// True when no safety component remains unavailable. The scheduler is
    /// intentionally excluded.
    pub all_recovered: bool,
}

#[derive(Default)]
struct Components {
    kill_switch: Option<Arc<KillSwitch>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    position_reservation: Option<Arc<PositionReservation>>,
    slice_scheduler: Option<Arc<SliceScheduler>>,
}

pub struct RecoveryManager {
    coordinator: Option<Arc<dyn Coordinator>>,
    components: Mutex<Components>,
    // Unavailable flags default to true: nothing trades until a probe passes.
    kill_switch_unavailable: AtomicBool,
    circuit_breaker_unavailable: AtomicBool,
    position_reservation_unavailable: AtomicBool,
    // Serializes concurrent recovery attempts.
    recovery_lock: tokio::sync::Mutex<()>,
}

impl RecoveryManager {
    pub fn new(coordinator: Option<Arc<dyn Coordinator>>) -> Self {
        RecoveryManager {
            coordinator,
            components: Mutex::new(Components::default()),
            kill_switch_unavailable: AtomicBool::new(true),
            circuit_breaker_unavailable: AtomicBool::new(true),
            position_reservation_unavailable: AtomicBool::new(true),
            recovery_lock: tokio::sync::Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Flags and component accessors
    // ------------------------------------------------------------------

    pub fn is_kill_switch_unavailable(&self) -> bool {
        self.kill_switch_unavailable.load(Ordering::SeqCst)
    }

    pub fn set_kill_switch_unavailable(&self, value: bool) {
        self.kill_switch_unavailable.store(value, Ordering::SeqCst);
    }

    pub fn is_circuit_breaker_unavailable(&self) -> bool {
        self.circuit_breaker_unavailable.load(Ordering::SeqCst)
    }

    pub fn set_circuit_breaker_unavailable(&self, value: bool) {
        self.circuit_breaker_unavailable.store(value, Ordering::SeqCst);
    }

    pub fn is_position_reservation_unavailable(&self) -> bool {
        self.position_reservation_unavailable.load(Ordering::SeqCst)
    }

    pub fn set_position_reservation_unavailable(&self, value: bool) {
        self.position_reservation_unavailable
            .store(value, Ordering::SeqCst);
    }

    pub fn kill_switch(&self) -> Option<Arc<KillSwitch>> {
        self.components.lock().kill_switch.clone()
    }

    pub fn circuit_breaker(&self) -> Option<Arc<CircuitBreaker>> {
        self.components.lock().circuit_breaker.clone()
    }

    pub fn position_reservation(&self) -> Option<Arc<PositionReservation>> {
        self.components.lock().position_reservation.clone()
    }

    pub fn slice_scheduler(&self) -> Option<Arc<SliceScheduler>> {
        self.components.lock().slice_scheduler.clone()
    }

    pub fn set_slice_scheduler(&self, scheduler: Arc<SliceScheduler>) {
        self.components.lock().slice_scheduler = Some(scheduler);
    }

    // ------------------------------------------------------------------
    // Recovery orchestration
    // ------------------------------------------------------------------

    /// True when any safety component is flagged unavailable or its instance
    /// is missing. The slice scheduler does not participate: trading single
    /// orders is fine without TWAP.
    pub fn needs_recovery(&self) -> bool {
        if self.is_kill_switch_unavailable()
            || self.is_circuit_breaker_unavailable()
            || self.is_position_reservation_unavailable()
        {
            return true;
        }
        let components = self.components.lock();
        components.kill_switch.is_none()
            || components.circuit_breaker.is_none()
            || components.position_reservation.is_none()
    }

    /// Whether the coordinator is reachable enough to attempt recovery.
    pub async fn can_recover(&self) -> bool {
        match &self.coordinator {
            None => false,
            Some(coordinator) => match coordinator.health_check().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "coordinator health check failed during recovery check");
                    false
                }
            },
        }
    }

    pub async fn attempt_recovery(&self, factories: &RecoveryFactories) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let needs_safety = self.needs_recovery();
        let needs_scheduler = self.should_recover_slice_scheduler();
        if !needs_safety && !needs_scheduler {
            report.all_recovered = true;
            return report;
        }

        let can_recover_safety = self.can_recover().await;
        if needs_safety && !can_recover_safety {
            warn!("safety component recovery not possible - coordinator unavailable");
        }

        let _guard = self.recovery_lock.lock().await;

        // Re-check under the lock; a concurrent attempt may have finished.
        let needs_safety = self.needs_recovery();
        let needs_scheduler = self.should_recover_slice_scheduler();
        if !needs_safety && !needs_scheduler {
            report.all_recovered = true;
            return report;
        }

        if can_recover_safety {
            if self.is_kill_switch_unavailable() || self.kill_switch().is_none() {
                report.kill_switch_recovered =
                    self.recover_kill_switch(factories.kill_switch.as_deref()).await;
            }
            if self.is_circuit_breaker_unavailable() || self.circuit_breaker().is_none() {
                report.circuit_breaker_recovered = self
                    .recover_circuit_breaker(factories.circuit_breaker.as_deref())
                    .await;
            }
            if self.is_position_reservation_unavailable()
                || self.position_reservation().is_none()
            {
                report.position_reservation_recovered = self
                    .recover_position_reservation(factories.position_reservation.as_deref())
                    .await;
            }
        }

        // Scheduler recovery needs only healthy safety components.
        if self.should_recover_slice_scheduler() {
            report.slice_scheduler_recovered = self
                .recover_slice_scheduler(factories.slice_scheduler.as_deref())
                .await;
        }

        report.all_recovered = !self.needs_recovery();
        info!(
            kill_switch_available = !self.is_kill_switch_unavailable(),
            breaker_available = !self.is_circuit_breaker_unavailable(),
            position_reservation_available = !self.is_position_reservation_unavailable(),
            all_recovered = report.all_recovered,
            "infrastructure recovery attempt completed"
        );
        report
    }

    async fn recover_kill_switch(&self, factory: Option<&(dyn Fn() -> KillSwitch + Send + Sync)>) -> bool {
        if self.kill_switch().is_none() {
            match factory {
                Some(factory) => {
                    self.components.lock().kill_switch = Some(Arc::new(factory()));
                    info!("kill-switch re-initialized after coordinator recovery");
                }
                None => {
                    warn!("kill-switch recovery failed: no instance and no factory");
                    self.set_kill_switch_unavailable(true);
                    return false;
                }
            }
        }

        let instance = match self.kill_switch() {
            Some(i) => i,
            None => {
                self.set_kill_switch_unavailable(true);
                return false;
            }
        };
        match instance.is_engaged().await {
            Ok(_) => {
                self.set_kill_switch_unavailable(false);
                info!("kill-switch recovered and validated");
                true
            }
            Err(e) => {
                warn!(error = %e, "kill-switch recovery failed");
                self.set_kill_switch_unavailable(true);
                false
            }
        }
    }

    async fn recover_circuit_breaker(
        &self,
        factory: Option<&(dyn Fn() -> CircuitBreaker + Send + Sync)>,
    ) -> bool {
        if self.circuit_breaker().is_none() {
            match factory {
                Some(factory) => {
                    self.components.lock().circuit_breaker = Some(Arc::new(factory()));
                    info!("circuit breaker re-initialized after coordinator recovery");
                }
                None => {
                    warn!("circuit breaker recovery failed: no instance and no factory");
                    self.set_circuit_breaker_unavailable(true);
                    return false;
                }
            }
        }

        let instance = match self.circuit_breaker() {
            Some(i) => i,
            None => {
                self.set_circuit_breaker_unavailable(true);
                return false;
            }
        };
        match instance.is_tripped().await {
            Ok(_) => {
                self.set_circuit_breaker_unavailable(false);
                info!("circuit breaker recovered and validated");
                true
            }
            Err(e) => {
                warn!(error = %e, "circuit breaker recovery failed");
                self.set_circuit_breaker_unavailable(true);
                false
            }
        }
    }

    async fn recover_position_reservation(
        &self,
        factory: Option<&(dyn Fn() -> PositionReservation + Send + Sync)>,
    ) -> bool {
        if self.position_reservation().is_none() {
            match factory {
                Some(factory) => {
                    self.components.lock().position_reservation = Some(Arc::new(factory()));
                    info!("position reservation re-initialized after coordinator recovery");
                }
                None => {
                    warn!("position reservation recovery failed: no instance and no factory");
                    self.set_position_reservation_unavailable(true);
                    return false;
                }
            }
        }

        let instance = match self.position_reservation() {
            Some(i) => i,
            None => {
                self.set_position_reservation_unavailable(true);
                return false;
            }
        };
        match instance.health_check().await {
            Ok(()) => {
                self.set_position_reservation_unavailable(false);
                info!("position reservation recovered and validated");
                true
            }
            Err(e) => {
                warn!(error = %e, "position reservation instance exists but coordinator unhealthy");
                self.set_position_reservation_unavailable(true);
                false
            }
        }
    }

    /// The scheduler is restarted whenever both gate components are healthy
    /// and it either does not exist or has stopped.
    fn should_recover_slice_scheduler(&self) -> bool {
        if self.is_kill_switch_unavailable() || self.is_circuit_breaker_unavailable() {
            return false;
        }
        let components = self.components.lock();
        if components.kill_switch.is_none() || components.circuit_breaker.is_none() {
            return false;
        }
        match &components.slice_scheduler {
            None => true,
            Some(scheduler) => !scheduler.is_running(),
        }
    }

    async fn recover_slice_scheduler(
        &self,
        factory: Option<&(dyn Fn() -> Arc<SliceScheduler> + Send + Sync)>,
    ) -> bool {
        let existing = self.slice_scheduler();
        if let Some(scheduler) = existing {
            if scheduler.is_running() {
                return true;
            }
            if let Err(e) = scheduler.start().await {
                warn!(error = %e, "slice scheduler restart failed");
                return false;
            }
            if !scheduler.is_running() {
                warn!("slice scheduler start() called but still not running");
                return false;
            }
            info!("slice scheduler restarted");
            return true;
        }

        let Some(factory) = factory else {
            return false;
        };
        let scheduler = factory();
        if let Err(e) = scheduler.start().await {
            warn!(error = %e, "new slice scheduler failed to start");
            return false;
        }
        if !scheduler.is_running() {
            warn!("new slice scheduler start() called but still not running");
            return false;
        }
        self.components.lock().slice_scheduler = Some(scheduler);
        info!("slice scheduler re-initialized and started after coordinator recovery");
        true
    }

    // ------------------------------------------------------------------
    // Startup initialization (fail closed on any error)
    // ------------------------------------------------------------------

    pub async fn initialize_kill_switch(
        &self,
        factory: impl Fn() -> KillSwitch,
    ) -> Option<Arc<KillSwitch>> {
        if self.coordinator.is_none() {
            error!("kill-switch not initialized (coordinator unavailable); all trading blocked");
            self.set_kill_switch_unavailable(true);
            return None;
        }
        let instance = Arc::new(factory());
        match instance.is_engaged().await {
            Ok(_) => {
                self.components.lock().kill_switch = Some(instance.clone());
                self.set_kill_switch_unavailable(false);
                info!("kill-switch initialized and validated");
                Some(instance)
            }
            Err(e) => {
                error!(error = %e, "kill-switch health check failed during init; failing closed");
                // Keep the instance for a later recovery pass.
                self.components.lock().kill_switch = Some(instance);
                self.set_kill_switch_unavailable(true);
                None
            }
        }
    }

    pub async fn initialize_circuit_breaker(
        &self,
        factory: impl Fn() -> CircuitBreaker,
    ) -> Option<Arc<CircuitBreaker>> {
        if self.coordinator.is_none() {
            error!("circuit breaker not initialized (coordinator unavailable); all trading blocked");
            self.set_circuit_breaker_unavailable(true);
            return None;
        }
        let instance = Arc::new(factory());
        match instance.is_tripped().await {
            Ok(_) => {
                self.components.lock().circuit_breaker = Some(instance.clone());
                self.set_circuit_breaker_unavailable(false);
                info!("circuit breaker initialized and validated");
                Some(instance)
            }
            Err(e) => {
                error!(error = %e, "circuit breaker health check failed during init; failing closed");
                self.components.lock().circuit_breaker = Some(instance);
                self.set_circuit_breaker_unavailable(true);
                None
            }
        }
    }

    pub async fn initialize_position_reservation(
        &self,
        factory: impl Fn() -> PositionReservation,
    ) -> Option<Arc<PositionReservation>> {
        if self.coordinator.is_none() {
            error!(
                "position reservation not initialized (coordinator unavailable); all trading blocked"
            );
            self.set_position_reservation_unavailable(true);
            return None;
        }
        let instance = Arc::new(factory());
        match instance.health_check().await {
            Ok(()) => {
                self.components.lock().position_reservation = Some(instance.clone());
                self.set_position_reservation_unavailable(false);
                info!("position reservation initialized and validated");
                Some(instance)
            }
            Err(e) => {
                error!(error = %e, "position reservation init failed; failing closed");
                self.components.lock().position_reservation = Some(instance);
                self.set_position_reservation_unavailable(true);
                None
            }
        }
    }
}
