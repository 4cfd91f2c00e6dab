//! The non-realtime housekeeping state machine.
//!
//! Housekeeping runs beside the cyclic exchange and does the slow work:
//! promoting subdevices to OP once the bus has proven itself, detecting
//! devices that fell back, and walking them up the state ladder again.
//! Each [`run_once`] call performs one bounded unit of work per subdevice
//! so the loop can be cooperatively scheduled; it must never be called
//! concurrently with `send`/`receive`.

use crate::driver::BusDriver;
use crate::master::Telemetry;
use crate::subdevice::Subdevice;
use ecat_common::{BusState, MasterConfig, RunState};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Jitter samples required before the estimate is trusted for promotion.
///
/// One full time constant of the 1/16-gain filter; below this the
/// estimate is still dominated by its zero start value.
pub const MIN_JITTER_SAMPLES: u64 = 16;

/// Upper bound on a single state-transition wait inside `run_once`.
const STATE_CHECK_TIMEOUT: Duration = Duration::from_millis(50);

/// Housekeeping control block.
#[derive(Debug, Default)]
pub(crate) struct Housekeeper {
    armed: bool,
}

impl Housekeeper {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arm(&mut self) {
        self.armed = true;
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

/// Least-advanced logical state over the bound subdevices.
///
/// `None` when nothing is bound.
pub(crate) fn aggregate_state(subdevices: &[Subdevice]) -> Option<RunState> {
    subdevices
        .iter()
        .filter(|sd| sd.is_bound())
        .map(Subdevice::run_state)
        .min_by_key(|state| state.promotion_rank())
}

/// One bounded housekeeping pass.
pub(crate) fn run_once(
    housekeeper: &mut Housekeeper,
    driver: &mut dyn BusDriver,
    subdevices: &mut [Subdevice],
    telemetry: &Telemetry,
    config: &MasterConfig,
) {
    if !housekeeper.armed || telemetry.faulted.load(Ordering::Acquire) {
        return;
    }

    driver.read_states();

    let wkc_ok = telemetry.actual_wkc.load(Ordering::Acquire)
        == telemetry.expected_wkc.load(Ordering::Acquire);
    let jitter_ok = !config.dc_enabled
        || (telemetry.jitter_estimate_ns.load(Ordering::Acquire)
            <= config.max_execution_jitter_ns()
            && telemetry.jitter_samples.load(Ordering::Acquire) >= MIN_JITTER_SAMPLES);
    let any_fault = subdevices
        .iter()
        .any(|sd| sd.run_state() == RunState::Fault);

    for sd in subdevices.iter_mut() {
        let Some(wire) = sd.wire_index() else {
            continue;
        };
        let observed = driver.subdevice(wire).state;
        sd.update_state_variables(driver.subdevice(wire));

        match sd.run_state() {
            RunState::SafeOp => {
                if observed.rank() < BusState::SafeOp.rank() {
                    if fall_back(sd, wire, observed, driver, telemetry, config) {
                        return;
                    }
                } else if wkc_ok && jitter_ok && !any_fault {
                    let _ = driver.request_state(Some(wire), BusState::Op);
                    if driver.state_check(Some(wire), BusState::Op, STATE_CHECK_TIMEOUT)
                        == BusState::Op
                    {
                        sd.set_run_state(RunState::Op);
                        info!(name = %sd.display_name(), "subdevice operational");
                    }
                } else {
                    debug!(
                        name = %sd.display_name(),
                        wkc_ok,
                        jitter_ok,
                        any_fault,
                        "OP promotion withheld"
                    );
                }
            }
            RunState::Op => {
                if observed.rank() < BusState::Op.rank()
                    && fall_back(sd, wire, observed, driver, telemetry, config)
                {
                    return;
                }
            }
            RunState::Recovering => {
                recover_step(sd, wire, observed, driver, config);
            }
            RunState::PreOp => {
                // Reached from recovery once mailbox traffic works again.
                if observed.rank() >= BusState::SafeOp.rank() {
                    sd.set_run_state(RunState::SafeOp);
                }
            }
            RunState::Shutdown => {
                if observed == BusState::Init {
                    sd.ack_shutdown();
                }
            }
            RunState::Offline | RunState::Init | RunState::Boot | RunState::Fault => {}
        }
    }
}

/// Handle a subdevice observed below its logical state.
///
/// Returns true when the whole master faulted and the pass must stop.
fn fall_back(
    sd: &mut Subdevice,
    wire: usize,
    observed: BusState,
    driver: &mut dyn BusDriver,
    telemetry: &Telemetry,
    config: &MasterConfig,
) -> bool {
    let al_status_code = driver.subdevice(wire).al_status_code;
    warn!(
        name = %sd.display_name(),
        %observed,
        al_status_code,
        "subdevice fell back from {}",
        sd.run_state()
    );

    if config.read_rx_error_statistics {
        let rx_errors = driver.rx_error_count(wire);
        debug!(name = %sd.display_name(), rx_errors, "RX error counters before recovery");
    }

    if config.disable_recovery {
        sd.set_run_state(RunState::Fault);
        telemetry.faulted.store(true, Ordering::Release);
        warn!("recovery disabled; master faulted");
        return true;
    }

    sd.set_run_state(RunState::Recovering);
    false
}

/// One re-promotion step for a recovering subdevice.
fn recover_step(
    sd: &mut Subdevice,
    wire: usize,
    observed: BusState,
    driver: &mut dyn BusDriver,
    config: &MasterConfig,
) {
    if observed == BusState::Op {
        sd.set_run_state(RunState::Op);
        info!(name = %sd.display_name(), "subdevice recovered");
        return;
    }

    let Some(next) = observed.successor() else {
        return;
    };
    let _ = driver.request_state(Some(wire), next);
    let reached = driver.state_check(Some(wire), next, STATE_CHECK_TIMEOUT);

    if reached == BusState::PreOp && next == BusState::PreOp {
        // The device restarted; its mailbox configuration is gone.
        if let Err(error) = sd.configure(driver, config.dc_enabled, config.cycle_time_ns()) {
            warn!(name = %sd.display_name(), %error, "reconfiguration failed");
            sd.set_run_state(RunState::Fault);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{SimulatedBusDriver, WireSubdevice};
    use std::sync::atomic::Ordering;

    fn bound_subdevice(wire: usize) -> Subdevice {
        let mut sd = Subdevice::new(0, wire as u16, 0x2, 0x1234);
        sd.bind(wire);
        sd
    }

    fn simulated_bus(count: usize) -> SimulatedBusDriver {
        let mut driver = SimulatedBusDriver::new();
        for _ in 0..count {
            driver.add_subdevice(WireSubdevice::new(0, 0x2, 0x1234).with_io(8, 8));
        }
        driver.open("sim0").unwrap();
        driver.config_init().unwrap();
        driver
    }

    #[test]
    fn test_promotion_requires_matching_wkc() {
        let mut driver = simulated_bus(1);
        driver.request_state(None, BusState::SafeOp).unwrap();

        let mut subdevices = vec![bound_subdevice(0)];
        subdevices[0].set_run_state(RunState::SafeOp);

        let telemetry = Telemetry::new();
        telemetry.expected_wkc.store(3, Ordering::Release);
        telemetry.actual_wkc.store(0, Ordering::Release);

        let config = MasterConfig::new("sim0");
        let mut hk = Housekeeper::new();
        hk.arm();

        run_once(&mut hk, &mut driver, &mut subdevices, &telemetry, &config);
        assert_eq!(subdevices[0].run_state(), RunState::SafeOp);

        telemetry.actual_wkc.store(3, Ordering::Release);
        run_once(&mut hk, &mut driver, &mut subdevices, &telemetry, &config);
        assert_eq!(subdevices[0].run_state(), RunState::Op);
    }

    #[test]
    fn test_fallback_enters_recovery_and_recovers() {
        let mut driver = simulated_bus(1);
        driver.request_state(None, BusState::Op).unwrap();

        let mut subdevices = vec![bound_subdevice(0)];
        subdevices[0].set_run_state(RunState::Op);

        let telemetry = Telemetry::new();
        let config = MasterConfig::new("sim0");
        let mut hk = Housekeeper::new();
        hk.arm();

        driver.force_state(0, BusState::SafeOp);
        run_once(&mut hk, &mut driver, &mut subdevices, &telemetry, &config);
        assert_eq!(subdevices[0].run_state(), RunState::Recovering);

        // The simulated bus honors every request, so recovery converges.
        for _ in 0..4 {
            run_once(&mut hk, &mut driver, &mut subdevices, &telemetry, &config);
        }
        assert_eq!(subdevices[0].run_state(), RunState::Op);
    }

    #[test]
    fn test_disable_recovery_faults_master() {
        let mut driver = simulated_bus(2);
        driver.request_state(None, BusState::Op).unwrap();

        let mut subdevices = vec![bound_subdevice(0), bound_subdevice(1)];
        for sd in &subdevices {
            sd.set_run_state(RunState::Op);
        }

        let telemetry = Telemetry::new();
        let mut config = MasterConfig::new("sim0");
        config.disable_recovery = true;
        let mut hk = Housekeeper::new();
        hk.arm();

        driver.force_state(0, BusState::Init);
        run_once(&mut hk, &mut driver, &mut subdevices, &telemetry, &config);

        assert!(telemetry.faulted.load(Ordering::Acquire));
        assert_eq!(subdevices[0].run_state(), RunState::Fault);
        // Once faulted, no pass touches anything anymore.
        driver.force_state(1, BusState::Init);
        run_once(&mut hk, &mut driver, &mut subdevices, &telemetry, &config);
        assert_eq!(subdevices[1].run_state(), RunState::Op);
    }

    #[test]
    fn test_aggregate_is_least_advanced() {
        let mut subdevices = vec![bound_subdevice(0), bound_subdevice(1)];
        subdevices[0].set_run_state(RunState::Op);
        subdevices[1].set_run_state(RunState::SafeOp);
        assert_eq!(aggregate_state(&subdevices), Some(RunState::SafeOp));

        subdevices[1].set_run_state(RunState::Recovering);
        assert_eq!(aggregate_state(&subdevices), Some(RunState::Recovering));

        let unbound = vec![Subdevice::new(0, 0, 1, 1)];
        assert_eq!(aggregate_state(&unbound), None);
    }

    #[test]
    fn test_jitter_gate_blocks_promotion() {
        let mut driver = simulated_bus(1);
        driver.request_state(None, BusState::SafeOp).unwrap();

        let mut subdevices = vec![bound_subdevice(0)];
        subdevices[0].set_run_state(RunState::SafeOp);

        let telemetry = Telemetry::new();
        telemetry.expected_wkc.store(3, Ordering::Release);
        telemetry.actual_wkc.store(3, Ordering::Release);

        let mut config = MasterConfig::new("sim0");
        config.dc_enabled = true;
        let mut hk = Housekeeper::new();
        hk.arm();

        // Too few samples.
        telemetry
            .jitter_samples
            .store(MIN_JITTER_SAMPLES - 1, Ordering::Release);
        run_once(&mut hk, &mut driver, &mut subdevices, &telemetry, &config);
        assert_eq!(subdevices[0].run_state(), RunState::SafeOp);

        // Enough samples but estimate above the bound.
        telemetry
            .jitter_samples
            .store(MIN_JITTER_SAMPLES, Ordering::Release);
        telemetry
            .jitter_estimate_ns
            .store(config.max_execution_jitter_ns() + 1, Ordering::Release);
        run_once(&mut hk, &mut driver, &mut subdevices, &telemetry, &config);
        assert_eq!(subdevices[0].run_state(), RunState::SafeOp);

        // Both gates pass.
        telemetry.jitter_estimate_ns.store(100, Ordering::Release);
        run_once(&mut hk, &mut driver, &mut subdevices, &telemetry, &config);
        assert_eq!(subdevices[0].run_state(), RunState::Op);
    }
}
