//! The master: lifecycle, cyclic engine, and published telemetry.
//!
//! # Concurrency contract
//!
//! Two logical threads drive a master: the realtime cyclic thread calls
//! [`Master::send`] / [`Master::receive`] every cycle, the housekeeping
//! thread calls [`Master::do_housekeeping`]. The bus driver is not
//! reentrant, so these calls must never overlap; the `&mut self`
//! receivers make that the caller's obligation and make the
//! single-threaded collapse trivially sound. Everything a reader might
//! want between cycles - working counters, jitter estimate, DC time,
//! frame statistics, per-subdevice states - is published through
//! release/acquire atomics and readable lock-free via the getters and the
//! cloneable [`MasterMonitor`].

use crate::driver::{
    fast_irq, BusDriver, SimulatedBusDriver, COE_DETAILS_COMPLETE_ACCESS, NO_FRAME,
};
use crate::housekeeping::{self, Housekeeper};
use crate::jitter::JitterEstimator;
use crate::process_image::{ImageWindow, ProcessImage};
use crate::status::{StatusEvent, StatusHandler, TracePoint, TraceStatusHandler};
use crate::subdevice::Subdevice;
use crossbeam_utils::CachePadded;
use ecat_common::{BusState, MasterConfig, MasterError, MasterResult, RunState};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bound on the initialization waits for PRE-OP and SAFE-OP.
const STATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Values the cyclic thread publishes for lock-free readers.
///
/// The hot fields sit on their own cache lines so the housekeeping
/// thread's polling never bounces the line the cyclic thread writes.
#[derive(Debug)]
pub(crate) struct Telemetry {
    pub(crate) expected_wkc: AtomicI64,
    pub(crate) actual_wkc: CachePadded<AtomicI64>,
    pub(crate) jitter_estimate_ns: CachePadded<AtomicU64>,
    pub(crate) jitter_samples: AtomicU64,
    pub(crate) dc_time_ns: CachePadded<AtomicI64>,
    pub(crate) start_dc_time_ns: AtomicI64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) wkc_mismatches: AtomicU64,
    pub(crate) lost_frames: AtomicU64,
    pub(crate) faulted: AtomicBool,
}

impl Telemetry {
    pub(crate) fn new() -> Self {
        Self {
            expected_wkc: AtomicI64::new(0),
            actual_wkc: CachePadded::new(AtomicI64::new(0)),
            jitter_estimate_ns: CachePadded::new(AtomicU64::new(0)),
            jitter_samples: AtomicU64::new(0),
            dc_time_ns: CachePadded::new(AtomicI64::new(0)),
            start_dc_time_ns: AtomicI64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            wkc_mismatches: AtomicU64::new(0),
            lost_frames: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
        }
    }
}

/// Lock-free view of the master's published values.
///
/// Cheap to clone and safe to read from any thread, including while the
/// cyclic and housekeeping threads are running.
#[derive(Debug, Clone)]
pub struct MasterMonitor {
    telemetry: Arc<Telemetry>,
}

impl MasterMonitor {
    /// Working counter expected for a fully delivered frame.
    #[must_use]
    pub fn expected_working_counter(&self) -> i32 {
        self.telemetry.expected_wkc.load(Ordering::Acquire) as i32
    }

    /// Most recently received working counter.
    #[must_use]
    pub fn actual_working_counter(&self) -> i32 {
        self.telemetry.actual_wkc.load(Ordering::Acquire) as i32
    }

    /// Current jitter estimate in nanoseconds.
    #[must_use]
    pub fn jitter_estimate_ns(&self) -> u64 {
        self.telemetry.jitter_estimate_ns.load(Ordering::Acquire)
    }

    /// Intervals that have fed the jitter estimate.
    #[must_use]
    pub fn jitter_samples(&self) -> u64 {
        self.telemetry.jitter_samples.load(Ordering::Acquire)
    }

    /// DC master time of the last received frame, in nanoseconds.
    #[must_use]
    pub fn dc_time_ns(&self) -> i64 {
        self.telemetry.dc_time_ns.load(Ordering::Acquire)
    }

    /// DC master time recorded when the cyclic exchange was primed.
    #[must_use]
    pub fn start_dc_time_ns(&self) -> i64 {
        self.telemetry.start_dc_time_ns.load(Ordering::Acquire)
    }

    /// Cyclic frames handed to the driver.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.telemetry.frames_sent.load(Ordering::Relaxed)
    }

    /// Cyclic frames received.
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.telemetry.frames_received.load(Ordering::Relaxed)
    }

    /// Received frames whose working counter missed the expectation.
    #[must_use]
    pub fn wkc_mismatches(&self) -> u64 {
        self.telemetry.wkc_mismatches.load(Ordering::Relaxed)
    }

    /// Receive timeouts.
    #[must_use]
    pub fn lost_frames(&self) -> u64 {
        self.telemetry.lost_frames.load(Ordering::Relaxed)
    }

    /// Whether the master faulted.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.telemetry.faulted.load(Ordering::Acquire)
    }
}

/// Handle to a registered subdevice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubdeviceHandle(usize);

/// The EtherCAT master.
pub struct Master {
    config: MasterConfig,
    driver: Box<dyn BusDriver>,
    status: Box<dyn StatusHandler>,
    subdevices: Vec<Subdevice>,
    /// Wire slot -> registry index, filled during identity matching.
    wire_bindings: Vec<Option<usize>>,
    /// Wire slots with no matching registration: (slot, alias, position).
    unconfigured: Vec<(usize, u16, u16)>,
    image: ProcessImage,
    jitter: JitterEstimator,
    telemetry: Arc<Telemetry>,
    housekeeper: Housekeeper,
    initialized: bool,
    opened: bool,
    closed: bool,
}

impl Master {
    /// Master on the given interface, backed by the simulated driver.
    ///
    /// Production hosts hand in their datagram engine via
    /// [`Master::with_driver`].
    #[must_use]
    pub fn new(interface: impl Into<String>) -> Self {
        Self::with_driver(
            MasterConfig::new(interface),
            Box::new(SimulatedBusDriver::new()),
        )
    }

    /// Master with an explicit configuration and driver backend.
    #[must_use]
    pub fn with_driver(config: MasterConfig, driver: Box<dyn BusDriver>) -> Self {
        let cycle_time_ns = config.cycle_time_ns();
        Self {
            config,
            driver,
            status: Box::new(TraceStatusHandler),
            subdevices: Vec::new(),
            wire_bindings: Vec::new(),
            unconfigured: Vec::new(),
            image: ProcessImage::unallocated(),
            jitter: JitterEstimator::new(cycle_time_ns),
            telemetry: Arc::new(Telemetry::new()),
            housekeeper: Housekeeper::new(),
            initialized: false,
            opened: false,
            closed: false,
        }
    }

    /// Replace the status handler. Only sensible before `init`.
    pub fn set_status_handler(&mut self, handler: Box<dyn StatusHandler>) {
        self.status = handler;
    }

    /// Register a subdevice. Only legal before `init`.
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` when the (alias, position) address is
    /// already taken; `AlreadyInitialized` after `init`.
    pub fn register_subdevice(&mut self, subdevice: Subdevice) -> MasterResult<SubdeviceHandle> {
        if self.initialized {
            return Err(MasterError::AlreadyInitialized);
        }
        if self
            .subdevices
            .iter()
            .any(|sd| sd.alias() == subdevice.alias() && sd.position() == subdevice.position())
        {
            return Err(MasterError::DuplicateRegistration {
                alias: subdevice.alias(),
                position: subdevice.position(),
            });
        }
        self.subdevices.push(subdevice);
        Ok(SubdeviceHandle(self.subdevices.len() - 1))
    }

    /// The configuration is frozen once `init` returns; setters called
    /// afterwards are ignored with a warning.
    fn config_mut(&mut self) -> Option<&mut MasterConfig> {
        if self.initialized {
            warn!("configuration is frozen after init; setting ignored");
            return None;
        }
        Some(&mut self.config)
    }

    /// Enable Distributed Clocks with the given cycle time.
    pub fn enable_dc(&mut self, cycle_time_ns: u64) {
        if let Some(config) = self.config_mut() {
            config.dc_enabled = true;
            config.cycle_time = Duration::from_nanos(cycle_time_ns);
        }
    }

    /// Fail `init` when a registered subdevice is missing from the bus.
    pub fn set_require_all_subdevices(&mut self, require: bool) {
        if let Some(config) = self.config_mut() {
            config.require_all_subdevices = require;
        }
    }

    /// How long `receive` waits for the cyclic frame.
    pub fn set_receive_timeout_us(&mut self, micros: u64) {
        if let Some(config) = self.config_mut() {
            config.receive_timeout = Duration::from_micros(micros);
        }
    }

    /// Execution-jitter bound gating promotion to OP.
    pub fn set_max_execution_jitter_ns(&mut self, nanos: u64) {
        if let Some(config) = self.config_mut() {
            config.max_execution_jitter = Duration::from_nanos(nanos);
        }
    }

    /// Fault the master instead of recovering fallen subdevices.
    pub fn disable_recovery(&mut self) {
        if let Some(config) = self.config_mut() {
            config.disable_recovery = true;
        }
    }

    /// Clear the Complete-Access bit on every subdevice record.
    pub fn disable_complete_access(&mut self) {
        if let Some(config) = self.config_mut() {
            config.disable_complete_access = true;
        }
    }

    /// Read RX error counters from subdevices that fall back.
    pub fn set_read_rx_error_statistics(&mut self, read: bool) {
        if let Some(config) = self.config_mut() {
            config.read_rx_error_statistics = read;
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Whether `init` completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn emit(&mut self, event: StatusEvent) {
        self.status.on_event(&event);
    }

    /// Bring the bus up: scan, match, configure, map the process image,
    /// reach SAFE-OP, and prime the cyclic exchange.
    ///
    /// # Errors
    ///
    /// See [`MasterError`]; on failure the master can still be shut down
    /// and a fresh master constructed for a retry.
    pub fn init(&mut self) -> MasterResult<()> {
        if self.initialized {
            return Err(MasterError::AlreadyInitialized);
        }
        if self.closed {
            return Err(MasterError::AlreadyShutDown);
        }
        self.verify_unique_addresses()?;

        // NIC interrupt coalescing adds up to a full cycle of latency.
        self.emit(StatusEvent::Trace(TracePoint::FastIrq));
        let code = self.driver.setup_fast_irq(&self.config.interface);
        match code {
            fast_irq::OK => {}
            fast_irq::NOT_LINUX
            | fast_irq::NO_DRIVER_INFO
            | fast_irq::CANNOT_READ_COALESCE
            | fast_irq::CANNOT_WRITE_COALESCE => {
                warn!(
                    code,
                    interface = %self.config.interface,
                    "could not reduce NIC interrupt coalescing; cycle latency may suffer"
                );
            }
            fast_irq::NO_PERMISSION => return Err(MasterError::PermissionDenied),
            other => return Err(MasterError::InternalError(other)),
        }

        self.emit(StatusEvent::Trace(TracePoint::CreateContext));
        self.emit(StatusEvent::Trace(TracePoint::OpenInterface));
        let interface = self.config.interface.clone();
        self.driver
            .open(&interface)
            .map_err(|_| MasterError::InterfaceUnavailable(interface.clone()))?;
        self.opened = true;

        self.emit(StatusEvent::Trace(TracePoint::InitializingSubdevices));
        let wire_count = self
            .driver
            .config_init()
            .map_err(|e| MasterError::ScanFailed(e.to_string()))?;
        info!(wire_count, interface = %self.config.interface, "bus scan complete");

        // Mailbox traffic (DC setup, configure hooks, startup SDOs) is
        // only legal once the whole bus confirmed PRE-OP.
        self.emit(StatusEvent::Trace(TracePoint::WaitForPreOp));
        let reached = self
            .driver
            .state_check(None, BusState::PreOp, STATE_TIMEOUT);
        if reached.rank() < BusState::PreOp.rank() {
            return Err(MasterError::StateTransitionFailed {
                target: BusState::PreOp,
            });
        }

        if self.config.dc_enabled {
            let capable = self
                .driver
                .config_dc()
                .map_err(|e| MasterError::ScanFailed(e.to_string()))?;
            if capable {
                self.emit(StatusEvent::Trace(TracePoint::DcEnabled));
            } else {
                self.config.dc_enabled = false;
                self.emit(StatusEvent::Trace(TracePoint::DcDisabled));
                self.emit(StatusEvent::DcNotCapable);
            }
        } else {
            self.emit(StatusEvent::Trace(TracePoint::DcDisabled));
        }
        self.jitter = JitterEstimator::new(self.config.cycle_time_ns());

        self.emit(StatusEvent::Trace(TracePoint::ConfiguringSubdevices));
        let pdo_bytes = self.match_and_configure(wire_count)?;

        self.enforce_missing_policy(wire_count)?;

        self.emit(StatusEvent::Trace(TracePoint::AllocateImage));
        self.image = ProcessImage::new(pdo_bytes);
        let required = self
            .driver
            .config_map_group(self.image.as_mut_slice(), 0)
            .map_err(|e| MasterError::ScanFailed(e.to_string()))?;
        if required > self.image.len() {
            return Err(MasterError::ProcessImageTooSmall {
                required,
                allocated: self.image.len(),
            });
        }
        debug!(
            allocated = self.image.len(),
            required, pdo_bytes, "process image mapped"
        );

        let reached = self
            .driver
            .state_check(None, BusState::SafeOp, STATE_TIMEOUT);
        if reached.rank() < BusState::SafeOp.rank() {
            return Err(MasterError::StateTransitionFailed {
                target: BusState::SafeOp,
            });
        }

        self.emit(StatusEvent::Trace(TracePoint::LinkBuffers));
        self.link_buffers()?;

        self.emit(StatusEvent::Trace(TracePoint::ConfigureTxRx));
        self.driver.send_process_data(self.image.as_slice());
        self.telemetry.frames_sent.fetch_add(1, Ordering::Relaxed);
        let wkc = self
            .driver
            .receive_process_data(self.image.as_mut_slice(), self.config.receive_timeout_us());
        if wkc != NO_FRAME {
            self.telemetry
                .frames_received
                .fetch_add(1, Ordering::Relaxed);
            self.telemetry
                .actual_wkc
                .store(i64::from(wkc), Ordering::Release);
        }

        let expected = self.driver.group(0).expected_wkc();
        self.telemetry
            .expected_wkc
            .store(i64::from(expected), Ordering::Release);
        self.emit(StatusEvent::ExpectedWorkingCounter(expected));

        if self.config.dc_enabled {
            let start = self.driver.dc_time();
            self.telemetry
                .start_dc_time_ns
                .store(start, Ordering::Release);
            self.telemetry.dc_time_ns.store(start, Ordering::Release);
            // Seeds the reference point; no sample is counted yet.
            self.jitter.record_arrival(start);
        }

        self.housekeeper.arm();
        self.initialized = true;
        self.emit(StatusEvent::Trace(TracePoint::ConfigureComplete));
        info!(
            subdevices = self.subdevices.len(),
            expected_wkc = expected,
            dc = self.config.dc_enabled,
            "master initialized"
        );
        Ok(())
    }

    fn verify_unique_addresses(&self) -> MasterResult<()> {
        for (i, a) in self.subdevices.iter().enumerate() {
            for b in self.subdevices.iter().skip(i + 1) {
                if a.alias() == b.alias() && a.position() == b.position() {
                    return Err(MasterError::DuplicateRegistration {
                        alias: a.alias(),
                        position: a.position(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Walk the discovered subdevices in wire order, compute their
    /// (alias, position) addresses, bind matching registrations, and run
    /// their configure hooks. Returns the accumulated PDO byte count.
    fn match_and_configure(&mut self, wire_count: usize) -> MasterResult<usize> {
        self.wire_bindings = vec![None; wire_count];
        self.unconfigured.clear();

        let reported: Vec<u16> = (0..wire_count)
            .map(|i| self.driver.subdevice(i).alias)
            .collect();
        let addresses = wire_addresses(&reported);

        let mut pdo_bytes = 0;
        for (wire_index, &(alias, position)) in addresses.iter().enumerate() {
            let (vendor, product, bytes) = {
                let record = self.driver.subdevice(wire_index);
                (
                    record.vendor_id,
                    record.product_code,
                    record.process_data_bytes(),
                )
            };
            pdo_bytes += bytes;

            let registration = self
                .subdevices
                .iter()
                .position(|sd| sd.alias() == alias && sd.position() == position);

            match registration {
                Some(reg) => {
                    let identity = self.subdevices[reg].identity();
                    if identity.vendor_id != vendor || identity.product_code != product {
                        return Err(MasterError::IdentityMismatch {
                            slot: wire_index,
                            expected_vendor: identity.vendor_id,
                            expected_product: identity.product_code,
                            found_vendor: vendor,
                            found_product: product,
                        });
                    }

                    if !self.subdevices[reg].supports_complete_access()
                        || self.config.disable_complete_access
                    {
                        self.driver.subdevice_mut(wire_index).coe_details &=
                            !COE_DETAILS_COMPLETE_ACCESS;
                    }

                    self.wire_bindings[wire_index] = Some(reg);
                    let dc_enabled = self.config.dc_enabled;
                    let cycle_time_ns = self.config.cycle_time_ns();
                    let sd = &mut self.subdevices[reg];
                    sd.bind(wire_index);
                    sd.configure(self.driver.as_mut(), dc_enabled, cycle_time_ns)
                        .map_err(|e| MasterError::ScanFailed(e.to_string()))?;
                }
                None => {
                    if self.config.disable_complete_access {
                        self.driver.subdevice_mut(wire_index).coe_details &=
                            !COE_DETAILS_COMPLETE_ACCESS;
                    }
                    self.unconfigured.push((wire_index, alias, position));
                    self.emit(StatusEvent::UnconfiguredSubdevice {
                        wire_index,
                        alias,
                        position,
                    });
                }
            }
        }
        Ok(pdo_bytes)
    }

    fn enforce_missing_policy(&mut self, wire_count: usize) -> MasterResult<()> {
        let offline: Vec<String> = self
            .subdevices
            .iter()
            .filter(|sd| !sd.is_bound())
            .map(Subdevice::display_name)
            .collect();
        for sd in self.subdevices.iter().filter(|sd| !sd.is_bound()) {
            self.status.on_event(&StatusEvent::SubdeviceOffline {
                name: sd.display_name(),
                alias: sd.alias(),
                position: sd.position(),
            });
        }

        if !self.config.require_all_subdevices {
            return Ok(());
        }
        if !offline.is_empty() {
            return Err(MasterError::SubdevicesOffline(offline));
        }
        if !self.unconfigured.is_empty() {
            let list = self
                .unconfigured
                .iter()
                .map(|(slot, alias, position)| format!("wire slot {slot} ({alias}:{position})"))
                .collect();
            return Err(MasterError::SubdevicesUnconfigured(list));
        }
        if self.subdevices.len() != wire_count {
            return Err(MasterError::SubdeviceCountMismatch {
                expected: self.subdevices.len(),
                actual: wire_count,
            });
        }
        Ok(())
    }

    /// Copy the driver's post-mapping window offsets into the bound
    /// subdevices, verify disjointness, and freeze the image layout.
    fn link_buffers(&mut self) -> MasterResult<()> {
        let bindings = self.wire_bindings.clone();
        for (wire_index, binding) in bindings.iter().enumerate() {
            let Some(reg) = binding else { continue };

            let (output, input) = {
                let record = self.driver.subdevice(wire_index);
                (
                    ImageWindow::new(record.output_offset, record.output_bytes),
                    ImageWindow::new(record.input_offset, record.input_bytes),
                )
            };
            self.image.claim(output)?;
            self.image.claim(input)?;

            for other in self.subdevices.iter().filter(|sd| sd.is_bound()) {
                if output.overlaps(&other.output_window()) || input.overlaps(&other.input_window())
                {
                    warn!(
                        wire_index,
                        other = %other.display_name(),
                        "driver mapped overlapping windows"
                    );
                    return Err(MasterError::InternalError(-1));
                }
            }

            let sd = &mut self.subdevices[*reg];
            sd.link_buffers(output, input)?;
            sd.set_run_state(RunState::SafeOp);
        }
        self.image.freeze();
        Ok(())
    }

    /// Hand the current output image to the driver for transmission.
    ///
    /// Realtime-safe: no allocation, no unwinding.
    pub fn send(&mut self) {
        if !self.initialized {
            return;
        }
        self.driver.send_process_data(self.image.as_slice());
        self.telemetry.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Wait for the cyclic frame and fold it into the image.
    ///
    /// Returns the working counter, or [`NO_FRAME`] after a timeout - in
    /// which case nothing else is touched. On a frame, updates the DC
    /// time and jitter estimate (when DC is enabled), publishes the
    /// working counter, and refreshes every bound subdevice's observed
    /// state.
    pub fn receive(&mut self) -> i32 {
        if !self.initialized {
            return NO_FRAME;
        }
        let wkc = self
            .driver
            .receive_process_data(self.image.as_mut_slice(), self.config.receive_timeout_us());
        if wkc == NO_FRAME {
            self.telemetry.lost_frames.fetch_add(1, Ordering::Relaxed);
            return NO_FRAME;
        }
        self.telemetry
            .frames_received
            .fetch_add(1, Ordering::Relaxed);

        if self.config.dc_enabled {
            let now = self.driver.dc_time();
            self.telemetry.dc_time_ns.store(now, Ordering::Release);
            self.jitter.record_arrival(now);
            self.telemetry
                .jitter_estimate_ns
                .store(self.jitter.estimate_ns(), Ordering::Release);
            self.telemetry
                .jitter_samples
                .store(self.jitter.samples(), Ordering::Release);
        }

        self.telemetry
            .actual_wkc
            .store(i64::from(wkc), Ordering::Release);
        if i64::from(wkc) != self.telemetry.expected_wkc.load(Ordering::Acquire) {
            self.telemetry
                .wkc_mismatches
                .fetch_add(1, Ordering::Relaxed);
        }

        for (wire_index, binding) in self.wire_bindings.iter().enumerate() {
            if let Some(reg) = binding {
                self.subdevices[*reg].update_state_variables(self.driver.subdevice(wire_index));
            }
        }
        wkc
    }

    /// Receive without side effects: no jitter update, no counter
    /// publication, no state refresh.
    ///
    /// For hosts issuing several receives per cycle; exactly one of them
    /// should be the full [`Master::receive`].
    pub fn receive_simple(&mut self) -> i32 {
        if !self.initialized {
            return NO_FRAME;
        }
        let wkc = self
            .driver
            .receive_process_data(self.image.as_mut_slice(), self.config.receive_timeout_us());
        if wkc == NO_FRAME {
            self.telemetry.lost_frames.fetch_add(1, Ordering::Relaxed);
        } else {
            self.telemetry
                .frames_received
                .fetch_add(1, Ordering::Relaxed);
        }
        wkc
    }

    /// One bounded housekeeping pass; see the crate-level concurrency
    /// contract.
    pub fn do_housekeeping(&mut self) {
        if !self.initialized {
            return;
        }
        housekeeping::run_once(
            &mut self.housekeeper,
            self.driver.as_mut(),
            &mut self.subdevices,
            &self.telemetry,
            &self.config,
        );
    }

    /// Command every bound subdevice back to INIT; returns true once all
    /// of them confirmed. Safe to call repeatedly until it does.
    pub fn shutdown_subdevices(&mut self) -> bool {
        if !self.initialized {
            return true;
        }
        for (wire_index, binding) in self.wire_bindings.iter().enumerate() {
            let Some(reg) = binding else { continue };
            let sd = &self.subdevices[*reg];
            if !sd.has_shutdown() {
                sd.set_run_state(RunState::Shutdown);
                let _ = self.driver.request_state(Some(wire_index), BusState::Init);
            }
        }
        self.driver.read_states();

        let mut all = true;
        for (wire_index, binding) in self.wire_bindings.iter().enumerate() {
            let Some(reg) = binding else { continue };
            let sd = &self.subdevices[*reg];
            if !sd.has_shutdown() {
                if self.driver.subdevice(wire_index).state == BusState::Init {
                    sd.ack_shutdown();
                } else {
                    all = false;
                }
            }
        }
        all
    }

    /// Stop housekeeping, command all subdevices to INIT, and release the
    /// driver. The master is unusable afterwards.
    ///
    /// # Errors
    ///
    /// `AlreadyShutDown` on a second call; resources are released exactly
    /// once regardless.
    pub fn shutdown(&mut self) -> MasterResult<()> {
        if self.closed {
            return Err(MasterError::AlreadyShutDown);
        }
        self.emit(StatusEvent::Trace(TracePoint::StopHousekeeping));
        self.housekeeper.disarm();

        if self.initialized {
            let _ = self.driver.request_state(None, BusState::Init);
            for binding in self.wire_bindings.iter().flatten() {
                self.subdevices[*binding].set_run_state(RunState::Shutdown);
            }
        }
        if self.opened {
            self.driver.close();
        }
        self.closed = true;
        self.initialized = false;
        info!("master shut down");
        Ok(())
    }

    /// Aggregate state: the least-advanced logical state over bound
    /// subdevices, by the ordinal `INIT < PRE_OP < BOOT < SAFE_OP < OP`.
    #[must_use]
    pub fn state(&self) -> RunState {
        if self.telemetry.faulted.load(Ordering::Acquire) {
            return RunState::Fault;
        }
        if self.closed {
            return RunState::Shutdown;
        }
        if !self.initialized {
            return RunState::Offline;
        }
        housekeeping::aggregate_state(&self.subdevices).unwrap_or(RunState::Op)
    }

    /// Working counter expected for a fully delivered frame.
    #[must_use]
    pub fn expected_working_counter(&self) -> i32 {
        self.telemetry.expected_wkc.load(Ordering::Acquire) as i32
    }

    /// Most recently received working counter.
    #[must_use]
    pub fn actual_working_counter(&self) -> i32 {
        self.telemetry.actual_wkc.load(Ordering::Acquire) as i32
    }

    /// DC master time of the last received frame.
    #[must_use]
    pub fn dc_time_ns(&self) -> i64 {
        self.telemetry.dc_time_ns.load(Ordering::Acquire)
    }

    /// DC master time recorded when the cyclic exchange was primed.
    #[must_use]
    pub fn start_dc_time_ns(&self) -> i64 {
        self.telemetry.start_dc_time_ns.load(Ordering::Acquire)
    }

    /// Current jitter estimate; zero whenever DC is disabled.
    #[must_use]
    pub fn jitter_estimate_ns(&self) -> u64 {
        self.telemetry.jitter_estimate_ns.load(Ordering::Acquire)
    }

    /// Intervals that have fed the jitter estimate.
    #[must_use]
    pub fn jitter_samples(&self) -> u64 {
        self.telemetry.jitter_samples.load(Ordering::Acquire)
    }

    /// Allocated process-image size in bytes; zero before `init`.
    #[must_use]
    pub fn process_image_size(&self) -> usize {
        self.image.len()
    }

    /// Lock-free monitor for other threads.
    #[must_use]
    pub fn monitor(&self) -> MasterMonitor {
        MasterMonitor {
            telemetry: Arc::clone(&self.telemetry),
        }
    }

    /// All registrations, bound or not.
    #[must_use]
    pub fn subdevices(&self) -> &[Subdevice] {
        &self.subdevices
    }

    /// One registration by handle.
    #[must_use]
    pub fn subdevice(&self, handle: SubdeviceHandle) -> &Subdevice {
        &self.subdevices[handle.0]
    }

    /// Input window of a subdevice; empty until buffers are linked.
    #[must_use]
    pub fn subdevice_inputs(&self, handle: SubdeviceHandle) -> &[u8] {
        self.image.input(self.subdevices[handle.0].input_window())
    }

    /// Output window of a subdevice; empty until buffers are linked.
    pub fn subdevice_outputs_mut(&mut self, handle: SubdeviceHandle) -> &mut [u8] {
        self.image
            .output_mut(self.subdevices[handle.0].output_window())
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        if self.opened && !self.closed {
            self.driver.close();
        }
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("interface", &self.config.interface)
            .field("subdevices", &self.subdevices.len())
            .field("initialized", &self.initialized)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Compute (alias, position) addresses from the wire-reported alias
/// sequence.
///
/// A non-zero alias that differs from the alias carried by the previous
/// device starts a new station at position 0. Devices reporting zero
/// inherit the running alias, so a repeat of that alias later in the
/// chain continues the station rather than restarting it.
fn wire_addresses(reported: &[u16]) -> Vec<(u16, u16)> {
    let mut addresses = Vec::with_capacity(reported.len());
    let mut alias = 0u16;
    let mut position: i32 = -1;
    for &report in reported {
        if report != 0 && report != alias {
            alias = report;
            position = 0;
        } else {
            position += 1;
        }
        addresses.push((alias, position as u16));
    }
    addresses
}
