//! Bus-driver contract and the simulated backend.
//!
//! The master core does not speak raw EtherCAT; it drives an opaque
//! [`BusDriver`] that owns the raw socket, the datagram engine, and the
//! cached per-subdevice records (the SOEM-style context). The
//! [`SimulatedBusDriver`] implements the same contract in memory so the
//! master logic can be exercised without hardware.

use ecat_common::BusState;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Sentinel returned by [`BusDriver::receive_process_data`] when no frame
/// arrived within the timeout.
pub const NO_FRAME: i32 = -1;

/// Complete-Access capability bit in the CoE details byte.
pub const COE_DETAILS_COMPLETE_ACCESS: u8 = 0x20;

/// Return codes of [`BusDriver::setup_fast_irq`].
pub mod fast_irq {
    /// Coalescing reduced successfully.
    pub const OK: i32 = 1;
    /// Not a Linux host; nothing to tune.
    pub const NOT_LINUX: i32 = 10;
    /// Opening the control socket was refused.
    pub const NO_PERMISSION: i32 = 70;
    /// The NIC driver reports no identification.
    pub const NO_DRIVER_INFO: i32 = 73;
    /// Current coalescing settings could not be read.
    pub const CANNOT_READ_COALESCE: i32 = 76;
    /// Coalescing settings could not be written.
    pub const CANNOT_WRITE_COALESCE: i32 = 81;
}

/// Driver-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The network interface could not be bound.
    #[error("interface error: {0}")]
    Interface(String),

    /// Bus enumeration failed.
    #[error("scan error: {0}")]
    Scan(String),

    /// A mailbox (SDO) transfer failed.
    #[error("mailbox error: {0}")]
    Mailbox(String),

    /// Operation on a closed driver.
    #[error("driver is closed")]
    Closed,
}

/// Convenience alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Sync-manager region types, as read from the SII.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SmType {
    /// Region not in use.
    #[default]
    Unused = 0,
    /// Mailbox master → subdevice.
    MailboxOut = 1,
    /// Mailbox subdevice → master.
    MailboxIn = 2,
    /// Cyclic outputs (master → subdevice).
    Outputs = 3,
    /// Cyclic inputs (subdevice → master).
    Inputs = 4,
}

/// One sync-manager region of a subdevice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncManagerRegion {
    /// Physical start address in ESC memory; zero means unconfigured.
    pub start_address: u16,
    /// Region length in bits.
    pub length_bits: u32,
    /// Region type.
    pub sm_type: SmType,
}

impl SyncManagerRegion {
    /// Region length rounded up to whole bytes.
    #[must_use]
    pub fn length_bytes(&self) -> usize {
        (self.length_bits as usize + 7) / 8
    }

    /// True for a configured cyclic process-data region.
    #[must_use]
    pub fn is_process_data(&self) -> bool {
        self.start_address != 0 && matches!(self.sm_type, SmType::Outputs | SmType::Inputs)
    }
}

/// Number of sync-manager slots per subdevice.
pub const SYNC_MANAGER_COUNT: usize = 8;

/// The driver's cached record for one discovered subdevice, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireSubdevice {
    /// Name read from the SII.
    pub name: String,
    /// Alias address as reported on the wire (zero when unset).
    pub alias: u16,
    /// Vendor id from the SII.
    pub vendor_id: u32,
    /// Product code from the SII.
    pub product_code: u32,
    /// Cached AL state.
    pub state: BusState,
    /// Last AL status code (error detail register).
    pub al_status_code: u16,
    /// Whether the subdevice supports Distributed Clocks.
    pub dc_capable: bool,
    /// CoE details byte; bit `0x20` advertises Complete Access.
    pub coe_details: u8,
    /// Sync-manager regions.
    pub sync_managers: [SyncManagerRegion; SYNC_MANAGER_COUNT],
    /// Output window offset in the process image, assigned during mapping.
    pub output_offset: usize,
    /// Output window length in bytes.
    pub output_bytes: usize,
    /// Input window offset in the process image, assigned during mapping.
    pub input_offset: usize,
    /// Input window length in bytes.
    pub input_bytes: usize,
}

impl WireSubdevice {
    /// Create a record with the given identity.
    #[must_use]
    pub fn new(alias: u16, vendor_id: u32, product_code: u32) -> Self {
        Self {
            name: String::new(),
            alias,
            vendor_id,
            product_code,
            state: BusState::Init,
            al_status_code: 0,
            dc_capable: false,
            coe_details: COE_DETAILS_COMPLETE_ACCESS,
            sync_managers: [SyncManagerRegion::default(); SYNC_MANAGER_COUNT],
            output_offset: 0,
            output_bytes: 0,
            input_offset: 0,
            input_bytes: 0,
        }
    }

    /// Set the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Configure cyclic process data: SM2 outputs and SM3 inputs.
    #[must_use]
    pub fn with_io(mut self, output_bits: u32, input_bits: u32) -> Self {
        if output_bits > 0 {
            self.sync_managers[2] = SyncManagerRegion {
                start_address: 0x1100,
                length_bits: output_bits,
                sm_type: SmType::Outputs,
            };
        }
        if input_bits > 0 {
            self.sync_managers[3] = SyncManagerRegion {
                start_address: 0x1180,
                length_bits: input_bits,
                sm_type: SmType::Inputs,
            };
        }
        self
    }

    /// Overwrite a single sync-manager slot.
    #[must_use]
    pub fn with_sync_manager(mut self, slot: usize, region: SyncManagerRegion) -> Self {
        self.sync_managers[slot] = region;
        self
    }

    /// Mark the subdevice DC-capable.
    #[must_use]
    pub fn with_dc(mut self, capable: bool) -> Self {
        self.dc_capable = capable;
        self
    }

    /// Whether the record advertises Complete Access.
    #[must_use]
    pub fn supports_complete_access(&self) -> bool {
        self.coe_details & COE_DETAILS_COMPLETE_ACCESS != 0
    }

    /// Bytes of cyclic process data this record contributes to the image.
    #[must_use]
    pub fn process_data_bytes(&self) -> usize {
        self.sync_managers
            .iter()
            .filter(|sm| sm.is_process_data())
            .map(SyncManagerRegion::length_bytes)
            .sum()
    }
}

/// Working-counter contributions of one logical group after mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupState {
    /// Subdevices with outputs in this group.
    pub outputs_wkc: u16,
    /// Subdevices with inputs in this group.
    pub inputs_wkc: u16,
}

impl GroupState {
    /// Working counter expected for a fully delivered cyclic frame.
    #[must_use]
    pub fn expected_wkc(&self) -> i32 {
        2 * i32::from(self.outputs_wkc) + i32::from(self.inputs_wkc)
    }
}

/// SDO (Service Data Object) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SdoAddress {
    /// Object index.
    pub index: u16,
    /// Object subindex.
    pub subindex: u8,
}

impl SdoAddress {
    /// Create a new SDO address.
    #[must_use]
    pub const fn new(index: u16, subindex: u8) -> Self {
        Self { index, subindex }
    }
}

impl fmt::Display for SdoAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}:{}", self.index, self.subindex)
    }
}

/// An SDO transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoRequest {
    /// Target object.
    pub address: SdoAddress,
    /// Data to write; `None` for reads.
    pub data: Option<Vec<u8>>,
    /// Transfer the whole object atomically.
    pub complete_access: bool,
}

impl SdoRequest {
    /// Create a read request.
    #[must_use]
    pub fn read(index: u16, subindex: u8) -> Self {
        Self {
            address: SdoAddress::new(index, subindex),
            data: None,
            complete_access: false,
        }
    }

    /// Create a write request.
    #[must_use]
    pub fn write(index: u16, subindex: u8, data: Vec<u8>) -> Self {
        Self {
            address: SdoAddress::new(index, subindex),
            data: Some(data),
            complete_access: false,
        }
    }

    /// Enable complete-access mode.
    #[must_use]
    pub fn with_complete_access(mut self) -> Self {
        self.complete_access = true;
        self
    }
}

/// The EtherCAT datagram engine the master drives.
///
/// The driver object doubles as the bus context: it owns the raw socket
/// and the cached subdevice records. It is not reentrant; the master
/// serializes all calls (see the crate-level concurrency contract).
pub trait BusDriver: Send {
    /// Reduce NIC interrupt-coalescing latency for the interface.
    ///
    /// Returns one of the [`fast_irq`] codes.
    fn setup_fast_irq(&mut self, interface: &str) -> i32;

    /// Bind the network interface and open the raw socket.
    fn open(&mut self, interface: &str) -> DriverResult<()>;

    /// Enumerate subdevices and request PRE-OP; returns the count found.
    fn config_init(&mut self) -> DriverResult<usize>;

    /// Activate Distributed Clocks if the bus is capable; returns whether
    /// a reference clock was found.
    fn config_dc(&mut self) -> DriverResult<bool>;

    /// Number of discovered subdevices.
    fn subdevice_count(&self) -> usize;

    /// Cached record of the subdevice at `index` (wire order, zero-based).
    fn subdevice(&self, index: usize) -> &WireSubdevice;

    /// Mutable access to a cached record.
    fn subdevice_mut(&mut self, index: usize) -> &mut WireSubdevice;

    /// Lay all PDOs of `group` into `image`, assigning per-subdevice
    /// window offsets. Returns the number of bytes required.
    fn config_map_group(&mut self, image: &mut [u8], group: u8) -> DriverResult<usize>;

    /// Working-counter contributions of `group` after mapping.
    fn group(&self, group: u8) -> &GroupState;

    /// Request an AL state; `None` addresses all subdevices.
    fn request_state(&mut self, index: Option<usize>, target: BusState) -> DriverResult<()>;

    /// Wait up to `timeout` for `target`; returns the state actually
    /// reached. `None` addresses the whole bus (lowest state wins).
    fn state_check(&mut self, index: Option<usize>, target: BusState, timeout: Duration)
        -> BusState;

    /// Refresh all cached AL states; returns the lowest.
    fn read_states(&mut self) -> BusState;

    /// Transmit the cyclic datagram built from `image`.
    fn send_process_data(&mut self, image: &[u8]);

    /// Block up to `timeout_us` for the cyclic frame; writes received
    /// input data into `image` and returns the working counter, or
    /// [`NO_FRAME`].
    fn receive_process_data(&mut self, image: &mut [u8], timeout_us: u64) -> i32;

    /// DC master time of the last received datagram, in nanoseconds.
    fn dc_time(&self) -> i64;

    /// RX error counter of the subdevice at `index`.
    fn rx_error_count(&mut self, index: usize) -> u32 {
        let _ = index;
        0
    }

    /// Read an SDO from the subdevice at `index`.
    fn sdo_read(&mut self, index: usize, request: &SdoRequest) -> DriverResult<Vec<u8>>;

    /// Write an SDO to the subdevice at `index`.
    fn sdo_write(&mut self, index: usize, request: &SdoRequest) -> DriverResult<()>;

    /// Release the raw socket and all bus resources.
    fn close(&mut self);
}

/// In-memory bus driver for tests and hardware-free development.
///
/// Models a single-group bus: subdevice records are scripted up front,
/// `config_map_group` lays outputs first and inputs second, and each
/// received frame echoes every subdevice's output window into its input
/// window. The DC clock advances per received frame, either by the nominal
/// cycle time or by scripted intervals.
#[derive(Debug)]
pub struct SimulatedBusDriver {
    interface: Option<String>,
    subdevices: Vec<WireSubdevice>,
    group: GroupState,
    fast_irq_code: i32,
    open: bool,
    fail_open: bool,
    fail_scan: bool,
    dc_capable: bool,
    dc_time: i64,
    cycle_time_ns: i64,
    dc_intervals: VecDeque<i64>,
    refused_states: Vec<BusState>,
    frame: Vec<u8>,
    frame_pending: bool,
    receive_attempts: u64,
    drop_frames: u32,
    drop_at: Vec<u64>,
    wkc_errors_at: Vec<u64>,
    wkc_error_value: i32,
    fallback_at: Vec<(u64, usize, BusState)>,
    wkc_override: Option<i32>,
    required_bytes_override: Option<usize>,
    sdo_log: Vec<(usize, SdoRequest)>,
}

impl Default for SimulatedBusDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBusDriver {
    /// Create an empty simulated bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            interface: None,
            subdevices: Vec::new(),
            group: GroupState::default(),
            fast_irq_code: fast_irq::OK,
            open: false,
            fail_open: false,
            fail_scan: false,
            dc_capable: true,
            dc_time: 0,
            cycle_time_ns: 1_000_000,
            dc_intervals: VecDeque::new(),
            refused_states: Vec::new(),
            frame: Vec::new(),
            frame_pending: false,
            receive_attempts: 0,
            drop_frames: 0,
            drop_at: Vec::new(),
            wkc_errors_at: Vec::new(),
            wkc_error_value: 0,
            fallback_at: Vec::new(),
            wkc_override: None,
            required_bytes_override: None,
            sdo_log: Vec::new(),
        }
    }

    /// Add a subdevice record to the simulated wire.
    pub fn add_subdevice(&mut self, subdevice: WireSubdevice) {
        self.subdevices.push(subdevice);
    }

    /// Script the fast-IRQ setup return code.
    pub fn set_fast_irq_code(&mut self, code: i32) {
        self.fast_irq_code = code;
    }

    /// Script DC capability of the bus.
    pub fn set_dc_capable(&mut self, capable: bool) {
        self.dc_capable = capable;
    }

    /// Nominal interval the DC clock advances per received frame.
    pub fn set_cycle_time_ns(&mut self, ns: i64) {
        self.cycle_time_ns = ns;
    }

    /// Queue explicit DC clock intervals, consumed one per received frame.
    pub fn queue_dc_intervals(&mut self, intervals: &[i64]) {
        self.dc_intervals.extend(intervals.iter().copied());
    }

    /// Make `open` fail.
    pub fn fail_open(&mut self) {
        self.fail_open = true;
    }

    /// Make `config_init` fail.
    pub fn fail_scan(&mut self) {
        self.fail_scan = true;
    }

    /// Requests for `state` are silently not honored.
    pub fn refuse_state(&mut self, state: BusState) {
        self.refused_states.push(state);
    }

    /// Drop the next `count` cyclic frames.
    pub fn drop_next_frames(&mut self, count: u32) {
        self.drop_frames += count;
    }

    /// Drop the frames of specific receive attempts. Attempts are counted
    /// from the master's priming receive, which is attempt 0.
    pub fn drop_frame_at(&mut self, attempts: &[u64]) {
        self.drop_at.extend_from_slice(attempts);
    }

    /// Return `wkc` instead of the real working counter on the given
    /// receive attempts.
    pub fn wkc_error_at(&mut self, attempts: &[u64], wkc: i32) {
        self.wkc_errors_at.extend_from_slice(attempts);
        self.wkc_error_value = wkc;
    }

    /// Force the cached state of one subdevice right before the given
    /// receive attempt, modeling a device falling back mid-run.
    pub fn fallback_at(&mut self, attempt: u64, index: usize, state: BusState) {
        self.fallback_at.push((attempt, index, state));
    }

    /// Override the working counter returned on receive.
    pub fn set_working_counter(&mut self, wkc: Option<i32>) {
        self.wkc_override = wkc;
    }

    /// Override the image size `config_map_group` reports as required.
    pub fn set_required_image_bytes(&mut self, bytes: Option<usize>) {
        self.required_bytes_override = bytes;
    }

    /// Force the cached state of one subdevice, e.g. to model a fallback.
    pub fn force_state(&mut self, index: usize, state: BusState) {
        self.subdevices[index].state = state;
    }

    /// SDO transfers issued through this driver, in order.
    #[must_use]
    pub fn sdo_log(&self) -> &[(usize, SdoRequest)] {
        &self.sdo_log
    }

    fn apply_state(&mut self, index: Option<usize>, target: BusState) {
        if self.refused_states.contains(&target) {
            return;
        }
        match index {
            Some(i) => self.subdevices[i].state = target,
            None => {
                for sd in &mut self.subdevices {
                    sd.state = target;
                }
            }
        }
    }

    fn lowest_state(&self) -> BusState {
        self.subdevices
            .iter()
            .map(|sd| sd.state)
            .min_by_key(|s| s.rank())
            .unwrap_or(BusState::None)
    }
}

impl BusDriver for SimulatedBusDriver {
    fn setup_fast_irq(&mut self, interface: &str) -> i32 {
        trace!(interface, code = self.fast_irq_code, "simulated fast-IRQ setup");
        self.fast_irq_code
    }

    fn open(&mut self, interface: &str) -> DriverResult<()> {
        if self.fail_open {
            return Err(DriverError::Interface(format!(
                "cannot bind '{interface}'"
            )));
        }
        self.interface = Some(interface.to_string());
        self.open = true;
        debug!(interface, "simulated interface opened");
        Ok(())
    }

    fn config_init(&mut self) -> DriverResult<usize> {
        if !self.open {
            return Err(DriverError::Closed);
        }
        if self.fail_scan {
            return Err(DriverError::Scan("simulated scan failure".into()));
        }
        self.apply_state(None, BusState::PreOp);
        debug!(count = self.subdevices.len(), "simulated bus scan");
        Ok(self.subdevices.len())
    }

    fn config_dc(&mut self) -> DriverResult<bool> {
        if !self.open {
            return Err(DriverError::Closed);
        }
        Ok(self.dc_capable && self.subdevices.iter().any(|sd| sd.dc_capable))
    }

    fn subdevice_count(&self) -> usize {
        self.subdevices.len()
    }

    fn subdevice(&self, index: usize) -> &WireSubdevice {
        &self.subdevices[index]
    }

    fn subdevice_mut(&mut self, index: usize) -> &mut WireSubdevice {
        &mut self.subdevices[index]
    }

    fn config_map_group(&mut self, image: &mut [u8], _group: u8) -> DriverResult<usize> {
        let mut offset = 0;
        let mut outputs_wkc = 0;
        let mut inputs_wkc = 0;

        for sd in &mut self.subdevices {
            sd.output_bytes = sd
                .sync_managers
                .iter()
                .filter(|sm| sm.is_process_data() && sm.sm_type == SmType::Outputs)
                .map(SyncManagerRegion::length_bytes)
                .sum();
            if sd.output_bytes > 0 {
                sd.output_offset = offset;
                offset += sd.output_bytes;
                outputs_wkc += 1;
            }
        }
        for sd in &mut self.subdevices {
            sd.input_bytes = sd
                .sync_managers
                .iter()
                .filter(|sm| sm.is_process_data() && sm.sm_type == SmType::Inputs)
                .map(SyncManagerRegion::length_bytes)
                .sum();
            if sd.input_bytes > 0 {
                sd.input_offset = offset;
                offset += sd.input_bytes;
                inputs_wkc += 1;
            }
        }

        self.group = GroupState {
            outputs_wkc,
            inputs_wkc,
        };

        // Mapping complete; a real engine requests SAFE-OP here.
        self.apply_state(None, BusState::SafeOp);

        let required = self.required_bytes_override.unwrap_or(offset);
        debug!(
            required,
            allocated = image.len(),
            outputs_wkc,
            inputs_wkc,
            "simulated PDO mapping"
        );
        Ok(required)
    }

    fn group(&self, _group: u8) -> &GroupState {
        &self.group
    }

    fn request_state(&mut self, index: Option<usize>, target: BusState) -> DriverResult<()> {
        if !self.open {
            return Err(DriverError::Closed);
        }
        self.apply_state(index, target);
        Ok(())
    }

    fn state_check(
        &mut self,
        index: Option<usize>,
        _target: BusState,
        _timeout: Duration,
    ) -> BusState {
        match index {
            Some(i) => self.subdevices[i].state,
            None => self.lowest_state(),
        }
    }

    fn read_states(&mut self) -> BusState {
        self.lowest_state()
    }

    fn send_process_data(&mut self, image: &[u8]) {
        self.frame.clear();
        self.frame.extend_from_slice(image);
        self.frame_pending = true;
    }

    fn receive_process_data(&mut self, image: &mut [u8], _timeout_us: u64) -> i32 {
        let attempt = self.receive_attempts;
        self.receive_attempts += 1;

        let falls: Vec<(usize, BusState)> = self
            .fallback_at
            .iter()
            .filter(|(at, _, _)| *at == attempt)
            .map(|(_, index, state)| (*index, *state))
            .collect();
        for (index, state) in falls {
            self.subdevices[index].state = state;
        }

        if self.drop_frames > 0 {
            self.drop_frames -= 1;
            return NO_FRAME;
        }
        if self.drop_at.contains(&attempt) {
            self.frame_pending = false;
            return NO_FRAME;
        }
        if !self.frame_pending {
            return NO_FRAME;
        }
        self.frame_pending = false;

        // Each subdevice reads its output window in-place and answers on
        // its input window.
        for sd in &self.subdevices {
            let n = sd.output_bytes.min(sd.input_bytes);
            if n > 0 {
                let (src, dst) = (sd.output_offset, sd.input_offset);
                image[dst..dst + n].copy_from_slice(&self.frame[src..src + n]);
            }
        }

        self.dc_time += self.dc_intervals.pop_front().unwrap_or(self.cycle_time_ns);

        if self.wkc_errors_at.contains(&attempt) {
            return self.wkc_error_value;
        }
        self.wkc_override.unwrap_or_else(|| self.group.expected_wkc())
    }

    fn dc_time(&self) -> i64 {
        self.dc_time
    }

    fn sdo_read(&mut self, index: usize, request: &SdoRequest) -> DriverResult<Vec<u8>> {
        debug!(index, address = %request.address, "simulated SDO read");
        self.sdo_log.push((index, request.clone()));
        Ok(vec![0; 4])
    }

    fn sdo_write(&mut self, index: usize, request: &SdoRequest) -> DriverResult<()> {
        debug!(index, address = %request.address, "simulated SDO write");
        self.sdo_log.push((index, request.clone()));
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.frame_pending = false;
        debug!("simulated driver closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dio(alias: u16) -> WireSubdevice {
        WireSubdevice::new(alias, 0x2, 0x1234)
            .with_name("DIO")
            .with_io(8, 8)
    }

    #[test]
    fn test_scan_moves_bus_to_preop() {
        let mut driver = SimulatedBusDriver::new();
        driver.add_subdevice(dio(0));
        driver.open("sim0").unwrap();

        assert_eq!(driver.config_init().unwrap(), 1);
        assert_eq!(driver.subdevice(0).state, BusState::PreOp);
    }

    #[test]
    fn test_mapping_assigns_disjoint_offsets() {
        let mut driver = SimulatedBusDriver::new();
        driver.add_subdevice(WireSubdevice::new(0, 0x2, 0x10).with_io(16, 32));
        driver.add_subdevice(WireSubdevice::new(0, 0x2, 0x11).with_io(8, 8));
        driver.open("sim0").unwrap();
        driver.config_init().unwrap();

        let mut image = vec![0u8; 64];
        let required = driver.config_map_group(&mut image, 0).unwrap();
        assert_eq!(required, 2 + 1 + 4 + 1);

        let a = driver.subdevice(0).clone();
        let b = driver.subdevice(1).clone();
        assert_eq!(a.output_offset, 0);
        assert_eq!(b.output_offset, 2);
        assert_eq!(a.input_offset, 3);
        assert_eq!(b.input_offset, 7);
        assert_eq!(driver.group(0).expected_wkc(), 2 * 2 + 2);
    }

    #[test]
    fn test_receive_echoes_outputs() {
        let mut driver = SimulatedBusDriver::new();
        driver.add_subdevice(dio(0));
        driver.open("sim0").unwrap();
        driver.config_init().unwrap();

        let mut image = vec![0u8; 16];
        driver.config_map_group(&mut image, 0).unwrap();

        image[0] = 0xA5;
        driver.send_process_data(&image);
        let wkc = driver.receive_process_data(&mut image, 2_000);

        assert_eq!(wkc, driver.group(0).expected_wkc());
        assert_eq!(image[driver.subdevice(0).input_offset], 0xA5);
    }

    #[test]
    fn test_receive_without_send_is_no_frame() {
        let mut driver = SimulatedBusDriver::new();
        driver.add_subdevice(dio(0));
        let mut image = vec![0u8; 16];
        assert_eq!(driver.receive_process_data(&mut image, 2_000), NO_FRAME);
    }

    #[test]
    fn test_scripted_dc_intervals() {
        let mut driver = SimulatedBusDriver::new();
        driver.add_subdevice(dio(0));
        driver.open("sim0").unwrap();
        driver.config_init().unwrap();
        let mut image = vec![0u8; 16];
        driver.config_map_group(&mut image, 0).unwrap();

        driver.queue_dc_intervals(&[1_000_000, 1_000_200]);
        driver.send_process_data(&image);
        driver.receive_process_data(&mut image, 2_000);
        assert_eq!(driver.dc_time(), 1_000_000);

        driver.send_process_data(&image);
        driver.receive_process_data(&mut image, 2_000);
        assert_eq!(driver.dc_time(), 2_000_200);

        // Queue exhausted: falls back to the nominal cycle.
        driver.send_process_data(&image);
        driver.receive_process_data(&mut image, 2_000);
        assert_eq!(driver.dc_time(), 3_000_200);
    }

    #[test]
    fn test_refused_state_is_not_applied() {
        let mut driver = SimulatedBusDriver::new();
        driver.add_subdevice(dio(0));
        driver.refuse_state(BusState::Op);
        driver.open("sim0").unwrap();
        driver.config_init().unwrap();

        driver.request_state(None, BusState::Op).unwrap();
        assert_eq!(driver.read_states(), BusState::PreOp);
    }

    #[test]
    fn test_sync_manager_byte_rounding() {
        let region = SyncManagerRegion {
            start_address: 0x1100,
            length_bits: 12,
            sm_type: SmType::Inputs,
        };
        assert_eq!(region.length_bytes(), 2);
        assert!(region.is_process_data());

        let unconfigured = SyncManagerRegion {
            start_address: 0,
            length_bits: 12,
            sm_type: SmType::Inputs,
        };
        assert!(!unconfigured.is_process_data());
    }
}
