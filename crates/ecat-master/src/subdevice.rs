//! The registered subdevice model.
//!
//! A [`Subdevice`] is what the host registers before `init`: an expected
//! identity at an (alias, position) address, an optional configure hook
//! for PDO assignment and startup parameter writes, and - once bound to a
//! wire slot - a pair of windows into the process image.
//!
//! Observed bus state and logical run state live in per-subdevice atomic
//! words so the housekeeping thread can read what the cyclic thread
//! published without taking any lock.

use crate::driver::{BusDriver, DriverResult, SdoRequest, WireSubdevice};
use crate::process_image::ImageWindow;
use ecat_common::{BusState, MasterError, MasterResult, RunState};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::debug;

/// Identity a registration expects to find on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubdeviceIdentity {
    /// Vendor id from the SII EEPROM.
    pub vendor_id: u32,
    /// Product code from the SII EEPROM.
    pub product_code: u32,
}

impl SubdeviceIdentity {
    /// Create a new identity.
    #[must_use]
    pub const fn new(vendor_id: u32, product_code: u32) -> Self {
        Self {
            vendor_id,
            product_code,
        }
    }

    /// Whether a wire record carries this identity.
    #[must_use]
    pub fn matches(&self, record: &WireSubdevice) -> bool {
        self.vendor_id == record.vendor_id && self.product_code == record.product_code
    }
}

impl fmt::Display for SubdeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#010x} P:{:#010x}", self.vendor_id, self.product_code)
    }
}

/// Context handed to a configure hook.
///
/// Carries a non-owning driver handle; the hook must not stash it.
pub struct ConfigureContext<'a> {
    /// The bus driver, for SDO traffic and record access.
    pub driver: &'a mut dyn BusDriver,
    /// Wire index of the subdevice being configured.
    pub index: usize,
    /// Whether DC was enabled for this run.
    pub dc_enabled: bool,
    /// Nominal cycle time in nanoseconds.
    pub cycle_time_ns: u64,
}

/// Per-subdevice configuration hook, run once during `init` after the
/// subdevice was bound to its wire slot.
pub type ConfigureHook = Box<dyn FnMut(&mut ConfigureContext<'_>) -> DriverResult<()> + Send>;

/// One registered subdevice.
pub struct Subdevice {
    name: String,
    identity: SubdeviceIdentity,
    alias: u16,
    position: u16,
    wire_index: Option<usize>,
    output_window: ImageWindow,
    input_window: ImageWindow,
    linked: bool,
    dc_enabled: bool,
    supports_complete_access: bool,
    startup_sdos: Vec<SdoRequest>,
    configure_hook: Option<ConfigureHook>,
    observed: AtomicU8,
    run_state: AtomicU8,
    shutdown_acked: AtomicBool,
}

impl Subdevice {
    /// Register a subdevice expected at `(alias, position)` with the given
    /// identity.
    #[must_use]
    pub fn new(alias: u16, position: u16, vendor_id: u32, product_code: u32) -> Self {
        Self {
            name: String::new(),
            identity: SubdeviceIdentity::new(vendor_id, product_code),
            alias,
            position,
            wire_index: None,
            output_window: ImageWindow::default(),
            input_window: ImageWindow::default(),
            linked: false,
            dc_enabled: false,
            supports_complete_access: true,
            startup_sdos: Vec::new(),
            configure_hook: None,
            observed: AtomicU8::new(BusState::None as u8),
            run_state: AtomicU8::new(RunState::Offline as u8),
            shutdown_acked: AtomicBool::new(false),
        }
    }

    /// Set a human-readable name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark the subdevice as not supporting SDO Complete Access; the
    /// master clears the capability bit on the wire record before any
    /// mailbox startup.
    #[must_use]
    pub fn without_complete_access(mut self) -> Self {
        self.supports_complete_access = false;
        self
    }

    /// Attach the configure hook.
    #[must_use]
    pub fn with_configure(
        mut self,
        hook: impl FnMut(&mut ConfigureContext<'_>) -> DriverResult<()> + Send + 'static,
    ) -> Self {
        self.configure_hook = Some(Box::new(hook));
        self
    }

    /// Register a startup SDO write, applied in order after the configure
    /// hook. Only legal before `init`.
    pub fn register_sdo(&mut self, request: SdoRequest) {
        self.startup_sdos.push(request);
    }

    /// Name, or a placeholder derived from the address.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("subdevice@{}:{}", self.alias, self.position)
        } else {
            self.name.clone()
        }
    }

    /// Configured alias.
    #[must_use]
    pub fn alias(&self) -> u16 {
        self.alias
    }

    /// Configured position under the alias.
    #[must_use]
    pub fn position(&self) -> u16 {
        self.position
    }

    /// Expected identity.
    #[must_use]
    pub fn identity(&self) -> SubdeviceIdentity {
        self.identity
    }

    /// Whether the registration claims Complete-Access support.
    #[must_use]
    pub fn supports_complete_access(&self) -> bool {
        self.supports_complete_access
    }

    /// Wire slot this registration was bound to during the scan.
    #[must_use]
    pub fn wire_index(&self) -> Option<usize> {
        self.wire_index
    }

    /// Whether the registration was found on the wire.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.wire_index.is_some()
    }

    /// Output window into the process image.
    #[must_use]
    pub fn output_window(&self) -> ImageWindow {
        self.output_window
    }

    /// Input window into the process image.
    #[must_use]
    pub fn input_window(&self) -> ImageWindow {
        self.input_window
    }

    /// Whether DC was activated for this subdevice.
    #[must_use]
    pub fn dc_enabled(&self) -> bool {
        self.dc_enabled
    }

    /// Bind to a wire slot. Called once during the scan.
    pub(crate) fn bind(&mut self, wire_index: usize) {
        self.wire_index = Some(wire_index);
        self.set_run_state(RunState::PreOp);
    }

    /// Run the configure hook and startup SDO writes.
    pub(crate) fn configure(
        &mut self,
        driver: &mut dyn BusDriver,
        dc_enabled: bool,
        cycle_time_ns: u64,
    ) -> DriverResult<()> {
        let index = match self.wire_index {
            Some(index) => index,
            None => return Ok(()),
        };
        self.dc_enabled = dc_enabled && driver.subdevice(index).dc_capable;

        if let Some(hook) = self.configure_hook.as_mut() {
            let mut ctx = ConfigureContext {
                driver,
                index,
                dc_enabled: self.dc_enabled,
                cycle_time_ns,
            };
            hook(&mut ctx)?;
        }
        for request in &self.startup_sdos {
            driver.sdo_write(index, request)?;
        }
        debug!(
            name = %self.display_name(),
            index,
            dc = self.dc_enabled,
            startup_sdos = self.startup_sdos.len(),
            "subdevice configured"
        );
        Ok(())
    }

    /// Assign the image windows. Legal exactly once, between PRE-OP and
    /// SAFE-OP; immutable afterwards.
    pub(crate) fn link_buffers(
        &mut self,
        output: ImageWindow,
        input: ImageWindow,
    ) -> MasterResult<()> {
        if self.linked {
            return Err(MasterError::InternalError(0));
        }
        self.output_window = output;
        self.input_window = input;
        self.linked = true;
        Ok(())
    }

    /// Refresh the observed bus state from the driver's cached record.
    pub(crate) fn update_state_variables(&self, record: &WireSubdevice) {
        self.observed.store(record.state as u8, Ordering::Release);
    }

    /// Last observed bus state.
    #[must_use]
    pub fn observed_state(&self) -> BusState {
        BusState::from_al_status(u16::from(self.observed.load(Ordering::Acquire)))
            .unwrap_or(BusState::None)
    }

    /// Current logical run state.
    #[must_use]
    pub fn run_state(&self) -> RunState {
        RunState::from_raw(self.run_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_run_state(&self, state: RunState) {
        self.run_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn ack_shutdown(&self) {
        self.shutdown_acked.store(true, Ordering::Release);
    }

    /// Whether the driver confirmed this subdevice back in INIT after a
    /// shutdown request.
    #[must_use]
    pub fn has_shutdown(&self) -> bool {
        self.shutdown_acked.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subdevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subdevice")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .field("alias", &self.alias)
            .field("position", &self.position)
            .field("wire_index", &self.wire_index)
            .field("run_state", &self.run_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{SimulatedBusDriver, WireSubdevice};

    #[test]
    fn test_identity_match() {
        let identity = SubdeviceIdentity::new(0x2, 0x1234);
        let record = WireSubdevice::new(0, 0x2, 0x1234);
        assert!(identity.matches(&record));

        let other = WireSubdevice::new(0, 0x2, 0x9999);
        assert!(!identity.matches(&other));
    }

    #[test]
    fn test_link_buffers_is_one_shot() {
        let mut sd = Subdevice::new(0, 0, 0x2, 0x1234);
        sd.link_buffers(ImageWindow::new(0, 2), ImageWindow::new(2, 2))
            .unwrap();
        assert_eq!(sd.output_window(), ImageWindow::new(0, 2));

        let again = sd.link_buffers(ImageWindow::new(8, 2), ImageWindow::new(10, 2));
        assert!(again.is_err());
        assert_eq!(sd.output_window(), ImageWindow::new(0, 2));
    }

    #[test]
    fn test_configure_applies_startup_sdos() {
        let mut driver = SimulatedBusDriver::new();
        driver.add_subdevice(WireSubdevice::new(0, 0x2, 0x1234).with_dc(true));

        let mut sd = Subdevice::new(0, 0, 0x2, 0x1234).with_configure(|ctx| {
            ctx.driver
                .sdo_write(ctx.index, &SdoRequest::write(0x1C12, 0, vec![0]))
        });
        sd.register_sdo(SdoRequest::write(0x8000, 1, vec![0x01]));
        sd.bind(0);

        sd.configure(&mut driver, true, 1_000_000).unwrap();

        let log = driver.sdo_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].1.address.index, 0x1C12);
        assert_eq!(log[1].1.address.index, 0x8000);
        assert!(sd.dc_enabled());
    }

    #[test]
    fn test_dc_not_activated_on_incapable_device() {
        let mut driver = SimulatedBusDriver::new();
        driver.add_subdevice(WireSubdevice::new(0, 0x2, 0x1234).with_dc(false));

        let mut sd = Subdevice::new(0, 0, 0x2, 0x1234);
        sd.bind(0);
        sd.configure(&mut driver, true, 1_000_000).unwrap();
        assert!(!sd.dc_enabled());
    }

    #[test]
    fn test_observed_state_round_trip() {
        let sd = Subdevice::new(0, 0, 0x2, 0x1234);
        assert_eq!(sd.observed_state(), BusState::None);

        let mut record = WireSubdevice::new(0, 0x2, 0x1234);
        record.state = BusState::SafeOp;
        sd.update_state_variables(&record);
        assert_eq!(sd.observed_state(), BusState::SafeOp);
    }

    #[test]
    fn test_display_name_fallback() {
        let sd = Subdevice::new(7, 2, 0x2, 0x1234);
        assert_eq!(sd.display_name(), "subdevice@7:2");
        let named = Subdevice::new(7, 2, 0x2, 0x1234).with_name("EL2008");
        assert_eq!(named.display_name(), "EL2008");
    }
}
