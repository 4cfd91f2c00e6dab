//! Status callback surface.
//!
//! Initialization and housekeeping report progress and anomalies through
//! a host-replaceable [`StatusHandler`]. Events are a tagged variant type
//! rather than a handler-subclass hierarchy; hosts match on what they
//! care about and ignore the rest.

use tracing::{info, warn};

/// Initialization trace points, in the order `init` emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePoint {
    /// NIC interrupt-coalescing setup.
    FastIrq,
    /// Driver context creation.
    CreateContext,
    /// Raw-socket bind.
    OpenInterface,
    /// Bus enumeration.
    InitializingSubdevices,
    /// DC was requested and activated.
    DcEnabled,
    /// DC is off for this run.
    DcDisabled,
    /// Identity matching and configure hooks.
    ConfiguringSubdevices,
    /// Waiting for the bus to confirm PRE-OP.
    WaitForPreOp,
    /// Process-image allocation and PDO mapping.
    AllocateImage,
    /// Window assignment into the image.
    LinkBuffers,
    /// Priming the cyclic datagram.
    ConfigureTxRx,
    /// Initialization finished.
    ConfigureComplete,
    /// Housekeeping stopped for shutdown.
    StopHousekeeping,
}

/// Events delivered to the status handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// An initialization phase was entered.
    Trace(TracePoint),
    /// A wire slot has no matching registration.
    UnconfiguredSubdevice {
        /// Wire position of the unmatched subdevice.
        wire_index: usize,
        /// Computed alias of the unmatched subdevice.
        alias: u16,
        /// Computed position under the alias.
        position: u16,
    },
    /// A registered subdevice was not found on the bus.
    SubdeviceOffline {
        /// Registration name.
        name: String,
        /// Configured alias.
        alias: u16,
        /// Configured position.
        position: u16,
    },
    /// The expected working counter was computed.
    ExpectedWorkingCounter(i32),
    /// DC was requested but the bus has no capable reference clock.
    DcNotCapable,
}

/// Receiver for master status events.
pub trait StatusHandler: Send {
    /// Called for every event; must not block.
    fn on_event(&mut self, event: &StatusEvent);
}

/// Default handler that forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TraceStatusHandler;

impl StatusHandler for TraceStatusHandler {
    fn on_event(&mut self, event: &StatusEvent) {
        match event {
            StatusEvent::Trace(point) => info!(?point, "master status"),
            StatusEvent::UnconfiguredSubdevice {
                wire_index,
                alias,
                position,
            } => warn!(
                wire_index,
                alias, position, "subdevice on the bus has no registration"
            ),
            StatusEvent::SubdeviceOffline {
                name,
                alias,
                position,
            } => warn!(name = %name, alias, position, "registered subdevice not found on the bus"),
            StatusEvent::ExpectedWorkingCounter(wkc) => {
                info!(expected_wkc = wkc, "working counter computed");
            }
            StatusEvent::DcNotCapable => {
                warn!("DC requested but the bus is not DC-capable; continuing without DC");
            }
        }
    }
}
