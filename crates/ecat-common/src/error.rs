use crate::state::BusState;
use thiserror::Error;

/// Errors surfaced by master initialization and lifecycle operations.
///
/// Cyclic-path conditions (no frame, working-counter mismatch) are never
/// errors; they are returned as plain values so the realtime thread never
/// unwinds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MasterError {
    /// `init` was called on an already-initialized master.
    #[error("master already initialized")]
    AlreadyInitialized,

    /// `shutdown` was called on an already-shut-down master.
    #[error("master already shut down")]
    AlreadyShutDown,

    /// NIC interrupt-coalescing setup was refused for lack of privileges.
    #[error("permission denied adjusting NIC interrupt coalescing (raw socket privileges required)")]
    PermissionDenied,

    /// The driver could not bind the network interface.
    #[error("network interface '{0}' unavailable")]
    InterfaceUnavailable(String),

    /// Bus enumeration failed.
    #[error("bus scan failed: {0}")]
    ScanFailed(String),

    /// The bus did not reach the requested state within the driver timeout.
    #[error("bus did not reach {target} within timeout")]
    StateTransitionFailed {
        /// State the bus was asked to reach.
        target: BusState,
    },

    /// A discovered subdevice does not match its registration.
    #[error(
        "identity mismatch at wire slot {slot}: expected vendor {expected_vendor:#010x} \
         product {expected_product:#010x}, found vendor {found_vendor:#010x} \
         product {found_product:#010x}"
    )]
    IdentityMismatch {
        /// Wire position of the mismatching subdevice.
        slot: usize,
        /// Vendor id the registration expects.
        expected_vendor: u32,
        /// Product code the registration expects.
        expected_product: u32,
        /// Vendor id reported on the wire.
        found_vendor: u32,
        /// Product code reported on the wire.
        found_product: u32,
    },

    /// Two registrations claim the same (alias, position) address.
    #[error("duplicate registration for alias {alias} position {position}")]
    DuplicateRegistration {
        /// Configured alias of the colliding registrations.
        alias: u16,
        /// Configured position of the colliding registrations.
        position: u16,
    },

    /// Registered subdevices were not found on the bus.
    #[error("registered subdevices not found on the bus: {0:?}")]
    SubdevicesOffline(Vec<String>),

    /// Discovered subdevices have no matching registration.
    #[error("subdevices on the bus without registration: {0:?}")]
    SubdevicesUnconfigured(Vec<String>),

    /// Registered and discovered counts disagree.
    #[error("subdevice count mismatch: {expected} registered, {actual} on the bus")]
    SubdeviceCountMismatch {
        /// Number of registered subdevices.
        expected: usize,
        /// Number of subdevices discovered on the wire.
        actual: usize,
    },

    /// The driver needs a larger process image than was allocated.
    #[error("process image too small: driver requires {required} bytes, allocated {allocated}")]
    ProcessImageTooSmall {
        /// Bytes the driver reported as required.
        required: usize,
        /// Bytes actually allocated.
        allocated: usize,
    },

    /// Unexpected driver behavior with no more specific classification.
    #[error("internal error: driver code {0}")]
    InternalError(i32),
}

/// Convenience alias for master operations.
pub type MasterResult<T> = Result<T, MasterError>;
