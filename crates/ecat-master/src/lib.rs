//! EtherCAT master core.
//!
//! This crate provides:
//! - [`Master`] - bus bring-up, cyclic process-data exchange, and shutdown
//! - [`BusDriver`] trait for the underlying datagram engine, with a
//!   [`SimulatedBusDriver`] backend for tests and hardware-free development
//! - [`Subdevice`] - registered node model with identity matching and
//!   per-node configure hooks
//! - [`ProcessImage`] - the contiguous I/O map all PDOs live in
//! - [`JitterEstimator`] - DC arrival-jitter tracking that gates OP
//! - housekeeping: fault detection, recovery, and OP promotion
//!
//! # Threads
//!
//! The cyclic thread calls [`Master::send`] and [`Master::receive`] once
//! per cycle; the housekeeping thread calls [`Master::do_housekeeping`].
//! The two must not overlap (the bus driver is not reentrant); a host
//! collapsing both into one thread satisfies this trivially. Telemetry
//! crosses threads through the lock-free [`MasterMonitor`].

pub mod driver;
pub mod housekeeping;
pub mod jitter;
pub mod master;
pub mod process_image;
pub mod status;
pub mod subdevice;

pub use driver::{
    fast_irq, BusDriver, DriverError, DriverResult, GroupState, SdoAddress, SdoRequest,
    SimulatedBusDriver, SmType, SyncManagerRegion, WireSubdevice, COE_DETAILS_COMPLETE_ACCESS,
    NO_FRAME,
};
pub use housekeeping::MIN_JITTER_SAMPLES;
pub use jitter::JitterEstimator;
pub use master::{Master, MasterMonitor, SubdeviceHandle};
pub use process_image::{ImageWindow, ProcessImage, IOMAP_MIN};
pub use status::{StatusEvent, StatusHandler, TracePoint, TraceStatusHandler};
pub use subdevice::{ConfigureContext, ConfigureHook, Subdevice, SubdeviceIdentity};

pub use ecat_common::{
    BusState, ConfigError, MasterConfig, MasterError, MasterResult, RunState,
    MAX_EXECUTION_JITTER_DEFAULT,
};
