//! Bus and housekeeping state types.
//!
//! Two state spaces exist side by side:
//! - [`BusState`] is what the wire reports: the EtherCAT application-layer
//!   state machine of a subdevice.
//! - [`RunState`] is the housekeeping view: where the master *wants* a
//!   subdevice to be, including bookkeeping states the wire does not know
//!   about (offline, recovering, shut down).

use serde::{Deserialize, Serialize};
use std::fmt;

/// EtherCAT application-layer states as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum BusState {
    /// No communication with the subdevice.
    #[default]
    None = 0x00,
    /// Initial state after power-on.
    Init = 0x01,
    /// Pre-operational: mailbox (SDO) communication available.
    PreOp = 0x02,
    /// Bootstrap: firmware update mode.
    Boot = 0x03,
    /// Safe-operational: inputs active, outputs held safe.
    SafeOp = 0x04,
    /// Operational: full I/O active.
    Op = 0x08,
}

impl BusState {
    /// Parse a state from the raw AL status register.
    #[must_use]
    pub fn from_al_status(status: u16) -> Option<Self> {
        match status & 0x0F {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Init),
            0x02 => Some(Self::PreOp),
            0x03 => Some(Self::Boot),
            0x04 => Some(Self::SafeOp),
            0x08 => Some(Self::Op),
            _ => None,
        }
    }

    /// AL control value requesting this state.
    #[must_use]
    pub fn to_al_control(self) -> u16 {
        self as u16
    }

    /// Rank in the promotion order `INIT < PRE_OP < BOOT < SAFE_OP < OP`.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Init => 1,
            Self::PreOp => 2,
            Self::Boot => 3,
            Self::SafeOp => 4,
            Self::Op => 5,
        }
    }

    /// Next state on the promotion path toward OP, if any.
    ///
    /// BOOT is not on the path; a device observed there is first brought
    /// back to INIT.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::None | Self::Boot => Some(Self::Init),
            Self::Init => Some(Self::PreOp),
            Self::PreOp => Some(Self::SafeOp),
            Self::SafeOp => Some(Self::Op),
            Self::Op => None,
        }
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Init => write!(f, "INIT"),
            Self::PreOp => write!(f, "PRE_OP"),
            Self::Boot => write!(f, "BOOT"),
            Self::SafeOp => write!(f, "SAFE_OP"),
            Self::Op => write!(f, "OP"),
        }
    }
}

/// Housekeeping (logical) state of one subdevice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum RunState {
    /// Registered but never seen on the wire.
    #[default]
    Offline = 0,
    /// Bound; bus-level INIT.
    Init = 1,
    /// Bound and configured; mailbox traffic possible.
    PreOp = 2,
    /// Firmware update mode.
    Boot = 3,
    /// Inputs live, outputs safe; cyclic exchange running.
    SafeOp = 4,
    /// Fully operational.
    Op = 5,
    /// Observed below its logical state; being re-promoted.
    Recovering = 6,
    /// Unrecoverable (or recovery disabled).
    Fault = 7,
    /// Commanded back to INIT for shutdown.
    Shutdown = 8,
}

impl RunState {
    /// Decode from the raw byte used for atomic storage.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Init,
            2 => Self::PreOp,
            3 => Self::Boot,
            4 => Self::SafeOp,
            5 => Self::Op,
            6 => Self::Recovering,
            7 => Self::Fault,
            8 => Self::Shutdown,
            _ => Self::Offline,
        }
    }

    /// Rank in the aggregate ordering `INIT < PRE_OP < BOOT < SAFE_OP < OP`.
    ///
    /// The bookkeeping states rank below INIT so a faulted or recovering
    /// subdevice always drags the aggregate down.
    #[must_use]
    pub fn promotion_rank(self) -> u8 {
        match self {
            Self::Offline | Self::Fault | Self::Shutdown | Self::Recovering => 0,
            Self::Init => 1,
            Self::PreOp => 2,
            Self::Boot => 3,
            Self::SafeOp => 4,
            Self::Op => 5,
        }
    }

}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "OFFLINE"),
            Self::Init => write!(f, "INIT"),
            Self::PreOp => write!(f, "PRE_OP"),
            Self::Boot => write!(f, "BOOT"),
            Self::SafeOp => write!(f, "SAFE_OP"),
            Self::Op => write!(f, "OP"),
            Self::Recovering => write!(f, "RECOVERING"),
            Self::Fault => write!(f, "FAULT"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_state_conversion() {
        assert_eq!(BusState::from_al_status(0x01), Some(BusState::Init));
        assert_eq!(BusState::from_al_status(0x02), Some(BusState::PreOp));
        assert_eq!(BusState::from_al_status(0x04), Some(BusState::SafeOp));
        assert_eq!(BusState::from_al_status(0x08), Some(BusState::Op));
        // Error bit set on top of SAFE_OP still decodes the state nibble.
        assert_eq!(BusState::from_al_status(0x14), Some(BusState::SafeOp));
        assert_eq!(BusState::from_al_status(0x0F), None);
    }

    #[test]
    fn test_promotion_order() {
        assert!(BusState::Init.rank() < BusState::PreOp.rank());
        assert!(BusState::PreOp.rank() < BusState::Boot.rank());
        assert!(BusState::Boot.rank() < BusState::SafeOp.rank());
        assert!(BusState::SafeOp.rank() < BusState::Op.rank());
    }

    #[test]
    fn test_successor_path() {
        let mut state = BusState::Init;
        let mut path = vec![state];
        while let Some(next) = state.successor() {
            state = next;
            path.push(state);
        }
        assert_eq!(
            path,
            vec![
                BusState::Init,
                BusState::PreOp,
                BusState::SafeOp,
                BusState::Op
            ]
        );
    }

    #[test]
    fn test_run_state_raw_round_trip() {
        for state in [
            RunState::Offline,
            RunState::Init,
            RunState::PreOp,
            RunState::Boot,
            RunState::SafeOp,
            RunState::Op,
            RunState::Recovering,
            RunState::Fault,
            RunState::Shutdown,
        ] {
            assert_eq!(RunState::from_raw(state as u8), state);
        }
    }

    #[test]
    fn test_bookkeeping_states_rank_lowest() {
        assert_eq!(RunState::Fault.promotion_rank(), 0);
        assert_eq!(RunState::Recovering.promotion_rank(), 0);
        assert!(RunState::Fault.promotion_rank() < RunState::Init.promotion_rank());
    }
}
