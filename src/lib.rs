#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod err;
pub mod host;
pub mod sd;

pub use block::request::{Completion, Direction, RequestAttrs};
pub use block::{CardInfo, SdBlockDriver};
pub use config::DriverConfig;
pub use err::SdError;
pub use host::{
    BusConfig, BusWidth, ClockRange, DataTransfer, DmaLimits, DriverStrength, HostCaps,
    HostDevice, PowerMode, SignalVoltage, TimingMode,
};
pub use sd::{CardSession, SpeedMode};
