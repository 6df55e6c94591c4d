//! Core types shared by every layer: constants, errors, configuration, time.

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{TransportConfig, TransportConfigBuilder};
pub use error::*;
