pub mod codec;
pub mod constants;
pub mod device;
pub mod error;
pub mod frame;
pub mod mps;
pub mod transport;

// Re-export the session type and the data model for easy access
pub use device::{DeviceConfig, FrameCallback, MicroPulse};
pub use error::MpError;
pub use frame::{
    DigitisationRate, Frame, ProbeGeometry, ResetStatus, SubFrame, SubFrameHeader, SubFrameKind,
    SubFramePayload, SystemType,
};
pub use mps::{FramingParams, MpsConfig};
