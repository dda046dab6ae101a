use crate::error::MpError;
use crate::mps::FramingParams;
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Digitisation rates the instrument accepts as an argument to RST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DigitisationRate {
    /// Leave the instrument at its power-on default
    #[default]
    #[strum(to_string = "instrument default")]
    Default,
    #[strum(to_string = "10 MHz")]
    Mhz10,
    #[strum(to_string = "25 MHz")]
    Mhz25,
    #[strum(to_string = "50 MHz")]
    Mhz50,
    #[strum(to_string = "100 MHz")]
    Mhz100,
}

impl DigitisationRate {
    /// Rate in MHz as sent on the wire; 0 selects the instrument default
    pub fn as_mhz(&self) -> u32 {
        match self {
            DigitisationRate::Default => 0,
            DigitisationRate::Mhz10 => 10,
            DigitisationRate::Mhz25 => 25,
            DigitisationRate::Mhz50 => 50,
            DigitisationRate::Mhz100 => 100,
        }
    }
}

impl TryFrom<u32> for DigitisationRate {
    type Error = MpError;

    fn try_from(mhz: u32) -> Result<Self, MpError> {
        match mhz {
            0 => Ok(DigitisationRate::Default),
            10 => Ok(DigitisationRate::Mhz10),
            25 => Ok(DigitisationRate::Mhz25),
            50 => Ok(DigitisationRate::Mhz50),
            100 => Ok(DigitisationRate::Mhz100),
            other => Err(MpError::InvalidRate(other)),
        }
    }
}

/// Instrument model reported in bits 4-7 of the system-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum SystemType {
    MicroPulse5 = 0,
    MicroPulseLt1 = 1,
    MicroPulseLt2 = 2,
    Ltpa = 3,
    Mplt = 4,
    MicroPulse6 = 5,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Raw layout of the 32-byte status block returned after RST.
///
/// Only a handful of offsets carry meaning; the rest is reserved by the
/// instrument firmware.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ResetStatusRaw {
    /// 0x23 ('#') on success; anything else is a rejection
    pub marker: u8,
    reserved0: [u8; 3],
    /// Model selector in bits 4-7
    pub system_type: u8,
    reserved1: [u8; 2],
    /// Data output format in effect for this session
    pub actual_format: u8,
    /// Power-on digitisation rate in MHz
    pub default_rate_mhz: u8,
    /// Digitisation rate in effect for this session, in MHz
    pub actual_rate_mhz: u8,
    /// Power-on data output format
    pub default_format: u8,
    reserved2: [u8; 21],
}

/// Decoded instrument status from a successful reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResetStatus {
    pub system_type: SystemType,
    pub actual_format: u8,
    pub default_format: u8,
    pub default_rate_mhz: u8,
    pub actual_rate_mhz: u8,
}

impl From<ResetStatusRaw> for ResetStatus {
    fn from(raw: ResetStatusRaw) -> Self {
        ResetStatus {
            system_type: SystemType::from_primitive(raw.system_type >> 4),
            actual_format: raw.actual_format,
            default_format: raw.default_format,
            default_rate_mhz: raw.default_rate_mhz,
            actual_rate_mhz: raw.actual_rate_mhz,
        }
    }
}

/// Marker byte at the start of every DOF sub-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum SubFrameKind {
    Ascan = 0x1A,
    NormalIndications = 0x1C,
    GainReducedIndications = 0x1D,
    LwlCouplingFailure = 0x1E,
    InstrumentError = 0x06,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Raw layout of the 8-byte sub-header preceding every DOF message.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SubFrameHeaderRaw {
    pub marker: u8,
    count: [u8; 3],
    pub test_number: U16,
    pub format_code: u8,
    pub channel: u8,
}

impl SubFrameHeaderRaw {
    /// Total bytes in this sub-frame, including the 8-byte header (24-bit LE)
    pub fn count(&self) -> u32 {
        u32::from_le_bytes([self.count[0], self.count[1], self.count[2], 0])
    }
}

/// Decoded sub-frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubFrameHeader {
    pub kind: SubFrameKind,
    /// Declared sub-frame size in bytes, header included
    pub count: u32,
    pub test_number: u16,
    pub format_code: u8,
    /// 0-based channel index
    pub channel: u8,
}

impl From<&SubFrameHeaderRaw> for SubFrameHeader {
    fn from(raw: &SubFrameHeaderRaw) -> Self {
        SubFrameHeader {
            kind: SubFrameKind::from_primitive(raw.marker),
            count: raw.count(),
            test_number: raw.test_number.get(),
            format_code: raw.format_code,
            channel: raw.channel,
        }
    }
}

/// Payload of a DOF sub-frame, keyed by the marker byte.
///
/// Only A-scans are decoded; the indication and failure kinds keep their
/// raw payload until a consumer needs them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SubFramePayload {
    /// Amplitude samples, signed and centred around zero
    Ascan(Vec<i32>),
    NormalIndications(Vec<u8>),
    GainReducedIndications(Vec<u8>),
    LwlCouplingFailure,
    InstrumentError,
    Unknown(u8),
}

/// One channel's amplitude-versus-time trace for a single pulse.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubFrame {
    pub header: SubFrameHeader,
    pub payload: SubFramePayload,
}

impl SubFrame {
    /// The decoded amplitude samples, when this sub-frame is an A-scan
    pub fn samples(&self) -> Option<&[i32]> {
        match &self.payload {
            SubFramePayload::Ascan(samples) => Some(samples),
            _ => None,
        }
    }
}

/// Probe and wedge geometry forwarded untouched into every frame for the
/// downstream reconstruction stage. The driver never interprets any of it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProbeGeometry {
    pub n_elements: u32,
    pub element_pitch_mm: f64,
    pub inter_element_spacing_mm: f64,
    pub element_width_mm: f64,
    pub vel_wedge_m_per_s: f64,
    pub vel_couplant_m_per_s: f64,
    pub vel_material_m_per_s: f64,
    pub wedge_angle_deg: f64,
    pub wedge_depth_mm: f64,
    pub couplant_depth_mm: f64,
    pub specimen_depth_mm: f64,
}

/// One complete packet worth of A-scans plus the static session metadata.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Frame {
    /// Digitisation rate reported by the instrument at reset, in MHz
    pub digitisation_rate_mhz: u8,
    pub ascan_length: u32,
    pub num_ascans: u32,
    pub geometry: ProbeGeometry,
    pub sub_frames: Vec<SubFrame>,
    /// Largest absolute amplitude across the whole frame
    pub max_amplitude: i32,
}

impl Frame {
    /// Static-metadata template for a session; sub-frames and the peak
    /// amplitude are filled in per acquisition by [`Frame::fill`].
    pub(crate) fn template(rate_mhz: u8, framing: &FramingParams, geometry: ProbeGeometry) -> Frame {
        Frame {
            digitisation_rate_mhz: rate_mhz,
            ascan_length: framing.ascan_length,
            num_ascans: framing.num_ascans,
            geometry,
            sub_frames: Vec::new(),
            max_amplitude: 0,
        }
    }

    /// Clone the static metadata and attach one acquisition's sub-frames,
    /// computing the frame-wide peak amplitude.
    pub(crate) fn fill(&self, sub_frames: Vec<SubFrame>) -> Frame {
        let max_amplitude = sub_frames
            .iter()
            .flat_map(|sf| sf.samples().unwrap_or(&[]))
            .map(|sample| sample.abs())
            .max()
            .unwrap_or(0);

        Frame {
            sub_frames,
            max_amplitude,
            ..self.clone()
        }
    }
}
