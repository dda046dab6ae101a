use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::frame::SubFrameKind;

/// The primary error type for the `micropulse` driver.
#[derive(Error, Debug)]
pub enum MpError {
    #[error("unable to read MPS file {path}")]
    MpsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed {directive} directive in MPS file: {line:?}")]
    Directive { directive: &'static str, line: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not connected to the instrument")]
    NotConnected,

    #[error("digitisation rate must be 0, 10, 25, 50 or 100 MHz, got {0}")]
    InvalidRate(u32),

    #[error("instrument rejected reset (response marker 0x{marker:02X})")]
    ResetRejected { marker: u8 },

    #[error("instrument failed to reset after {attempts} attempts")]
    ResetFailed { attempts: u32 },

    #[error("unsupported data output format {0} (only DOF 1 and 4 are implemented)")]
    UnknownFormat(u8),

    #[error("framing parameters incomplete: ascan_length={ascan_length}, num_ascans={num_ascans}")]
    InvalidFraming { ascan_length: u32, num_ascans: u32 },

    #[error("truncated sub-frame: needed {expected} bytes, {actual} available")]
    Truncated { expected: usize, actual: usize },

    #[error("sub-frame {index} is {kind:?} where an A-scan was expected")]
    UnexpectedSubFrame { index: usize, kind: SubFrameKind },

    #[error("instrument error message in sub-frame {index}")]
    InstrumentFault { index: usize },

    #[error("sub-frame {index} carries format {actual} but the MPS file configured {expected}")]
    FormatMismatch { index: usize, expected: u8, actual: u8 },

    #[error("sub-frame {index} declares {actual} bytes, expected {expected}")]
    CountMismatch { index: usize, expected: u32, actual: u32 },

    #[error("packet held {actual} A-scans, expected {expected}")]
    SubFrameCount { expected: u32, actual: u32 },

    #[error("{operation} is not valid while {state}")]
    Usage {
        operation: &'static str,
        state: &'static str,
    },
}
