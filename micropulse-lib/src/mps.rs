//! MPS configuration-file interpreter.
//!
//! The instrument is configured by replaying an MPS file line by line, so
//! every non-empty line is kept verbatim and in order. Three directives are
//! additionally interpreted because they determine how the returned data
//! packets are framed: DOF (sample width), GATS (gate bounds) and SWP
//! (test-number sweep).

use crate::constants::SUB_HEADER_SIZE;
use crate::error::MpError;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Packet-framing parameters derived from the MPS file and fixed for a
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FramingParams {
    /// Data output format: 1 = 8-bit, 4 = 16-bit; 2, 3, 5 and 6 are reserved
    pub format_code: u8,
    pub gate_start: u32,
    pub gate_end: u32,
    /// Samples per A-scan, `gate_end - gate_start`
    pub ascan_length: u32,
    /// A-scans per data packet
    pub num_ascans: u32,
}

impl FramingParams {
    /// Bytes per amplitude sample for the configured format.
    ///
    /// The reserved formats surface here, at packet-size calculation time,
    /// rather than when the MPS file is read.
    pub fn bytes_per_sample(&self) -> Result<usize, MpError> {
        match self.format_code {
            1 => Ok(1),
            4 => Ok(2),
            other => Err(MpError::UnknownFormat(other)),
        }
    }

    /// Size of one sub-frame on the wire, header included.
    pub fn per_subframe_bytes(&self) -> Result<usize, MpError> {
        if self.ascan_length == 0 {
            return Err(MpError::InvalidFraming {
                ascan_length: self.ascan_length,
                num_ascans: self.num_ascans,
            });
        }
        Ok(SUB_HEADER_SIZE + self.ascan_length as usize * self.bytes_per_sample()?)
    }

    /// Size of one full data packet on the wire.
    pub fn packet_bytes(&self) -> Result<usize, MpError> {
        if self.num_ascans == 0 {
            return Err(MpError::InvalidFraming {
                ascan_length: self.ascan_length,
                num_ascans: self.num_ascans,
            });
        }
        Ok(self.num_ascans as usize * self.per_subframe_bytes()?)
    }
}

/// The interpreted contents of an MPS instrument-configuration file:
/// the verbatim command stream plus the framing parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MpsConfig {
    /// Every non-empty source line, in order
    pub commands: Vec<String>,
    pub framing: FramingParams,
}

impl MpsConfig {
    /// Read and interpret an MPS file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MpError> {
        let path = path.as_ref();
        info!("reading MPS file {}", path.display());
        let text = fs::read_to_string(path).map_err(|source| MpError::MpsFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        info!(commands = config.commands.len(), "MPS file read");
        Ok(config)
    }

    /// Interpret MPS text already in memory.
    pub fn parse(text: &str) -> Result<Self, MpError> {
        let mut config = MpsConfig::default();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            config.commands.push(line.to_string());
            config.apply_directive(line)?;
        }
        Ok(config)
    }

    /// Recognise the framing directives; the last occurrence of each wins.
    fn apply_directive(&mut self, line: &str) -> Result<(), MpError> {
        match line.split_whitespace().next() {
            // DOF <code> [ascan_mode]
            Some("DOF") => {
                self.framing.format_code = directive_field(line, "DOF", 1)?;
                debug!(format_code = self.framing.format_code, "data output format directive");
            }
            // GATS <test_no> <start> <end>
            Some("GATS") => {
                let start: u32 = directive_field(line, "GATS", 2)?;
                let end: u32 = directive_field(line, "GATS", 3)?;
                let length = end.checked_sub(start).ok_or_else(|| MpError::Directive {
                    directive: "GATS",
                    line: line.to_string(),
                })?;
                self.framing.gate_start = start;
                self.framing.gate_end = end;
                self.framing.ascan_length = length;
                debug!(start, end, "gate directive");
            }
            // SWP <sweep_no> <start_tn> - <end_tn>, the dash is its own token
            Some("SWP") => {
                let start: u32 = directive_field(line, "SWP", 2)?;
                let end: u32 = directive_field(line, "SWP", 4)?;
                let count = end
                    .checked_sub(start)
                    .and_then(|span| span.checked_add(1))
                    .ok_or_else(|| MpError::Directive {
                        directive: "SWP",
                        line: line.to_string(),
                    })?;
                self.framing.num_ascans = count;
                debug!(num_ascans = count, "sweep directive");
            }
            // Everything else is forwarded to the instrument untouched
            _ => {}
        }
        Ok(())
    }
}

fn directive_field<T: FromStr>(
    line: &str,
    directive: &'static str,
    index: usize,
) -> Result<T, MpError> {
    line.split_whitespace()
        .nth(index)
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| MpError::Directive {
            directive,
            line: line.to_string(),
        })
}
