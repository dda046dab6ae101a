//! Wire codec: ASCII command emission and DOF packet decoding.
//!
//! Outgoing traffic is a line protocol (every command is ASCII plus CR-LF).
//! Incoming traffic is binary: a 32-byte status block after a reset, and
//! after each data request a packet of concatenated sub-frames with no
//! outer header.

use crate::constants::{COMMAND_TERMINATOR, RESET_COMMAND, RESET_SUCCESS_MARKER, SUB_HEADER_SIZE};
use crate::error::MpError;
use crate::frame::{
    DigitisationRate, ResetStatus, ResetStatusRaw, SubFrame, SubFrameHeader, SubFrameHeaderRaw,
    SubFrameKind, SubFramePayload,
};
use crate::mps::FramingParams;
use zerocopy::FromBytes;

/// Append the CR-LF terminator the instrument expects on every command.
pub fn encode_command(command: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.len() + COMMAND_TERMINATOR.len());
    bytes.extend_from_slice(command.as_bytes());
    bytes.extend_from_slice(COMMAND_TERMINATOR.as_bytes());
    bytes
}

/// The RST command, optionally parameterised with a digitisation rate.
pub fn reset_command(rate: DigitisationRate) -> String {
    match rate.as_mhz() {
        0 => RESET_COMMAND.to_string(),
        mhz => format!("{RESET_COMMAND} {mhz}"),
    }
}

/// Decode the 32-byte status block returned after RST.
///
/// A marker other than '#' means the instrument rejected the reset; the
/// caller decides whether to retry.
pub fn parse_reset_response(bytes: &[u8]) -> Result<ResetStatus, MpError> {
    let raw = ResetStatusRaw::read_from_bytes(bytes).map_err(|_| MpError::Truncated {
        expected: std::mem::size_of::<ResetStatusRaw>(),
        actual: bytes.len(),
    })?;
    if raw.marker != RESET_SUCCESS_MARKER {
        return Err(MpError::ResetRejected { marker: raw.marker });
    }
    Ok(ResetStatus::from(raw))
}

/// Decode one 8-bit amplitude sample; raw bytes are centred at 128.
pub fn decode_sample_8(raw: u8) -> i32 {
    raw as i32 - 128
}

/// Decode one 16-bit little-endian amplitude sample; raw words are centred
/// at 32768.
pub fn decode_sample_16(lo: u8, hi: u8) -> i32 {
    u16::from_le_bytes([lo, hi]) as i32 - 32768
}

/// Inverse of [`decode_sample_8`]; used by mock instruments and tests.
pub fn encode_sample_8(sample: i32) -> u8 {
    (sample + 128) as u8
}

/// Inverse of [`decode_sample_16`]; used by mock instruments and tests.
pub fn encode_sample_16(sample: i32) -> [u8; 2] {
    ((sample + 32768) as u16).to_le_bytes()
}

fn decode_samples(format_code: u8, payload: &[u8]) -> Result<Vec<i32>, MpError> {
    match format_code {
        1 => Ok(payload.iter().map(|&b| decode_sample_8(b)).collect()),
        4 => Ok(payload
            .chunks_exact(2)
            .map(|pair| decode_sample_16(pair[0], pair[1]))
            .collect()),
        other => Err(MpError::UnknownFormat(other)),
    }
}

/// Parse a single DOF sub-frame starting at the head of `bytes`.
///
/// The header is read best-effort for every marker value so that a caller
/// can log what the instrument actually sent. A-scan payloads are decoded
/// to signed samples; the indication kinds stay opaque.
pub fn parse_sub_frame(bytes: &[u8]) -> Result<SubFrame, MpError> {
    let header_bytes = bytes.get(..SUB_HEADER_SIZE).ok_or(MpError::Truncated {
        expected: SUB_HEADER_SIZE,
        actual: bytes.len(),
    })?;
    let raw = SubFrameHeaderRaw::ref_from_bytes(header_bytes).map_err(|_| MpError::Truncated {
        expected: SUB_HEADER_SIZE,
        actual: header_bytes.len(),
    })?;
    let header = SubFrameHeader::from(raw);

    let end = (header.count as usize).clamp(SUB_HEADER_SIZE, bytes.len());
    let body = &bytes[SUB_HEADER_SIZE..end];

    let payload = match header.kind {
        SubFrameKind::Ascan => SubFramePayload::Ascan(decode_samples(header.format_code, body)?),
        SubFrameKind::NormalIndications => SubFramePayload::NormalIndications(body.to_vec()),
        SubFrameKind::GainReducedIndications => {
            SubFramePayload::GainReducedIndications(body.to_vec())
        }
        SubFrameKind::LwlCouplingFailure => SubFramePayload::LwlCouplingFailure,
        SubFrameKind::InstrumentError => SubFramePayload::InstrumentError,
        SubFrameKind::Unknown(marker) => SubFramePayload::Unknown(marker),
    };

    Ok(SubFrame { header, payload })
}

/// Walk a full data packet and validate every sub-frame against the framing
/// parameters derived from the MPS file.
///
/// Validation aborts the packet at the first faulty sub-frame; nothing
/// partial is returned. Each sub-frame must be an A-scan whose format code
/// and declared byte count match the configured framing, and the packet
/// must hold exactly `num_ascans` of them.
pub fn parse_data_packet(
    packet: &[u8],
    framing: &FramingParams,
) -> Result<Vec<SubFrame>, MpError> {
    let per_subframe = framing.per_subframe_bytes()?;
    let mut sub_frames: Vec<SubFrame> = Vec::with_capacity(framing.num_ascans as usize);
    let mut cursor = 0usize;

    while cursor + SUB_HEADER_SIZE <= packet.len() {
        let index = sub_frames.len();
        let sub_frame = parse_sub_frame(&packet[cursor..])?;

        match sub_frame.header.kind {
            SubFrameKind::Ascan => {}
            SubFrameKind::InstrumentError => return Err(MpError::InstrumentFault { index }),
            kind => return Err(MpError::UnexpectedSubFrame { index, kind }),
        }
        if sub_frame.header.format_code != framing.format_code {
            return Err(MpError::FormatMismatch {
                index,
                expected: framing.format_code,
                actual: sub_frame.header.format_code,
            });
        }
        if sub_frame.header.count as usize != per_subframe {
            return Err(MpError::CountMismatch {
                index,
                expected: per_subframe as u32,
                actual: sub_frame.header.count,
            });
        }
        if cursor + per_subframe > packet.len() {
            return Err(MpError::Truncated {
                expected: per_subframe,
                actual: packet.len() - cursor,
            });
        }

        sub_frames.push(sub_frame);
        cursor += per_subframe;
    }

    if sub_frames.len() as u32 != framing.num_ascans {
        return Err(MpError::SubFrameCount {
            expected: framing.num_ascans,
            actual: sub_frames.len() as u32,
        });
    }

    Ok(sub_frames)
}
