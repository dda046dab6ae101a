// Protocol constants for the MicroPulse/LTPA command and framing protocol

use std::time::Duration;

/// Size of the sub-header preceding every DOF message (8 bytes)
pub const SUB_HEADER_SIZE: usize = 8;

/// Size of the status block the instrument returns after a reset (32 bytes)
pub const RESET_RESPONSE_SIZE: usize = 32;

/// First byte of a successful reset response ('#')
pub const RESET_SUCCESS_MARKER: u8 = 0x23;

/// Terminator appended to every outgoing ASCII command
pub const COMMAND_TERMINATOR: &str = "\r\n";

/// Reset command prefix; optionally followed by a digitisation rate in MHz
pub const RESET_COMMAND: &str = "RST";

/// Data-request command; the instrument answers with one full packet
pub const DATA_REQUEST: &str = "CALS 1";

/// Bounded number of reset attempts before giving up
pub const MAX_RESET_ATTEMPTS: u32 = 3;

/// Settle delay the instrument needs between RST and its status response
pub const RESET_SETTLE: Duration = Duration::from_secs(10);

/// Backoff between failed continuous-acquisition cycles
pub const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Grace period for an in-flight response to land before the socket is
/// drained on stop
pub const DRAIN_GRACE: Duration = Duration::from_millis(50);
