//! In-process mock of a MicroPulse/LTPA instrument.
//!
//! Listens on an ephemeral port, absorbs configuration lines, answers RST
//! with a 32-byte status block and CALS with one deterministic data packet.
//! The ramp pattern matches the real instrument's framing so the driver can
//! be exercised end to end without hardware.

use micropulse_lib::codec::{encode_sample_16, encode_sample_8};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Ways the mock can deviate from in-spec framing.
#[derive(Debug, Clone, Copy)]
pub enum Corruption {
    /// Stamp this format code into every sub-frame header
    FormatCode(u8),
    /// Declare this byte count in every sub-frame header
    DeclaredCount(u32),
    /// Emit only the first n sub-frames and zero-fill the rest of the packet
    TruncateAfter(usize),
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub format_code: u8,
    pub ascan_length: usize,
    pub num_ascans: usize,
    pub actual_rate_mhz: u8,
    /// Reject this many resets before acknowledging one
    pub reset_rejections: u32,
    pub corruption: Option<Corruption>,
}

impl MockConfig {
    pub fn new(format_code: u8, ascan_length: usize, num_ascans: usize) -> Self {
        Self {
            format_code,
            ascan_length,
            num_ascans,
            actual_rate_mhz: 50,
            reset_rejections: 0,
            corruption: None,
        }
    }

    pub fn with_corruption(mut self, corruption: Corruption) -> Self {
        self.corruption = Some(corruption);
        self
    }

    pub fn with_reset_rejections(mut self, rejections: u32) -> Self {
        self.reset_rejections = rejections;
        self
    }
}

pub struct MockInstrument {
    port: u16,
    accept_task: JoinHandle<()>,
    pub resets: Arc<AtomicU32>,
    pub data_requests: Arc<AtomicU32>,
    pub config_lines: Arc<AtomicU32>,
}

impl MockInstrument {
    pub async fn start(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let resets = Arc::new(AtomicU32::new(0));
        let data_requests = Arc::new(AtomicU32::new(0));
        let config_lines = Arc::new(AtomicU32::new(0));
        let rejections_left = Arc::new(AtomicU32::new(config.reset_rejections));

        let counters = (
            Arc::clone(&resets),
            Arc::clone(&data_requests),
            Arc::clone(&config_lines),
        );
        let accept_task = tokio::spawn(async move {
            // One client at a time, like the single-socket hardware
            while let Ok((stream, _)) = listener.accept().await {
                serve(stream, &config, &counters, &rejections_left).await;
            }
        });

        Self {
            port,
            accept_task,
            resets,
            data_requests,
            config_lines,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for MockInstrument {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    config: &MockConfig,
    (resets, data_requests, config_lines): &(Arc<AtomicU32>, Arc<AtomicU32>, Arc<AtomicU32>),
    rejections_left: &AtomicU32,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end_matches('\r');
        if line.starts_with("RST") {
            resets.fetch_add(1, Ordering::SeqCst);
            let accept = rejections_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_err();
            if write_half.write_all(&reset_response(config, accept)).await.is_err() {
                break;
            }
        } else if line.starts_with("CALS") {
            data_requests.fetch_add(1, Ordering::SeqCst);
            if write_half.write_all(&build_packet(config)).await.is_err() {
                break;
            }
        } else {
            config_lines.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn reset_response(config: &MockConfig, accept: bool) -> Vec<u8> {
    let mut response = vec![0u8; 32];
    response[0] = if accept { 0x23 } else { 0x00 };
    response[4] = 0x30; // LTPA
    response[7] = config.format_code;
    response[8] = 50;
    response[9] = config.actual_rate_mhz;
    response[10] = config.format_code;
    response
}

fn build_packet(config: &MockConfig) -> Vec<u8> {
    let bytes_per_sample = if config.format_code == 4 { 2 } else { 1 };
    let sub_frame_len = 8 + config.ascan_length * bytes_per_sample;

    let emit = match config.corruption {
        Some(Corruption::TruncateAfter(n)) => n.min(config.num_ascans),
        _ => config.num_ascans,
    };

    let mut packet = Vec::with_capacity(config.num_ascans * sub_frame_len);
    for index in 0..emit {
        packet.extend(build_sub_frame(config, index, sub_frame_len));
    }
    packet.resize(config.num_ascans * sub_frame_len, 0);
    packet
}

fn build_sub_frame(config: &MockConfig, index: usize, sub_frame_len: usize) -> Vec<u8> {
    let declared = match config.corruption {
        Some(Corruption::DeclaredCount(count)) => count,
        _ => sub_frame_len as u32,
    };
    let format = match config.corruption {
        Some(Corruption::FormatCode(code)) => code,
        _ => config.format_code,
    };

    let mut msg = vec![0u8; sub_frame_len];
    msg[0] = 0x1A;
    msg[1] = (declared & 0xFF) as u8;
    msg[2] = ((declared >> 8) & 0xFF) as u8;
    msg[3] = ((declared >> 16) & 0xFF) as u8;
    let test_number = (index + 1) as u16;
    msg[4] = (test_number & 0xFF) as u8;
    msg[5] = (test_number >> 8) as u8;
    msg[6] = format;
    msg[7] = index as u8;

    // Deterministic ramp so tests can assert exact decoded values
    if config.format_code == 4 {
        for j in 0..config.ascan_length {
            let word = encode_sample_16(((index * 7 + j) % 1000) as i32);
            msg[8 + 2 * j] = word[0];
            msg[8 + 2 * j + 1] = word[1];
        }
    } else {
        for j in 0..config.ascan_length {
            msg[8 + j] = encode_sample_8(((index * 7 + j) % 100) as i32);
        }
    }

    msg
}
