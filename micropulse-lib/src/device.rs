//! MicroPulse/LTPA session and acquisition engine.
//!
//! # Session lifecycle
//!
//! A session walks through `configure` (read the MPS file), `connect`,
//! `reset` and `send_mps_configuration` before any data can be requested;
//! [`MicroPulse::setup`] runs the whole sequence. Acquisition then has two
//! mutually exclusive modes:
//!
//! - **Single-shot**: [`MicroPulse::acquire_once`] sends one data request,
//!   blocks for the size-known response, and replaces the session's latest
//!   frame on success.
//! - **Continuous**: [`MicroPulse::start_async`] moves the socket into a
//!   background task that pipelines request and receive, publishing each
//!   parsed frame through a latest-wins slot that [`MicroPulse::poll_frame`]
//!   drains without blocking. [`MicroPulse::stop_async`] halts the task,
//!   drains the socket and hands it back, so acquisition can be restarted
//!   on the same connection at any time.
//!
//! The background task never holds a reference back into the session: it
//! checks a monotonically increasing generation counter on every cycle and
//! exits silently once a stop or restart has advanced it.

use crate::codec;
use crate::constants::{
    DATA_REQUEST, DRAIN_GRACE, ERROR_BACKOFF, MAX_RESET_ATTEMPTS, RESET_RESPONSE_SIZE, RESET_SETTLE,
};
use crate::error::MpError;
use crate::frame::{DigitisationRate, Frame, ProbeGeometry, ResetStatus};
use crate::mps::{FramingParams, MpsConfig};
use crate::transport::{self, Transport};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for a MicroPulse/LTPA session.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Instrument address
    pub host: String,
    /// Instrument TCP port
    pub port: u16,
    /// Path to the MPS configuration file replayed to the instrument
    pub mps_file: PathBuf,
    /// Digitisation rate requested at reset
    pub rate: DigitisationRate,
    /// Pass-through probe geometry copied into every frame
    pub geometry: ProbeGeometry,
    /// Target request cadence for continuous acquisition; `None` re-arms
    /// the next request as soon as the previous frame has been handled
    pub target_period: Option<Duration>,
}

impl DeviceConfig {
    pub fn new(host: impl Into<String>, port: u16, mps_file: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            mps_file: mps_file.into(),
            rate: DigitisationRate::Default,
            geometry: ProbeGeometry::default(),
            target_period: None,
        }
    }

    pub fn with_rate(mut self, rate: DigitisationRate) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_geometry(mut self, geometry: ProbeGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_target_period(mut self, period: Duration) -> Self {
        self.target_period = Some(period);
        self
    }
}

/// Invoked from the acquisition task after every completed cycle, with
/// `true` when the packet parsed and validated cleanly.
pub type FrameCallback = Box<dyn Fn(bool) + Send + Sync + 'static>;

/// Lifecycle state of the acquisition engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquisitionState {
    Idle,
    Sync,
    Async { generation: u64 },
}

impl AcquisitionState {
    fn name(&self) -> &'static str {
        match self {
            AcquisitionState::Idle => "idle",
            AcquisitionState::Sync => "a single-shot acquisition is in flight",
            AcquisitionState::Async { .. } => "continuous acquisition is running",
        }
    }
}

/// Latest-wins hand-off between the acquisition task and consumers.
///
/// `Some` means written but not yet taken. Publishing over an unread frame
/// discards it, and taking clears the slot in the same lock acquisition, so
/// each publication is observed at most once.
#[derive(Debug, Default)]
pub(crate) struct PublishSlot {
    slot: Mutex<Option<Frame>>,
}

impl PublishSlot {
    pub(crate) fn publish(&self, frame: Frame) {
        *self.slot.lock().unwrap() = Some(frame);
    }

    pub(crate) fn take(&self) -> Option<Frame> {
        self.slot.lock().unwrap().take()
    }
}

struct AsyncHandle {
    join: JoinHandle<TcpStream>,
    stop: Arc<Notify>,
}

/// A session with one MicroPulse/LTPA instrument.
pub struct MicroPulse {
    config: DeviceConfig,
    mps: Option<MpsConfig>,
    reset_status: Option<ResetStatus>,
    transport: Transport,
    latest: Option<Frame>,
    slot: Arc<PublishSlot>,
    generation: Arc<AtomicU64>,
    state: AcquisitionState,
    task: Option<AsyncHandle>,
}

impl MicroPulse {
    /// Create a session. No I/O happens until [`MicroPulse::configure`] and
    /// [`MicroPulse::connect`] are called.
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            mps: None,
            reset_status: None,
            transport: Transport::default(),
            latest: None,
            slot: Arc::new(PublishSlot::default()),
            generation: Arc::new(AtomicU64::new(0)),
            state: AcquisitionState::Idle,
            task: None,
        }
    }

    /// Read and interpret the MPS file named in the configuration.
    pub fn configure(&mut self) -> Result<(), MpError> {
        let mps = MpsConfig::from_file(&self.config.mps_file)?;
        debug!(framing = ?mps.framing, "framing parameters derived");
        self.mps = Some(mps);
        Ok(())
    }

    /// Establish the TCP session to the instrument.
    pub async fn connect(&mut self) -> Result<(), MpError> {
        info!(
            "connecting to instrument at {}:{}",
            self.config.host, self.config.port
        );
        self.transport
            .connect(&self.config.host, self.config.port)
            .await
    }

    /// Reset the instrument, optionally selecting a digitisation rate.
    ///
    /// The instrument needs a settle period between RST and its status
    /// response; production firmware wants [`RESET_SETTLE`], tests against a
    /// mock may pass `Duration::ZERO`. A rejected reset is retried up to
    /// [`MAX_RESET_ATTEMPTS`] times before surfacing as fatal.
    pub async fn reset(&mut self, settle: Duration) -> Result<ResetStatus, MpError> {
        let command = codec::encode_command(&codec::reset_command(self.config.rate));
        for attempt in 1..=MAX_RESET_ATTEMPTS {
            info!(attempt, rate = %self.config.rate, "resetting instrument");
            self.transport.send(&command).await?;
            tokio::time::sleep(settle).await;

            let response = self.transport.receive_exact(RESET_RESPONSE_SIZE).await?;
            match codec::parse_reset_response(&response) {
                Ok(status) => {
                    info!(system_type = ?status.system_type, "reset acknowledged");
                    info!(
                        default = status.default_format,
                        actual = status.actual_format,
                        "data output format"
                    );
                    info!(
                        default_mhz = status.default_rate_mhz,
                        actual_mhz = status.actual_rate_mhz,
                        "digitisation rate"
                    );
                    self.reset_status = Some(status);
                    return Ok(status);
                }
                Err(MpError::ResetRejected { marker }) => {
                    warn!(marker, attempt, "instrument rejected reset");
                }
                Err(err) => return Err(err),
            }
        }
        Err(MpError::ResetFailed {
            attempts: MAX_RESET_ATTEMPTS,
        })
    }

    /// Replay every retained MPS line to the instrument, in file order.
    pub async fn send_mps_configuration(&mut self) -> Result<(), MpError> {
        let mps = self.mps.as_ref().ok_or(MpError::Usage {
            operation: "send_mps_configuration",
            state: "no MPS configuration has been read",
        })?;
        for line in &mps.commands {
            self.transport.send(&codec::encode_command(line)).await?;
        }
        info!(commands = mps.commands.len(), "MPS configuration sent");
        Ok(())
    }

    /// Full bring-up: configure, connect, reset and replay the MPS file.
    pub async fn setup(&mut self, settle: Duration) -> Result<ResetStatus, MpError> {
        self.configure()?;
        self.connect().await?;
        let status = self.reset(settle).await?;
        self.send_mps_configuration().await?;
        Ok(status)
    }

    /// Reset settle delay suitable for production firmware.
    pub fn default_settle() -> Duration {
        RESET_SETTLE
    }

    /// Framing parameters derived from the MPS file, once configured.
    pub fn framing(&self) -> Option<&FramingParams> {
        self.mps.as_ref().map(|mps| &mps.framing)
    }

    /// Instrument status captured by the last successful reset.
    pub fn reset_status(&self) -> Option<&ResetStatus> {
        self.reset_status.as_ref()
    }

    fn acquisition_framing(&self, operation: &'static str) -> Result<FramingParams, MpError> {
        let framing = self.mps.as_ref().map(|mps| mps.framing).ok_or(MpError::Usage {
            operation,
            state: "no MPS configuration has been read",
        })?;
        if self.reset_status.is_none() {
            return Err(MpError::Usage {
                operation,
                state: "the instrument has not been reset",
            });
        }
        Ok(framing)
    }

    fn frame_template(&self, framing: &FramingParams) -> Frame {
        let rate_mhz = self
            .reset_status
            .map(|status| status.actual_rate_mhz)
            .unwrap_or(0);
        Frame::template(rate_mhz, framing, self.config.geometry)
    }

    /// Request and receive a single frame synchronously.
    ///
    /// On success the session's latest frame is replaced; on any validation
    /// failure the previous frame is left untouched and the typed error is
    /// returned.
    pub async fn acquire_once(&mut self) -> Result<(), MpError> {
        if self.state != AcquisitionState::Idle {
            return Err(MpError::Usage {
                operation: "acquire_once",
                state: self.state.name(),
            });
        }
        let framing = self.acquisition_framing("acquire_once")?;
        let packet_bytes = framing.packet_bytes()?;

        self.state = AcquisitionState::Sync;
        let result = self.acquire_inner(&framing, packet_bytes).await;
        self.state = AcquisitionState::Idle;
        result
    }

    async fn acquire_inner(
        &mut self,
        framing: &FramingParams,
        packet_bytes: usize,
    ) -> Result<(), MpError> {
        self.transport
            .send(&codec::encode_command(DATA_REQUEST))
            .await?;
        let packet = self.transport.receive_exact(packet_bytes).await?;
        let sub_frames = codec::parse_data_packet(&packet, framing)?;
        let frame = self.frame_template(framing).fill(sub_frames);
        debug!(
            ascans = frame.sub_frames.len(),
            max_amplitude = frame.max_amplitude,
            "frame received"
        );
        self.latest = Some(frame);
        Ok(())
    }

    /// Read-only view of the most recent synchronously acquired frame.
    pub fn latest_frame(&self) -> Option<&Frame> {
        self.latest.as_ref()
    }

    /// Start continuous acquisition.
    ///
    /// A no-op when continuous acquisition is already running. The socket
    /// moves into a background task that repeatedly requests a packet,
    /// receives it, parses it and publishes the frame; `on_frame_ready` is
    /// invoked after every cycle with the validation outcome. Receive or
    /// parse failures are reported and the loop re-arms; deciding when a
    /// failing instrument should be stopped is left to the consumer.
    pub fn start_async(&mut self, on_frame_ready: Option<FrameCallback>) -> Result<(), MpError> {
        match self.state {
            AcquisitionState::Async { .. } => return Ok(()),
            AcquisitionState::Sync => {
                return Err(MpError::Usage {
                    operation: "start_async",
                    state: self.state.name(),
                })
            }
            AcquisitionState::Idle => {}
        }
        let framing = self.acquisition_framing("start_async")?;
        let packet_bytes = framing.packet_bytes()?;
        let template = self.frame_template(&framing);
        let stream = self.transport.take_stream()?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let stop = Arc::new(Notify::new());
        let task = AcquisitionTask {
            stream,
            framing,
            packet_bytes,
            template,
            slot: Arc::clone(&self.slot),
            generation_counter: Arc::clone(&self.generation),
            generation,
            stop: Arc::clone(&stop),
            on_frame_ready,
            period: self.config.target_period,
        };

        info!(generation, packet_bytes, "starting continuous acquisition");
        let join = tokio::spawn(task.run());
        self.task = Some(AsyncHandle { join, stop });
        self.state = AcquisitionState::Async { generation };
        Ok(())
    }

    /// Copy the most recent continuously acquired frame into `out`.
    ///
    /// Returns `true` iff a frame has been published since the last take.
    /// Never blocks; safe to call concurrently with publishes from the
    /// acquisition task.
    pub fn poll_frame(&self, out: &mut Frame) -> bool {
        match self.slot.take() {
            Some(frame) => {
                *out = frame;
                true
            }
            None => false,
        }
    }

    /// Stop continuous acquisition.
    ///
    /// Idempotent. On return no further frame callbacks will fire and the
    /// socket has been drained, so a subsequent [`MicroPulse::start_async`]
    /// observes clean framing. The publish slot keeps the last frame for
    /// one final [`MicroPulse::poll_frame`].
    pub async fn stop_async(&mut self) -> Result<(), MpError> {
        let handle = match self.task.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        if let AcquisitionState::Async { generation } = self.state {
            debug!(generation, "stopping continuous acquisition");
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        handle.stop.notify_one();
        match handle.join.await {
            Ok(stream) => self.transport.restore_stream(stream),
            Err(err) => warn!("acquisition task failed to join: {err}"),
        }
        self.state = AcquisitionState::Idle;
        info!("continuous acquisition stopped");
        Ok(())
    }
}

impl Drop for MicroPulse {
    fn drop(&mut self) {
        if let Some(handle) = self.task.take() {
            // A synchronous drop cannot join the task; aborting it closes
            // the socket it owns and prevents any further callback.
            self.generation.fetch_add(1, Ordering::AcqRel);
            handle.join.abort();
        }
    }
}

/// The request/receive pipeline run on the background task during
/// continuous acquisition.
struct AcquisitionTask {
    stream: TcpStream,
    framing: FramingParams,
    packet_bytes: usize,
    template: Frame,
    slot: Arc<PublishSlot>,
    generation_counter: Arc<AtomicU64>,
    generation: u64,
    stop: Arc<Notify>,
    on_frame_ready: Option<FrameCallback>,
    period: Option<Duration>,
}

/// Outcome of one request/receive cycle.
enum Cycle {
    Published,
    Stopped,
}

impl AcquisitionTask {
    fn stale(&self) -> bool {
        self.generation_counter.load(Ordering::Acquire) != self.generation
    }

    fn report(&self, valid: bool) {
        if let Some(callback) = &self.on_frame_ready {
            callback(valid);
        }
    }

    /// Runs until stopped or superseded, then hands the drained stream back.
    async fn run(mut self) -> TcpStream {
        let request = codec::encode_command(DATA_REQUEST);
        let mut buf = vec![0u8; self.packet_bytes];
        let mut ticker = self.period.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            if self.stale() {
                break;
            }

            if let Some(ticker) = &mut ticker {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.stop.notified() => break,
                }
            }

            match self.cycle(&request, &mut buf).await {
                Ok(Cycle::Published) => self.report(true),
                Ok(Cycle::Stopped) => break,
                Err(err) => {
                    if self.stale() {
                        break;
                    }
                    warn!("acquisition cycle failed: {err}");
                    self.report(false);
                    // Keeps a dead socket from spinning the loop hot
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        // A cancelled read may have consumed part of an in-flight packet;
        // give the remainder a moment to land so the second drain leaves
        // the stream on a packet boundary for the next start.
        transport::drain(&self.stream);
        tokio::time::sleep(DRAIN_GRACE).await;
        transport::drain(&self.stream);
        debug!(generation = self.generation, "acquisition task exiting");
        self.stream
    }

    async fn cycle(&mut self, request: &[u8], buf: &mut [u8]) -> Result<Cycle, MpError> {
        self.stream.write_all(request).await?;

        let stop = Arc::clone(&self.stop);
        tokio::select! {
            _ = stop.notified() => return Ok(Cycle::Stopped),
            received = self.stream.read_exact(buf) => { received?; }
        }

        let sub_frames = codec::parse_data_packet(buf, &self.framing)?;
        if self.stale() {
            return Ok(Cycle::Stopped);
        }
        self.slot.publish(self.template.fill(sub_frames));
        Ok(Cycle::Published)
    }
}
