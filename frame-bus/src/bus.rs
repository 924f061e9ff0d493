use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{ConversionStage, DecodeStage, MediaBackend, OpenedStream, StreamSource},
    cache::ConversionCache,
    config::BusConfig,
    error::{Result, StreamError},
    frame::{DecodedSurface, FrameRequest, ProcessedFrame, RawFrame},
    ring::DecodedRing,
    stream::StreamParameters,
};

/// Longest uninterrupted sleep of the decode thread; bounds how long a
/// close waits for the pacing sleep to notice cancellation.
const PACING_SLICE: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Initialized,
    Running,
    Closing,
    Closed,
}

impl PipelineState {
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            (a, b) if a == b => true,
            (Uninitialized, Initialized) => true,
            (Initialized, Running) => true,
            (Closed, _) => false,
            (_, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }

    /// Whether consumer requests are admitted in this state.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, PipelineState::Initialized | PipelineState::Running)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloseMode {
    /// Let in-flight requests and the current decode iteration finish first.
    Soft,
    /// Release everything immediately; in-flight requests fail.
    #[default]
    Hard,
}

/// Everything sized from the opened stream.
struct Session {
    params: StreamParameters,
    ring: DecodedRing,
    cache: ConversionCache,
    converter: Arc<dyn ConversionStage>,
}

struct Status {
    state: PipelineState,
    in_flight: usize,
}

/// State shared between the bus handle, consumer calls and the decode thread.
struct Shared {
    config: BusConfig,
    status: Mutex<Status>,
    idle: Condvar,
    cancel: CancellationToken,
    session: OnceLock<Session>,
    delay_us: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> PipelineState {
        self.status.lock().state
    }

    fn transition(&self, target: PipelineState) -> bool {
        let mut status = self.status.lock();
        if !status.state.can_transition_to(&target) {
            log::warn!(
                "frame bus: ignoring transition {:?} -> {:?}",
                status.state,
                target
            );
            return false;
        }
        if status.state != target {
            log::info!("frame bus: {:?} -> {:?}", status.state, target);
            status.state = target;
        }
        true
    }

    /// Admits a consumer request, counting it as in flight until the guard drops.
    fn enter(&self) -> Result<RequestGuard<'_>> {
        let mut status = self.status.lock();
        if status.state == PipelineState::Uninitialized {
            return Err(StreamError::NotInitialized);
        }
        if !status.state.accepts_requests() {
            return Err(StreamError::PipelineClosed);
        }
        status.in_flight += 1;
        Ok(RequestGuard { shared: self })
    }

    fn leave(&self) {
        let mut status = self.status.lock();
        status.in_flight = status.in_flight.saturating_sub(1);
        if status.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut status = self.status.lock();
        while status.in_flight > 0 {
            self.idle.wait(&mut status);
        }
    }

    fn record_error(&self, err: &StreamError) {
        *self.last_error.lock() = Some(err.to_string());
    }

    /// Drives the pipeline through Closing to Closed. Safe to call more than
    /// once and from any thread; buffers are released in a single step.
    fn shutdown(&self, mode: CloseMode) {
        if self.state() == PipelineState::Closed || !self.transition(PipelineState::Closing) {
            return;
        }
        self.cancel.cancel();

        let session = self.session.get();
        if let Some(session) = session {
            session.ring.stop_producing();
        }
        if mode == CloseMode::Soft {
            self.wait_idle();
            if let Some(session) = session {
                session.ring.wait_unpinned();
            }
        }
        if let Some(session) = session {
            // close the cache first so a conversion finishing now is discarded
            session.cache.clear();
            let released = session.ring.release();
            log::info!(
                "frame bus: released {} decoded frame(s) ({:?} close)",
                released.len(),
                mode
            );
        }

        self.transition(PipelineState::Closed);
    }
}

struct RequestGuard<'a> {
    shared: &'a Shared,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.shared.leave();
    }
}

#[derive(Default)]
struct Lifecycle {
    opened: Option<OpenedStream>,
    producer: Option<JoinHandle<()>>,
}

/// Decodes one video stream into a bounded ring of frames and serves
/// per-consumer converted views of them.
///
/// ```ignore
/// let bus = FrameBus::new(Arc::new(SyntheticBackend::new()), BusConfig::default());
/// bus.initialize("synthetic://640x360@30", 5)?;
/// bus.start()?;
/// let frame = bus.get_frame("detector", FrameRequest::new(0, PixelFormat::Rgb24))?;
/// println!("{}", frame);
/// bus.close(CloseMode::Soft);
/// ```
pub struct FrameBus {
    backend: Arc<dyn MediaBackend>,
    shared: Arc<Shared>,
    // serialises initialize/start/close so a new decode thread never
    // overlaps the teardown of a previous one
    lifecycle: Mutex<Lifecycle>,
}

impl FrameBus {
    pub fn new(backend: Arc<dyn MediaBackend>, config: BusConfig) -> Self {
        Self {
            backend,
            shared: Arc::new(Shared {
                config,
                status: Mutex::new(Status {
                    state: PipelineState::Uninitialized,
                    in_flight: 0,
                }),
                idle: Condvar::new(),
                cancel: CancellationToken::new(),
                session: OnceLock::new(),
                delay_us: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Opens `locator` and sizes the decoded ring to `decoder_buffer` frames.
    ///
    /// `decoder_buffer` must be between 1 and the decoder's in-flight frame
    /// limit; anything else is rejected before a single packet is decoded.
    pub fn initialize(&self, locator: &str, decoder_buffer: usize) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match self.shared.state() {
            PipelineState::Uninitialized => {}
            PipelineState::Closing | PipelineState::Closed => {
                return Err(StreamError::PipelineClosed);
            }
            _ => {
                return Err(StreamError::Configuration(
                    "pipeline is already initialized".to_string(),
                ));
            }
        }
        if decoder_buffer == 0 {
            return Err(StreamError::Configuration(
                "decoder buffer must hold at least one frame".to_string(),
            ));
        }

        let opened = self.backend.open(locator)?;
        let params = StreamParameters::from_metadata(opened.source.metadata())?;
        let depth = opened.decoder.max_in_flight_frames();
        if decoder_buffer > depth {
            return Err(StreamError::Configuration(format!(
                "decoder buffer of {} frames exceeds the decoder's limit of {} frames in flight",
                decoder_buffer, depth
            )));
        }

        let session = Session {
            params,
            ring: DecodedRing::new(decoder_buffer)?,
            cache: ConversionCache::new(&params),
            converter: self.backend.converter(),
        };
        if self.shared.session.set(session).is_err() {
            return Err(StreamError::Configuration(
                "pipeline is already initialized".to_string(),
            ));
        }
        lifecycle.opened = Some(opened);
        self.shared.transition(PipelineState::Initialized);

        log::info!(
            "frame bus: opened {} ({}x{} @ {}/{}), buffer {} of {} frames",
            locator,
            params.width,
            params.height,
            params.frame_rate_num,
            params.frame_rate_den,
            decoder_buffer,
            depth
        );
        Ok(())
    }

    pub fn get_parameters(&self) -> Result<StreamParameters> {
        self.session().map(|session| session.params)
    }

    /// Parameters keyed as `framerate_num`, `framerate_den`, `width`, `height`.
    pub fn get_parameters_map(&self) -> Result<BTreeMap<&'static str, u32>> {
        self.get_parameters().map(|params| params.as_map())
    }

    /// Spawns the decode thread.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match self.shared.state() {
            PipelineState::Uninitialized => return Err(StreamError::NotInitialized),
            PipelineState::Running => return Err(StreamError::AlreadyRunning),
            PipelineState::Closing | PipelineState::Closed => {
                return Err(StreamError::PipelineClosed);
            }
            PipelineState::Initialized => {}
        }
        let opened = lifecycle.opened.take().ok_or(StreamError::NotInitialized)?;

        self.shared.transition(PipelineState::Running);
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("frame-bus-decode".to_string())
            .spawn(move || decode_loop(shared, opened));

        match spawned {
            Ok(handle) => {
                lifecycle.producer = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::error!("frame bus: failed to spawn decode thread: {}", e);
                self.shared.shutdown(CloseMode::Hard);
                Err(e.into())
            }
        }
    }

    /// Returns the frame `request.index` steps back from the newest one,
    /// converted for `consumer`.
    pub fn get_frame(&self, consumer: &str, request: FrameRequest) -> Result<ProcessedFrame> {
        let _in_flight = self.shared.enter()?;
        let session = self.session()?;

        if !session.ring.in_window(request.index) {
            return Err(StreamError::OutOfRange {
                index: request.index,
                capacity: session.ring.capacity(),
                retained: session.ring.len(),
            });
        }

        let config = &self.shared.config;
        let fresh_wait = (config.pacing && self.shared.state() == PipelineState::Running)
            .then(|| config.frame_wait_timeout());

        session.cache.resolve(
            &session.ring,
            session.converter.as_ref(),
            consumer,
            &request,
            fresh_wait,
        )
    }

    /// Stops decoding and releases every buffer. Idempotent.
    pub fn close(&self, mode: CloseMode) {
        let mut lifecycle = self.lifecycle.lock();
        let producer = lifecycle.producer.take();
        lifecycle.opened = None;
        if self.shared.state() == PipelineState::Closed {
            return;
        }

        match mode {
            CloseMode::Soft => {
                // stop admitting requests before the producer winds down
                self.shared.transition(PipelineState::Closing);
                self.shared.cancel.cancel();
                if let Some(session) = self.shared.session.get() {
                    session.ring.stop_producing();
                }
                if let Some(handle) = producer {
                    if handle.join().is_err() {
                        log::error!("frame bus: decode thread panicked");
                    }
                }
                self.shared.shutdown(CloseMode::Soft);
            }
            CloseMode::Hard => {
                self.shared.shutdown(CloseMode::Hard);
                // the decode thread notices the closed ring on its own
                drop(producer);
            }
        }
    }

    /// Pacing sleep computed for the most recently decoded frame.
    pub fn get_delay(&self) -> Duration {
        Duration::from_micros(self.shared.delay_us.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Sequence of the newest decoded frame, `None` before the first one.
    pub fn latest_sequence(&self) -> Option<u64> {
        self.shared
            .session
            .get()
            .and_then(|session| session.ring.newest_sequence())
    }

    /// Why the pipeline closed itself, if it did so because of an error.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    fn session(&self) -> Result<&Session> {
        self.shared.session.get().ok_or(StreamError::NotInitialized)
    }
}

impl Drop for FrameBus {
    fn drop(&mut self) {
        self.close(CloseMode::Hard);
    }
}

enum LoopExit {
    Cancelled,
    EndOfStream,
    Failed(StreamError),
}

struct DecodeLoop<'a> {
    shared: &'a Shared,
    session: &'a Session,
    source: Box<dyn StreamSource>,
    decoder: Box<dyn DecodeStage>,
    interval: Duration,
    sequence: u64,
    failures: u32,
    frame_started: Instant,
}

fn decode_loop(shared: Arc<Shared>, opened: OpenedStream) {
    let Some(session) = shared.session.get() else {
        return;
    };
    let mut decode = DecodeLoop {
        shared: &shared,
        session,
        source: opened.source,
        decoder: opened.decoder,
        interval: session.params.frame_interval(),
        sequence: 0,
        failures: 0,
        frame_started: Instant::now(),
    };
    log::info!("decode loop: started, frame interval {:?}", decode.interval);

    match decode.run() {
        LoopExit::Cancelled => {
            log::info!("decode loop: stopped after {} frames", decode.sequence);
        }
        LoopExit::EndOfStream => {
            log::info!("decode loop: end of stream after {} frames", decode.sequence);
            shared.shutdown(CloseMode::Soft);
        }
        LoopExit::Failed(_) if shared.cancel.is_cancelled() => {
            log::info!("decode loop: stopped after {} frames", decode.sequence);
        }
        LoopExit::Failed(err) => {
            log::error!("decode loop: {}", err);
            shared.record_error(&err);
            shared.shutdown(CloseMode::Hard);
        }
    }
}

impl DecodeLoop<'_> {
    fn run(&mut self) -> LoopExit {
        loop {
            if self.shared.cancel.is_cancelled() {
                return LoopExit::Cancelled;
            }

            let packet = match self.source.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => return self.drain(),
                Err(e) => match self.on_failure("read packet", e) {
                    Some(exit) => return exit,
                    None => continue,
                },
            };

            match self.decoder.decode(&packet) {
                Ok(Some(decoded)) => {
                    self.failures = 0;
                    if let Some(exit) = self.publish(decoded) {
                        return exit;
                    }
                }
                // decoder wants more input
                Ok(None) => self.failures = 0,
                Err(e) => {
                    if let Some(exit) = self.on_failure("decode", e) {
                        return exit;
                    }
                }
            }
        }
    }

    fn drain(&mut self) -> LoopExit {
        match self.decoder.flush() {
            Ok(frames) => {
                for decoded in frames {
                    if self.shared.cancel.is_cancelled() {
                        return LoopExit::Cancelled;
                    }
                    if let Some(exit) = self.publish(decoded) {
                        return exit;
                    }
                }
            }
            Err(e) => log::warn!("decode loop: flush failed: {:#}", e),
        }
        LoopExit::EndOfStream
    }

    fn on_failure(&mut self, what: &str, err: anyhow::Error) -> Option<LoopExit> {
        self.failures += 1;
        let allowed = self.shared.config.max_decode_retries;
        if self.failures > allowed {
            return Some(LoopExit::Failed(StreamError::DecodeFatal {
                attempts: self.failures,
                last: format!("{:#}", err),
            }));
        }
        log::warn!(
            "decode loop: {} failed ({}/{}), skipping packet: {:#}",
            what,
            self.failures,
            allowed,
            err
        );
        None
    }

    fn publish(&mut self, decoded: DecodedSurface) -> Option<LoopExit> {
        self.sequence += 1;
        let frame = RawFrame::new(decoded, self.sequence);
        match self.session.ring.insert(frame) {
            Ok(evicted) => {
                if let Some(evicted) = evicted {
                    log::trace!("decode loop: evicted frame {}", evicted.sequence());
                }
            }
            Err(_) => return Some(LoopExit::Cancelled),
        }
        log::debug!("decode loop: frame {} ready", self.sequence);

        self.pace();
        None
    }

    /// Sleeps away what is left of the frame interval.
    fn pace(&mut self) {
        let delay = self.interval.saturating_sub(self.frame_started.elapsed());
        self.shared
            .delay_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);

        if self.shared.config.pacing && !delay.is_zero() {
            let deadline = Instant::now() + delay;
            loop {
                if self.shared.cancel.is_cancelled() {
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                std::thread::sleep(remaining.min(PACING_SLICE));
            }
        }
        self.frame_started = Instant::now();
    }
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod bus_test;
