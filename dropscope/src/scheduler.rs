/// Frame scheduler - single-slot latest-wins backpressure
///
/// Runs one pipeline pass at a time on a dedicated worker thread:
/// - `submit` never blocks and never queues more than one pending frame
/// - a frame arriving while busy overwrites the pending one
/// - `stop` is callable from any thread and never waits for the in-flight pass;
///   its result is discarded
use crate::error::{DropletError, Result};
use crate::types::Frame;
use crossbeam::atomic::AtomicCell;
use crossbeam::sync::{Parker, Unparker};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Window over which the processing rate is measured
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// A pipeline the scheduler can drive
pub trait FrameProcessor: Send + 'static {
    type Output: Send;

    /// Run every stage on one frame without publishing anything
    fn process(&mut self, frame: Frame) -> Result<Self::Output>;

    /// Make the result of a completed pass visible to readers
    fn publish(&mut self, output: Self::Output);

    /// Called for a recoverable error instead of halting
    fn recover(&mut self, frame_id: u64, error: &DropletError);
}

/// What happened to a submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    /// Placed into the empty slot
    Accepted,
    /// Placed into the slot, overwriting a frame that was never processed
    Replaced { dropped_frame_id: u64 },
    /// Not newer than the last admitted frame
    Stale,
    /// Scheduler is not running
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub state: SchedulerState,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub frames_stale: u64,
    pub recoverable_errors: u64,
    pub processing_rate_hz: f64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    frames: u64,
    rate_hz: f64,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            rate_hz: 0.0,
        }
    }

    fn tick(&mut self) {
        self.frames += 1;
        let elapsed = self.started.elapsed();
        if elapsed >= RATE_WINDOW {
            self.rate_hz = self.frames as f64 / elapsed.as_secs_f64();
            self.frames = 0;
            self.started = Instant::now();
        }
    }

    /// Last closed window's rate, or the running rate of a window that no
    /// completed frame has closed yet, so an idle stream decays to zero
    fn current_rate(&self) -> f64 {
        let elapsed = self.started.elapsed();
        if elapsed < RATE_WINDOW {
            self.rate_hz
        } else {
            self.frames as f64 / elapsed.as_secs_f64()
        }
    }
}

/// State shared between submitters, the worker and status readers
struct Shared {
    slot: AtomicCell<Option<Box<Frame>>>,
    running: AtomicBool,
    busy: AtomicBool,
    epoch: AtomicU64,
    last_admitted: Mutex<Option<u64>>,
    /// Frames placed in the slot
    admitted: AtomicU64,
    /// Admitted frames that were processed, replaced or discarded
    settled: AtomicU64,
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    frames_stale: AtomicU64,
    recoverable_errors: AtomicU64,
    rate: Mutex<RateWindow>,
    fatal: Mutex<Option<DropletError>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Empty the slot, accounting for the discarded frame
    fn discard_pending(&self) {
        if self.slot.take().is_some() {
            self.settled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct Scheduler<P: FrameProcessor> {
    processor: Arc<Mutex<P>>,
    shared: Arc<Shared>,
    unparker: Mutex<Option<Unparker>>,
}

impl<P: FrameProcessor> Scheduler<P> {
    pub fn new(processor: Arc<Mutex<P>>) -> Self {
        Self {
            processor,
            shared: Arc::new(Shared {
                slot: AtomicCell::new(None),
                running: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                last_admitted: Mutex::new(None),
                admitted: AtomicU64::new(0),
                settled: AtomicU64::new(0),
                frames_processed: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                frames_stale: AtomicU64::new(0),
                recoverable_errors: AtomicU64::new(0),
                rate: Mutex::new(RateWindow::new()),
                fatal: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            unparker: Mutex::new(None),
        }
    }

    pub fn processor(&self) -> &Arc<Mutex<P>> {
        &self.processor
    }

    /// Spawn a worker and begin admitting frames
    pub fn start(&self) -> Result<()> {
        let mut unparker = self.unparker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(DropletError::AlreadyRunning);
        }

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.discard_pending();
        *self.shared.fatal.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.shared.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.shared.rate.lock().unwrap_or_else(PoisonError::into_inner) = RateWindow::new();

        let parker = Parker::new();
        *unparker = Some(parker.unparker().clone());
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let processor = Arc::clone(&self.processor);
        thread::Builder::new()
            .name("droplet-scheduler".into())
            .spawn(move || worker_loop(shared, processor, parker, epoch))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                DropletError::internal(format!("failed to spawn scheduler worker: {}", e))
            })?;

        log::info!("Scheduler started (epoch {})", epoch);
        Ok(())
    }

    /// Stop admitting frames and drop any pending one. Idempotent, never blocks
    /// on the in-flight pass.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        self.shared.discard_pending();
        self.shared.rate.lock().unwrap_or_else(PoisonError::into_inner).rate_hz = 0.0;

        if let Some(unparker) = self
            .unparker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            unparker.unpark();
        }

        if was_running {
            log::info!(
                "Scheduler stopped: {} processed, {} dropped",
                self.shared.frames_processed.load(Ordering::SeqCst),
                self.shared.frames_dropped.load(Ordering::SeqCst)
            );
        }
    }

    /// Offer a frame for processing (non-blocking)
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        if !self.shared.running.load(Ordering::SeqCst) {
            return SubmitOutcome::Stopped;
        }
        self.admit(frame)
    }

    /// Place a frame into the slot. A `stop` may land between the running
    /// check in `submit` and the swap; the frame is then taken back out.
    fn admit(&self, frame: Frame) -> SubmitOutcome {
        let frame_id = frame.frame_id;
        let previous = {
            let mut last = self
                .shared
                .last_admitted
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(last_id) = *last {
                if frame_id <= last_id {
                    self.shared.frames_stale.fetch_add(1, Ordering::SeqCst);
                    log::warn!(
                        "Rejecting stale frame {} (last admitted {})",
                        frame_id,
                        last_id
                    );
                    return SubmitOutcome::Stale;
                }
            }
            *last = Some(frame_id);
            self.shared.admitted.fetch_add(1, Ordering::SeqCst);
            self.shared.slot.swap(Some(Box::new(frame)))
        };

        if let Some(unparker) = self
            .unparker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            unparker.unpark();
        }

        let outcome = match previous {
            Some(dropped) => {
                self.shared.frames_dropped.fetch_add(1, Ordering::SeqCst);
                self.shared.settled.fetch_add(1, Ordering::SeqCst);
                log::debug!("Frame {} replaced pending frame {}", frame_id, dropped.frame_id);
                SubmitOutcome::Replaced {
                    dropped_frame_id: dropped.frame_id,
                }
            }
            None => SubmitOutcome::Accepted,
        };

        if !self.shared.running.load(Ordering::SeqCst) {
            self.shared.discard_pending();
            log::debug!("Frame {} arrived during stop, discarded", frame_id);
            return SubmitOutcome::Stopped;
        }
        outcome
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        if self.shared.busy.load(Ordering::SeqCst) {
            SchedulerState::Busy
        } else {
            SchedulerState::Idle
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let running = self.is_running();
        let rate = self.shared.rate.lock().unwrap_or_else(PoisonError::into_inner);
        SchedulerStats {
            running,
            state: self.state(),
            frames_processed: self.shared.frames_processed.load(Ordering::SeqCst),
            frames_dropped: self.shared.frames_dropped.load(Ordering::SeqCst),
            frames_stale: self.shared.frames_stale.load(Ordering::SeqCst),
            recoverable_errors: self.shared.recoverable_errors.load(Ordering::SeqCst),
            processing_rate_hz: if running { rate.current_rate() } else { 0.0 },
            last_error: self.last_error(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The error that halted scheduling, if any; subsequent calls return `None`
    pub fn take_fatal_error(&self) -> Option<DropletError> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Zero the counters and forget the frame id history
    pub fn reset_counters(&self) {
        self.shared.frames_processed.store(0, Ordering::SeqCst);
        self.shared.frames_dropped.store(0, Ordering::SeqCst);
        self.shared.frames_stale.store(0, Ordering::SeqCst);
        self.shared.recoverable_errors.store(0, Ordering::SeqCst);
        *self
            .shared
            .last_admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        *self.shared.rate.lock().unwrap_or_else(PoisonError::into_inner) = RateWindow::new();
    }

    /// Wait until no frame is pending or in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let settled = self.shared.settled.load(Ordering::SeqCst);
            if settled >= self.shared.admitted.load(Ordering::SeqCst) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl<P: FrameProcessor> Drop for Scheduler<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<P: FrameProcessor>(
    shared: Arc<Shared>,
    processor: Arc<Mutex<P>>,
    parker: Parker,
    epoch: u64,
) {
    log::debug!("Scheduler worker {} started", epoch);

    while shared.is_current(epoch) {
        let frame = match shared.slot.take() {
            Some(frame) => frame,
            None => {
                parker.park();
                continue;
            }
        };

        shared.busy.store(true, Ordering::SeqCst);
        let keep_running = run_pass(&shared, &processor, *frame, epoch);
        shared.busy.store(false, Ordering::SeqCst);
        shared.settled.fetch_add(1, Ordering::SeqCst);

        if !keep_running {
            break;
        }
    }

    log::debug!("Scheduler worker {} exited", epoch);
}

/// One pipeline pass. Returns false when scheduling must halt.
fn run_pass<P: FrameProcessor>(
    shared: &Shared,
    processor: &Mutex<P>,
    frame: Frame,
    epoch: u64,
) -> bool {
    let frame_id = frame.frame_id;
    let mut processor = processor.lock().unwrap_or_else(PoisonError::into_inner);

    // Stopped while waiting for a previous worker's pass to finish
    if !shared.is_current(epoch) {
        return false;
    }

    let result = processor.process(frame);

    if !shared.is_current(epoch) {
        log::debug!("Discarding result of frame {} after stop", frame_id);
        return false;
    }

    match result {
        Ok(output) => {
            processor.publish(output);
            let processed = shared.frames_processed.fetch_add(1, Ordering::SeqCst) + 1;
            shared
                .rate
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .tick();

            if processed % 100 == 0 {
                log::info!(
                    "Scheduler: {} processed, {} dropped",
                    processed,
                    shared.frames_dropped.load(Ordering::SeqCst)
                );
            }
            true
        }
        Err(e) if e.is_recoverable() => {
            log::warn!("Recoverable error on frame {}: {}", frame_id, e);
            processor.recover(frame_id, &e);
            shared.recoverable_errors.fetch_add(1, Ordering::SeqCst);
            shared.frames_processed.fetch_add(1, Ordering::SeqCst);
            true
        }
        Err(e) => {
            log::error!("Fatal error on frame {}, halting scheduler: {}", frame_id, e);
            *shared.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
            *shared.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
            // Only halt the scheduler instance this worker belongs to
            if shared.epoch.load(Ordering::SeqCst) == epoch {
                shared.running.store(false, Ordering::SeqCst);
                shared.discard_pending();
            }
            false
        }
    }
}
