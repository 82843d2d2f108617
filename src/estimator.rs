//! Worker thread driving the localization pipeline from a queue of audio
//! frames.
//!
//! Producers push hardware frames through a [`FrameSink`]. The worker wakes
//! every poll interval, takes one frame off the queue and pairs consecutive
//! frames into a doubled frame which runs through [`Pipeline::process`]. The
//! resulting target is turned into a [`GeometrySnapshot`] with steering
//! information and swapped in for readers.
//!
//! Events are delivered over channels returned by [`Estimator::subscribe`].
//! They are sent from the worker thread, except [`EstimatorState::Starting`]
//! which is sent by [`Estimator::start`]; after [`Estimator::stop`] returned
//! no further events are sent.
use std::any::Any;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use derive_more::Display;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::calibration::CalibrationSource;
use crate::channel::ChannelSelector;
use crate::config::EstimatorConfig;
use crate::dynamics::DampedVelocity;
use crate::gcc::DelayAnalysis;
use crate::geometry::{GeometryProvider, GeometrySnapshot, SnapshotCache, SubArray};
use crate::localize::Localizer;
use crate::particle::{GaussianLikelihood, ParticleFilter};
use crate::plausibility::PlausibilityChecker;
use crate::steering::{self, SteeringComputer, SteeringResult};
use crate::utils::{is_finite, mean};
use crate::{Audio, Error, Position, Result, F};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum EstimatorState {
    #[display(fmt = "stopped")]
    Stopped,
    #[display(fmt = "starting")]
    Starting,
    #[display(fmt = "running")]
    Running,
    /// A cycle failed, the worker backs off before resuming.
    #[display(fmt = "recovering")]
    Recovering,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EstimatorEvent {
    StateChanged(EstimatorState),
    /// `false` after a failed cycle, `true` once processing resumed.
    Connection(bool),
    /// A new snapshot was published.
    GeometryChanged(Arc<GeometrySnapshot>),
}

/// A hardware frame tagged with its capture position.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    pub sequence: u64,
    pub audio: Audio,
}

/// Cloneable producer handle of the estimator's frame queue.
#[derive(Clone, Debug)]
pub struct FrameSink {
    sender: Sender<AudioFrame>,
    next_sequence: Arc<AtomicU64>,
}

impl FrameSink {
    /// Queues `audio` as the successor of the previously added frame.
    ///
    /// Returns `false` if the estimator is gone.
    pub fn add_audio_frame(&self, audio: Audio) -> bool {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.add_captured_frame(sequence, audio)
    }

    /// Queues `audio` with an explicit capture sequence number, for producers
    /// that count frames themselves. Only frames with adjacent numbers are
    /// paired.
    pub fn add_captured_frame(&self, sequence: u64, audio: Audio) -> bool {
        self.sender.send(AudioFrame { sequence, audio }).is_ok()
    }

    /// Frames waiting in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Receiving end of an event subscription.
///
/// Delivery ends when it is dropped or passed to [`Estimator::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: Receiver<EstimatorEvent>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Deref for Subscription {
    type Target = Receiver<EstimatorEvent>;

    fn deref(&self) -> &Self::Target {
        &self.receiver
    }
}

#[derive(Debug, Default)]
struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Sender<EstimatorEvent>)>>,
}

impl EventBus {
    fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push((id, sender));
        Subscription { id, receiver }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(other, _)| *other != id);
    }

    fn publish(&self, event: &EstimatorEvent) {
        self.subscribers
            .lock()
            .retain(|(_, sender)| sender.send(event.clone()).is_ok());
    }
}

#[derive(Debug)]
struct Controls {
    auto_mode: bool,
    manual_target: Option<Position>,
}

/// State shared between the owning [`Estimator`] and its worker.
struct Shared {
    config: EstimatorConfig,
    provider: Arc<dyn GeometryProvider>,
    calibration: RwLock<Option<Arc<dyn CalibrationSource>>>,
    snapshot: RwLock<Arc<GeometrySnapshot>>,
    cache: Mutex<SnapshotCache>,
    steering: Mutex<SteeringComputer>,
    controls: Mutex<Controls>,
    state: Mutex<EstimatorState>,
    events: EventBus,
}

impl Shared {
    fn set_state(&self, state: EstimatorState) {
        let changed = {
            let mut current = self.state.lock();
            std::mem::replace(&mut *current, state) != state
        };
        if changed {
            debug!("estimator {state}");
            self.events.publish(&EstimatorEvent::StateChanged(state));
        }
    }

    /// Target steering should point at right now.
    fn steering_target(&self, estimated: Position) -> Position {
        let controls = self.controls.lock();
        match (controls.auto_mode, controls.manual_target) {
            (false, Some(target)) => target,
            _ => estimated,
        }
    }

    /// Rebuilds and swaps in the snapshot if target or hardware changed.
    fn publish(&self, target: Position) {
        let hardware = self.provider.current();
        // steering stays locked until the rebuilt snapshot is cached
        let steering = self.steering.lock();
        let (snapshot, rebuilt) = self
            .cache
            .lock()
            .get_or_rebuild(hardware, target, |s| steering.apply(s));
        if rebuilt {
            *self.snapshot.write() = Arc::clone(&snapshot);
            self.events
                .publish(&EstimatorEvent::GeometryChanged(snapshot));
        }
    }
}

/// Synchronous localization chain for one doubled frame.
///
/// Owned by the worker thread of an [`Estimator`], usable on its own for
/// offline processing.
pub struct Pipeline {
    config: EstimatorConfig,
    selector: ChannelSelector,
    gcc: DelayAnalysis,
    localizer: Localizer,
    checker: PlausibilityChecker,
    filter: Option<ParticleFilter<3, DampedVelocity>>,
    rng: StdRng,
    target: Position,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: &EstimatorConfig) -> Self {
        let mut rng = match config.tracking.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let filter = config.tracking.enabled.then(|| {
            ParticleFilter::uniform(
                DampedVelocity::from_config(config),
                config.tracking.particles.max(1),
                &config.room.min,
                &config.room.max,
                &mut rng,
            )
            .with_resample_divisor(config.tracking.resample_divisor)
            .with_reevaluation(config.tracking.reevaluate_after_dispersal)
        });
        Self {
            selector: ChannelSelector::from_config(config),
            gcc: DelayAnalysis::from_config(config),
            localizer: Localizer::from_config(config),
            checker: PlausibilityChecker::from_config(config),
            filter,
            rng,
            target: config.room.clamp(&config.initial_target),
            config: config.clone(),
        }
    }

    /// Continues from `target` instead of the configured start point.
    #[must_use]
    pub fn with_target(mut self, target: Position) -> Self {
        self.target = self.config.room.clamp(&target);
        self
    }

    /// Current tracked target.
    #[must_use]
    pub fn target(&self) -> Position {
        self.target
    }

    /// Raw localization candidate of `sub_array`, `None` when there were not
    /// enough channels or the system was degenerate.
    ///
    /// # Errors
    /// [`Error::InvalidFrameShape`] for malformed frames.
    pub fn localize(
        &mut self,
        frame: &Audio,
        geometry: &GeometrySnapshot,
        sub_array: SubArray,
    ) -> Result<Option<Position>> {
        let channels = self.selector.select(frame, geometry, sub_array)?;
        let Some(reference) = self.selector.reference(sub_array, &channels) else {
            return Ok(None);
        };
        let delays = self.gcc.estimate(reference, &channels, reference.mic_id);
        if delays.is_empty() {
            return Ok(None);
        }
        Ok(self.localizer.solve(
            &reference.position,
            reference.mic_id,
            &delays,
            &geometry.positions,
            sub_array,
        ))
    }

    /// Runs one full cycle and returns the new target. Without a plausible
    /// candidate the previous target is kept.
    ///
    /// # Errors
    /// [`Error::InvalidFrameShape`] for malformed frames.
    pub fn process(&mut self, frame: &Audio, geometry: &GeometrySnapshot) -> Result<Position> {
        let mut measurements = Vec::with_capacity(SubArray::ALL.len());
        for sub_array in SubArray::ALL {
            if geometry.active_in(sub_array).next().is_none() {
                continue;
            }
            self.checker.set_array(
                sub_array,
                geometry.centroid(sub_array),
                self.config.sub_array(sub_array).facing,
            );
            let candidate = self.localize(frame, geometry, sub_array)?;
            let checked = self.checker.check(sub_array, candidate);
            debug!("{sub_array}: candidate {candidate:?} -> {checked:?}");
            if checked.is_measurement() {
                measurements.push(checked.point());
            }
        }

        let Some(observed) = mean(&measurements) else {
            debug!("no plausible candidate, keeping target {:?}", self.target);
            return Ok(self.target);
        };
        let tracked = match &mut self.filter {
            Some(filter) => filter.step(
                &GaussianLikelihood::new(observed, self.config.tracking.measurement_sigma),
                self.config.tracking.spread,
                &mut self.rng,
            ),
            None => observed,
        };
        if is_finite(&tracked) {
            self.target = self.config.room.clamp(&tracked);
        }
        Ok(self.target)
    }

    /// Frees the GCC buffers, they are rebuilt on the next cycle.
    pub fn release(&mut self) {
        self.gcc.release();
    }
}

enum Control {
    Stop,
}

struct Worker {
    shared: Arc<Shared>,
    frames: Receiver<AudioFrame>,
    control: Receiver<Control>,
    pipeline: Pipeline,
    pending: Option<(AudioFrame, Instant)>,
    backlogged: bool,
}

impl Worker {
    fn run(mut self) {
        let stale = self.frames.try_iter().count();
        if stale > 0 {
            debug!("dropped {stale} frames queued before start");
        }
        self.shared.set_state(EstimatorState::Running);
        let poll_interval = self.shared.config.poll_interval();
        loop {
            match self.control.recv_timeout(poll_interval) {
                Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.tick()));
            let fault = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(Error::WorkerFault(panic_message(&*panic))),
            };
            if let Some(fault) = fault {
                if !self.recover(&fault) {
                    break;
                }
                continue;
            }
            let elapsed = started.elapsed();
            if elapsed > poll_interval {
                warn!(
                    "processing took {elapsed:?}, over the poll interval of {poll_interval:?}"
                );
            }
        }
        self.pipeline.release();
        self.shared.set_state(EstimatorState::Stopped);
        info!("estimator worker exiting");
    }

    /// Logs `fault` and backs off. Returns `false` if a stop was requested
    /// meanwhile.
    fn recover(&mut self, fault: &Error) -> bool {
        error!("estimator cycle failed: {fault}");
        self.pending = None;
        self.shared.set_state(EstimatorState::Recovering);
        self.shared.events.publish(&EstimatorEvent::Connection(false));
        match self.control.recv_timeout(self.shared.config.fault_backoff()) {
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => false,
            Err(RecvTimeoutError::Timeout) => {
                self.shared.set_state(EstimatorState::Running);
                self.shared.events.publish(&EstimatorEvent::Connection(true));
                true
            }
        }
    }

    fn tick(&mut self) -> Result<()> {
        self.check_backlog();
        let auto_mode = self.shared.controls.lock().auto_mode;
        match self.frames.try_recv() {
            Ok(frame) => {
                if let Some(calibration) = &*self.shared.calibration.read() {
                    calibration.observe(&frame.audio);
                }
                if auto_mode {
                    self.accept(frame)?;
                } else {
                    self.pending = None;
                }
            }
            Err(_) => self.expire_pending(),
        }
        self.shared
            .publish(self.shared.steering_target(self.pipeline.target()));
        Ok(())
    }

    /// Pairs `frame` with the pending half and processes the doubled frame.
    fn accept(&mut self, frame: AudioFrame) -> Result<()> {
        let config = &self.shared.config;
        let expected = (config.channel_count, config.frame_size);
        if frame.audio.shape() != expected {
            warn!(
                "{}",
                Error::InvalidFrameShape {
                    expected,
                    found: frame.audio.shape()
                }
            );
            self.pending = None;
            return Ok(());
        }
        let first = match self.pending.take() {
            Some((first, _)) if first.sequence.wrapping_add(1) == frame.sequence => first,
            Some((first, _)) => {
                debug!(
                    "frame {} does not follow {}, dropping the older half",
                    frame.sequence, first.sequence
                );
                self.pending = Some((frame, Instant::now()));
                return Ok(());
            }
            None => {
                self.pending = Some((frame, Instant::now()));
                return Ok(());
            }
        };
        let doubled = first.audio.concat(&frame.audio)?;
        let hardware = self.shared.provider.current();
        let geometry = GeometrySnapshot::new(hardware, self.pipeline.target());
        match self.pipeline.process(&doubled, &geometry) {
            Ok(target) => debug!("target {target:?}"),
            Err(e @ Error::InvalidFrameShape { .. }) => warn!("{e}"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn expire_pending(&mut self) {
        if let Some((frame, since)) = &self.pending {
            if since.elapsed() > self.shared.config.pair_timeout() {
                debug!(
                    "no successor for frame {} after {:?}, dropping it",
                    frame.sequence,
                    since.elapsed()
                );
                self.pending = None;
            }
        }
    }

    fn check_backlog(&mut self) {
        let queued = self.frames.len();
        let limit = self.shared.config.backlog_warning;
        if queued > limit && !self.backlogged {
            warn!("{queued} frames queued, processing is falling behind");
            self.backlogged = true;
        } else if queued <= limit && self.backlogged {
            info!("frame backlog cleared");
            self.backlogged = false;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Owner of the worker thread and entry point of the control surface.
pub struct Estimator {
    shared: Arc<Shared>,
    frames: (Sender<AudioFrame>, Receiver<AudioFrame>),
    next_sequence: Arc<AtomicU64>,
    worker: Option<(JoinHandle<()>, Sender<Control>)>,
}

impl Estimator {
    /// Creates a stopped estimator and publishes an initial snapshot towards
    /// the configured start target.
    #[must_use]
    pub fn new(config: EstimatorConfig, provider: Arc<dyn GeometryProvider>) -> Self {
        let target = config.room.clamp(&config.initial_target);
        let steering = SteeringComputer::from_config(&config);
        let mut cache = SnapshotCache::default();
        let (snapshot, _) = cache.get_or_rebuild(provider.current(), target, |s| steering.apply(s));
        let auto_mode = config.auto_mode;
        Self {
            shared: Arc::new(Shared {
                config,
                provider,
                calibration: RwLock::new(None),
                snapshot: RwLock::new(snapshot),
                cache: Mutex::new(cache),
                steering: Mutex::new(steering),
                controls: Mutex::new(Controls {
                    auto_mode,
                    manual_target: None,
                }),
                state: Mutex::new(EstimatorState::Stopped),
                events: EventBus::default(),
            }),
            frames: unbounded(),
            next_sequence: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    /// Delegates [`Estimator::calibrate`] to `source`, which also sees every
    /// frame taken off the queue.
    #[must_use]
    pub fn with_calibration(self, source: Arc<dyn CalibrationSource>) -> Self {
        self.set_calibration_source(Some(source));
        self
    }

    pub fn set_calibration_source(&self, source: Option<Arc<dyn CalibrationSource>>) {
        *self.shared.calibration.write() = source;
    }

    #[must_use]
    pub fn config(&self) -> &EstimatorConfig {
        &self.shared.config
    }

    /// Spawns the worker thread.
    ///
    /// # Errors
    /// [`Error::AlreadyRunning`] or [`Error::Spawn`].
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.shared.set_state(EstimatorState::Starting);
        let (control_tx, control_rx) = unbounded();
        let shared = Arc::clone(&self.shared);
        let frames = self.frames.1.clone();
        let handle = thread::Builder::new()
            .name("doa-estimator".into())
            .spawn(move || {
                let pipeline =
                    Pipeline::new(&shared.config).with_target(shared.snapshot.read().target);
                Worker {
                    shared,
                    frames,
                    control: control_rx,
                    pipeline,
                    pending: None,
                    backlogged: false,
                }
                .run();
            })
            .map_err(|e| {
                self.shared.set_state(EstimatorState::Stopped);
                Error::Spawn(e)
            })?;
        info!("estimator started");
        self.worker = Some((handle, control_tx));
        Ok(())
    }

    /// Signals the worker, interrupts its wait and joins it. A stopped
    /// estimator sends no further events.
    ///
    /// # Errors
    /// [`Error::WorkerPanicked`] if the worker thread died.
    pub fn stop(&mut self) -> Result<()> {
        let Some((handle, control)) = self.worker.take() else {
            return Ok(());
        };
        // the worker may already be gone, join reports that
        _ = control.send(Control::Stop);
        let joined = handle.join();
        *self.shared.state.lock() = EstimatorState::Stopped;
        info!("estimator stopped");
        joined.map_err(|_| Error::WorkerPanicked)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    #[must_use]
    pub fn state(&self) -> EstimatorState {
        *self.shared.state.lock()
    }

    #[must_use]
    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            sender: self.frames.0.clone(),
            next_sequence: Arc::clone(&self.next_sequence),
        }
    }

    /// Shorthand for [`FrameSink::add_audio_frame`].
    pub fn add_audio_frame(&self, audio: Audio) {
        self.frame_sink().add_audio_frame(audio);
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.shared.events.unsubscribe(subscription.id);
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<GeometrySnapshot> {
        Arc::clone(&self.shared.snapshot.read())
    }

    #[must_use]
    pub fn steering(&self) -> Vec<SteeringResult> {
        steering::from_snapshot(&self.snapshot())
    }

    /// Disabling auto mode pins the current target until
    /// [`Estimator::set_target_source`] moves it.
    pub fn set_auto_mode(&self, auto_mode: bool) {
        let current = self.snapshot().target;
        let mut controls = self.shared.controls.lock();
        if controls.auto_mode != auto_mode {
            info!("auto mode {}", if auto_mode { "on" } else { "off" });
        }
        controls.auto_mode = auto_mode;
        if auto_mode {
            controls.manual_target = None;
        } else if controls.manual_target.is_none() {
            controls.manual_target = Some(current);
        }
    }

    #[must_use]
    pub fn is_auto_mode(&self) -> bool {
        self.shared.controls.lock().auto_mode
    }

    /// `None` returns to automatic tracking. A point pins the steering target
    /// (clamped into the room) while auto mode is off and is ignored while it
    /// is on.
    pub fn set_target_source(&self, target: Option<Position>) {
        let mut controls = self.shared.controls.lock();
        match target {
            None => {
                controls.auto_mode = true;
                controls.manual_target = None;
            }
            Some(target) if controls.auto_mode => {
                debug!("ignoring manual target {target:?} while auto mode is on");
            }
            Some(target) => {
                controls.manual_target = Some(self.shared.config.room.clamp(&target));
            }
        }
    }

    /// The pinned target in manual mode, the tracked one otherwise.
    #[must_use]
    pub fn target_source(&self) -> Position {
        let estimated = self.snapshot().target;
        self.shared.steering_target(estimated)
    }

    /// Runs the device calibration and applies the gains to steering.
    ///
    /// # Errors
    /// [`Error::CalibrationNotReady`] if no calibration source is installed
    /// or it has not seen enough audio.
    pub fn calibrate(&self) -> Result<Vec<F>> {
        let source = self
            .shared
            .calibration
            .read()
            .clone()
            .ok_or(Error::CalibrationNotReady {
                collected: 0,
                needed: 1,
            })?;
        let gains = source.calibrate()?;
        info!("calibrated gains {gains:?}");
        let mut steering = self.shared.steering.lock();
        steering.set_calibration(Some(gains.clone()));
        self.shared.cache.lock().invalidate();
        drop(steering);
        Ok(gains)
    }
}

impl Drop for Estimator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("failed to stop estimator: {e}");
        }
    }
}

impl std::fmt::Debug for Estimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Estimator")
            .field("state", &self.state())
            .field("auto_mode", &self.is_auto_mode())
            .field("target", &self.target_source())
            .finish_non_exhaustive()
    }
}
