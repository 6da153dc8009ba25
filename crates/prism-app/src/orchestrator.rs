//! Background frame loop.
//!
//! The loop thread owns the tick sequence; the GPU side of each step is
//! delegated to a [`FrameBackend`]. Status lives behind a mutex plus condvar
//! so controllers block on state changes instead of polling.
//!
//! States: `Stopped → Idle ⇄ Running → Stopped`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use prism_core::constants::FRAMES_IN_FLIGHT;

use crate::config::LoopConfig;
use crate::error::FrameError;
use crate::slots::FrameRing;

const THREAD_NAME: &str = "prism-frame-loop";

/// Frame loop state as seen by controllers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Idle,
    Running,
}

/// GPU half of the frame loop.
///
/// Methods run on the loop thread in tick order, except
/// [`FrameBackend::wait_device_idle`], which controllers call while the loop
/// is idle.
pub trait FrameBackend: Send + 'static {
    /// Wait for the slot's previous submission, bounded by `timeout`.
    fn wait_slot(&mut self, slot: usize, timeout: Duration) -> Result<(), FrameError>;

    /// Acquire the next presentable image. `None` skips the tick.
    fn acquire(&mut self, slot: usize) -> Result<Option<u32>, FrameError>;

    /// Reset the slot's fence. Only called after a successful acquire.
    fn reset_slot(&mut self, slot: usize) -> Result<(), FrameError>;

    /// Reset and record the slot's command buffer for `image`.
    ///
    /// On failure the backend must leave the slot fence signaled again, since
    /// submit will not run for this tick.
    fn record(&mut self, slot: usize, image: u32) -> Result<(), FrameError>;

    fn submit(&mut self, slot: usize) -> Result<(), FrameError>;

    fn present(&mut self, slot: usize, image: u32) -> Result<(), FrameError>;

    fn wait_device_idle(&mut self) -> Result<(), FrameError>;

    /// Rebuild size-dependent resources for a `width` x `height` surface.
    /// Only called while the loop is paused and the device idle.
    fn resize(&mut self, width: u32, height: u32) -> Result<(), FrameError>;
}

/// Result of one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Presented,
    Skipped,
}

/// Run one frame on `slot`.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub fn tick<B: FrameBackend + ?Sized>(
    backend: &mut B,
    slot: usize,
    config: &LoopConfig,
) -> Result<TickOutcome, FrameError> {
    backend.wait_slot(slot, config.fence_timeout)?;

    let image = match backend.acquire(slot) {
        Ok(Some(image)) => image,
        Ok(None) => return Ok(TickOutcome::Skipped),
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            tracing::debug!("Acquire failed, skipping frame: {e}");
            return Ok(TickOutcome::Skipped);
        }
    };

    backend.reset_slot(slot)?;
    backend.record(slot, image)?;
    backend.submit(slot)?;

    match backend.present(slot, image) {
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::debug!("Present failed, retrying next frame: {e}");
            Ok(TickOutcome::Presented)
        }
        Ok(()) => Ok(TickOutcome::Presented),
    }
}

#[derive(Debug)]
struct LoopStatus {
    state: LoopState,
    active: bool,
    exit: bool,
    error: Option<FrameError>,
    frames: u64,
}

struct Shared {
    status: Mutex<LoopStatus>,
    changed: Condvar,
}

impl Shared {
    /// Block until the loop should tick. Returns `false` on exit.
    fn wait_for_work(&self) -> bool {
        let mut status = self.status.lock();
        loop {
            if status.exit {
                status.state = LoopState::Stopped;
                self.changed.notify_all();
                return false;
            }
            if status.active {
                if status.state != LoopState::Running {
                    status.state = LoopState::Running;
                    tracing::debug!("Frame loop running");
                    self.changed.notify_all();
                }
                return true;
            }
            if status.state != LoopState::Idle {
                status.state = LoopState::Idle;
                tracing::debug!("Frame loop idle");
                self.changed.notify_all();
            }
            self.changed.wait(&mut status);
        }
    }

    fn stop_with(&self, error: FrameError) {
        let mut status = self.status.lock();
        status.error = Some(error);
        status.state = LoopState::Stopped;
        status.active = false;
        self.changed.notify_all();
    }
}

/// Sleeps to hold the tick rate at or below the target.
struct Pacer {
    frame_time: Option<Duration>,
    last: Option<Instant>,
}

impl Pacer {
    const fn new(frame_time: Option<Duration>) -> Self {
        Self {
            frame_time,
            last: None,
        }
    }

    fn wait(&mut self) {
        if let (Some(frame_time), Some(last)) = (self.frame_time, self.last) {
            let elapsed = last.elapsed();
            if elapsed < frame_time {
                thread::sleep(frame_time - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

fn run<B: FrameBackend>(shared: &Shared, backend: &Mutex<B>, config: &LoopConfig) {
    let mut ring = FrameRing::new(FRAMES_IN_FLIGHT);
    let mut pacer = Pacer::new(config.frame_time());

    while shared.wait_for_work() {
        pacer.wait();
        let slot = ring.advance();
        let result = tick(&mut *backend.lock(), slot, config);
        match result {
            Ok(TickOutcome::Presented) => shared.status.lock().frames += 1,
            Ok(TickOutcome::Skipped) => tracing::trace!("Frame {} skipped", ring.frame()),
            Err(e) if e.is_fatal() => {
                tracing::error!("Frame loop stopped: {e}");
                shared.stop_with(e);
                return;
            }
            Err(e) => tracing::warn!("Frame {} failed: {e}", ring.frame()),
        }
    }
    tracing::debug!("Frame loop exited after {} frames", ring.frame());
}

/// Handle to the background frame loop.
pub struct FrameLoop<B: FrameBackend> {
    shared: Arc<Shared>,
    backend: Arc<Mutex<B>>,
    thread: Option<JoinHandle<()>>,
    idle_timeout: Duration,
}

impl<B: FrameBackend> FrameLoop<B> {
    /// Spawn the loop thread. The loop starts `Idle`.
    pub fn start(backend: B, config: LoopConfig) -> Result<Self, FrameError> {
        let shared = Arc::new(Shared {
            status: Mutex::new(LoopStatus {
                state: LoopState::Idle,
                active: false,
                exit: false,
                error: None,
                frames: 0,
            }),
            changed: Condvar::new(),
        });
        let backend = Arc::new(Mutex::new(backend));
        // An in-flight tick may itself wait a full fence timeout
        let idle_timeout = config.fence_timeout.saturating_mul(2);

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                let backend = Arc::clone(&backend);
                move || run(&shared, &backend, &config)
            })
            .map_err(FrameError::Spawn)?;
        tracing::info!("Frame loop started");

        Ok(Self {
            shared,
            backend,
            thread: Some(thread),
            idle_timeout,
        })
    }

    pub fn state(&self) -> LoopState {
        self.shared.status.lock().state
    }

    /// Toggle `Idle ⇄ Running`. Ignored once stopped.
    pub fn set_active(&self, active: bool) {
        let mut status = self.shared.status.lock();
        if status.state == LoopState::Stopped || status.exit {
            tracing::debug!("Frame loop is stopped, ignoring set_active({active})");
            return;
        }
        status.active = active;
        self.shared.changed.notify_all();
    }

    pub fn is_active(&self) -> bool {
        self.shared.status.lock().active
    }

    /// Frames presented so far.
    pub fn frames(&self) -> u64 {
        self.shared.status.lock().frames
    }

    /// Block until the loop is `Idle` or `Stopped`, then wait for the device.
    ///
    /// The loop must have been deactivated first; [`FrameLoop::pause`] does
    /// both.
    pub fn wait_idle(&self, timeout: Duration) -> Result<(), FrameError> {
        let deadline = Instant::now() + timeout;
        {
            let mut status = self.shared.status.lock();
            while status.state == LoopState::Running {
                if self
                    .shared
                    .changed
                    .wait_until(&mut status, deadline)
                    .timed_out()
                {
                    return Err(FrameError::IdleTimeout(timeout));
                }
            }
        }
        self.backend.lock().wait_device_idle()
    }

    /// Deactivate the loop and wait for the device. Activity is restored
    /// when the guard drops, including on error paths.
    pub fn pause(&self) -> Result<PauseGuard<'_, B>, FrameError> {
        let resume = {
            let mut status = self.shared.status.lock();
            let previous = status.active;
            status.active = false;
            self.shared.changed.notify_all();
            previous
        };
        let guard = PauseGuard {
            frame_loop: self,
            resume,
        };
        self.wait_idle(self.idle_timeout)?;
        Ok(guard)
    }

    /// Rebuild the backend's size-dependent resources inside the pause
    /// bracket, so queries made after this returns see the new size.
    pub fn resize(&self, width: u32, height: u32) -> Result<(), FrameError> {
        let _pause = self.pause()?;
        self.backend.lock().resize(width, height)
    }

    /// Shared backend. Lock it only while the loop is paused to avoid
    /// stalling a tick.
    pub fn backend(&self) -> &Arc<Mutex<B>> {
        &self.backend
    }

    /// The error that stopped the loop, if any.
    pub fn take_error(&self) -> Option<FrameError> {
        self.shared.status.lock().error.take()
    }

    /// Stop the loop and join its thread. Safe to call more than once.
    pub fn exit_loop(&mut self) {
        {
            let mut status = self.shared.status.lock();
            status.exit = true;
            status.active = false;
            self.shared.changed.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Frame loop thread panicked");
            }
            tracing::info!("Frame loop stopped");
        }
        self.shared.status.lock().state = LoopState::Stopped;
    }
}

impl<B: FrameBackend> Drop for FrameLoop<B> {
    fn drop(&mut self) {
        self.exit_loop();
    }
}

/// Pause bracket returned by [`FrameLoop::pause`].
#[must_use = "the loop resumes as soon as the guard is dropped"]
pub struct PauseGuard<'a, B: FrameBackend> {
    frame_loop: &'a FrameLoop<B>,
    resume: bool,
}

impl<B: FrameBackend> PauseGuard<'_, B> {
    /// Whether the loop will be reactivated on drop.
    pub const fn resumes(&self) -> bool {
        self.resume
    }
}

impl<B: FrameBackend> Drop for PauseGuard<'_, B> {
    fn drop(&mut self) {
        if self.resume {
            self.frame_loop.set_active(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        DeviceIdle,
        Resize(u32, u32),
    }

    #[derive(Default)]
    struct MockBackend {
        calls: Arc<Mutex<Vec<Call>>>,
        acquire_nothing: bool,
        hang_on_wait: Option<usize>,
        fail_present: bool,
        waits: usize,
        extent: (u32, u32),
    }

    impl MockBackend {
        fn log(&self, call: Call) {
            self.calls.lock().push(call);
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_slot(&mut self, slot: usize, timeout: Duration) -> Result<(), FrameError> {
            self.log(Call::Wait(slot));
            self.waits += 1;
            if self.hang_on_wait == Some(self.waits) {
                return Err(FrameError::DeviceHang { slot, timeout });
            }
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> Result<Option<u32>, FrameError> {
            self.log(Call::Acquire(slot));
            Ok((!self.acquire_nothing).then_some(slot as u32 + 10))
        }

        fn reset_slot(&mut self, slot: usize) -> Result<(), FrameError> {
            self.log(Call::Reset(slot));
            Ok(())
        }

        fn record(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
            self.log(Call::Record(slot, image));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<(), FrameError> {
            self.log(Call::Submit(slot));
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
            self.log(Call::Present(slot, image));
            if self.fail_present {
                return Err(ash::vk::Result::ERROR_OUT_OF_DATE_KHR.into());
            }
            Ok(())
        }

        fn wait_device_idle(&mut self) -> Result<(), FrameError> {
            self.log(Call::DeviceIdle);
            Ok(())
        }

        fn resize(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
            self.log(Call::Resize(width, height));
            self.extent = (width, height);
            Ok(())
        }
    }

    fn fast() -> LoopConfig {
        LoopConfig {
            target_fps: Some(1000),
            fence_timeout: Duration::from_millis(200),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn tick_runs_steps_in_order() {
        let mut backend = MockBackend::default();
        let outcome = tick(&mut backend, 1, &fast()).unwrap();
        assert_eq!(outcome, TickOutcome::Presented);
        assert_eq!(
            *backend.calls.lock(),
            vec![
                Call::Wait(1),
                Call::Acquire(1),
                Call::Reset(1),
                Call::Record(1, 11),
                Call::Submit(1),
                Call::Present(1, 11),
            ]
        );
    }

    #[test]
    fn skipped_acquire_leaves_fence_alone() {
        let mut backend = MockBackend {
            acquire_nothing: true,
            ..MockBackend::default()
        };
        assert_eq!(tick(&mut backend, 0, &fast()).unwrap(), TickOutcome::Skipped);
        assert_eq!(*backend.calls.lock(), vec![Call::Wait(0), Call::Acquire(0)]);
    }

    #[test]
    fn present_failure_is_not_an_error() {
        let mut backend = MockBackend {
            fail_present: true,
            ..MockBackend::default()
        };
        assert_eq!(tick(&mut backend, 2, &fast()).unwrap(), TickOutcome::Presented);
    }

    #[test]
    fn loop_starts_idle_and_exits_idempotently() {
        let mut frame_loop = FrameLoop::start(MockBackend::default(), fast()).unwrap();
        assert_eq!(frame_loop.state(), LoopState::Idle);
        frame_loop.exit_loop();
        assert_eq!(frame_loop.state(), LoopState::Stopped);
        frame_loop.exit_loop();
        assert_eq!(frame_loop.state(), LoopState::Stopped);
        frame_loop.set_active(true);
        assert_eq!(frame_loop.state(), LoopState::Stopped);
    }

    #[test]
    fn running_loop_cycles_slots_in_order() {
        let backend = MockBackend::default();
        let calls = Arc::clone(&backend.calls);
        let frame_loop = FrameLoop::start(backend, fast()).unwrap();

        frame_loop.set_active(true);
        wait_until(|| frame_loop.frames() >= 4);
        frame_loop.set_active(false);
        frame_loop.wait_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(frame_loop.state(), LoopState::Idle);

        let calls = calls.lock().clone();
        assert_eq!(calls.last(), Some(&Call::DeviceIdle));
        let waits: Vec<usize> = calls
            .iter()
            .filter_map(|call| match call {
                Call::Wait(slot) => Some(*slot),
                _ => None,
            })
            .collect();
        for (i, slot) in waits.iter().enumerate() {
            assert_eq!(*slot, i % FRAMES_IN_FLIGHT);
        }
        // A fence is reset only after its own wait and acquire
        for window in calls.windows(3) {
            if let Call::Reset(slot) = window[2] {
                assert_eq!(window[0], Call::Wait(slot));
                assert_eq!(window[1], Call::Acquire(slot));
            }
        }
    }

    #[test]
    fn device_hang_stops_the_loop() {
        let backend = MockBackend {
            hang_on_wait: Some(3),
            ..MockBackend::default()
        };
        let frame_loop = FrameLoop::start(backend, fast()).unwrap();
        frame_loop.set_active(true);
        wait_until(|| frame_loop.state() == LoopState::Stopped);

        assert!(matches!(
            frame_loop.take_error(),
            Some(FrameError::DeviceHang { slot: 2, .. })
        ));
        assert!(frame_loop.take_error().is_none());
        assert_eq!(frame_loop.frames(), 2);
    }

    #[test]
    fn pause_guard_restores_previous_activity() {
        let backend = MockBackend::default();
        let calls = Arc::clone(&backend.calls);
        let frame_loop = FrameLoop::start(backend, fast()).unwrap();
        frame_loop.set_active(true);
        wait_until(|| frame_loop.frames() >= 1);

        {
            let guard = frame_loop.pause().unwrap();
            assert!(guard.resumes());
            assert_eq!(frame_loop.state(), LoopState::Idle);
            let frozen = calls.lock().len();
            thread::sleep(Duration::from_millis(20));
            assert_eq!(calls.lock().len(), frozen);
        }
        assert!(frame_loop.is_active());
        let resumed_from = frame_loop.frames();
        wait_until(|| frame_loop.frames() > resumed_from);
    }

    #[test]
    fn resize_applies_before_returning() {
        let backend = MockBackend {
            extent: (800, 600),
            ..MockBackend::default()
        };
        let calls = Arc::clone(&backend.calls);
        let frame_loop = FrameLoop::start(backend, fast()).unwrap();
        frame_loop.set_active(true);
        wait_until(|| frame_loop.frames() >= 1);

        frame_loop.resize(640, 480).unwrap();
        assert_eq!(frame_loop.backend().lock().extent, (640, 480));
        assert!(frame_loop.is_active());

        let calls = calls.lock();
        let resize = calls
            .iter()
            .position(|c| *c == Call::Resize(640, 480))
            .unwrap();
        assert_eq!(calls[resize - 1], Call::DeviceIdle);
    }

    #[test]
    fn nested_pauses_resume_once() {
        let frame_loop = FrameLoop::start(MockBackend::default(), fast()).unwrap();
        frame_loop.set_active(true);
        {
            let outer = frame_loop.pause().unwrap();
            {
                let inner = frame_loop.pause().unwrap();
                assert!(!inner.resumes());
            }
            assert!(!frame_loop.is_active());
            assert!(outer.resumes());
        }
        assert!(frame_loop.is_active());
    }

    #[test]
    fn pausing_an_idle_loop_keeps_it_idle() {
        let frame_loop = FrameLoop::start(MockBackend::default(), fast()).unwrap();
        drop(frame_loop.pause().unwrap());
        assert!(!frame_loop.is_active());
        assert_eq!(frame_loop.state(), LoopState::Idle);
    }

    #[test]
    fn wait_idle_times_out_while_running() {
        let frame_loop = FrameLoop::start(MockBackend::default(), fast()).unwrap();
        frame_loop.set_active(true);
        wait_until(|| frame_loop.state() == LoopState::Running);
        assert!(matches!(
            frame_loop.wait_idle(Duration::from_millis(10)),
            Err(FrameError::IdleTimeout(_))
        ));
    }
}
