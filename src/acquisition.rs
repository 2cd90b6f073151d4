//! Background acquisition thread.
//!
//! One worker per stream pulls frames from the driver while the stream is
//! active. It only holds the device-access lock for the duration of a single
//! `get_frame` call and never blocks on it: lock acquisition is bounded and
//! retried, so a command on the caller's thread always gets its turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};

use crate::controller::Shared;
use crate::events::CameraEvent;
use crate::state::CameraState;
use crate::traits::Frame;

/// Timeouts and back-off intervals used by the controller and its threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Bounded wait for the device-access lock inside the acquisition loop.
    pub lock_timeout: Duration,
    /// Pause after a failed lock attempt.
    pub lock_retry: Duration,
    /// Timeout passed to `get_frame`.
    pub frame_timeout: Duration,
    /// Pause after a driver fault while pulling frames.
    pub error_backoff: Duration,
    /// How long a stop waits for the worker to exit.
    pub join_timeout: Duration,
    /// FPS sampling interval; zero disables the sampler.
    pub fps_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(20),
            lock_retry: Duration::from_millis(5),
            frame_timeout: Duration::from_millis(50),
            error_backoff: Duration::from_millis(100),
            join_timeout: Duration::from_secs(1),
            fps_interval: Duration::from_secs(1),
        }
    }
}

/// Cooperative cancellation flag shared with the worker.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A running acquisition worker.
///
/// Exists while the controller is streaming, and after a stop whose join
/// timed out until the detached worker has exited.
pub(crate) struct StreamSession {
    cancel: CancelToken,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Keeps the live worker count accurate however the worker exits.
struct LiveWorker(Arc<Shared>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.workers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StreamSession {
    /// Spawn the worker for `device_id`.
    pub(crate) fn start(shared: &Arc<Shared>, device_id: String) -> std::io::Result<Self> {
        let cancel = CancelToken::default();
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);

        shared.workers.fetch_add(1, Ordering::SeqCst);
        let live = LiveWorker(Arc::clone(shared));
        let worker_cancel = cancel.clone();

        let spawned = thread::Builder::new()
            .name("camera-acquisition".to_owned())
            .spawn(move || {
                // Declared first so it drops last: the worker count is already
                // decremented when the stopper wakes up.
                let _done = done_tx;
                let live = live;
                run(&live.0, &worker_cancel, &device_id);
            });

        // On spawn failure the closure, and with it `live`, is dropped here.
        let handle = spawned?;
        Ok(Self {
            cancel,
            done,
            handle,
        })
    }

    /// Cancel the worker and wait up to `join_timeout` for it to exit.
    ///
    /// Returns the session back when the worker did not finish in time; it is
    /// then detached and will exit on its own at its next cancellation check.
    pub(crate) fn stop(self, join_timeout: Duration) -> Option<Self> {
        self.cancel.cancel();
        let detached = self.join(join_timeout);
        if detached.is_some() {
            warn!(
                timeout_ms = join_timeout.as_millis(),
                "acquisition thread did not exit in time, detaching it"
            );
        }
        detached
    }

    /// Wait up to `timeout` for an already cancelled worker to exit.
    ///
    /// Returns the session back while the worker is still running.
    pub(crate) fn join(self, timeout: Duration) -> Option<Self> {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Some(self),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    warn!("acquisition thread panicked");
                }
                None
            }
        }
    }
}

fn run(shared: &Shared, cancel: &CancelToken, device_id: &str) {
    let timing = shared.timing;
    let mut delivered: u64 = 0;
    info!(device_id, "acquisition loop started");

    while shared.streaming_active.load(Ordering::Acquire) && !cancel.is_cancelled() {
        let Some(mut slot) = shared.device.try_lock_for(timing.lock_timeout) else {
            thread::sleep(timing.lock_retry);
            continue;
        };
        if slot.state() != CameraState::Streaming {
            drop(slot);
            thread::sleep(timing.lock_retry);
            continue;
        }
        let pulled = slot.driver.get_frame(timing.frame_timeout);
        drop(slot);

        match pulled {
            Ok(Some(frame)) => {
                deliver(shared, frame, device_id);
                delivered += 1;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(device_id, error = %err, "frame pull failed, retrying");
                thread::sleep(timing.error_backoff);
            }
        }
    }

    info!(device_id, frames = delivered, "acquisition loop stopped");
}

fn deliver(shared: &Shared, mut frame: Frame, device_id: &str) {
    device_id.clone_into(&mut frame.device_id);
    let frame = Arc::new(frame);
    *shared.latest_frame.lock() = Some(Arc::clone(&frame));
    shared.fps.record_frame();
    shared.events.publish(CameraEvent::NewFrameAvailable(frame));
}
