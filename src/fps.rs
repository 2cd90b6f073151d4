//! Frames-per-second measurement, sampled independently of acquisition.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Sender};
use parking_lot::Mutex;

use crate::events::{CameraEvent, EventSink};

/// Frame counter plus the rate computed at the last sample.
#[derive(Debug)]
pub struct FpsMeter {
    frames: AtomicU64,
    last_sample: Mutex<Instant>,
    current_bits: AtomicU64,
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl FpsMeter {
    /// Create a meter with a zero count.
    pub fn new() -> Self {
        Self {
            frames: AtomicU64::new(0),
            last_sample: Mutex::new(Instant::now()),
            current_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Count one produced frame.
    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Compute `count / elapsed` since the previous sample and reset the count.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&self) -> f64 {
        let mut last = self.last_sample.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(*last).as_secs_f64();
        *last = now;
        let count = self.frames.swap(0, Ordering::Relaxed);

        let fps = if elapsed > 0.0 {
            count as f64 / elapsed
        } else {
            0.0
        };
        self.current_bits.store(fps.to_bits(), Ordering::Relaxed);
        fps
    }

    /// Drop the count and restart the sampling window.
    pub fn reset(&self) {
        let mut last = self.last_sample.lock();
        self.frames.store(0, Ordering::Relaxed);
        self.current_bits.store(0f64.to_bits(), Ordering::Relaxed);
        *last = Instant::now();
    }

    /// Rate computed at the last sample.
    pub fn current(&self) -> f64 {
        f64::from_bits(self.current_bits.load(Ordering::Relaxed))
    }
}

/// Background thread sampling an [`FpsMeter`] at a fixed interval.
///
/// `fps_updated` is only published while `active` is set. Dropping the
/// sampler stops and joins the thread.
pub(crate) struct FpsSampler {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FpsSampler {
    pub(crate) fn spawn(
        meter: Arc<FpsMeter>,
        active: Arc<AtomicBool>,
        events: Arc<dyn EventSink>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("camera-fps".to_owned())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let fps = meter.sample();
                            if active.load(Ordering::Acquire) {
                                events.publish(CameraEvent::FpsUpdated(fps));
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for FpsSampler {
    fn drop(&mut self) {
        // Disconnecting the stop channel wakes the select.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("fps sampler thread panicked");
            }
        }
    }
}
