//! Camera capture context
//!
//! A dedicated thread pulls frames from a [`CameraBackend`] at sensor cadence
//! and publishes each into a [`SlotWriter`]. The thread never waits on the
//! consumer: an unconsumed frame is simply replaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::buffer::SlotWriter;
use super::camera::CameraBackend;
use super::frame::RawFrame;
use crate::clock::RetryPolicy;
use crate::config::VideoSettings;
use crate::error::{CaptureError, ErrorKind, FaultReporter};

/// Sleep for `duration` unless cancelled first. Returns false when cancelled.
pub(crate) fn sleep_unless_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    const STEP: Duration = Duration::from_millis(10);
    let mut remaining = duration;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(STEP);
        thread::sleep(step);
        remaining -= step;
    }
    !cancel.is_cancelled()
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    transient_errors: AtomicU64,
}

/// Capture statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub transient_errors: u64,
}

/// Running camera capture
pub struct FrameSource {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl FrameSource {
    /// Open the camera and start the capture thread.
    ///
    /// A busy camera is retried per `retry`. Nothing is spawned when the open
    /// ultimately fails.
    pub fn start(
        mut camera: Box<dyn CameraBackend>,
        video: VideoSettings,
        retry: RetryPolicy,
        output: SlotWriter<RawFrame>,
        faults: FaultReporter,
        cancel: CancellationToken,
    ) -> Result<Self, CaptureError> {
        open_with_retry(camera.as_mut(), &video, &retry, &cancel)?;
        tracing::info!(
            camera = camera.name(),
            width = video.width,
            height = video.height,
            fps = video.fps,
            "Camera capture started"
        );

        let counters = Arc::new(Counters::default());
        let thread_counters = counters.clone();
        let thread_cancel = cancel.clone();

        let handle = thread::Builder::new()
            .name("camera-capture".into())
            .spawn(move || {
                capture_loop(
                    camera.as_mut(),
                    &retry,
                    &output,
                    &faults,
                    &thread_cancel,
                    &thread_counters,
                );
                camera.close();
                tracing::info!(
                    captured = thread_counters.captured.load(Ordering::Relaxed),
                    replaced = output.replaced(),
                    "Camera capture stopped"
                );
            })
            .map_err(|e| CaptureError::StreamError(e.to_string()))?;

        Ok(Self {
            cancel,
            handle: Some(handle),
            counters,
        })
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.captured.load(Ordering::Relaxed),
            transient_errors: self.counters.transient_errors.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the capture thread and release the camera. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_with_retry(
    camera: &mut dyn CameraBackend,
    video: &VideoSettings,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), CaptureError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match camera.open(video.width, video.height, video.fps) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::TransientUnavailable && attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                tracing::warn!(camera = camera.name(), attempt, ?delay, "Camera open failed, retrying: {}", e);
                if !sleep_unless_cancelled(cancel, delay) {
                    return Err(CaptureError::Stopped);
                }
            }
            Err(e) => {
                tracing::error!(camera = camera.name(), attempts = attempt, "Camera open failed: {}", e);
                return Err(e);
            }
        }
    }
}

fn capture_loop(
    camera: &mut dyn CameraBackend,
    retry: &RetryPolicy,
    output: &SlotWriter<RawFrame>,
    faults: &FaultReporter,
    cancel: &CancellationToken,
    counters: &Counters,
) {
    let mut consecutive_failures = 0;

    while !cancel.is_cancelled() {
        match camera.next_frame() {
            Ok(frame) => {
                consecutive_failures = 0;
                counters.captured.fetch_add(1, Ordering::Relaxed);
                if output.publish(frame).is_err() {
                    break;
                }
            }
            Err(CaptureError::Stopped) => break,
            Err(e) if e.kind() == ErrorKind::TransientUnavailable => {
                consecutive_failures += 1;
                counters.transient_errors.fetch_add(1, Ordering::Relaxed);
                if consecutive_failures >= retry.max_attempts {
                    faults.report(CaptureError::DeviceLost(format!(
                        "{} failed {} times in a row: {}",
                        camera.name(),
                        consecutive_failures,
                        e
                    )));
                    break;
                }
                tracing::debug!(attempt = consecutive_failures, "Transient capture failure: {}", e);
                if !sleep_unless_cancelled(cancel, retry.backoff(consecutive_failures)) {
                    break;
                }
            }
            Err(e) => {
                faults.report(e);
                break;
            }
        }
    }
}
