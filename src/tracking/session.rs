//! Tracking session state machine
//!
//! Owns a [`TrackingBackend`] and is the only writer of the published
//! [`TrackingState`].

use tokio_util::sync::CancellationToken;

use super::backend::{Capability, TrackingBackend};
use super::depth::compress_depth;
use super::types::{
    tracking_state_channel, TrackerSample, TrackingState, TrackingStateHandle,
    TrackingStatePublisher,
};
use crate::capture::source::sleep_unless_cancelled;
use crate::clock::RetryPolicy;
use crate::error::TrackingError;

/// Output of [`TrackingSession::poll`]
#[derive(Debug, Clone)]
pub struct Polled {
    /// Latest sample, repeated unchanged when nothing new arrived
    pub sample: Option<TrackerSample>,
    /// Whether `sample` was produced by this call
    pub fresh: bool,
    pub state: TrackingState,
}

/// AR tracking session
pub struct TrackingSession {
    backend: Box<dyn TrackingBackend>,
    state: TrackingStatePublisher,
    retry: RetryPolicy,
    include_depth: bool,
    max_depth_bytes: usize,
    last_sample: Option<TrackerSample>,
    terminal: Option<TrackingError>,
    started: bool,
}

impl TrackingSession {
    pub fn new(
        backend: Box<dyn TrackingBackend>,
        retry: RetryPolicy,
        include_depth: bool,
        max_depth_bytes: usize,
    ) -> Self {
        let (state, _) = tracking_state_channel(TrackingState::Initializing);
        Self {
            backend,
            state,
            retry,
            include_depth,
            max_depth_bytes,
            last_sample: None,
            terminal: None,
            started: false,
        }
    }

    /// Read handle on the published state
    pub fn state_handle(&self) -> TrackingStateHandle {
        self.state.handle()
    }

    pub fn state(&self) -> TrackingState {
        self.state.get()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Check capability and start the backend.
    ///
    /// Transient failures are retried with backoff up to the policy's attempt
    /// limit. Unsupported devices and backend start failures leave the session
    /// in a terminal state until [`restart`](Self::restart).
    pub fn start(&mut self) -> Result<(), TrackingError> {
        self.start_until(&CancellationToken::new())
    }

    /// Like [`start`](Self::start), but gives up as soon as `cancel` fires.
    ///
    /// A cancelled start is not terminal; the session can be started again.
    pub fn start_until(&mut self, cancel: &CancellationToken) -> Result<(), TrackingError> {
        if let Some(err) = &self.terminal {
            return Err(err.clone());
        }
        if self.started {
            return Ok(());
        }

        self.state.set(TrackingState::Initializing);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.backend.check_capability() {
                Capability::Available => break,
                Capability::Unsupported(reason) => {
                    tracing::warn!(backend = self.backend.name(), %reason, "Tracking unsupported");
                    return Err(self.fail(
                        TrackingState::Unsupported,
                        TrackingError::Unsupported(reason),
                    ));
                }
                Capability::Transient(reason) => {
                    if attempt >= self.retry.max_attempts {
                        tracing::error!(
                            backend = self.backend.name(),
                            attempts = attempt,
                            %reason,
                            "Tracking capability check gave up"
                        );
                        return Err(self.fail(
                            TrackingState::Error,
                            TrackingError::Unavailable(reason),
                        ));
                    }
                    let delay = self.retry.backoff(attempt);
                    tracing::debug!(attempt, ?delay, %reason, "Tracking not ready, retrying");
                    if !sleep_unless_cancelled(cancel, delay) {
                        self.state.set(TrackingState::NotTracking);
                        return Err(TrackingError::Unavailable("cancelled".into()));
                    }
                }
            }
        }

        if let Err(e) = self.backend.start() {
            tracing::error!(backend = self.backend.name(), "Tracking backend failed to start: {}", e);
            let state = match e {
                TrackingError::Unsupported(_) => TrackingState::Unsupported,
                _ => TrackingState::Error,
            };
            return Err(self.fail(state, e));
        }

        self.started = true;
        tracing::info!(backend = self.backend.name(), "Tracking started");
        Ok(())
    }

    /// Fetch the latest pose without blocking
    pub fn poll(&mut self) -> Polled {
        if !self.started {
            return self.unchanged();
        }

        match self.backend.poll() {
            Ok(Some(frame)) => {
                self.state.set(if frame.tracked {
                    TrackingState::Tracking
                } else {
                    TrackingState::NotTracking
                });

                // The raw depth image is consumed here and never outlives this cycle
                let depth = match frame.depth {
                    Some(image) if self.include_depth => {
                        Some(compress_depth(image, self.max_depth_bytes))
                    }
                    _ => None,
                };

                let sample = TrackerSample {
                    pose: frame.pose,
                    depth,
                };
                self.last_sample = Some(sample.clone());
                Polled {
                    sample: Some(sample),
                    fresh: true,
                    state: self.state.get(),
                }
            }
            Ok(None) => self.unchanged(),
            Err(TrackingError::Unavailable(reason)) => {
                tracing::debug!(%reason, "Tracking update skipped");
                self.unchanged()
            }
            Err(e) => {
                tracing::error!(backend = self.backend.name(), "Tracking update failed: {}", e);
                let state = match e {
                    TrackingError::Unsupported(_) => TrackingState::Unsupported,
                    _ => TrackingState::Error,
                };
                self.backend.stop();
                self.started = false;
                self.fail(state, e);
                self.unchanged()
            }
        }
    }

    /// Release backend resources. Idempotent.
    pub fn stop(&mut self) {
        if self.started {
            self.backend.stop();
            self.started = false;
            tracing::info!(backend = self.backend.name(), "Tracking stopped");
        }
        if !self.state.get().is_terminal() {
            self.state.set(TrackingState::NotTracking);
        }
    }

    /// Leave any terminal state and start again
    pub fn restart(&mut self) -> Result<(), TrackingError> {
        self.stop();
        self.terminal = None;
        self.last_sample = None;
        self.start()
    }

    fn unchanged(&self) -> Polled {
        Polled {
            sample: self.last_sample.clone(),
            fresh: false,
            state: self.state.get(),
        }
    }

    fn fail(&mut self, state: TrackingState, err: TrackingError) -> TrackingError {
        self.state.set(state);
        self.terminal = Some(err.clone());
        err
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SessionClock;
    use std::time::Duration;
    use crate::tracking::backend::{SimulatedTracker, UnsupportedTracker};

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_start_and_poll() {
        let backend = SimulatedTracker::new(SessionClock::new()).with_rate_hz(1.0);
        let mut session = TrackingSession::new(Box::new(backend), quick_retry(3), false, 1024);
        session.start().unwrap();

        let first = session.poll();
        assert!(first.fresh);
        assert_eq!(first.state, TrackingState::Tracking);

        // Nothing new inside the period: previous sample comes back unchanged
        let second = session.poll();
        assert!(!second.fresh);
        assert_eq!(second.sample, first.sample);
    }

    #[test]
    fn test_unsupported_is_terminal() {
        let mut session = TrackingSession::new(
            Box::new(UnsupportedTracker::new("no sensor")),
            quick_retry(3),
            false,
            1024,
        );
        assert!(matches!(session.start(), Err(TrackingError::Unsupported(_))));
        assert_eq!(session.state(), TrackingState::Unsupported);

        // Stays terminal on plain start
        assert!(session.start().is_err());
        assert_eq!(session.state(), TrackingState::Unsupported);
        assert!(session.poll().sample.is_none());
    }

    #[test]
    fn test_transient_retried_then_available() {
        let backend = SimulatedTracker::new(SessionClock::new()).with_capability_script(vec![
            Capability::Transient("installing".into()),
            Capability::Transient("installing".into()),
        ]);
        let mut session = TrackingSession::new(Box::new(backend), quick_retry(3), false, 1024);
        assert!(session.start().is_ok());
        assert!(session.is_started());
    }

    #[test]
    fn test_transient_exhausts_attempts() {
        let backend = SimulatedTracker::new(SessionClock::new()).with_capability_script(vec![
            Capability::Transient("busy".into()),
            Capability::Transient("busy".into()),
        ]);
        let mut session = TrackingSession::new(Box::new(backend), quick_retry(2), false, 1024);
        assert!(matches!(session.start(), Err(TrackingError::Unavailable(_))));
        assert_eq!(session.state(), TrackingState::Error);

        // Restart clears the terminal state; the script is exhausted now
        assert!(session.restart().is_ok());
        assert_eq!(session.state(), TrackingState::Initializing);
    }

    #[test]
    fn test_cancel_interrupts_capability_retry() {
        let backend = SimulatedTracker::new(SessionClock::new())
            .with_capability_script(vec![Capability::Transient("busy".into()); 10]);
        let mut session = TrackingSession::new(
            Box::new(backend),
            RetryPolicy::new(5, Duration::from_millis(500)),
            false,
            1024,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        assert!(matches!(session.start_until(&cancel), Err(TrackingError::Unavailable(_))));
        assert!(started.elapsed() < Duration::from_millis(400));
        canceller.join().unwrap();

        // Not terminal: a later start is still allowed
        assert_eq!(session.state(), TrackingState::NotTracking);
        assert!(!session.state().is_terminal());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let backend = SimulatedTracker::new(SessionClock::new());
        let mut session = TrackingSession::new(Box::new(backend), quick_retry(1), false, 1024);
        session.stop();
        session.start().unwrap();
        session.stop();
        session.stop();
        assert_eq!(session.state(), TrackingState::NotTracking);
    }

    #[test]
    fn test_depth_attached_when_enabled() {
        let backend = SimulatedTracker::new(SessionClock::new()).with_depth(16, 8);
        let mut session =
            TrackingSession::new(Box::new(backend), quick_retry(1), true, usize::MAX);
        session.start().unwrap();

        let depth = session.poll().sample.unwrap().depth.unwrap();
        assert_eq!((depth.width, depth.height), (16, 8));
        assert!(depth.samples.is_some());
    }
}
