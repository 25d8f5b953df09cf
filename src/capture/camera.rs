//! Camera capability interface

use bytes::Bytes;
use std::time::Duration;

use super::frame::RawFrame;
use crate::clock::SessionClock;
use crate::error::CaptureError;

/// Capability interface implemented by every camera provider
pub trait CameraBackend: Send {
    fn name(&self) -> &str;

    /// Acquire the sensor at the requested geometry and rate
    fn open(&mut self, width: u32, height: u32, fps: u32) -> Result<(), CaptureError>;

    /// Block until the sensor produces its next frame
    fn next_frame(&mut self) -> Result<RawFrame, CaptureError>;

    /// Release the sensor. Must tolerate being called when not open.
    fn close(&mut self);
}

/// Test-pattern camera running at the requested cadence.
///
/// Renders moving colour bars so consecutive frames differ.
pub struct SyntheticCamera {
    clock: SessionClock,
    geometry: Option<(u32, u32)>,
    period: Duration,
    next_due: Duration,
    index: u64,
    busy_opens: u32,
    lose_after: Option<u64>,
    transient_at: Vec<u64>,
}

impl SyntheticCamera {
    pub fn new(clock: SessionClock) -> Self {
        Self {
            clock,
            geometry: None,
            period: Duration::from_millis(33),
            next_due: Duration::ZERO,
            index: 0,
            busy_opens: 0,
            lose_after: None,
            transient_at: Vec::new(),
        }
    }

    /// Report `Busy` for the first `count` open attempts
    pub fn with_busy_opens(mut self, count: u32) -> Self {
        self.busy_opens = count;
        self
    }

    /// Report device loss once `frames` frames were delivered
    pub fn with_loss_after(mut self, frames: u64) -> Self {
        self.lose_after = Some(frames);
        self
    }

    /// Report a transient failure instead of frame number `index`
    pub fn with_transient_failure_at(mut self, index: u64) -> Self {
        self.transient_at.push(index);
        self
    }

    fn render(&self, width: u32, height: u32) -> Bytes {
        const BARS: [[u8; 3]; 8] = [
            [235, 235, 235],
            [235, 235, 16],
            [16, 235, 235],
            [16, 235, 16],
            [235, 16, 235],
            [235, 16, 16],
            [16, 16, 235],
            [16, 16, 16],
        ];

        let bar_width = (width / BARS.len() as u32).max(1);
        let shift = (self.index * 4) as u32;
        let mut data = Vec::with_capacity(RawFrame::rgb_len(width, height));
        for _ in 0..height {
            for x in 0..width {
                let bar = ((x + shift) / bar_width) as usize % BARS.len();
                data.extend_from_slice(&BARS[bar]);
            }
        }
        Bytes::from(data)
    }
}

impl CameraBackend for SyntheticCamera {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open(&mut self, width: u32, height: u32, fps: u32) -> Result<(), CaptureError> {
        if self.busy_opens > 0 {
            self.busy_opens -= 1;
            return Err(CaptureError::Busy("synthetic camera in use".into()));
        }
        if width == 0 || height == 0 || fps == 0 {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{}x{}@{}",
                width, height, fps
            )));
        }

        self.geometry = Some((width, height));
        self.period = Duration::from_micros(1_000_000 / fps as u64);
        self.next_due = self.clock.elapsed();
        self.index = 0;
        tracing::debug!(width, height, fps, "Synthetic camera opened");
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let (width, height) = self.geometry.ok_or(CaptureError::Stopped)?;

        if self.lose_after.is_some_and(|limit| self.index >= limit) {
            return Err(CaptureError::DeviceLost("synthetic camera unplugged".into()));
        }

        let now = self.clock.elapsed();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due += self.period;

        let index = self.index;
        self.index += 1;
        if let Some(pos) = self.transient_at.iter().position(|&i| i == index) {
            self.transient_at.swap_remove(pos);
            return Err(CaptureError::Busy(format!("frame {} not ready", index)));
        }

        Ok(RawFrame {
            width,
            height,
            timestamp_nanos: self.clock.now_nanos(),
            index,
            data: self.render(width, height),
        })
    }

    fn close(&mut self) {
        self.geometry = None;
    }
}
