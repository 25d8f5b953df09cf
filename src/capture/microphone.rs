//! Audio capture backends
//!
//! Every backend pushes interleaved f32 chunks into a shared [`RingBuffer`]
//! from its own context and never waits on the encoder.
//!
//! [`RingBuffer`]: super::buffer::RingBuffer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::buffer::SharedRingBuffer;
use super::frame::AudioChunk;
use crate::clock::SessionClock;
use crate::error::{CaptureError, FaultReporter};

/// Capability interface implemented by every audio provider
pub trait AudioBackend: Send {
    fn name(&self) -> &str;

    /// Begin delivering chunks into `output`. Runtime failures go to `faults`.
    fn start(&mut self, output: SharedRingBuffer, faults: FaultReporter) -> Result<(), CaptureError>;

    /// Stop delivering. Idempotent.
    fn stop(&mut self);

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;
}

/// Synthetic sine source paced in real time
pub struct ToneGenerator {
    clock: SessionClock,
    sample_rate: u32,
    channels: u16,
    frequency: f32,
    chunk: Duration,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ToneGenerator {
    pub fn new(clock: SessionClock, sample_rate: u32, channels: u16) -> Self {
        Self {
            clock,
            sample_rate,
            channels,
            frequency: 440.0,
            chunk: Duration::from_millis(10),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    pub fn with_frequency(mut self, hz: f32) -> Self {
        self.frequency = hz;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl AudioBackend for ToneGenerator {
    fn name(&self) -> &str {
        "tone"
    }

    fn start(&mut self, output: SharedRingBuffer, _faults: FaultReporter) -> Result<(), CaptureError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{}Hz/{}ch",
                self.sample_rate, self.channels
            )));
        }

        let running = self.running.clone();
        let clock = self.clock;
        let sample_rate = self.sample_rate;
        let channels = self.channels;
        let step = std::f32::consts::TAU * self.frequency / sample_rate as f32;
        let frames_per_chunk =
            (sample_rate as u64 * self.chunk.as_micros() as u64 / 1_000_000) as usize;
        let chunk_period = self.chunk;

        running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("tone-generator".into())
            .spawn(move || {
                let mut phase = 0.0f32;
                let mut next_due = clock.elapsed();
                let mut first_sample_micros = clock.now_micros();

                while running.load(Ordering::Relaxed) {
                    let mut samples = Vec::with_capacity(frames_per_chunk * channels as usize);
                    for _ in 0..frames_per_chunk {
                        let value = phase.sin() * 0.2;
                        phase = (phase + step) % std::f32::consts::TAU;
                        samples.extend(std::iter::repeat(value).take(channels as usize));
                    }
                    let chunk = AudioChunk::new(samples, channels, sample_rate, first_sample_micros);
                    first_sample_micros += chunk.duration_micros();
                    output.push(chunk);

                    next_due += chunk_period;
                    let now = clock.elapsed();
                    if next_due > now {
                        thread::sleep(next_due - now);
                    }
                }
            })
            .map_err(|e| CaptureError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        tracing::info!(sample_rate, channels, "Tone generator started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

impl Drop for ToneGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "microphone")]
pub use self::cpal_input::{list_input_devices, CpalMicrophone};

#[cfg(feature = "microphone")]
mod cpal_input {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam_channel::bounded;

    use super::*;

    /// Names of the host's input devices
    pub fn list_input_devices() -> Vec<String> {
        let host = cpal::default_host();
        match host.input_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate input devices: {}", e);
                Vec::new()
            }
        }
    }

    fn find_input_device(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
        let host = cpal::default_host();
        match name {
            None => host
                .default_input_device()
                .ok_or_else(|| CaptureError::DeviceNotFound("default input".into())),
            Some(wanted) => host
                .input_devices()
                .map_err(|e| CaptureError::DeviceNotFound(e.to_string()))?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| CaptureError::DeviceNotFound(wanted.to_string())),
        }
    }

    /// Microphone input through cpal.
    ///
    /// The cpal stream is not `Send`, so it lives on a dedicated thread that
    /// holds it until stopped.
    pub struct CpalMicrophone {
        clock: SessionClock,
        device_name: Option<String>,
        sample_rate: u32,
        channels: u16,
        running: Arc<AtomicBool>,
        thread_handle: Option<JoinHandle<()>>,
    }

    impl CpalMicrophone {
        pub fn new(
            clock: SessionClock,
            device_name: Option<String>,
            sample_rate: u32,
            channels: u16,
        ) -> Self {
            Self {
                clock,
                device_name,
                sample_rate,
                channels,
                running: Arc::new(AtomicBool::new(false)),
                thread_handle: None,
            }
        }
    }

    impl AudioBackend for CpalMicrophone {
        fn name(&self) -> &str {
            self.device_name.as_deref().unwrap_or("default-input")
        }

        fn start(&mut self, output: SharedRingBuffer, faults: FaultReporter) -> Result<(), CaptureError> {
            if self.running.load(Ordering::SeqCst) {
                return Ok(());
            }

            let device_name = self.device_name.clone();
            let config = cpal::StreamConfig {
                channels: self.channels,
                sample_rate: cpal::SampleRate(self.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let clock = self.clock;
            let channels = self.channels;
            let sample_rate = self.sample_rate;
            let running = self.running.clone();
            let (ready_tx, ready_rx) = bounded::<Result<(), CaptureError>>(1);

            running.store(true, Ordering::SeqCst);
            let handle = thread::Builder::new()
                .name("microphone-capture".into())
                .spawn(move || {
                    let device = match find_input_device(device_name.as_deref()) {
                        Ok(device) => device,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    let callback_running = running.clone();
                    let stream = device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if !callback_running.load(Ordering::Relaxed) {
                                return;
                            }
                            let mut chunk =
                                AudioChunk::new(data.to_vec(), channels, sample_rate, 0);
                            // Stamp with the first sample, not the callback time
                            chunk.timestamp_micros = clock.now_micros() - chunk.duration_micros();
                            output.push(chunk);
                        },
                        move |err| {
                            let err = match err {
                                cpal::StreamError::DeviceNotAvailable => {
                                    CaptureError::DeviceLost("microphone disconnected".into())
                                }
                                other => CaptureError::StreamError(other.to_string()),
                            };
                            faults.report(err);
                        },
                        None,
                    );

                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx
                                .send(Err(CaptureError::UnsupportedFormat(e.to_string())));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(CaptureError::StreamError(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    while running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(10));
                    }
                    // Dropping the stream stops the device
                })
                .map_err(|e| CaptureError::StreamError(e.to_string()))?;

            let ready = ready_rx
                .recv_timeout(Duration::from_secs(5))
                .unwrap_or_else(|_| Err(CaptureError::StreamError("microphone start timed out".into())));
            match ready {
                Ok(()) => {
                    self.thread_handle = Some(handle);
                    tracing::info!(device = self.name(), sample_rate, channels, "Microphone started");
                    Ok(())
                }
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    let _ = handle.join();
                    tracing::error!("Microphone failed to start: {}", e);
                    Err(e)
                }
            }
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }
    }

    impl Drop for CpalMicrophone {
        fn drop(&mut self) {
            self.stop();
        }
    }
}
