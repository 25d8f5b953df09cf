//! Encoder lifecycle
//!
//! `Unconfigured -> Configured -> Running -> Draining -> Released`, with
//! `release` allowed from anywhere. Operations outside their state fail with
//! [`CodecError::InvalidState`] instead of touching the encoder.

use super::{EncodedUnit, EncoderStats, MediaEncoder};
use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Unconfigured,
    Configured,
    Running,
    Draining,
    Released,
}

impl StageState {
    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Unconfigured => "unconfigured",
            StageState::Configured => "configured",
            StageState::Running => "running",
            StageState::Draining => "draining",
            StageState::Released => "released",
        }
    }
}

pub struct EncodingStage<E: MediaEncoder> {
    state: StageState,
    encoder: Option<E>,
    stats: EncoderStats,
}

impl<E: MediaEncoder> Default for EncodingStage<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: MediaEncoder> EncodingStage<E> {
    pub fn new() -> Self {
        Self {
            state: StageState::Unconfigured,
            encoder: None,
            stats: EncoderStats::default(),
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    /// Install an encoder that already passed its own setting checks
    pub fn configure(&mut self, encoder: E) -> Result<(), CodecError> {
        self.expect(StageState::Unconfigured)?;
        self.encoder = Some(encoder);
        self.state = StageState::Configured;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), CodecError> {
        self.expect(StageState::Configured)?;
        self.state = StageState::Running;
        Ok(())
    }

    /// Encode one input. Only valid while running.
    pub fn submit(&mut self, input: E::Input) -> Result<Vec<EncodedUnit>, CodecError> {
        self.expect(StageState::Running)?;
        let encoder = self.encoder.as_mut().ok_or(CodecError::InvalidState {
            expected: StageState::Running.as_str(),
            actual: StageState::Unconfigured.as_str(),
        })?;

        let units = encoder.encode(input)?;
        for unit in &units {
            self.stats.record(unit);
        }
        Ok(units)
    }

    /// Stop accepting input and flush everything the encoder still holds
    pub fn drain(&mut self) -> Result<Vec<EncodedUnit>, CodecError> {
        self.expect(StageState::Running)?;
        self.state = StageState::Draining;

        let units = match self.encoder.as_mut() {
            Some(encoder) => encoder.flush()?,
            None => Vec::new(),
        };
        for unit in &units {
            self.stats.record(unit);
        }
        tracing::debug!(flushed = units.len(), "Encoder drained");
        Ok(units)
    }

    /// Drop the encoder. Safe from any state, any number of times.
    pub fn release(&mut self) {
        if self.state != StageState::Released {
            if let Some(encoder) = self.encoder.take() {
                tracing::debug!(
                    kind = ?encoder.kind(),
                    units = self.stats.units_encoded,
                    bytes = self.stats.bytes_produced,
                    "Encoder released"
                );
            }
            self.state = StageState::Released;
        }
    }

    fn expect(&self, expected: StageState) -> Result<(), CodecError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CodecError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }
}

impl<E: MediaEncoder> Drop for EncodingStage<E> {
    fn drop(&mut self) {
        self.release();
    }
}
