//! Capture/replay latency measurement.
//!
//! Each measurement runs the launch once to warm up, synchronizes, captures
//! `capture_size` launches into one replayable unit, and times `replays`
//! replays of that unit between two synchronization barriers. The per-call
//! duration is the elapsed time divided by `capture_size * replays`.

mod capture;

pub use capture::{CaptureBackend, CaptureError, CapturedLaunch, LaunchFn};

use std::time::{Duration, Instant};

use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Default number of launches recorded into one captured unit.
pub const DEFAULT_CAPTURE_SIZE: usize = 100;
/// Default number of timed replays of the captured unit.
pub const DEFAULT_REPLAYS: usize = 3;

/// Errors from a timed run.
#[derive(Debug, thiserror::Error)]
pub enum TimingError {
    #[error("invalid timing config: {0}")]
    InvalidConfig(&'static str),
    #[error("warm-up launch failed: {0}")]
    Warmup(#[source] candle_core::Error),
    #[error("device synchronization failed: {0}")]
    Synchronize(#[source] candle_core::Error),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Capture and replay counts, shared by every kernel variant in a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub capture_size: usize,
    pub replays: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            capture_size: DEFAULT_CAPTURE_SIZE,
            replays: DEFAULT_REPLAYS,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<(), TimingError> {
        if self.capture_size == 0 {
            return Err(TimingError::InvalidConfig("capture_size must be >= 1"));
        }
        if self.replays == 0 {
            return Err(TimingError::InvalidConfig("replays must be >= 1"));
        }
        Ok(())
    }

    /// Launches covered by the timed window.
    pub fn timed_calls(&self) -> usize {
        self.capture_size * self.replays
    }
}

/// Result of one timed run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Mean wall-clock time per launch, always > 0.
    pub per_call_ms: f64,
    /// Elapsed time of the whole replay window.
    pub total: Duration,
    /// Launches covered by `total`.
    pub calls: usize,
}

/// Times launch closures on one device.
#[derive(Debug, Clone)]
pub struct TimingHarness {
    device: Device,
    config: TimingConfig,
}

impl TimingHarness {
    pub fn new(device: Device, config: TimingConfig) -> Result<Self, TimingError> {
        config.validate()?;
        Ok(Self { device, config })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Measure the steady-state latency of `launch`.
    ///
    /// The captured unit is released before returning, on success and on
    /// every error path.
    pub fn measure<F>(&self, mut launch: F) -> Result<Measurement, TimingError>
    where
        F: FnMut() -> candle_core::Result<()>,
    {
        launch().map_err(TimingError::Warmup)?;
        self.synchronize()?;

        let capture_size = self.config.capture_size;
        let launch: &mut LaunchFn<'_> = &mut launch;
        let mut unit = CapturedLaunch::capture(&self.device, capture_size, launch)?;

        let start = Instant::now();
        for _ in 0..self.config.replays {
            unit.replay()?;
        }
        self.synchronize()?;
        let total = start.elapsed();

        unit.reset()?;

        let calls = self.config.timed_calls();
        let per_call_ms = (total.as_secs_f64() * 1e3 / calls as f64).max(f64::MIN_POSITIVE);
        tracing::trace!(
            per_call_ms,
            calls,
            total_us = total.as_micros() as u64,
            "measured launch"
        );
        Ok(Measurement {
            per_call_ms,
            total,
            calls,
        })
    }

    fn synchronize(&self) -> Result<(), TimingError> {
        self.device.synchronize().map_err(TimingError::Synchronize)
    }
}
