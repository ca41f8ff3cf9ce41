//! [`StabilityClassifier`] – debounces raw samples into a [`Classification`].
//!
//! Range checks run first and take precedence:
//!
//! - above the device's rated capacity → [`Classification::Overload`]
//! - below [`StabilityConfig::underload_limit`] → [`Classification::Underload`]
//!
//! Otherwise a sample is *in band* when it is within `tolerance` of both the
//! previous sample and the moving average of the last `window` samples.  The
//! reading is [`Classification::Stable`] once `required_consecutive` samples
//! in a row were in band, and [`Classification::Unstable`] until then.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use weighbridge_types::Classification;

/// Tuning for [`StabilityClassifier`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Number of recent samples in the moving average.
    pub window: usize,
    /// Maximum allowed deviation, in device units.
    pub tolerance: f64,
    /// In-band samples in a row needed to report stable.
    pub required_consecutive: usize,
    /// Raw readings below this value are underload.
    pub underload_limit: f64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window: 5,
            tolerance: 0.5,
            required_consecutive: 3,
            underload_limit: -20.0,
        }
    }
}

/// Per-device sample history.  Owned by exactly one session engine.
#[derive(Debug, Clone)]
pub struct StabilityClassifier {
    config: StabilityConfig,
    rated_capacity: f64,
    samples: VecDeque<f64>,
    in_band: usize,
}

impl StabilityClassifier {
    pub fn new(config: StabilityConfig, rated_capacity: f64) -> Self {
        Self {
            config: StabilityConfig {
                window: config.window.max(1),
                required_consecutive: config.required_consecutive.max(1),
                tolerance: config.tolerance.abs(),
                ..config
            },
            rated_capacity,
            samples: VecDeque::new(),
            in_band: 0,
        }
    }

    /// Classify one raw sample and fold it into the history.
    pub fn classify(&mut self, raw: f64) -> Classification {
        if raw > self.rated_capacity {
            self.reset();
            return Classification::Overload;
        }
        if raw < self.config.underload_limit {
            self.reset();
            return Classification::Underload;
        }
        if !raw.is_finite() {
            self.in_band = 0;
            return Classification::Unstable;
        }

        let tolerance = self.config.tolerance;
        let in_band = match (self.samples.back(), self.mean()) {
            (Some(prev), Some(mean)) => (raw - prev).abs() <= tolerance && (raw - mean).abs() <= tolerance,
            _ => false,
        };
        self.in_band = if in_band { self.in_band + 1 } else { 0 };

        self.samples.push_back(raw);
        while self.samples.len() > self.config.window {
            self.samples.pop_front();
        }

        if self.in_band >= self.config.required_consecutive {
            Classification::Stable
        } else {
            Classification::Unstable
        }
    }

    /// Forget all history, e.g. after start or tare.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.in_band = 0;
    }

    /// Moving average of the retained samples.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }

    pub fn rated_capacity(&self) -> f64 {
        self.rated_capacity
    }
}
