use crate::config::{ConfigError, FilterSpec};
use crate::dsp::{butter_bandpass, butter_lowpass, filtfilt, Coefficients};
use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("window of {len} samples is too short for zero-phase filtering (need at least {min})")]
    WindowTooShort { len: usize, min: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Smallest window both zero-phase passes accept for a given filter order.
///
/// The band-pass has `2 * order + 1` coefficients and dominates; `filtfilt`
/// requires the input to be strictly longer than three times that.
pub fn min_window_len(order: usize) -> usize {
    let bandpass = 3 * (2 * order + 1);
    let lowpass = 3 * (order + 1);
    bandpass.max(lowpass) + 1
}

/// Band-pass → rectify → low-pass envelope, both passes zero-phase.
///
/// Coefficients are designed once at construction. `condition` takes `&self`
/// and keeps no filter state between calls, so the same window always
/// produces the same envelope.
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    bandpass: Coefficients,
    envelope: Coefficients,
}

impl SignalConditioner {
    pub fn new(spec: FilterSpec, envelope_cutoff: f64) -> Result<Self, ConfigError> {
        spec.validate()?;
        if !(envelope_cutoff > 0.0 && envelope_cutoff < spec.nyquist()) {
            return Err(ConfigError::InvalidEnvelopeCutoff {
                cutoff: envelope_cutoff,
                nyquist: spec.nyquist(),
            });
        }

        let bandpass = butter_bandpass(spec.order, spec.low_cutoff, spec.high_cutoff, spec.sampling_rate);
        let envelope = butter_lowpass(spec.order, envelope_cutoff, spec.sampling_rate);
        debug!(
            "Conditioner: band-pass {:.1}–{:.1} Hz, envelope {:.1} Hz, order {} @ {} Hz",
            spec.low_cutoff, spec.high_cutoff, envelope_cutoff, spec.order, spec.sampling_rate
        );

        Ok(Self {
            bandpass,
            envelope,
        })
    }

    pub fn min_len(&self) -> usize {
        self.bandpass.padlen().max(self.envelope.padlen()) + 1
    }

    /// Envelope of `window`, same length. An empty window yields an empty envelope.
    pub fn condition(&self, window: &[f64]) -> Result<Vec<f64>, ConditionError> {
        if window.is_empty() {
            return Ok(Vec::new());
        }
        let too_short = || ConditionError::WindowTooShort {
            len: window.len(),
            min: self.min_len(),
        };

        let filtered = filtfilt(&self.bandpass, window).ok_or_else(too_short)?;
        let rectified: Vec<f64> = filtered.iter().map(|v| v.abs()).collect();
        filtfilt(&self.envelope, &rectified).ok_or_else(too_short)
    }
}

/// One-shot conditioning with fresh coefficients. Prefer a long-lived
/// [`SignalConditioner`] in a loop.
pub fn condition(window: &[f64], spec: FilterSpec, envelope_cutoff: f64) -> Result<Vec<f64>, ConditionError> {
    SignalConditioner::new(spec, envelope_cutoff)?.condition(window)
}
