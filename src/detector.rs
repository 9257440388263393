use crate::types::Event;

/// Peak qualification thresholds. `min_width` is in samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakCriteria {
    pub prominence: f64,
    pub min_height: f64,
    pub min_width: f64,
}

/// Onset detection on a conditioned envelope.
///
/// A candidate is any strict local maximum (a plateau counts once, at its
/// first sample; window edges never qualify). It becomes an [`Event`] when
///   - its height is at least `min_height`,
///   - its prominence (drop to the higher of the two lowest points reached
///     before meeting a taller sample or the window edge) is at least `prominence`,
///   - its width at half prominence, with linear interpolation between
///     samples, is at least `min_width`.
pub struct EventDetector {
    criteria: PeakCriteria,
    sampling_rate: f64,
}

impl EventDetector {
    pub fn new(criteria: PeakCriteria, sampling_rate: f64) -> Self {
        Self {
            criteria,
            sampling_rate,
        }
    }

    /// Qualifying peaks in index order. `start` is the timestamp of sample 0.
    pub fn detect(&self, envelope: &[f64], start: f64) -> Vec<Event> {
        let mut events = detect(
            envelope,
            self.criteria.prominence,
            self.criteria.min_height,
            self.criteria.min_width,
        );
        for e in &mut events {
            e.timestamp = start + e.index_in_window as f64 / self.sampling_rate;
        }
        events
    }
}

/// Qualifying peaks in index order, timestamped relative to the window start (index seconds = 0).
pub fn detect(envelope: &[f64], prominence: f64, min_height: f64, min_width: f64) -> Vec<Event> {
    local_maxima(envelope)
        .into_iter()
        .filter(|&p| envelope[p] >= min_height)
        .filter_map(|p| {
            let (prom, left_base, right_base) = peak_prominence(envelope, p);
            if prom < prominence {
                return None;
            }
            let width = peak_width(envelope, p, prom, left_base, right_base);
            if width < min_width {
                return None;
            }
            Some(Event {
                index_in_window: p,
                timestamp: 0.0,
                amplitude: envelope[p],
                prominence: prom,
                width,
            })
        })
        .collect()
}

/// Indices of strict local maxima; a flat top is reported at its first sample.
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let last = x.len() - 1;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push(i);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

/// Prominence of `peak` plus the indices of its left and right bases.
fn peak_prominence(x: &[f64], peak: usize) -> (f64, usize, usize) {
    let height = x[peak];

    let mut left_min = height;
    let mut left_base = peak;
    let mut i = peak as isize;
    while i >= 0 && x[i as usize] <= height {
        if x[i as usize] < left_min {
            left_min = x[i as usize];
            left_base = i as usize;
        }
        i -= 1;
    }

    let mut right_min = height;
    let mut right_base = peak;
    let mut j = peak;
    while j < x.len() && x[j] <= height {
        if x[j] < right_min {
            right_min = x[j];
            right_base = j;
        }
        j += 1;
    }

    (height - left_min.max(right_min), left_base, right_base)
}

/// Width at half prominence, interpolated, bounded by the peak's bases.
fn peak_width(x: &[f64], peak: usize, prominence: f64, left_base: usize, right_base: usize) -> f64 {
    let level = x[peak] - prominence * 0.5;

    let mut i = peak;
    while left_base < i && level < x[i] {
        i -= 1;
    }
    let mut left = i as f64;
    if x[i] < level {
        left += (level - x[i]) / (x[i + 1] - x[i]);
    }

    let mut j = peak;
    while j < right_base && level < x[j] {
        j += 1;
    }
    let mut right = j as f64;
    if x[j] < level {
        right -= (level - x[j]) / (x[j - 1] - x[j]);
    }

    right - left
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::test_helpers::gaussian;

    fn bump(h: f64) -> Vec<f64> {
        gaussian(100, 50.0, 4.0, h)
    }

    #[test]
    fn test_single_bump_detected() {
        let events = detect(&bump(3.0), 0.005, 1.25, 1.25);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].index_in_window, 50);
        assert!((events[0].amplitude - 3.0).abs() < 1e-12);
        // FWHM of a Gaussian is 2.3548 σ
        assert!((events[0].width - 2.3548 * 4.0).abs() < 0.2, "width {}", events[0].width);
    }

    #[test]
    fn test_height_boundary() {
        let env = bump(2.0);
        assert_eq!(detect(&env, 0.005, 2.0, 1.0).len(), 1, "height equal to threshold qualifies");
        assert!(detect(&env, 0.005, 2.0 + 1e-9, 1.0).is_empty());
    }

    #[test]
    fn test_width_boundary() {
        let env = bump(2.0);
        let width = detect(&env, 0.0, 0.0, 0.0)[0].width;
        assert_eq!(detect(&env, 0.005, 1.0, width).len(), 1, "width equal to threshold qualifies");
        assert!(detect(&env, 0.005, 1.0, width + 1e-9).is_empty());
    }

    #[test]
    fn test_prominence_filters_ripples() {
        // Small ripple riding on the flank of a large bump
        let mut env = bump(4.0);
        env[30] += 0.05;
        let events = detect(&env, 0.5, 0.0, 0.0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].index_in_window, 50);
    }

    #[test]
    fn test_plateau_resolves_to_first_index() {
        let env = [0.0, 1.0, 3.0, 3.0, 3.0, 1.0, 0.0];
        let events = detect(&env, 0.0, 0.0, 0.0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].index_in_window, 2);
    }

    #[test]
    fn test_edges_are_not_peaks() {
        let env = [5.0, 4.0, 3.0, 2.0, 3.0, 4.0, 5.0];
        assert!(detect(&env, 0.0, 0.0, 0.0).is_empty());
    }

    #[test]
    fn test_empty_and_flat() {
        assert!(detect(&[], 0.005, 1.25, 1.25).is_empty());
        assert!(detect(&[1.0; 50], 0.0, 0.0, 0.0).is_empty());
    }

    #[test]
    fn test_two_bumps_ordered() {
        let a = gaussian(120, 30.0, 3.0, 2.0);
        let b = gaussian(120, 90.0, 3.0, 3.0);
        let env: Vec<f64> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        let events = detect(&env, 0.1, 1.0, 1.0);
        let idx: Vec<usize> = events.iter().map(|e| e.index_in_window).collect();
        assert_eq!(idx, vec![30, 90]);
    }

    #[test]
    fn test_detector_timestamps() {
        let d = EventDetector::new(
            PeakCriteria {
                prominence: 0.005,
                min_height: 1.25,
                min_width: 1.25,
            },
            500.0,
        );
        let events = d.detect(&bump(3.0), 10.0);
        assert_eq!(events.len(), 1);
        assert!((events[0].timestamp - 10.1).abs() < 1e-12);
    }
}
