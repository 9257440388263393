//! Shared DSP primitives: Butterworth design, direct-form filtering,
//! zero-phase (forward-backward) filtering, and test signal generators.

use num_complex::Complex64;
use std::f64::consts::PI;

/// Transfer-function coefficients, normalised so `a[0] == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    pub b: Vec<f64>,
    pub a: Vec<f64>,
}

impl Coefficients {
    /// Samples of odd-extension padding used by `filtfilt`.
    /// Input must be strictly longer than this.
    pub fn padlen(&self) -> usize {
        3 * self.a.len().max(self.b.len())
    }
}

/// Analog Butterworth prototype poles (unit cutoff), left half-plane.
fn prototype_poles(order: usize) -> Vec<Complex64> {
    let n = order as i64;
    (0..n)
        .map(|k| {
            let m = -n + 1 + 2 * k;
            -Complex64::from_polar(1.0, PI * m as f64 / (2.0 * n as f64))
        })
        .collect()
}

/// Pre-warp a cutoff in Hz to the analog frequency the bilinear transform maps onto it.
fn prewarp(cutoff_hz: f64, sampling_rate: f64) -> f64 {
    // Normalised to Nyquist, with the bilinear transform at fs = 2.
    let wn = cutoff_hz / (sampling_rate / 2.0);
    4.0 * (PI * wn / 2.0).tan()
}

/// Bilinear transform of an analog zpk system to digital coefficients.
fn bilinear(zeros: &[Complex64], poles: &[Complex64], gain: f64) -> Coefficients {
    let fs2 = Complex64::new(4.0, 0.0);
    let mut z_d: Vec<Complex64> = zeros.iter().map(|z| (fs2 + z) / (fs2 - z)).collect();
    let p_d: Vec<Complex64> = poles.iter().map(|p| (fs2 + p) / (fs2 - p)).collect();
    // Zeros at infinity land on Nyquist.
    z_d.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(poles.len() - zeros.len()));

    let num: Complex64 = zeros.iter().map(|z| fs2 - z).product();
    let den: Complex64 = poles.iter().map(|p| fs2 - p).product();
    let k = gain * (num / den).re;

    let b = poly(&z_d).into_iter().map(|c| k * c.re).collect();
    let a = poly(&p_d).into_iter().map(|c| c.re).collect();
    Coefficients { b, a }
}

/// Expand roots into monic polynomial coefficients, highest power first.
fn poly(roots: &[Complex64]) -> Vec<Complex64> {
    let mut coeffs = vec![Complex64::new(1.0, 0.0)];
    for r in roots {
        let mut next = vec![Complex64::new(0.0, 0.0); coeffs.len() + 1];
        for (i, c) in coeffs.iter().enumerate() {
            next[i] += c;
            next[i + 1] -= c * r;
        }
        coeffs = next;
    }
    coeffs
}

/// Digital Butterworth low-pass.
pub fn butter_lowpass(order: usize, cutoff_hz: f64, sampling_rate: f64) -> Coefficients {
    let wo = prewarp(cutoff_hz, sampling_rate);
    let poles: Vec<Complex64> = prototype_poles(order).into_iter().map(|p| p * wo).collect();
    bilinear(&[], &poles, wo.powi(order as i32))
}

/// Digital Butterworth band-pass. The result has `2 * order` poles.
pub fn butter_bandpass(order: usize, low_hz: f64, high_hz: f64, sampling_rate: f64) -> Coefficients {
    let wl = prewarp(low_hz, sampling_rate);
    let wh = prewarp(high_hz, sampling_rate);
    let bw = wh - wl;
    let wo2 = wl * wh;

    let mut poles = Vec::with_capacity(2 * order);
    let scaled: Vec<Complex64> = prototype_poles(order).into_iter().map(|p| p * bw / 2.0).collect();
    for p in &scaled {
        poles.push(p + (p * p - wo2).sqrt());
    }
    for p in &scaled {
        poles.push(p - (p * p - wo2).sqrt());
    }
    let zeros = vec![Complex64::new(0.0, 0.0); order];
    bilinear(&zeros, &poles, bw.powi(order as i32))
}

/// Direct form II transposed filter with initial state `zi`.
pub fn lfilter(coeffs: &Coefficients, x: &[f64], zi: &[f64]) -> Vec<f64> {
    let (b, a) = (&coeffs.b, &coeffs.a);
    let n = a.len().max(b.len());
    let mut z = zi.to_vec();
    z.resize(n - 1, 0.0);
    let coef = |v: &Vec<f64>, i: usize| v.get(i).copied().unwrap_or(0.0);

    let mut y = Vec::with_capacity(x.len());
    for &xv in x {
        let yv = coef(b, 0) * xv + z.first().copied().unwrap_or(0.0);
        for i in 0..n.saturating_sub(2) {
            z[i] = coef(b, i + 1) * xv + z[i + 1] - coef(a, i + 1) * yv;
        }
        if n >= 2 {
            z[n - 2] = coef(b, n - 1) * xv - coef(a, n - 1) * yv;
        }
        y.push(yv);
    }
    y
}

/// Steady-state initial conditions for a unit step input.
pub fn lfilter_zi(coeffs: &Coefficients) -> Vec<f64> {
    let n = coeffs.a.len().max(coeffs.b.len());
    if n < 2 {
        return Vec::new();
    }
    let coef = |v: &Vec<f64>, i: usize| v.get(i).copied().unwrap_or(0.0);
    let m = n - 1;

    // (I - companion(a)^T) zi = b[1:] - a[1:] * b[0]
    let mut mat = vec![vec![0.0; m]; m];
    for (i, row) in mat.iter_mut().enumerate() {
        row[i] = 1.0;
        row[0] += coef(&coeffs.a, i + 1);
        if i + 1 < m {
            row[i + 1] -= 1.0;
        }
    }
    let rhs: Vec<f64> = (0..m)
        .map(|i| coef(&coeffs.b, i + 1) - coef(&coeffs.a, i + 1) * coef(&coeffs.b, 0))
        .collect();
    solve(mat, rhs)
}

/// Gauss-Jordan elimination with partial pivoting. The systems here are at most 8×8.
fn solve(mut mat: Vec<Vec<f64>>, mut rhs: Vec<f64>) -> Vec<f64> {
    let n = rhs.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| mat[i][col].abs().total_cmp(&mat[j][col].abs()))
            .unwrap_or(col);
        mat.swap(col, pivot);
        rhs.swap(col, pivot);
        let diag = mat[col][col];
        if diag == 0.0 {
            continue;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = mat[row][col] / diag;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                mat[row][k] -= factor * mat[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    (0..n)
        .map(|i| if mat[i][i] == 0.0 { 0.0 } else { rhs[i] / mat[i][i] })
        .collect()
}

/// Zero-phase filtering: odd-extend by `padlen` on both ends, filter forward,
/// then backward, and trim the extension. Returns `None` if `x` is not
/// longer than `padlen`.
pub fn filtfilt(coeffs: &Coefficients, x: &[f64]) -> Option<Vec<f64>> {
    let edge = coeffs.padlen();
    if x.len() <= edge {
        return None;
    }
    let first = x[0];
    let last = x[x.len() - 1];

    let mut ext = Vec::with_capacity(x.len() + 2 * edge);
    ext.extend((1..=edge).rev().map(|i| 2.0 * first - x[i]));
    ext.extend_from_slice(x);
    ext.extend((0..edge).map(|i| 2.0 * last - x[x.len() - 2 - i]));

    let zi = lfilter_zi(coeffs);
    let scaled = |v: f64| zi.iter().map(|z| z * v).collect::<Vec<_>>();

    let forward = lfilter(coeffs, &ext, &scaled(ext[0]));
    let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
    let backward = lfilter(coeffs, &reversed, &scaled(reversed[0]));
    reversed = backward.into_iter().rev().collect();

    Some(reversed[edge..reversed.len() - edge].to_vec())
}


#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_lowpass_coefficients() {
        // 4th order, 7 Hz at 500 Hz
        let c = butter_lowpass(4, 7.0, 500.0);
        assert_eq!(c.a.len(), 5);
        assert_eq!(c.b.len(), 5);
        assert!(close(c.a[0], 1.0, 1e-12));
        assert!(close(c.a[1], -3.770173287743292, 1e-9));
        assert!(close(c.a[4], 0.7945737641510238, 1e-9));
        assert!(close(c.b[0], 3.3442551676373067e-06, 1e-12));
        // Unity DC gain
        let dc = c.b.iter().sum::<f64>() / c.a.iter().sum::<f64>();
        assert!(close(dc, 1.0, 1e-6), "dc gain {}", dc);
    }

    #[test]
    fn test_bandpass_coefficients() {
        let c = butter_bandpass(4, 74.5, 149.5, 500.0);
        assert_eq!(c.a.len(), 9);
        assert_eq!(c.b.len(), 9);
        assert!(close(c.b[0], 0.018563010626897185, 1e-9));
        assert!(close(c.b[1], 0.0, 1e-9));
        assert!(close(c.b[4], 0.11137806376138311, 1e-9));
        assert!(close(c.a[1], -1.016775807555208, 1e-9));
        assert!(close(c.a[8], 0.07619706461033238, 1e-9));
        // Zero DC gain
        assert!(c.b.iter().sum::<f64>().abs() < 1e-9);
    }

    #[test]
    fn test_padlen() {
        assert_eq!(butter_bandpass(4, 74.5, 149.5, 500.0).padlen(), 27);
        assert_eq!(butter_lowpass(4, 7.0, 500.0).padlen(), 15);
    }

    #[test]
    fn test_lfilter_zi_steady_state() {
        // A step input started from zi must produce a constant output equal to the DC gain.
        let c = butter_lowpass(4, 7.0, 500.0);
        let zi = lfilter_zi(&c);
        let y = lfilter(&c, &[1.0; 50], &zi);
        for v in y {
            assert!(close(v, 1.0, 1e-6), "{}", v);
        }
    }

    #[test]
    fn test_filtfilt_rejects_short_input() {
        let c = butter_lowpass(4, 7.0, 500.0);
        assert!(filtfilt(&c, &[0.0; 15]).is_none());
        assert!(filtfilt(&c, &[0.0; 16]).is_some());
    }

    #[test]
    fn test_filtfilt_preserves_length_and_constant() {
        let c = butter_lowpass(4, 7.0, 500.0);
        let y = filtfilt(&c, &[3.0; 100]).unwrap();
        assert_eq!(y.len(), 100);
        for v in y {
            assert!(close(v, 3.0, 1e-6));
        }
    }

    #[test]
    fn test_filtfilt_is_zero_phase() {
        // A symmetric bump stays centred after forward-backward filtering.
        let c = butter_lowpass(4, 20.0, 500.0);
        let x = gaussian(101, 50.0, 6.0, 1.0);
        let y = filtfilt(&c, &x).unwrap();
        let peak = (0..y.len()).max_by(|&i, &j| y[i].total_cmp(&y[j])).unwrap();
        assert_eq!(peak, 50);
    }

    #[test]
    fn test_bandpass_passes_center_and_blocks_dc() {
        let c = butter_bandpass(4, 74.5, 149.5, 500.0);
        let x = sine_burst(400, 110.0, 1.0, 500.0, 0, 399);
        let y = filtfilt(&c, &x).unwrap();
        let mid_peak = y[100..300].iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(mid_peak > 0.9, "in-band peak {}", mid_peak);

        let dc = filtfilt(&c, &[5.0; 400]).unwrap();
        let leak = dc[100..300].iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(leak < 1e-3, "dc leak {}", leak);
    }
}
