//! Zero-phase FIR convolution of trial data.
//!
//! Overlap-add in the frequency domain, as MNE's `_overlap_add_filter`.
//! The output is shifted left by `(N-1)/2` samples instead of running the
//! filter twice. Each row is padded by `N-1` samples of odd reflection on
//! both sides; rows shorter than the kernel get zeros past the reflection.
use std::sync::Arc;

use ndarray::{Array3, ArrayViewMut1, Axis};
use rayon::prelude::*;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::error::{Error, Result};

/// A zero-phase FIR kernel prepared for rows of one fixed length.
///
/// FFT plans and the kernel spectrum are computed once and shared by every
/// row, so one instance serves all channels of all trials.
pub struct ZeroPhaseFir {
    n_h: usize,
    n_x: usize,
    n_fft: usize,
    h_fft: Vec<Complex<f64>>,
    fwd: Arc<dyn Fft<f64>>,
    inv: Arc<dyn Fft<f64>>,
}

impl ZeroPhaseFir {
    /// Prepare `h` (odd length) for rows of `n_x` samples.
    pub fn new(h: &[f64], n_x: usize) -> Result<Self> {
        let n_h = h.len();
        if n_h % 2 == 0 {
            return Err(Error::config(format!("FIR length {n_h} must be odd for zero phase")));
        }
        if n_x == 0 {
            return Err(Error::config("cannot filter empty rows"));
        }
        let fir = {
            let n_ext = n_x + 2 * (n_h - 1);
            let n_fft = choose_fft_len(n_h, n_ext);
            let mut planner: FftPlanner<f64> = FftPlanner::new();
            let fwd = planner.plan_fft_forward(n_fft);
            let inv = planner.plan_fft_inverse(n_fft);
            let mut h_fft: Vec<Complex<f64>> = h
                .iter()
                .map(|&v| Complex { re: v, im: 0.0 })
                .chain(std::iter::repeat(Complex::default()))
                .take(n_fft)
                .collect();
            fwd.process(&mut h_fft);
            Self { n_h, n_x, n_fft, h_fft, fwd, inv }
        };
        if fir.pad_shortfall() > 0 {
            log::warn!(
                "filter length {} exceeds trial length {}; edges are zero-padded \
                 beyond the reflection and may ring",
                n_h,
                n_x
            );
        }
        Ok(fir)
    }

    /// Zero samples added on each side because the row is too short to
    /// reflect `N-1` samples.
    pub fn pad_shortfall(&self) -> usize {
        (self.n_h - 1).saturating_sub(self.n_x - 1)
    }

    /// Filter one row in place.
    pub fn apply(&self, mut row: ArrayViewMut1<f64>) -> Result<()> {
        if row.len() != self.n_x {
            return Err(Error::config(format!(
                "row has {} samples, kernel prepared for {}",
                row.len(),
                self.n_x
            )));
        }
        let x: Vec<f64> = row.iter().copied().collect();
        let n_edge = self.n_h - 1;
        let shift = n_edge / 2;
        let x_ext = reflect_limited_pad(&x, n_edge);
        let n_ext = x_ext.len();

        let n_seg = self.n_fft - self.n_h + 1;
        let inv_scale = 1.0 / self.n_fft as f64;
        let mut acc = vec![0.0_f64; n_ext];
        let mut buf = vec![Complex::default(); self.n_fft];

        for start in (0..n_ext).step_by(n_seg) {
            let stop = (start + n_seg).min(n_ext);
            buf.fill(Complex::default());
            for (b, &v) in buf.iter_mut().zip(&x_ext[start..stop]) {
                b.re = v;
            }
            self.fwd.process(&mut buf);
            for (b, &hf) in buf.iter_mut().zip(&self.h_fft) {
                *b *= hf;
            }
            self.inv.process(&mut buf);

            // Product sample p lands at start + p - shift.
            let skip = shift.saturating_sub(start);
            let out_start = start.saturating_sub(shift);
            for (o, b) in acc[out_start..].iter_mut().zip(&buf[skip..]) {
                *o += b.re * inv_scale;
            }
        }

        row.assign(&ndarray::ArrayView1::from(&acc[n_edge..n_edge + self.n_x]));
        Ok(())
    }
}

/// Filter every channel of every trial of `[E, C, T]` data in place.
///
/// Trials are padded separately, so no signal leaks across trial
/// boundaries. Runs in parallel over trials.
pub fn filter_trials(trials: &mut Array3<f64>, h: &[f64]) -> Result<()> {
    let fir = ZeroPhaseFir::new(h, trials.len_of(Axis(2)))?;
    trials
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .try_for_each(|mut trial| trial.rows_mut().into_iter().try_for_each(|row| fir.apply(row)))
}

/// Filter a single 1-D signal; returns a vector of the same length.
pub fn filter_1d(x: &[f64], h: &[f64]) -> Result<Vec<f64>> {
    if x.is_empty() {
        return Ok(vec![]);
    }
    let mut y = ndarray::Array1::from(x.to_vec());
    ZeroPhaseFir::new(h, x.len())?.apply(y.view_mut())?;
    Ok(y.to_vec())
}

/// Odd reflection about the end samples, `n` samples per side, with zeros
/// outside once the signal runs out (MNE `_smart_pad`).
fn reflect_limited_pad(x: &[f64], n: usize) -> Vec<f64> {
    let len = x.len();
    let reflect = n.min(len - 1);
    let (first, last) = (x[0], x[len - 1]);

    let mut out = Vec::with_capacity(len + 2 * n);
    out.extend(std::iter::repeat(0.0).take(n - reflect));
    out.extend((1..=reflect).rev().map(|i| 2.0 * first - x[i]));
    out.extend_from_slice(x);
    out.extend((1..=reflect).map(|i| 2.0 * last - x[len - 1 - i]));
    out.extend(std::iter::repeat(0.0).take(n - reflect));
    out
}

/// Power-of-two block size minimising MNE's overlap-add cost
/// `ceil(n_x / (N - n_h + 1)) * N * (log2(N) + 1) + 4e-5 * N * n_x`.
fn choose_fft_len(n_h: usize, n_x: usize) -> usize {
    let min_fft = 2 * n_h - 1;
    let min_pow = (min_fft as f64).log2().ceil() as u32;
    let max_pow = ((n_x as f64).log2().ceil() as u32 + 1).max(min_pow);

    (min_pow..=max_pow)
        .map(|pow| {
            let n = 1_usize << pow;
            let blocks = (n_x as f64 / (n - n_h + 1) as f64).ceil();
            let cost = blocks * n as f64 * (pow as f64 + 1.0) + 4e-5 * n as f64 * n_x as f64;
            (n, cost)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(n, _)| n)
        .unwrap_or(1 << min_pow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::design::{design_bandpass, design_highpass};

    #[test]
    fn filter_preserves_length() {
        let x: Vec<f64> = (0..1024).map(|i| (i as f64 / 1024.0).sin()).collect();
        let h = design_highpass(0.5, 256.0);
        let y = filter_1d(&x, &h).unwrap();
        assert_eq!(y.len(), x.len());
    }

    #[test]
    fn filter_removes_dc() {
        let x = vec![1.0_f64; 4096];
        let h = design_highpass(0.5, 256.0);
        let y = filter_1d(&x, &h).unwrap();
        let n_h = h.len();
        let interior = &y[n_h..y.len() - n_h];
        let max_val: f64 = interior.iter().map(|v| v.abs()).fold(0.0_f64, f64::max);
        assert!(max_val < 1e-3, "DC not removed: max={max_val}");
    }

    #[test]
    fn trials_match_row_filtering() {
        let h = design_bandpass(1.0, 80.0, 600.0).unwrap();
        let mut trials = Array3::from_shape_fn((2, 2, 1200), |(e, c, t)| {
            let x = t as f64 / 600.0;
            (2.0 * std::f64::consts::PI * 10.0 * x).sin() * (1.0 + e as f64) + c as f64
        });
        let row = trials.slice(ndarray::s![1, 0, ..]).to_vec();
        filter_trials(&mut trials, &h).unwrap();
        let single = filter_1d(&row, &h).unwrap();
        for (a, b) in trials.slice(ndarray::s![1, 0, ..]).iter().zip(&single) {
            approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn kernel_longer_than_trial_is_zero_padded() {
        // Default band at 600 Hz gives 1981 taps; 2 s trials hold 1200.
        let h = design_bandpass(1.0, 80.0, 600.0).unwrap();
        assert!(h.len() > 1200);
        let fir = ZeroPhaseFir::new(&h, 1200).unwrap();
        assert_eq!(fir.pad_shortfall(), h.len() - 1200);

        let mut trials = Array3::from_shape_fn((1, 1, 1200), |(_, _, t)| {
            (2.0 * std::f64::consts::PI * 20.0 * t as f64 / 600.0).sin()
        });
        filter_trials(&mut trials, &h).unwrap();
        assert!(trials.iter().all(|v| v.is_finite()));
        // 20 Hz sits in the pass band; mid-trial amplitude survives.
        let mid = trials.slice(ndarray::s![0, 0, 450..750]);
        let peak = mid.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        approx::assert_abs_diff_eq!(peak, 1.0, epsilon = 0.05);
    }

    #[test]
    fn long_trial_needs_no_zero_padding() {
        let h = design_bandpass(1.0, 80.0, 600.0).unwrap();
        assert_eq!(ZeroPhaseFir::new(&h, 6000).unwrap().pad_shortfall(), 0);
    }

    #[test]
    fn wrong_row_length_rejected() {
        let fir = ZeroPhaseFir::new(&[0.25, 0.5, 0.25], 8).unwrap();
        let mut row = ndarray::Array1::<f64>::zeros(9);
        assert!(matches!(fir.apply(row.view_mut()), Err(Error::Configuration(_))));
    }

    #[test]
    fn even_length_kernel_rejected() {
        assert!(filter_1d(&[1.0, 2.0, 3.0], &[0.5, 0.5]).is_err());
    }

    #[test]
    fn reflection_then_zeros() {
        let x = [1.0_f64, 2.0, 3.0, 4.0, 5.0];
        let padded = reflect_limited_pad(&x, 3);
        // 2*1 - x[3], 2*1 - x[2], 2*1 - x[1]
        assert_eq!(&padded[..3], &[-2.0_f64, -1.0, 0.0]);
        assert_eq!(&padded[3..8], &x[..]);
        assert_eq!(&padded[8..], &[6.0_f64, 7.0, 8.0]);

        let short = reflect_limited_pad(&[1.0, 3.0], 3);
        assert_eq!(short, vec![0.0, 0.0, -1.0, 1.0, 3.0, 5.0, 0.0, 0.0]);
    }
}
