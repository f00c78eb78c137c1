//! FIR filter design matching MNE / `scipy.signal.firwin`.
//!
//! For a band-pass filter `[l_freq, h_freq]` Hz at sampling rate `sfreq`:
//!   • low transition bandwidth  = min(max(0.25 * l_freq, 2.0), l_freq)
//!   • high transition bandwidth = min(max(0.25 * h_freq, 2.0), nyq - h_freq)
//!   • filter length N = ceil(3.3 / min(tb_low, tb_high) * sfreq), rounded to odd
//!   • windowed-sinc design (Hamming window), cutoffs at the transition midpoints
use std::f64::consts::PI;

use crate::error::{Error, Result};

/// MNE-compatible transition bandwidth for the lower band edge.
///
/// Rule: `min(max(0.25 * l_freq, 2.0), l_freq)`
pub fn auto_trans_bandwidth(l_freq: f64) -> f64 {
    (0.25 * l_freq).max(2.0).min(l_freq)
}

/// MNE-compatible transition bandwidth for the upper band edge.
///
/// Rule: `min(max(0.25 * h_freq, 2.0), nyq - h_freq)`
pub fn auto_trans_bandwidth_high(h_freq: f64, sfreq: f64) -> f64 {
    (0.25 * h_freq).max(2.0).min(sfreq / 2.0 - h_freq)
}

/// Number of FIR taps for a given transition bandwidth.
/// Returns an odd integer (required for zero-phase linear-phase FIR).
///
/// Formula: `ceil(3.3 / trans_bw * sfreq)` rounded up to odd.
pub fn auto_filter_length(trans_bw: f64, sfreq: f64) -> usize {
    let n_raw = (3.3 / trans_bw * sfreq).ceil() as usize;
    if n_raw % 2 == 0 { n_raw + 1 } else { n_raw }
}

/// Design a zero-phase highpass FIR filter using a Hamming-windowed sinc.
///
/// Matches `mne.filter.create_filter(None, sfreq, l_freq=l_freq, h_freq=None,
///   filter_length='auto', fir_window='hamming', fir_design='firwin', phase='zero')`.
pub fn design_highpass(l_freq: f64, sfreq: f64) -> Vec<f64> {
    let trans_bw = auto_trans_bandwidth(l_freq);
    let n = auto_filter_length(trans_bw, sfreq);
    let cutoff_hz = l_freq - trans_bw / 2.0;
    firwin(n, cutoff_hz, sfreq, false)
}

/// Design a zero-phase band-pass FIR filter.
///
/// When `h_freq` is at or above Nyquist (no room for an upper transition
/// band) the design degrades to [`design_highpass`] at `l_freq`.
///
/// # Errors
///
/// [`Error::Configuration`] unless `0 < l_freq < h_freq` and
/// `l_freq < sfreq / 2`.
pub fn design_bandpass(l_freq: f64, h_freq: f64, sfreq: f64) -> Result<Vec<f64>> {
    let nyq = sfreq / 2.0;
    if !(l_freq > 0.0 && h_freq > l_freq && l_freq < nyq) {
        return Err(Error::config(format!(
            "invalid pass band [{l_freq}, {h_freq}] Hz at {sfreq} Hz"
        )));
    }
    let tb_high = auto_trans_bandwidth_high(h_freq, sfreq);
    if tb_high <= 0.0 {
        log::warn!("upper band edge {h_freq} Hz >= Nyquist {nyq} Hz; using highpass only");
        return Ok(design_highpass(l_freq, sfreq));
    }
    let tb_low = auto_trans_bandwidth(l_freq);
    let n = auto_filter_length(tb_low.min(tb_high), sfreq);

    let f_lo = l_freq - tb_low / 2.0;
    let f_hi = (h_freq + tb_high / 2.0).min(nyq);

    // Band-pass = lowpass(f_hi) − lowpass(f_lo).
    let lp_hi = firwin(n, f_hi, sfreq, true);
    let lp_lo = firwin(n, f_lo, sfreq, true);
    let mut h: Vec<f64> = lp_hi.iter().zip(&lp_lo).map(|(a, b)| a - b).collect();

    // Unit gain at the centre of the pass band (scipy's `scale=True`).
    let w = 2.0 * PI * ((l_freq + h_freq) / 2.0) / sfreq;
    let alpha = (n - 1) as f64 / 2.0;
    let gain: f64 = h
        .iter()
        .enumerate()
        .map(|(i, &v)| v * (w * (i as f64 - alpha)).cos())
        .sum();
    if gain.abs() > f64::EPSILON {
        h.iter_mut().for_each(|v| *v /= gain);
    }
    Ok(h)
}

/// Design a lowpass FIR filter using a Hamming-windowed sinc.
///
/// `pass_zero=true` means the DC component passes (lowpass).
/// `cutoff_hz` is the -6 dB point.
pub fn firwin(n: usize, cutoff_hz: f64, sfreq: f64, pass_zero: bool) -> Vec<f64> {
    assert!(n % 2 == 1, "firwin requires odd N for linear-phase filter");
    let alpha = (n - 1) as f64 / 2.0;
    let nyq = sfreq / 2.0;
    let fc = cutoff_hz / nyq;

    let win = hamming(n);

    let mut h: Vec<f64> = (0..n)
        .map(|i| {
            let x = i as f64 - alpha;
            // f(x) = sin(π·fc·x) / (π·x);  lim_{x→0} f(x) = fc
            let sinc = if x == 0.0 { fc } else { (PI * fc * x).sin() / (PI * x) };
            sinc * win[i]
        })
        .collect();

    // Normalise so sum = 1 (unit DC gain for lowpass).
    let s: f64 = h.iter().sum();
    h.iter_mut().for_each(|v| *v /= s);

    if !pass_zero {
        // Highpass by spectral inversion.
        h.iter_mut().for_each(|v| *v = -*v);
        h[n / 2] += 1.0;
    }

    h
}

/// Hamming window of length `n`.
pub fn hamming(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}
