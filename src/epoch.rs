//! Fixed-length trial segmentation.
//!
//! Resting-state recordings carry no events, so trials are cut as
//! non-overlapping windows of `trial_samples` samples from continuous
//! [C, T] data, dropping any trailing incomplete window.
use ndarray::{Array2, Array3, s};

use crate::error::{Error, Result};

/// Segment `data` ([C, T]) into a 3-D array [E, C, trial_samples].
/// Trailing samples that don't fill a complete trial are discarded.
///
/// # Errors
///
/// [`Error::Configuration`] when `trial_samples` is zero or the recording is
/// shorter than one trial.
pub fn segment(data: &Array2<f64>, trial_samples: usize) -> Result<Array3<f64>> {
    let (n_ch, n_t) = data.dim();
    if trial_samples == 0 {
        return Err(Error::config("trial length must be at least one sample"));
    }
    let n_trials = n_t / trial_samples;
    if n_trials == 0 {
        return Err(Error::config(format!(
            "recording of {n_t} samples is shorter than one {trial_samples}-sample trial"
        )));
    }

    let mut out = Array3::<f64>::zeros((n_trials, n_ch, trial_samples));
    for e in 0..n_trials {
        let start = e * trial_samples;
        out.slice_mut(s![e, .., ..])
           .assign(&data.slice(s![.., start..start + trial_samples]));
    }
    log::debug!(
        "segmented {n_t} samples into {n_trials} trials of {trial_samples} ({} dropped)",
        n_t - n_trials * trial_samples
    );
    Ok(out)
}

/// Number of samples in a trial of `duration` seconds at `sfreq` Hz.
pub fn trial_samples(duration: f64, sfreq: f64) -> usize {
    (duration * sfreq).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn trial_count_and_shape() {
        let data = Array2::from_elem((12, 3600), 1.0);
        let trials = segment(&data, 1200).unwrap();
        assert_eq!(trials.shape(), &[3, 12, 1200]);
    }

    #[test]
    fn trailing_samples_dropped() {
        let data = Array2::from_shape_fn((4, 1300), |(_, t)| t as f64);
        let trials = segment(&data, 600).unwrap();
        assert_eq!(trials.shape()[0], 2);
        assert_eq!(trials[[1, 0, 0]], 600.0);
    }

    #[test]
    fn too_short_recording_rejected() {
        let data = Array2::zeros((4, 100));
        assert!(segment(&data, 600).is_err());
        assert!(segment(&data, 0).is_err());
    }

    #[test]
    fn samples_from_duration() {
        assert_eq!(trial_samples(2.0, 600.0), 1200);
        assert_eq!(trial_samples(1.0, 1200.0), 1200);
    }
}
