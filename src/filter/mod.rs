//! FIR filter design and application.
//!
//! - [`design`]: Hamming-windowed sinc band-pass / highpass FIR design,
//!   matching `mne.filter.create_filter(fir_window='hamming', phase='zero')`.
//! - [`apply`]: Overlap-add zero-phase convolution, matching MNE's
//!   `_overlap_add_filter`, one prepared kernel shared across trials.

pub mod apply;
pub mod design;

pub use design::{
    auto_filter_length, auto_trans_bandwidth, auto_trans_bandwidth_high, design_bandpass,
    design_highpass, firwin, hamming,
};
pub use apply::{filter_1d, filter_trials, ZeroPhaseFir};
