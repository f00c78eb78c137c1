/// Shared synthetic fixtures: spherical head, magnetometer helmet, lattice
/// grid, one simulated dipole and a two-parcel atlas.
use megparc::filter::{design_bandpass, filter_1d};
use megparc::{
    forward_gain, Affine, Atlas, CoordSys, HeadModel, SensorArray, SensorData, SourceModel,
    SubjectInputs,
};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Array3, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::PI;

pub const SFREQ: f64 = 200.0;
pub const BAND: (f64, f64) = (4.0, 40.0);
pub const N_TRIALS: usize = 20;
pub const N_SAMPLES: usize = 400;

/// Lattice step of the source grid and voxel size of the atlas (metres).
pub const SPACING: f64 = 0.02;
/// Native head space → template space.
pub const SHIFT: [f64; 3] = [0.0, 0.0, 0.04];
/// Simulated source, native space. Lies on the lattice.
pub const DIPOLE: [f64; 3] = [0.02, 0.0, 0.04];
/// Tangential to the sphere at `DIPOLE`.
pub const DIPOLE_ORI: [f64; 3] = [0.0, 1.0, 0.0];

/// Noise directions / floor of the structured-noise scenario.
pub const NOISE_RANK: usize = 40;

#[allow(unused)]
pub fn native() -> CoordSys {
    CoordSys::new("head")
}

#[allow(unused)]
pub fn template() -> CoordSys {
    CoordSys::new("mni")
}

#[allow(unused)]
pub fn labels(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("MEG{i:03}")).collect()
}

#[allow(unused)]
/// `n` radial magnetometers on the upper hemisphere of a 12 cm sphere
/// (Fibonacci spiral).
pub fn helmet(n: usize) -> SensorArray {
    let golden = PI * (3.0 - 5f64.sqrt());
    let mut pos = Array2::zeros((n, 3));
    let mut ori = Array2::zeros((n, 3));
    for i in 0..n {
        let z = (i as f64 + 0.5) / n as f64;
        let r = (1.0 - z * z).sqrt();
        let phi = golden * i as f64;
        let u = [r * phi.cos(), r * phi.sin(), z];
        for a in 0..3 {
            pos[[i, a]] = 0.12 * u[a];
            ori[[i, a]] = u[a];
        }
    }
    SensorArray::magnetometers(labels(n), pos, ori, native()).unwrap()
}

#[allow(unused)]
pub fn head() -> HeadModel {
    HeadModel::single_sphere([0.0; 3], 0.09, native())
}

#[allow(unused)]
/// Lattice points within 7 cm of the sphere centre. The centre itself is
/// flagged outside: a sphere is blind to dipoles there.
pub fn lattice() -> SourceModel {
    let mut rows = Vec::new();
    for a in -3i32..=3 {
        for b in -3i32..=3 {
            for c in -3i32..=3 {
                if a * a + b * b + c * c <= 12 {
                    rows.extend([a as f64 * SPACING, b as f64 * SPACING, c as f64 * SPACING]);
                }
            }
        }
    }
    let n = rows.len() / 3;
    let pos = Array2::from_shape_vec((n, 3), rows).unwrap();
    let inside = pos.rows().into_iter().map(|p| p.dot(&p) > 1e-12).collect();
    SourceModel::new(pos, native()).unwrap().with_inside(inside).unwrap()
}

#[allow(unused)]
/// Index of the grid point closest to `p`.
pub fn grid_index(grid: &SourceModel, p: [f64; 3]) -> usize {
    (0..grid.n_points())
        .min_by(|&i, &j| {
            let d = |k: usize| {
                let q = grid.point(k);
                (0..3).map(|a| (q[a] - p[a]).powi(2)).sum::<f64>()
            };
            d(i).total_cmp(&d(j))
        })
        .unwrap()
}

#[allow(unused)]
pub fn to_template() -> Affine {
    Affine::translation(SHIFT)
}

#[allow(unused)]
/// 7×7×7 atlas whose voxel centres coincide with the shifted lattice.
/// Label 1 ("dipole") is the single voxel holding the simulated source;
/// label 2 ("left") is every voxel with x < 0; the rest is background.
pub fn atlas() -> Atlas {
    let mut vol = Array3::<u32>::zeros((7, 7, 7));
    for ((i, _, _), v) in vol.indexed_iter_mut() {
        if i < 3 {
            *v = 2;
        }
    }
    let dip = [
        (DIPOLE[0] / SPACING).round() as usize + 3,
        (DIPOLE[1] / SPACING).round() as usize + 3,
        (DIPOLE[2] / SPACING).round() as usize + 3,
    ];
    vol[dip] = 1;
    let o = -3.0 * SPACING;
    let affine = Affine::from_row_slice(&[
        SPACING, 0.0, 0.0, o + SHIFT[0],
        0.0, SPACING, 0.0, o + SHIFT[1],
        0.0, 0.0, SPACING, o + SHIFT[2],
        0.0, 0.0, 0.0, 1.0,
    ])
    .unwrap();
    let names = BTreeMap::from([(1, "dipole".to_string()), (2, "left".to_string())]);
    Atlas::new(vol, affine, names, template()).unwrap()
}

/// Standard normal draw (Box–Muller).
pub fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

#[allow(unused)]
/// Amplitude-modulated 10 Hz source with a random phase per trial,
/// `[trials, samples]`, unit peak.
pub fn source_waveform(n_trials: usize, n_samples: usize, rng: &mut StdRng) -> Array2<f64> {
    let mut s = Array2::zeros((n_trials, n_samples));
    for e in 0..n_trials {
        let phi = 2.0 * PI * rng.gen::<f64>();
        let psi = 2.0 * PI * rng.gen::<f64>();
        for t in 0..n_samples {
            let time = t as f64 / SFREQ;
            s[[e, t]] = (2.0 * PI * 10.0 * time + phi).sin()
                * (1.0 + 0.5 * (2.0 * PI * 1.0 * time + psi).sin());
        }
    }
    s
}

#[allow(unused)]
/// Sensor gain of the simulated dipole, `[C]`, native space.
pub fn dipole_gain(grad: &SensorArray) -> Array1<f64> {
    let g = forward_gain(&head(), grad, DIPOLE).unwrap();
    g.dot(&Array1::from(DIPOLE_ORI.to_vec()))
}

/// Simulated recording plus the injected waveform.
pub struct Scenario {
    pub sensors: SensorData,
    /// `[trials, samples]` source waveform.
    pub truth: Array2<f64>,
}

#[allow(unused)]
/// Dipole only, no noise.
pub fn noiseless(grad: SensorArray, seed: u64) -> Scenario {
    let mut rng = StdRng::seed_from_u64(seed);
    let truth = source_waveform(N_TRIALS, N_SAMPLES, &mut rng);
    let l = dipole_gain(&grad);
    let mut trials = Array3::zeros((N_TRIALS, grad.n_channels(), N_SAMPLES));
    for e in 0..N_TRIALS {
        for c in 0..grad.n_channels() {
            for t in 0..N_SAMPLES {
                trials[[e, c, t]] = l[c] * truth[[e, t]];
            }
        }
    }
    Scenario { sensors: SensorData::new(trials, SFREQ, grad).unwrap(), truth }
}

#[allow(unused)]
/// Dipole plus noise confined to a random `NOISE_RANK`-dimensional sensor
/// subspace plus a white floor 60 dB down. The covariance spectrum then
/// drops sharply after `NOISE_RANK + 1` components.
pub fn structured(grad: SensorArray, seed: u64) -> Scenario {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_ch = grad.n_channels();
    let truth = source_waveform(N_TRIALS, N_SAMPLES, &mut rng);
    let l = dipole_gain(&grad);

    let sigma = 1e-12;
    let floor = 1e-3 * sigma;
    let amp = 10.0 * sigma / l.dot(&l).sqrt();
    let mix = DMatrix::from_fn(n_ch, NOISE_RANK, |_, _| gaussian(&mut rng)).qr().q();

    let mut trials = Array3::zeros((N_TRIALS, n_ch, N_SAMPLES));
    for e in 0..N_TRIALS {
        for t in 0..N_SAMPLES {
            let z: Vec<f64> = (0..NOISE_RANK).map(|_| sigma * gaussian(&mut rng)).collect();
            for c in 0..n_ch {
                let noise: f64 = (0..NOISE_RANK).map(|j| mix[(c, j)] * z[j]).sum();
                trials[[e, c, t]] =
                    amp * l[c] * truth[[e, t]] + noise + floor * gaussian(&mut rng);
            }
        }
    }
    Scenario { sensors: SensorData::new(trials, SFREQ, grad).unwrap(), truth }
}

#[allow(unused)]
/// One subject: 64-channel helmet, structured noise.
pub fn subject(id: &str, seed: u64) -> SubjectInputs {
    let scenario = structured(helmet(64), seed);
    SubjectInputs {
        subject: id.to_string(),
        sensors: scenario.sensors,
        transform: to_template(),
        target: template(),
        head: head(),
        source: lattice(),
    }
}

#[allow(unused)]
/// Band-pass each trial of `x` exactly as signal conditioning does.
pub fn band_passed(x: &Array2<f64>) -> Array2<f64> {
    let h = design_bandpass(BAND.0, BAND.1, SFREQ).unwrap();
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let y = filter_1d(&row.to_vec(), &h).unwrap();
        row.assign(&ArrayView1::from(&y));
    }
    out
}

#[allow(unused)]
/// Pearson correlation.
pub fn correlation(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    let ma = a.mean().unwrap();
    let mb = b.mean().unwrap();
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma) * (x - ma);
        sbb += (y - mb) * (y - mb);
    }
    sab / (saa * sbb).sqrt()
}
