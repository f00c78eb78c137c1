//! Safetensors I/O.
//!
//! Readers parse subject input bundles and atlas bundles handed over by the
//! upstream tooling; writers persist the two per-subject artifacts.
//!
//! Artifacts are written to a temporary sibling file and renamed into place,
//! so a failed or interrupted job never leaves a partial artifact behind.
//!
//! String lists (channel names, parcel names, coordinate systems) are stored
//! as `U8` tensors holding newline-joined UTF-8.
use ndarray::{Array, Array1, Array2, Array3, ArrayBase, Data, Dimension, IxDyn};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::atlas::Atlas;
use crate::beamformer::SourceEstimate;
use crate::config::PipelineConfig;
use crate::epoch::{segment, trial_samples};
use crate::error::{Error, Result};
use crate::geometry::{Affine, CoordSys, HeadModel, SourceModel, VolumeConductor};
use crate::parcellate::ParcelTimeseries;
use crate::pipeline::SubjectInputs;
use crate::sensors::{SensorArray, SensorData};

// ── Reader ────────────────────────────────────────────────────────────────────

/// A parsed safetensors file held in memory.
pub struct StFile {
    path: PathBuf,
    bytes: Vec<u8>,
    header: HashMap<String, serde_json::Value>,
    data_start: usize,
}

impl StFile {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        if bytes.len() < 8 {
            return Err(Error::config(format!("{}: safetensors file too small", path.display())));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[..8]);
        let data_start = usize::try_from(u64::from_le_bytes(len))
            .ok()
            .and_then(|n| n.checked_add(8))
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                Error::config(format!("{}: truncated safetensors header", path.display()))
            })?;
        let header: HashMap<String, serde_json::Value> =
            serde_json::from_slice(&bytes[8..data_start])?;
        Ok(Self { path: path.to_path_buf(), bytes, header, data_start })
    }

    pub fn has(&self, name: &str) -> bool {
        self.header.contains_key(name)
    }

    /// `__metadata__` string map, empty when absent.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.header
            .get("__metadata__")
            .and_then(|m| m.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn missing(&self, what: &str) -> Error {
        Error::config(format!("{}: {what}", self.path.display()))
    }

    fn raw(&self, name: &str) -> Result<(&str, Vec<usize>, &[u8])> {
        let entry = self
            .header
            .get(name)
            .ok_or_else(|| self.missing(&format!("missing '{name}' tensor")))?;
        let dtype = entry["dtype"]
            .as_str()
            .ok_or_else(|| self.missing(&format!("'{name}' has no dtype")))?;
        let shape: Vec<usize> = entry["shape"]
            .as_array()
            .ok_or_else(|| self.missing(&format!("'{name}' has no shape")))?
            .iter()
            .map(|v| v.as_u64().map(|u| u as usize))
            .collect::<Option<_>>()
            .ok_or_else(|| self.missing(&format!("'{name}' has a malformed shape")))?;
        let offsets = entry["data_offsets"]
            .as_array()
            .filter(|o| o.len() == 2)
            .ok_or_else(|| self.missing(&format!("'{name}' has no data_offsets")))?;
        let s = offsets[0].as_u64().unwrap_or(u64::MAX) as usize;
        let e = offsets[1].as_u64().unwrap_or(u64::MAX) as usize;
        let bytes = self
            .data_start
            .checked_add(e)
            .filter(|&end| s <= e && end <= self.bytes.len())
            .map(|end| &self.bytes[self.data_start + s..end])
            .ok_or_else(|| self.missing(&format!("'{name}' data offsets out of range")))?;
        Ok((dtype, shape, bytes))
    }

    /// Any numeric tensor, converted to `f64`.
    pub fn f64_dyn(&self, name: &str) -> Result<Array<f64, IxDyn>> {
        let (dtype, shape, raw) = self.raw(name)?;
        let vals: Vec<f64> = match dtype {
            "F64" => raw.chunks_exact(8).map(|b| f64::from_le_bytes(to8(b))).collect(),
            "F32" => raw.chunks_exact(4).map(|b| f32::from_le_bytes(to4(b)) as f64).collect(),
            "I64" => raw.chunks_exact(8).map(|b| i64::from_le_bytes(to8(b)) as f64).collect(),
            "I32" => raw.chunks_exact(4).map(|b| i32::from_le_bytes(to4(b)) as f64).collect(),
            "U32" => raw.chunks_exact(4).map(|b| u32::from_le_bytes(to4(b)) as f64).collect(),
            "U16" => raw.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]]) as f64).collect(),
            "U8" => raw.iter().map(|&b| b as f64).collect(),
            other => {
                return Err(self.missing(&format!("'{name}' has unsupported dtype {other}")));
            }
        };
        Ok(Array::from_shape_vec(IxDyn(&shape), vals)?)
    }

    pub fn array1(&self, name: &str) -> Result<Array1<f64>> {
        Ok(self.f64_dyn(name)?.into_dimensionality()?)
    }

    pub fn array2(&self, name: &str) -> Result<Array2<f64>> {
        Ok(self.f64_dyn(name)?.into_dimensionality()?)
    }

    pub fn array3(&self, name: &str) -> Result<Array3<f64>> {
        Ok(self.f64_dyn(name)?.into_dimensionality()?)
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        self.f64_dyn(name)?
            .iter()
            .next()
            .copied()
            .ok_or_else(|| self.missing(&format!("'{name}' is empty")))
    }

    /// Integer label tensor as `u32`; negative or fractional values are
    /// rejected.
    pub fn labels3(&self, name: &str) -> Result<Array3<u32>> {
        let a = self.array3(name)?;
        if a.iter().any(|&v| v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64) {
            return Err(self.missing(&format!("'{name}' holds non-label values")));
        }
        Ok(a.mapv(|v| v as u32))
    }

    /// Newline-joined UTF-8 string list.
    pub fn strings(&self, name: &str) -> Result<Vec<String>> {
        let (_, _, raw) = self.raw(name)?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| self.missing(&format!("'{name}' is not UTF-8")))?;
        Ok(text.split('\n').filter(|s| !s.is_empty()).map(String::from).collect())
    }

    fn string_or(&self, name: &str, default: &str) -> Result<String> {
        if self.has(name) {
            Ok(self.strings(name)?.into_iter().next().unwrap_or_else(|| default.to_string()))
        } else {
            Ok(default.to_string())
        }
    }
}

fn to4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

fn to8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Simple safetensors file writer that handles F64, I32, U32 and U8
/// tensors plus a string metadata map.
///
/// ```rust,no_run
/// use megparc::io::StWriter;
/// use std::path::Path;
/// let mut w = StWriter::new();
/// w.add_f64("pow", &[1.0, 2.0, 3.0], &[3]);
/// w.add_strings("ch_names", &["MEG0111".to_string()]);
/// w.write(Path::new("/tmp/out.safetensors")).unwrap();
/// ```
#[derive(Default)]
pub struct StWriter {
    entries: Vec<(String, Vec<u8>, &'static str, Vec<usize>)>,
    metadata: BTreeMap<String, String>,
}

impl StWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn add_f64(&mut self, name: &str, data: &[f64], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F64", shape.to_vec()));
    }

    /// Any-dimensional `f64` array in logical (row-major) order.
    pub fn add_array<S, D>(&mut self, name: &str, arr: &ArrayBase<S, D>)
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        let data: Vec<f64> = arr.iter().copied().collect();
        self.add_f64(name, &data, arr.shape());
    }

    pub fn add_i32(&mut self, name: &str, data: &[i32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "I32", shape.to_vec()));
    }

    pub fn add_u32(&mut self, name: &str, data: &[u32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "U32", shape.to_vec()));
    }

    pub fn add_u8(&mut self, name: &str, data: &[u8], shape: &[usize]) {
        self.entries.push((name.to_string(), data.to_vec(), "U8", shape.to_vec()));
    }

    pub fn add_strings(&mut self, name: &str, items: &[String]) {
        let joined = items.join("\n").into_bytes();
        let n = joined.len();
        self.add_u8(name, &joined, &[n]);
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn write(&self, path: &Path) -> Result<()> {
        self.stage(path)?.commit()
    }

    /// Write the complete file next to `path` without publishing it.
    pub fn stage(&self, path: &Path) -> Result<Staged> {
        use std::io::Write;
        let mut header_map = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header_map.insert("__metadata__".into(), serde_json::to_value(&self.metadata)?);
        }
        let mut offset: usize = 0;
        for (name, data, dtype, shape) in &self.entries {
            header_map.insert(name.clone(), serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "data_offsets": [offset, offset + data.len()],
            }));
            offset += data.len();
        }
        let hdr_bytes = serde_json::to_vec(&header_map)?;
        let pad = (8 - hdr_bytes.len() % 8) % 8;
        let padded: Vec<u8> = hdr_bytes.into_iter()
            .chain(std::iter::repeat(b' ').take(pad))
            .collect();

        let tmp = tmp_path(path);
        let result = (|| -> std::io::Result<()> {
            let mut f = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
            f.write_all(&(padded.len() as u64).to_le_bytes())?;
            f.write_all(&padded)?;
            for (_, data, _, _) in &self.entries {
                f.write_all(data)?;
            }
            f.into_inner().map_err(|e| e.into_error())?.sync_all()
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::io(path, e));
        }
        Ok(Staged { tmp, dest: path.to_path_buf() })
    }
}

/// A fully written file waiting under its `.partial` name.
///
/// Dropping it without [`Staged::commit`] deletes the temp file.
#[must_use]
pub struct Staged {
    tmp: PathBuf,
    dest: PathBuf,
}

impl Staged {
    pub fn path(&self) -> &Path {
        &self.dest
    }

    /// Rename into place.
    pub fn commit(self) -> Result<()> {
        std::fs::rename(&self.tmp, &self.dest).map_err(|e| Error::io(&self.dest, e))
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if self.tmp.exists() {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

// ── Artifacts ─────────────────────────────────────────────────────────────────

/// `<dir>/<subject>_source.safetensors`
pub fn source_path(dir: &Path, subject: &str) -> PathBuf {
    dir.join(format!("{subject}_source.safetensors"))
}

/// `<dir>/<subject>_parcels.safetensors`
pub fn parcels_path(dir: &Path, subject: &str) -> PathBuf {
    dir.join(format!("{subject}_parcels.safetensors"))
}

/// The averaged source estimate with its filters, as a `<subject>_source`
/// artifact.
pub fn source_writer(subject: &str, est: &SourceEstimate) -> StWriter {
    let f = &est.filters;
    let mut w = StWriter::new();
    w.metadata("subject", subject);
    w.metadata("coordsys", f.coordsys.as_str());
    w.add_array("pos", &est.pos);
    let inside: Vec<u8> = f.inside.iter().map(|&b| b as u8).collect();
    w.add_u8("inside", &inside, &[inside.len()]);
    w.add_array("filters", &f.weights);
    w.add_array("ori", &f.ori);
    w.add_array("pow", &est.pow);
    w.add_array("mom", &est.mom);
    w.add_i32("kappa", &[f.kappa as i32], &[1]);
    w.add_f64("lambda", &[f.lambda], &[1]);
    w.add_strings("ch_names", &f.labels);
    w
}

/// The `[trials, parcels, samples]` parcel array as a `<subject>_parcels`
/// artifact.
pub fn parcel_writer(subject: &str, ts: &ParcelTimeseries) -> StWriter {
    let mut w = StWriter::new();
    w.metadata("subject", subject);
    w.add_array("data", &ts.data);
    w.add_u32("labels", &ts.labels, &[ts.labels.len()]);
    w.add_strings("names", &ts.names);
    w.add_f64("sfreq", &[ts.sfreq], &[1]);
    w
}

/// Read back a parcel array written from [`parcel_writer`].
pub fn read_parcel_timeseries(path: &Path) -> Result<ParcelTimeseries> {
    let st = StFile::open(path)?;
    let data = st.array3("data")?;
    let labels = st.array1("labels")?.iter().map(|&v| v as u32).collect();
    Ok(ParcelTimeseries {
        data,
        labels,
        names: st.strings("names")?,
        sfreq: st.scalar("sfreq")?,
    })
}

// ── Input bundles ─────────────────────────────────────────────────────────────

/// Load an atlas bundle.
///
/// Keys: `labels` `[nx, ny, nz]` integers, `affine` `[4, 4]` voxel→world,
/// `label_values` `[L]` + `label_names` (L strings), optional `coordsys`
/// (default `"mni"`).
pub fn load_atlas(path: &Path) -> Result<Atlas> {
    let st = StFile::open(path)?;
    let labels = st.labels3("labels")?;
    let affine = Affine::from_array(&st.array2("affine")?.view())?;
    let mut names = BTreeMap::new();
    if st.has("label_values") {
        let values = st.array1("label_values")?;
        let text = st.strings("label_names")?;
        if values.len() != text.len() {
            return Err(Error::config(format!(
                "{}: {} label values but {} names",
                path.display(),
                values.len(),
                text.len()
            )));
        }
        names = values.iter().map(|&v| v as u32).zip(text).collect();
    }
    let coordsys = CoordSys::new(st.string_or("coordsys", "mni")?);
    log::info!(
        "atlas {}: {:?} voxels, {} named labels, {}",
        path.display(),
        labels.dim(),
        names.len(),
        coordsys
    );
    Atlas::new(labels, affine, names, coordsys)
}

/// Load one subject's input bundle.
///
/// Keys:
/// * `data` — `[E, C, T]` trials, or `[C, T]` continuous (cut into
///   `cfg.trial_duration` second trials)
/// * `sfreq`, `ch_names`
/// * `coil_pos` / `coil_ori` `[K, 3]`, optional `tra` `[C, K]` (identity)
/// * `sphere` `[4]` (cx, cy, cz, r) or `local_spheres` `[C, 4]`
/// * `grid_pos` `[N, 3]`, optional `grid_inside` `[N]`, `grid_ori` `[N, 3]`
/// * `transform` `[4, 4]` native→template
/// * optional `coordsys` (default `"head"`), `template_coordsys` (`"mni"`)
pub fn load_subject(path: &Path, subject: &str, cfg: &PipelineConfig) -> Result<SubjectInputs> {
    let st = StFile::open(path)?;
    let native = CoordSys::new(st.string_or("coordsys", "head")?);
    let target = CoordSys::new(st.string_or("template_coordsys", "mni")?);

    let sfreq = st.scalar("sfreq")?;
    let labels = st.strings("ch_names")?;
    let coil_pos = st.array2("coil_pos")?;
    let coil_ori = st.array2("coil_ori")?;
    let tra = if st.has("tra") { st.array2("tra")? } else { Array2::eye(labels.len()) };
    let grad = SensorArray::new(labels, coil_pos, coil_ori, tra, native.clone())?;

    let raw = st.f64_dyn("data")?;
    let trials = match raw.ndim() {
        3 => raw.into_dimensionality()?,
        2 => {
            let dur = cfg.trial_duration.ok_or_else(|| {
                Error::config("continuous data needs a trial duration to be segmented")
            })?;
            segment(&raw.into_dimensionality()?, trial_samples(dur, sfreq))?
        }
        n => return Err(Error::config(format!("data must be 2-D or 3-D, got {n}-D"))),
    };
    let sensors = SensorData::new(trials, sfreq, grad)?;

    let conductivity = if st.has("conductivity") {
        st.array1("conductivity")?.to_vec()
    } else {
        vec![0.33]
    };
    let conductor = if st.has("sphere") {
        let s = st.array1("sphere")?;
        if s.len() != 4 {
            return Err(Error::config("sphere must hold [cx, cy, cz, r]"));
        }
        VolumeConductor::SingleSphere { center: [s[0], s[1], s[2]], radius: s[3] }
    } else if st.has("local_spheres") {
        let s = st.array2("local_spheres")?;
        if s.dim() != (sensors.n_channels(), 4) {
            return Err(Error::config(format!(
                "{}: local_spheres is {:?}, expected [{}, 4]",
                path.display(),
                s.dim(),
                sensors.n_channels()
            )));
        }
        VolumeConductor::LocalSpheres {
            centers: s.slice(ndarray::s![.., 0..3]).to_owned(),
            radii: s.column(3).to_vec(),
        }
    } else {
        return Err(Error::config(format!(
            "{}: no head model ('sphere' or 'local_spheres')",
            path.display()
        )));
    };
    let head = HeadModel { conductor, conductivity, coordsys: native.clone() };

    let mut source = SourceModel::new(st.array2("grid_pos")?, native)?;
    if st.has("grid_inside") {
        source = source.with_inside(st.array1("grid_inside")?.iter().map(|&v| v != 0.0).collect())?;
    }
    if st.has("grid_ori") {
        source = source.with_orientations(st.array2("grid_ori")?)?;
    }

    let transform = Affine::from_array(&st.array2("transform")?.view())?;

    Ok(SubjectInputs {
        subject: subject.to_string(),
        sensors,
        transform,
        target,
        head,
        source,
    })
}
