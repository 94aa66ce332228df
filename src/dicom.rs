//! DICOM series discovery and volume assembly

use crate::error::{MedvolError, Result};
use crate::frame::Frame;
use dicom::core::Tag;
use dicom::object::{open_file, DefaultDicomObject, OpenFileOptions};
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder};
use dicom_dictionary_std::tags;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Rescale pair used when the header carries no rescale tags
pub const DEFAULT_RESCALE_SLOPE: f64 = 1.0;
/// Rescale pair used when the header carries no rescale tags
pub const DEFAULT_RESCALE_INTERCEPT: f64 = -1024.0;

/// How to resolve a directory holding more than one DICOM series
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesSelection {
    /// Succeed only when exactly one series is present
    #[default]
    Auto,
    /// Read the series with this SeriesInstanceUID
    Uid(String),
}

/// Header tags carried into an asset's identifier metadata, keyed by their
/// DICOM keyword
const CARRIED_TAGS: &[(Tag, &str)] = &[
    (tags::PATIENT_NAME, "PatientName"),
    (tags::PATIENT_ID, "PatientID"),
    (tags::PATIENT_SEX, "PatientSex"),
    (tags::PATIENT_BIRTH_DATE, "PatientBirthDate"),
    (tags::STUDY_DATE, "StudyDate"),
    (tags::STUDY_DESCRIPTION, "StudyDescription"),
    (tags::SERIES_DESCRIPTION, "SeriesDescription"),
    (tags::MODALITY, "Modality"),
    (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
    (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
    (tags::MANUFACTURER, "Manufacturer"),
];

/// Metadata keys that identify the patient
const SENSITIVE_KEYS: &[&str] = &["PatientName", "PatientID", "PatientBirthDate"];

/// Whether a carried tag map contains patient-identifying entries.
///
/// Callers deciding the sensitivity assertion for a freshly read asset can
/// probe its metadata with this before confirming.
pub fn contains_patient_identifiers(metadata: &HashMap<String, String>) -> bool {
    SENSITIVE_KEYS.iter().any(|k| metadata.contains_key(*k))
}

/// Open only the header portion of a DICOM file
fn header_object(path: &Path) -> Result<DefaultDicomObject> {
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| MedvolError::Dicom(e.to_string()))
}

fn element_str(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    let value = obj.element(tag).ok()?.to_str().ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn element_f64(obj: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    obj.element(tag).ok()?.to_float64().ok()
}

fn element_multi_f64(obj: &DefaultDicomObject, tag: Tag) -> Option<Vec<f64>> {
    obj.element(tag).ok()?.to_multi_float64().ok()
}

fn collect_tags(obj: &DefaultDicomObject) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    for (tag, keyword) in CARRIED_TAGS {
        if let Some(value) = element_str(obj, *tag) {
            metadata.insert((*keyword).to_string(), value);
        }
    }
    metadata
}

/// Carried header tags of a single file, keyed by DICOM keyword
pub fn read_tags(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    Ok(collect_tags(&header_object(path.as_ref())?))
}

/// Group the DICOM files of a directory by SeriesInstanceUID.
///
/// Non-DICOM directory entries are skipped; an empty result is an error.
/// File lists are sorted by name for deterministic inventories.
pub fn series_inventory(dir: impl AsRef<Path>) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let dir = dir.as_ref();
    let mut series: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Ok(obj) = header_object(&path) else {
            continue;
        };
        let uid = element_str(&obj, tags::SERIES_INSTANCE_UID).unwrap_or_default();
        series.entry(uid).or_default().push(path);
    }

    if series.is_empty() {
        return Err(MedvolError::SeriesNotFound(dir.display().to_string()));
    }
    for files in series.values_mut() {
        files.sort();
    }
    Ok(series)
}

/// Resolve a directory to the file list of one series
pub fn select_series(dir: impl AsRef<Path>, selection: &SeriesSelection) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut inventory = series_inventory(dir)?;

    match selection {
        SeriesSelection::Auto => {
            if inventory.len() == 1 {
                Ok(inventory.pop_first().map(|(_, files)| files).unwrap_or_default())
            } else {
                Err(MedvolError::AmbiguousSeries(inventory.len()))
            }
        }
        SeriesSelection::Uid(uid) => inventory.remove(uid).ok_or_else(|| {
            MedvolError::SeriesNotFound(format!("series {} under {}", uid, dir.display()))
        }),
    }
}

/// Decode-time affine transform from stored values to output units
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RescaleParams {
    pub slope: f64,
    pub intercept: f64,
}

impl RescaleParams {
    fn of(obj: &DefaultDicomObject) -> Self {
        match (
            element_f64(obj, tags::RESCALE_SLOPE),
            element_f64(obj, tags::RESCALE_INTERCEPT),
        ) {
            (Some(slope), Some(intercept)) => Self { slope, intercept },
            _ => {
                log::warn!(
                    "rescale tags absent, assuming slope {} intercept {}",
                    DEFAULT_RESCALE_SLOPE,
                    DEFAULT_RESCALE_INTERCEPT
                );
                Self {
                    slope: DEFAULT_RESCALE_SLOPE,
                    intercept: DEFAULT_RESCALE_INTERCEPT,
                }
            }
        }
    }

    /// `output = stored * slope + intercept`, saturating at the i16 range.
    /// The intercept applies additively; it is never used as a divisor.
    pub fn apply(&self, stored: i16) -> i16 {
        let value = stored as f64 * self.slope + self.intercept;
        value.clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }
}

struct SliceData {
    order: f64,
    position: Option<[f64; 3]>,
    rows: usize,
    columns: usize,
    stored: Vec<i16>,
}

fn decode_slice(
    path: &Path,
    index: usize,
    rescale: Option<&mut Option<RescaleParams>>,
    spacing_meta: &mut Option<(Vec<f64>, Option<f64>)>,
    metadata: &mut HashMap<String, String>,
) -> Result<SliceData> {
    let obj = open_file(path).map_err(|e| MedvolError::Dicom(e.to_string()))?;

    if index == 0 {
        *metadata = collect_tags(&obj);
        *spacing_meta = Some((
            element_multi_f64(&obj, tags::PIXEL_SPACING).unwrap_or_default(),
            element_f64(&obj, tags::SLICE_THICKNESS),
        ));
        if let Some(params) = rescale {
            *params = Some(RescaleParams::of(&obj));
        }
    }

    let position = element_multi_f64(&obj, tags::IMAGE_POSITION_PATIENT).and_then(|p| {
        match p.as_slice() {
            [x, y, z, ..] => Some([*x, *y, *z]),
            _ => None,
        }
    });
    let order = position
        .map(|p| p[2])
        .or_else(|| element_f64(&obj, tags::INSTANCE_NUMBER))
        .unwrap_or(f64::MAX);

    let decoded = obj
        .decode_pixel_data()
        .map_err(|e| MedvolError::Dicom(e.to_string()))?;
    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
    let stored: Vec<i16> = decoded
        .to_vec_with_options(&options)
        .map_err(|e| MedvolError::Dicom(e.to_string()))?;

    let (rows, columns) = (decoded.rows() as usize, decoded.columns() as usize);
    if stored.len() != rows * columns {
        return Err(MedvolError::InvalidDimensions(format!(
            "{}: expected a single frame of {}x{} samples, got {}",
            path.display(),
            rows,
            columns,
            stored.len()
        )));
    }

    Ok(SliceData {
        order,
        position,
        rows,
        columns,
        stored,
    })
}

/// Read an ordered series file list into a z-major volume.
///
/// Slices sort by ImagePositionPatient z, falling back to InstanceNumber.
/// With `rescale`, stored values pass through the slope/intercept transform
/// of [`RescaleParams::apply`].
pub(crate) fn read_series(
    paths: &[PathBuf],
    rescale: bool,
) -> Result<(Array3<i16>, Frame, HashMap<String, String>)> {
    if paths.is_empty() {
        return Err(MedvolError::SeriesNotFound("empty series file list".to_string()));
    }

    let mut rescale_params: Option<RescaleParams> = None;
    let mut spacing_meta: Option<(Vec<f64>, Option<f64>)> = None;
    let mut metadata = HashMap::new();

    let mut slices = Vec::with_capacity(paths.len());
    for (index, path) in paths.iter().enumerate() {
        let params = rescale.then_some(&mut rescale_params);
        slices.push(decode_slice(path, index, params, &mut spacing_meta, &mut metadata)?);
    }

    slices.sort_by(|a, b| a.order.partial_cmp(&b.order).unwrap_or(std::cmp::Ordering::Equal));

    let (rows, columns) = (slices[0].rows, slices[0].columns);
    if slices.iter().any(|s| s.rows != rows || s.columns != columns) {
        return Err(MedvolError::InvalidDimensions(
            "series slices disagree on rows/columns".to_string(),
        ));
    }

    let depth = slices.len();
    let mut samples = Vec::with_capacity(depth * rows * columns);
    for slice in &slices {
        match rescale_params {
            Some(params) => samples.extend(slice.stored.iter().map(|&v| params.apply(v))),
            None => samples.extend_from_slice(&slice.stored),
        }
    }
    let volume = Array3::from_shape_vec((depth, rows, columns), samples)
        .map_err(|e| MedvolError::InvalidDimensions(e.to_string()))?;

    // in-plane spacing from PixelSpacing (row, column) = (y, x); slice
    // spacing from the positional gap when available, else SliceThickness
    let (pixel_spacing, thickness) = spacing_meta.unwrap_or((Vec::new(), None));
    let (sy, sx) = match pixel_spacing.as_slice() {
        [row, col, ..] => (*row, *col),
        _ => {
            log::warn!("PixelSpacing absent, assuming 1.0mm in-plane");
            (1.0, 1.0)
        }
    };
    let positions: Vec<f64> = slices.iter().filter_map(|s| s.position.map(|p| p[2])).collect();
    let gap = if positions.len() == depth && depth >= 2 {
        Some((positions[depth - 1] - positions[0]).abs() / (depth - 1) as f64)
    } else {
        None
    };
    let sz = match gap {
        Some(gap) if gap > 0.0 => gap,
        _ => thickness.unwrap_or_else(|| {
            log::warn!("slice spacing not derivable, assuming 1.0mm");
            1.0
        }),
    };

    let origin = slices[0]
        .position
        .map(|p| (p[0], p[1], p[2]))
        .unwrap_or((0.0, 0.0, 0.0));

    let frame = Frame::new((columns as u32, rows as u32, depth as u32), (sx, sy, sz), origin)?;
    Ok((volume, frame, metadata))
}

/// Read a volume from a DICOM file or directory.
///
/// A file path reads the series it belongs to: sibling files in the same
/// directory carrying the same SeriesInstanceUID, or the lone file itself.
/// A directory path resolves through `selection`.
pub(crate) fn read_volume(
    path: &Path,
    selection: &SeriesSelection,
    rescale: bool,
) -> Result<(Array3<i16>, Frame, HashMap<String, String>)> {
    let files = if path.is_dir() {
        select_series(path, selection)?
    } else {
        let uid = element_str(&header_object(path)?, tags::SERIES_INSTANCE_UID);
        match (uid, path.parent()) {
            (Some(uid), Some(parent)) => {
                let mut inventory = series_inventory(parent)?;
                inventory.remove(&uid).unwrap_or_else(|| vec![path.to_path_buf()])
            }
            _ => vec![path.to_path_buf()],
        }
    };
    read_series(&files, rescale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rescale_uses_slope_intercept_convention() {
        // output = stored * slope + intercept; the intercept is added, never
        // divided through
        let params = RescaleParams {
            slope: 1.0,
            intercept: -1024.0,
        };
        assert_eq!(params.apply(0), -1024);
        assert_eq!(params.apply(1024), 0);
        assert_eq!(params.apply(2000), 976);

        let scaled = RescaleParams {
            slope: 2.0,
            intercept: 10.0,
        };
        assert_eq!(scaled.apply(5), 20);
    }

    #[test]
    fn test_rescale_saturates() {
        let params = RescaleParams {
            slope: 100.0,
            intercept: 0.0,
        };
        assert_eq!(params.apply(i16::MAX), i16::MAX);
        assert_eq!(params.apply(i16::MIN), i16::MIN);
    }

    #[test]
    fn test_inventory_of_empty_directory_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            series_inventory(dir.path()),
            Err(MedvolError::SeriesNotFound(_))
        ));
    }

    #[test]
    fn test_inventory_skips_non_dicom_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a dicom file").unwrap();
        assert!(matches!(
            series_inventory(dir.path()),
            Err(MedvolError::SeriesNotFound(_))
        ));
    }

    #[test]
    fn test_sensitive_tag_detection() {
        let mut metadata = HashMap::new();
        metadata.insert("Modality".to_string(), "CT".to_string());
        assert!(!contains_patient_identifiers(&metadata));

        metadata.insert("PatientName".to_string(), "DOE^JANE".to_string());
        assert!(contains_patient_identifiers(&metadata));
    }
}
