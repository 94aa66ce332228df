//! Standard volumetric codec: DICOM-aware reading, NIfTI writing

use crate::dicom::{self, SeriesSelection};
use crate::error::{MedvolError, Result};
use crate::frame::Frame;
use crate::identifier::Identifier;
use crate::volume::{Action, SampleBuffer, ScalarType, VolumeAsset, VolumeKind};
use ndarray::{Array3, ArrayD, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// On-disk formats the standard codec recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    Dicom,
    Nifti,
}

/// Closed option set for [`read`].
///
/// `rescale` applies the DICOM slope/intercept transform on decode;
/// `pixel_type` overrides the inferred sample type; `format` pins the codec
/// instead of probing DICOM first; `series` resolves multi-series
/// directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadOptions {
    pub rescale: bool,
    pub pixel_type: Option<ScalarType>,
    pub format: Option<ImageFormat>,
    pub series: SeriesSelection,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            rescale: true,
            pixel_type: None,
            format: None,
            series: SeriesSelection::Auto,
        }
    }
}

impl ReadOptions {
    pub fn with_rescale(mut self, rescale: bool) -> Self {
        self.rescale = rescale;
        self
    }

    pub fn with_pixel_type(mut self, pixel_type: ScalarType) -> Self {
        self.pixel_type = Some(pixel_type);
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_series(mut self, series: SeriesSelection) -> Self {
        self.series = series;
        self
    }
}

/// Reorder a NIfTI `[x, y, z]` volume into the crate's z-major layout
fn to_zyx<T: Clone>(vol: ArrayD<T>) -> Result<Array3<T>> {
    if vol.ndim() != 3 {
        return Err(MedvolError::InvalidDimensions(format!(
            "expected a 3D volume, got {}D",
            vol.ndim()
        )));
    }
    let vol = vol
        .into_dimensionality::<Ix3>()
        .map_err(|e| MedvolError::InvalidDimensions(e.to_string()))?;
    let vol = vol.permuted_axes([2, 1, 0]);
    Ok(if vol.is_standard_layout() {
        vol
    } else {
        vol.as_standard_layout().to_owned()
    })
}

/// Reorder a z-major buffer into the NIfTI `[x, y, z]` layout
fn to_xyz<T: Clone>(arr: &Array3<T>) -> Array3<T> {
    arr.view().permuted_axes([2, 1, 0]).as_standard_layout().to_owned()
}

fn infer_scalar(header: &NiftiHeader) -> ScalarType {
    // NIfTI datatype codes: 16 = float32, 64 = float64, 512 = uint16,
    // 768 = uint32; everything else decodes through i16
    match header.datatype {
        16 | 64 => ScalarType::F32,
        512 | 768 => ScalarType::U32,
        _ => ScalarType::I16,
    }
}

fn frame_from_header(header: &NiftiHeader, size: (u32, u32, u32)) -> Result<Frame> {
    let mut spacing = [
        header.pixdim[1].abs() as f64,
        header.pixdim[2].abs() as f64,
        header.pixdim[3].abs() as f64,
    ];
    for s in spacing.iter_mut() {
        if !(*s > 0.0) {
            log::warn!("non-positive pixdim in NIfTI header, assuming 1.0");
            *s = 1.0;
        }
    }

    let origin = if header.sform_code > 0 {
        (
            header.srow_x[3] as f64,
            header.srow_y[3] as f64,
            header.srow_z[3] as f64,
        )
    } else {
        (
            header.quatern_x as f64,
            header.quatern_y as f64,
            header.quatern_z as f64,
        )
    };

    Frame::new(size, (spacing[0], spacing[1], spacing[2]), origin)
}

fn header_for(frame: &Frame) -> NiftiHeader {
    let (sx, sy, sz) = frame.spacing();
    let (ox, oy, oz) = frame.origin();
    let d = frame.direction();

    let mut header = NiftiHeader::default();
    header.pixdim = [1.0, sx as f32, sy as f32, sz as f32, 0.0, 0.0, 0.0, 0.0];
    header.sform_code = 1;
    header.srow_x = [
        (d[0][0] * sx) as f32,
        (d[1][0] * sy) as f32,
        (d[2][0] * sz) as f32,
        ox as f32,
    ];
    header.srow_y = [
        (d[0][1] * sx) as f32,
        (d[1][1] * sy) as f32,
        (d[2][1] * sz) as f32,
        oy as f32,
    ];
    header.srow_z = [
        (d[0][2] * sx) as f32,
        (d[1][2] * sy) as f32,
        (d[2][2] * sz) as f32,
        oz as f32,
    ];
    header
}

fn read_dicom_volume(
    path: &Path,
    options: &ReadOptions,
) -> Result<(SampleBuffer, Frame, HashMap<String, String>)> {
    let (volume, frame, metadata) = dicom::read_volume(path, &options.series, options.rescale)?;
    Ok((SampleBuffer::I16(volume), frame, metadata))
}

fn read_nifti_volume(
    path: &Path,
    options: &ReadOptions,
) -> Result<(SampleBuffer, Frame, HashMap<String, String>)> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| MedvolError::Nifti(e.to_string()))?;
    let header = obj.header().clone();
    let volume = obj.into_volume();

    let scalar = options.pixel_type.unwrap_or_else(|| infer_scalar(&header));
    let samples = match scalar {
        ScalarType::I16 => SampleBuffer::I16(to_zyx(
            volume
                .into_ndarray::<i16>()
                .map_err(|e| MedvolError::Nifti(e.to_string()))?,
        )?),
        ScalarType::F32 => SampleBuffer::F32(to_zyx(
            volume
                .into_ndarray::<f32>()
                .map_err(|e| MedvolError::Nifti(e.to_string()))?,
        )?),
        ScalarType::U32 => SampleBuffer::U32(to_zyx(
            volume
                .into_ndarray::<u32>()
                .map_err(|e| MedvolError::Nifti(e.to_string()))?,
        )?),
    };

    let frame = frame_from_header(&header, samples.size())?;
    Ok((samples, frame, HashMap::new()))
}

/// Read a volume asset from a file or DICOM directory.
///
/// Files are probed as DICOM first (reading the whole series the file
/// belongs to) and fall back to the generic NIfTI reader; directories
/// always resolve through the DICOM series machinery. Header tags land in
/// the asset's identifier metadata; sensitivity is settled later by the
/// caller's policy.
pub fn read(path: impl AsRef<Path>, options: &ReadOptions) -> Result<VolumeAsset> {
    let path = path.as_ref();

    let (samples, frame, metadata) = if path.is_dir() {
        read_dicom_volume(path, options)?
    } else {
        match options.format {
            Some(ImageFormat::Dicom) => read_dicom_volume(path, options)?,
            Some(ImageFormat::Nifti) => read_nifti_volume(path, options)?,
            None => match read_dicom_volume(path, options) {
                Ok(result) => result,
                Err(err) => {
                    log::debug!("DICOM read of {} failed ({}), trying NIfTI", path.display(), err);
                    read_nifti_volume(path, options)?
                }
            },
        }
    };

    let mut identifier = Identifier::fresh();
    for (key, value) in metadata {
        identifier.insert_metadata(key, value);
    }

    let mut asset = VolumeAsset::new(VolumeKind::Scan, samples, Arc::new(frame), identifier)?;
    asset.record(
        Action::new("io", "read")
            .with_arg(path.display().to_string())
            .with_option("rescale", options.rescale),
    );
    Ok(asset)
}

/// Read a labeled volume (integer label per voxel) from a NIfTI file.
///
/// Values decode through f32 to cover integer and float storage alike, then
/// clamp to non-negative integers.
pub fn read_labels(path: impl AsRef<Path>) -> Result<Array3<u32>> {
    let obj = ReaderOptions::new()
        .read_file(path.as_ref())
        .map_err(|e| MedvolError::Nifti(e.to_string()))?;
    let volume = to_zyx(
        obj.into_volume()
            .into_ndarray::<f32>()
            .map_err(|e| MedvolError::Nifti(e.to_string()))?,
    )?;
    Ok(volume.mapv(|v| v.max(0.0).round() as u32))
}

/// Write an asset to disk.
///
/// Always writes NIfTI regardless of the requested extension; frame
/// geometry is carried into the header.
pub fn save(asset: &VolumeAsset, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let header = header_for(asset.frame());
    let writer = WriterOptions::new(path).reference_header(&header);

    match asset.samples() {
        SampleBuffer::I16(a) => writer
            .write_nifti(&to_xyz(a))
            .map_err(|e| MedvolError::Nifti(e.to_string())),
        SampleBuffer::F32(a) => writer
            .write_nifti(&to_xyz(a))
            .map_err(|e| MedvolError::Nifti(e.to_string())),
        SampleBuffer::U32(a) => writer
            .write_nifti(&to_xyz(a))
            .map_err(|e| MedvolError::Nifti(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ramp_asset() -> VolumeAsset {
        let frame = Frame::new((4, 3, 2), (0.5, 0.75, 1.25), (10.0, -20.0, 30.0)).unwrap();
        let samples = Array3::from_shape_fn(frame.shape(), |(z, y, x)| (z * 100 + y * 10 + x) as i16);
        VolumeAsset::new(
            VolumeKind::Scan,
            SampleBuffer::I16(samples),
            Arc::new(frame),
            Identifier::fresh(),
        )
        .unwrap()
    }

    #[test]
    fn test_nifti_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.nii");
        let asset = ramp_asset();
        save(&asset, &path).unwrap();

        let options = ReadOptions::default()
            .with_format(ImageFormat::Nifti)
            .with_pixel_type(ScalarType::I16);
        let reread = read(&path, &options).unwrap();

        match (asset.samples(), reread.samples()) {
            (SampleBuffer::I16(a), SampleBuffer::I16(b)) => assert_eq!(a, b),
            _ => panic!("sample type changed in roundtrip"),
        }
        assert_eq!(reread.frame().size(), asset.frame().size());

        // geometry survives up to the header's f32 precision
        let (sx, sy, sz) = reread.frame().spacing();
        assert!((sx - 0.5).abs() < 1e-6);
        assert!((sy - 0.75).abs() < 1e-6);
        assert!((sz - 1.25).abs() < 1e-6);
        let (ox, oy, oz) = reread.frame().origin();
        assert!((ox - 10.0).abs() < 1e-4);
        assert!((oy + 20.0).abs() < 1e-4);
        assert!((oz - 30.0).abs() < 1e-4);
    }

    #[test]
    fn test_read_falls_back_to_nifti() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.nii");
        save(&ramp_asset(), &path).unwrap();

        // no format pinned: the DICOM probe fails and the NIfTI path succeeds
        let options = ReadOptions::default().with_pixel_type(ScalarType::I16);
        let reread = read(&path, &options).unwrap();
        assert_eq!(reread.samples().size(), (4, 3, 2));
        assert_eq!(reread.actions().len(), 1);
        assert_eq!(reread.actions()[0].operation, "read");
    }

    #[test]
    fn test_read_labels_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.nii");

        let frame = Frame::new((4, 3, 2), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0)).unwrap();
        let mut labels = Array3::from_elem(frame.shape(), 0u32);
        labels[[0, 1, 2]] = 3;
        labels[[1, 2, 0]] = 7;
        let asset = VolumeAsset::new(
            VolumeKind::MultiLabelMask,
            SampleBuffer::U32(labels.clone()),
            Arc::new(frame),
            Identifier::new(),
        )
        .unwrap();
        save(&asset, &path).unwrap();

        let reread = read_labels(&path).unwrap();
        assert_eq!(reread, labels);
    }

    #[test]
    fn test_missing_file_errors() {
        let options = ReadOptions::default();
        assert!(read("/nonexistent/scan.nii", &options).is_err());
    }
}
