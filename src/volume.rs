//! Volume assets: sample buffers, provenance log, and the multi-label bitmask

use crate::error::{MedvolError, Result};
use crate::frame::Frame;
use crate::identifier::Identifier;
use crate::MAX_LABELS;
use chrono::{DateTime, Utc};
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Sample types a volume buffer can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    /// Signed 16-bit integer (stored DICOM values, HU)
    I16,
    /// 32-bit floating point
    F32,
    /// Unsigned 32-bit integer (label bitmask)
    U32,
}

impl ScalarType {
    /// Size in bytes of this sample type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ScalarType::I16 => 2,
            ScalarType::F32 | ScalarType::U32 => 4,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::F32)
    }
}

/// Dense z-major 3D sample buffer, one variant per supported sample type.
///
/// Shape is `(z, y, x)` throughout the crate; [`Frame::shape`] produces the
/// matching tuple for a given geometry.
#[derive(Debug, Clone)]
pub enum SampleBuffer {
    I16(Array3<i16>),
    F32(Array3<f32>),
    U32(Array3<u32>),
}

impl SampleBuffer {
    /// All-zero buffer of the given type with the frame's shape
    pub fn zeros(scalar: ScalarType, frame: &Frame) -> Self {
        let shape = frame.shape();
        match scalar {
            ScalarType::I16 => SampleBuffer::I16(Array3::zeros(shape)),
            ScalarType::F32 => SampleBuffer::F32(Array3::zeros(shape)),
            ScalarType::U32 => SampleBuffer::U32(Array3::zeros(shape)),
        }
    }

    /// Sample type held by this buffer
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            SampleBuffer::I16(_) => ScalarType::I16,
            SampleBuffer::F32(_) => ScalarType::F32,
            SampleBuffer::U32(_) => ScalarType::U32,
        }
    }

    /// Buffer shape in z-major order: `(z, y, x)`
    pub fn shape(&self) -> (usize, usize, usize) {
        match self {
            SampleBuffer::I16(a) => a.dim(),
            SampleBuffer::F32(a) => a.dim(),
            SampleBuffer::U32(a) => a.dim(),
        }
    }

    /// Voxel counts along +x, +y, +z derived from the buffer shape
    pub fn size(&self) -> (u32, u32, u32) {
        let (z, y, x) = self.shape();
        (x as u32, y as u32, z as u32)
    }

    /// Total number of voxels
    pub fn voxel_count(&self) -> usize {
        let (z, y, x) = self.shape();
        z * y * x
    }

    /// Whether the buffer shape matches the frame's grid
    pub fn matches(&self, frame: &Frame) -> bool {
        self.shape() == frame.shape()
    }

    /// Borrow the label bitmask array, if this is a `U32` buffer
    pub fn as_labels(&self) -> Option<&Array3<u32>> {
        match self {
            SampleBuffer::U32(a) => Some(a),
            _ => None,
        }
    }

    /// Mutably borrow the label bitmask array, if this is a `U32` buffer
    pub fn as_labels_mut(&mut self) -> Option<&mut Array3<u32>> {
        match self {
            SampleBuffer::U32(a) => Some(a),
            _ => None,
        }
    }
}

/// Role of a volume asset within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    /// Continuous intensity samples
    Scan,
    /// One u32 per voxel; bit k flags membership in label id k
    MultiLabelMask,
}

impl VolumeKind {
    /// Sample type newly synthesized assets of this kind use
    pub fn default_scalar(&self) -> ScalarType {
        match self {
            VolumeKind::Scan => ScalarType::I16,
            VolumeKind::MultiLabelMask => ScalarType::U32,
        }
    }

    /// Component name used in provenance log entries
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeKind::Scan => "scan",
            VolumeKind::MultiLabelMask => "mask",
        }
    }
}

/// One provenance log entry: which component performed which operation,
/// with which arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub component: String,
    pub operation: String,
    pub args: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl Action {
    /// Create a log entry stamped with the current time
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            args: Vec::new(),
            options: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    /// Append a positional argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Record a keyword option
    pub fn with_option(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.options.insert(key.into(), value.to_string());
        self
    }
}

/// Which voxels a label mutation applies to
#[derive(Debug, Clone, Copy)]
pub enum VoxelSelector<'a> {
    /// Every voxel
    All,
    /// Explicit `[z, y, x]` indices into the z-major buffer
    Indices(&'a [[usize; 3]]),
    /// Boolean stencil of the same shape; true voxels are affected
    Stencil(&'a Array3<bool>),
}

/// A scan or multi-label mask: dense samples plus geometry, bookkeeping,
/// and an ordered provenance log.
///
/// The frame is shared (`Arc`) between a scan and its companion mask so
/// that geometry stays a single value; replacement goes through the owning
/// manager, which swaps both assets' buffers and frame together.
#[derive(Debug, Clone)]
pub struct VolumeAsset {
    kind: VolumeKind,
    samples: SampleBuffer,
    frame: Arc<Frame>,
    identifier: Identifier,
    actions: Vec<Action>,

    /// Open key-value bag for ad hoc use by callers
    pub extra: HashMap<String, String>,
}

impl VolumeAsset {
    /// Assemble an asset from decoded samples.
    ///
    /// The buffer shape must match the frame, and mask assets must hold a
    /// `U32` bitmask buffer.
    pub fn new(
        kind: VolumeKind,
        samples: SampleBuffer,
        frame: Arc<Frame>,
        identifier: Identifier,
    ) -> Result<Self> {
        if !samples.matches(&frame) {
            return Err(MedvolError::ShapeMismatch(format!(
                "buffer shape {:?} does not match frame shape {:?}",
                samples.shape(),
                frame.shape()
            )));
        }
        if kind == VolumeKind::MultiLabelMask && samples.scalar_type() != ScalarType::U32 {
            return Err(MedvolError::InvalidFormat(
                "multi-label masks hold u32 bitmask samples".to_string(),
            ));
        }

        Ok(Self {
            kind,
            samples,
            frame,
            identifier,
            actions: Vec::new(),
            extra: HashMap::new(),
        })
    }

    /// Synthesize an all-zero asset over the given frame
    pub fn empty(kind: VolumeKind, frame: Arc<Frame>) -> Self {
        let samples = SampleBuffer::zeros(kind.default_scalar(), &frame);
        let mut asset = Self {
            kind,
            samples,
            frame,
            identifier: Identifier::fresh(),
            actions: Vec::new(),
            extra: HashMap::new(),
        };
        asset.record(Action::new(kind.as_str(), "empty"));
        asset
    }

    pub fn kind(&self) -> VolumeKind {
        self.kind
    }

    pub fn samples(&self) -> &SampleBuffer {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut SampleBuffer {
        &mut self.samples
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Shared handle to the frame, for creating companion assets
    pub fn shared_frame(&self) -> Arc<Frame> {
        Arc::clone(&self.frame)
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn identifier_mut(&mut self) -> &mut Identifier {
        &mut self.identifier
    }

    /// Provenance log, oldest first
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Append a provenance log entry
    pub fn record(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Swap in resampled samples and the matching new frame.
    ///
    /// Identifier, provenance log, and extras are untouched; only the
    /// manager calls this, for the scan and its mask in lock-step.
    pub(crate) fn replace_samples(&mut self, samples: SampleBuffer, frame: Arc<Frame>) -> Result<()> {
        if !samples.matches(&frame) {
            return Err(MedvolError::ShapeMismatch(format!(
                "buffer shape {:?} does not match frame shape {:?}",
                samples.shape(),
                frame.shape()
            )));
        }
        self.samples = samples;
        self.frame = frame;
        Ok(())
    }

    fn label_bit(label: u8) -> Result<u32> {
        if (label as usize) < MAX_LABELS {
            Ok(1u32 << label)
        } else {
            Err(MedvolError::InvalidLabel(format!(
                "label id {} out of range 0..{}",
                label, MAX_LABELS
            )))
        }
    }

    fn labels(&self) -> Result<&Array3<u32>> {
        if self.kind != VolumeKind::MultiLabelMask {
            return Err(MedvolError::InvalidLabel(
                "label operations apply to multi-label masks only".to_string(),
            ));
        }
        self.samples.as_labels().ok_or_else(|| {
            MedvolError::InvalidFormat("mask asset holds a non-u32 buffer".to_string())
        })
    }

    fn labels_mut(&mut self) -> Result<&mut Array3<u32>> {
        if self.kind != VolumeKind::MultiLabelMask {
            return Err(MedvolError::InvalidLabel(
                "label operations apply to multi-label masks only".to_string(),
            ));
        }
        self.samples.as_labels_mut().ok_or_else(|| {
            MedvolError::InvalidFormat("mask asset holds a non-u32 buffer".to_string())
        })
    }

    /// Set or clear one label's membership bit on the selected voxels.
    ///
    /// Only bit `label` changes; all other labels are untouched regardless
    /// of selector.
    pub fn set_label(&mut self, label: u8, selector: VoxelSelector<'_>, value: bool) -> Result<()> {
        let bit = Self::label_bit(label)?;
        let data = self.labels_mut()?;

        match selector {
            VoxelSelector::All => {
                if value {
                    data.mapv_inplace(|v| v | bit);
                } else {
                    data.mapv_inplace(|v| v & !bit);
                }
            }
            VoxelSelector::Indices(indices) => {
                for &idx in indices {
                    let voxel = data.get_mut(idx).ok_or_else(|| {
                        MedvolError::ShapeMismatch(format!(
                            "voxel index {:?} out of bounds",
                            idx
                        ))
                    })?;
                    if value {
                        *voxel |= bit;
                    } else {
                        *voxel &= !bit;
                    }
                }
            }
            VoxelSelector::Stencil(stencil) => {
                if stencil.dim() != data.dim() {
                    return Err(MedvolError::ShapeMismatch(format!(
                        "stencil shape {:?} does not match buffer shape {:?}",
                        stencil.dim(),
                        data.dim()
                    )));
                }
                Zip::from(&mut *data).and(stencil).for_each(|v, &selected| {
                    if selected {
                        if value {
                            *v |= bit;
                        } else {
                            *v &= !bit;
                        }
                    }
                });
            }
        }

        Ok(())
    }

    /// Whether any voxel carries the given label
    pub fn label_present(&self, label: u8) -> Result<bool> {
        let bit = Self::label_bit(label)?;
        Ok(self.labels()?.iter().any(|&v| v & bit != 0))
    }

    /// All label ids carried by at least one voxel, ascending
    pub fn labels_present(&self) -> Result<Vec<u8>> {
        let union = self.labels()?.iter().fold(0u32, |acc, &v| acc | v);
        Ok((0..MAX_LABELS as u8)
            .filter(|k| union & (1u32 << *k) != 0)
            .collect())
    }
}
