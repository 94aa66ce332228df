//! Voxel grid geometry - placement and resolution of a volume in physical space

use crate::error::{MedvolError, Result};
use serde::{Deserialize, Serialize};

/// Identity orientation matrix
pub const IDENTITY_DIRECTION: [[f64; 3]; 3] =
    [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Geometric descriptor of a voxel grid: dimensions, spacing, origin, and
/// orientation, shared by a scan and its companion masks.
///
/// Dimensions are ordered along +x, +y, +z. Sample buffers that carry this
/// frame are z-major (`[z, y, x]` shape); [`Frame::shape`] gives that
/// ordering directly.
///
/// A frame is immutable once constructed. Changing geometry means building a
/// new frame and swapping it in through the owning manager, never mutating a
/// frame other assets may still reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Voxel counts along +x, +y, +z
    size: (u32, u32, u32),

    /// Physical units per voxel along +x, +y, +z
    spacing: (f64, f64, f64),

    /// Physical coordinates of the first voxel
    origin: (f64, f64, f64),

    /// 3x3 orientation matrix, rows are the physical directions of +x, +y, +z
    direction: [[f64; 3]; 3],
}

impl Frame {
    /// Create a frame with an explicit origin and identity orientation
    pub fn new(size: (u32, u32, u32), spacing: (f64, f64, f64), origin: (f64, f64, f64)) -> Result<Self> {
        Self::with_direction(size, spacing, origin, IDENTITY_DIRECTION)
    }

    /// Create a frame with full geometry
    pub fn with_direction(
        size: (u32, u32, u32),
        spacing: (f64, f64, f64),
        origin: (f64, f64, f64),
        direction: [[f64; 3]; 3],
    ) -> Result<Self> {
        if size.0 == 0 || size.1 == 0 || size.2 == 0 {
            return Err(MedvolError::InvalidDimensions(format!(
                "size components must be positive, got ({}, {}, {})",
                size.0, size.1, size.2
            )));
        }
        if spacing.0 <= 0.0 || spacing.1 <= 0.0 || spacing.2 <= 0.0 {
            return Err(MedvolError::InvalidDimensions(format!(
                "spacing components must be positive, got ({}, {}, {})",
                spacing.0, spacing.1, spacing.2
            )));
        }

        Ok(Self {
            size,
            spacing,
            origin,
            direction,
        })
    }

    /// Voxel counts along +x, +y, +z
    pub fn size(&self) -> (u32, u32, u32) {
        self.size
    }

    /// Physical units per voxel along +x, +y, +z
    pub fn spacing(&self) -> (f64, f64, f64) {
        self.spacing
    }

    /// Physical coordinates of the first voxel
    pub fn origin(&self) -> (f64, f64, f64) {
        self.origin
    }

    /// Orientation matrix
    pub fn direction(&self) -> &[[f64; 3]; 3] {
        &self.direction
    }

    /// Total number of voxels
    pub fn voxel_count(&self) -> usize {
        self.size.0 as usize * self.size.1 as usize * self.size.2 as usize
    }

    /// Buffer shape in z-major order: `(z, y, x)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.size.2 as usize, self.size.1 as usize, self.size.0 as usize)
    }

    /// Physical extent along each axis: `size * spacing`
    pub fn extent(&self) -> (f64, f64, f64) {
        (
            self.size.0 as f64 * self.spacing.0,
            self.size.1 as f64 * self.spacing.1,
            self.size.2 as f64 * self.spacing.2,
        )
    }

    /// Derive a frame with the same origin and orientation but new size and
    /// spacing, as produced by resampling
    pub fn resampled(&self, size: (u32, u32, u32), spacing: (f64, f64, f64)) -> Result<Self> {
        Self::with_direction(size, spacing, self.origin, self.direction)
    }
}
