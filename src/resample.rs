//! Grid-spacing change operator for scans and label masks

use crate::error::{MedvolError, Result};
use crate::volume::SampleBuffer;
use ndarray::Array3;
use num_traits::{NumCast, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

/// Interpolation policy for resampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    /// Trilinear interpolation with edge-clamped extrapolation, for
    /// continuous intensity samples
    Smooth,
    /// Nearest source voxel with constant-zero extrapolation, for label
    /// masks; never blends label values
    Nearest,
}

/// Resample a buffer from one voxel spacing to another.
///
/// The per-axis zoom factor is `old_spacing / new_spacing`; the output
/// extent per axis is `round(extent * zoom)`. Output coordinates map onto
/// the source grid by the half-pixel convention
/// `src = (dst + 0.5) / zoom - 0.5`, so resampling with unchanged spacing
/// reproduces the buffer exactly. The result is cast back to the input
/// sample type (integer casts truncate).
///
/// A scan and its companion mask must be resampled with the same spacing to
/// keep their frames aligned; the manager sequences that pair.
pub fn resample(
    samples: &SampleBuffer,
    old_spacing: (f64, f64, f64),
    new_spacing: (f64, f64, f64),
    interpolation: Interpolation,
) -> Result<SampleBuffer> {
    for s in [
        old_spacing.0,
        old_spacing.1,
        old_spacing.2,
        new_spacing.0,
        new_spacing.1,
        new_spacing.2,
    ] {
        if !(s > 0.0 && s.is_finite()) {
            return Err(MedvolError::InvalidDimensions(format!(
                "spacing components must be positive and finite, got {:?} -> {:?}",
                old_spacing, new_spacing
            )));
        }
    }

    // buffer axes are (z, y, x)
    let factors = [
        old_spacing.2 / new_spacing.2,
        old_spacing.1 / new_spacing.1,
        old_spacing.0 / new_spacing.0,
    ];

    Ok(match samples {
        SampleBuffer::I16(a) => SampleBuffer::I16(zoom(a, factors, interpolation)),
        SampleBuffer::F32(a) => SampleBuffer::F32(zoom(a, factors, interpolation)),
        SampleBuffer::U32(a) => SampleBuffer::U32(zoom(a, factors, interpolation)),
    })
}

fn out_extent(n: usize, factor: f64) -> usize {
    ((n as f64 * factor).round() as usize).max(1)
}

/// Map an output index to its source-grid coordinate
fn source_coord(i: usize, factor: f64) -> f64 {
    (i as f64 + 0.5) / factor - 0.5
}

fn zoom<T>(src: &Array3<T>, factors: [f64; 3], interpolation: Interpolation) -> Array3<T>
where
    T: Copy + Zero + NumCast + ToPrimitive,
{
    let (nz, ny, nx) = src.dim();
    let dims = (
        out_extent(nz, factors[0]),
        out_extent(ny, factors[1]),
        out_extent(nx, factors[2]),
    );

    match interpolation {
        Interpolation::Nearest => Array3::from_shape_fn(dims, |(k, j, i)| {
            let z = source_coord(k, factors[0]).round();
            let y = source_coord(j, factors[1]).round();
            let x = source_coord(i, factors[2]).round();
            if z < 0.0
                || y < 0.0
                || x < 0.0
                || z as usize >= nz
                || y as usize >= ny
                || x as usize >= nx
            {
                T::zero()
            } else {
                src[[z as usize, y as usize, x as usize]]
            }
        }),
        Interpolation::Smooth => Array3::from_shape_fn(dims, |(k, j, i)| {
            let z = source_coord(k, factors[0]).clamp(0.0, (nz - 1) as f64);
            let y = source_coord(j, factors[1]).clamp(0.0, (ny - 1) as f64);
            let x = source_coord(i, factors[2]).clamp(0.0, (nx - 1) as f64);

            let (z0, y0, x0) = (z.floor() as usize, y.floor() as usize, x.floor() as usize);
            let (z1, y1, x1) = (
                (z0 + 1).min(nz - 1),
                (y0 + 1).min(ny - 1),
                (x0 + 1).min(nx - 1),
            );
            let (tz, ty, tx) = (z - z0 as f64, y - y0 as f64, x - x0 as f64);

            let at = |zi: usize, yi: usize, xi: usize| -> f64 {
                src[[zi, yi, xi]].to_f64().unwrap_or(0.0)
            };

            let c00 = at(z0, y0, x0) * (1.0 - tx) + at(z0, y0, x1) * tx;
            let c01 = at(z0, y1, x0) * (1.0 - tx) + at(z0, y1, x1) * tx;
            let c10 = at(z1, y0, x0) * (1.0 - tx) + at(z1, y0, x1) * tx;
            let c11 = at(z1, y1, x0) * (1.0 - tx) + at(z1, y1, x1) * tx;

            let c0 = c00 * (1.0 - ty) + c01 * ty;
            let c1 = c10 * (1.0 - ty) + c11 * ty;
            let value = c0 * (1.0 - tz) + c1 * tz;

            // interpolated values stay within the source range, so the
            // cast back to T cannot overflow
            NumCast::from(value).unwrap_or_else(T::zero)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn ramp_i16() -> Array3<i16> {
        Array3::from_shape_fn((2, 4, 4), |(z, y, x)| (z * 100 + y * 10 + x) as i16)
    }

    #[test]
    fn test_unchanged_spacing_is_identity() {
        let src = SampleBuffer::I16(ramp_i16());
        let out = resample(&src, (1.0, 1.0, 1.0), (1.0, 1.0, 1.0), Interpolation::Smooth).unwrap();
        match (&src, &out) {
            (SampleBuffer::I16(a), SampleBuffer::I16(b)) => assert_eq!(a, b),
            _ => panic!("sample type changed"),
        }
    }

    #[test]
    fn test_unchanged_spacing_is_identity_for_labels() {
        let labels = Array3::from_shape_fn((2, 4, 4), |(z, y, x)| ((z + y + x) % 3) as u32);
        let src = SampleBuffer::U32(labels.clone());
        let out = resample(&src, (0.4, 0.4, 0.6), (0.4, 0.4, 0.6), Interpolation::Nearest).unwrap();
        assert_eq!(out.as_labels().unwrap(), &labels);
    }

    #[test]
    fn test_halving_spacing_doubles_extent() {
        let src = SampleBuffer::I16(ramp_i16());
        let out = resample(&src, (1.0, 1.0, 1.0), (0.5, 0.5, 0.5), Interpolation::Smooth).unwrap();
        assert_eq!(out.shape(), (4, 8, 8));
        assert_eq!(out.size(), (8, 8, 4));
    }

    #[test]
    fn test_nearest_never_invents_labels() {
        let labels = Array3::from_shape_fn((4, 6, 6), |(z, y, x)| {
            if (2..4).contains(&y) && (2..4).contains(&x) && z < 2 {
                5u32
            } else if y >= 4 {
                9u32
            } else {
                0
            }
        });
        let source_values: BTreeSet<u32> = labels.iter().copied().collect();

        let out = resample(
            &SampleBuffer::U32(labels),
            (1.0, 1.0, 1.0),
            (0.7, 1.3, 0.9),
            Interpolation::Nearest,
        )
        .unwrap();

        let out_values: BTreeSet<u32> = out.as_labels().unwrap().iter().copied().collect();
        assert!(out_values.is_subset(&source_values));
    }

    #[test]
    fn test_smooth_midpoint_interpolates() {
        // two slices valued 0 and 100; doubling z puts the two inner output
        // slices at source coordinates 0.25 and 0.75
        let src = Array3::from_shape_fn((2, 2, 2), |(z, _, _)| if z == 0 { 0.0f32 } else { 100.0 });
        let out = resample(
            &SampleBuffer::F32(src),
            (1.0, 1.0, 2.0),
            (1.0, 1.0, 1.0),
            Interpolation::Smooth,
        )
        .unwrap();
        match out {
            SampleBuffer::F32(a) => {
                assert_eq!(a.dim(), (4, 2, 2));
                assert!((a[[1, 0, 0]] - 25.0).abs() < 1e-4);
                assert!((a[[2, 0, 0]] - 75.0).abs() < 1e-4);
            }
            _ => panic!("sample type changed"),
        }
    }

    #[test]
    fn test_rejects_bad_spacing() {
        let src = SampleBuffer::I16(ramp_i16());
        assert!(resample(&src, (1.0, 1.0, 1.0), (0.0, 1.0, 1.0), Interpolation::Smooth).is_err());
        assert!(resample(&src, (1.0, -1.0, 1.0), (1.0, 1.0, 1.0), Interpolation::Nearest).is_err());
    }
}
