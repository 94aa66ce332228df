//! Codec for the legacy bin format of the external segmentation tool
//!
//! Two wire layouts, neither with a header:
//!
//! - scan: raw little-endian signed 16-bit samples, row-major within each
//!   z-slice, slice-major overall
//! - mask: a sequence of 4 x i16 records `(row, col_start, run_length,
//!   slice)`, each flagging one contiguous run of voxels
//!
//! The tool stores volumes mirrored on the z and y axes relative to this
//! crate's convention, so both directions reverse those two axes at the
//! buffer boundary. Encoding a decoded file reproduces it bit-for-bit.

use crate::error::{MedvolError, Result};
use crate::frame::Frame;
use crate::volume::SampleBuffer;
use byteorder::{ByteOrder, LittleEndian};
use ndarray::{s, Array3};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Reverse the z and y axes, returning an owned standard-layout buffer
fn reversed_zy<T: Clone>(arr: &Array3<T>) -> Array3<T> {
    arr.slice(s![..;-1, ..;-1, ..]).to_owned()
}

/// Largest per-axis extent the record fields can address
fn check_addressable(frame: &Frame) -> Result<()> {
    let (x, y, z) = frame.size();
    if x > i16::MAX as u32 || y > i16::MAX as u32 || z > i16::MAX as u32 {
        return Err(MedvolError::InvalidDimensions(format!(
            "grid ({}, {}, {}) exceeds the 16-bit addressing of the legacy format",
            x, y, z
        )));
    }
    Ok(())
}

/// Decode a raw scan dump into a z-major sample buffer
pub fn decode_scan(bytes: &[u8], frame: &Frame) -> Result<Array3<i16>> {
    let expected = frame.voxel_count() * 2;
    if bytes.len() != expected {
        return Err(MedvolError::InvalidFormat(format!(
            "scan bin holds {} bytes, frame expects {}",
            bytes.len(),
            expected
        )));
    }

    let mut samples = vec![0i16; frame.voxel_count()];
    LittleEndian::read_i16_into(bytes, &mut samples);

    let arr = Array3::from_shape_vec(frame.shape(), samples)
        .map_err(|e| MedvolError::InvalidFormat(e.to_string()))?;
    Ok(reversed_zy(&arr))
}

/// Encode a sample buffer as a raw scan dump.
///
/// The format is fixed at 16 bits; wider in-memory types are narrowed with
/// a logged warning (accepted, not rejected).
pub fn encode_scan(samples: &SampleBuffer) -> Vec<u8> {
    let arr: Array3<i16> = match samples {
        SampleBuffer::I16(a) => reversed_zy(a),
        SampleBuffer::F32(a) => {
            log::warn!("narrowing f32 samples to the 16-bit legacy scan format");
            reversed_zy(&a.mapv(|v| v.clamp(i16::MIN as f32, i16::MAX as f32) as i16))
        }
        SampleBuffer::U32(a) => {
            log::warn!("narrowing u32 samples to the 16-bit legacy scan format");
            reversed_zy(&a.mapv(|v| v.min(i16::MAX as u32) as i16))
        }
    };

    let flat: Vec<i16> = arr.iter().copied().collect();
    let mut bytes = vec![0u8; flat.len() * 2];
    LittleEndian::write_i16_into(&flat, &mut bytes);
    bytes
}

/// Read and decode a scan bin file
pub fn read_scan(path: impl AsRef<Path>, frame: &Frame) -> Result<Array3<i16>> {
    decode_scan(&fs::read(path)?, frame)
}

/// Encode and write a scan bin file
pub fn write_scan(samples: &SampleBuffer, path: impl AsRef<Path>) -> Result<()> {
    fs::write(path, encode_scan(samples))?;
    Ok(())
}

/// Decode a run-length mask file into a dense boolean volume
pub fn decode_mask(bytes: &[u8], frame: &Frame) -> Result<Array3<bool>> {
    if bytes.len() % 8 != 0 {
        return Err(MedvolError::InvalidFormat(format!(
            "mask bin length {} is not a multiple of the 8-byte record size",
            bytes.len()
        )));
    }

    let mut fields = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut fields);

    let (nz, ny, nx) = frame.shape();
    let mut dense = Array3::from_elem((nz, ny, nx), false);

    for record in fields.chunks_exact(4) {
        let (row, col, run, slice) = (record[0], record[1], record[2], record[3]);
        if row < 0 || col < 0 || run < 0 || slice < 0 {
            return Err(MedvolError::InvalidFormat(format!(
                "negative field in mask record ({}, {}, {}, {})",
                row, col, run, slice
            )));
        }
        let (row, col, run, slice) = (row as usize, col as usize, run as usize, slice as usize);
        if slice >= nz || row >= ny || col + run > nx {
            return Err(MedvolError::InvalidFormat(format!(
                "mask record ({}, {}, {}, {}) outside grid ({}, {}, {})",
                row, col, run, slice, nz, ny, nx
            )));
        }
        dense.slice_mut(s![slice, row, col..col + run]).fill(true);
    }

    Ok(reversed_zy(&dense))
}

/// Encode a labeled volume as run-length mask records, one byte buffer per
/// distinct non-zero value (ascending).
///
/// More than one distinct value is an error unless `allow_split` is set.
pub fn encode_mask(labels: &Array3<u32>, allow_split: bool) -> Result<Vec<(u32, Vec<u8>)>> {
    let rev = reversed_zy(labels);
    let values: BTreeSet<u32> = rev.iter().copied().filter(|&v| v != 0).collect();
    if values.len() > 1 && !allow_split {
        return Err(MedvolError::MultipleMasks(values.len()));
    }

    let (nz, ny, nx) = rev.dim();
    if nx > i16::MAX as usize || ny > i16::MAX as usize || nz > i16::MAX as usize {
        return Err(MedvolError::InvalidDimensions(format!(
            "grid ({}, {}, {}) exceeds the 16-bit addressing of the legacy format",
            nx, ny, nz
        )));
    }

    let mut encoded = Vec::with_capacity(values.len());
    for value in values {
        let mut fields: Vec<i16> = Vec::new();
        for slice in 0..nz {
            for row in 0..ny {
                // run boundaries are the sign changes of the zero-padded
                // row signal
                let mut start = None;
                for col in 0..=nx {
                    let on = col < nx && rev[[slice, row, col]] == value;
                    match (start, on) {
                        (None, true) => start = Some(col),
                        (Some(s0), false) => {
                            fields.extend_from_slice(&[
                                row as i16,
                                s0 as i16,
                                (col - s0) as i16,
                                slice as i16,
                            ]);
                            start = None;
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut bytes = vec![0u8; fields.len() * 2];
        LittleEndian::write_i16_into(&fields, &mut bytes);
        encoded.push((value, bytes));
    }

    Ok(encoded)
}

/// Read and decode a single mask bin file
pub fn read_mask(path: impl AsRef<Path>, frame: &Frame) -> Result<Array3<bool>> {
    check_addressable(frame)?;
    decode_mask(&fs::read(path)?, frame)
}

/// Encode and write mask bin files.
///
/// A single distinct value writes to `path` as requested. With several
/// values and `allow_split`, one file per value is written with the value
/// appended to the filename stem. Returns the written paths.
pub fn write_mask(
    labels: &Array3<u32>,
    path: impl AsRef<Path>,
    allow_split: bool,
) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let encoded = encode_mask(labels, allow_split)?;
    let split = encoded.len() > 1;

    let mut written = Vec::with_capacity(encoded.len());
    for (value, bytes) in encoded {
        let target = if split {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("mask");
            let name = match path.extension().and_then(|e| e.to_str()) {
                Some(ext) => format!("{}_{}.{}", stem, value, ext),
                None => format!("{}_{}", stem, value),
            };
            path.with_file_name(name)
        } else {
            path.to_path_buf()
        };
        fs::write(&target, bytes)?;
        written.push(target);
    }

    Ok(written)
}

/// Decode several single-mask bin files into one labeled volume, file order
/// assigning ascending values starting at 1. Overlapping voxels take the
/// value of the later file.
pub fn read_mask_set(paths: &[PathBuf], frame: &Frame) -> Result<Array3<u32>> {
    let mut labeled = Array3::from_elem(frame.shape(), 0u32);
    for (index, path) in paths.iter().enumerate() {
        let value = index as u32 + 1;
        let dense = read_mask(path, frame)?;
        ndarray::Zip::from(&mut labeled).and(&dense).for_each(|out, &on| {
            if on {
                *out = value;
            }
        });
    }
    Ok(labeled)
}
