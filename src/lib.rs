//! Medvol - session data core for 3D medical scan volumes
//!
//! An object model for medical volumes (scan + multi-label mask) backing
//! desktop viewers: reading and writing standard volumetric formats (DICOM
//! series in, NIfTI out) and the legacy run-length bin format of an
//! external segmentation tool, in-place resampling, and a bitmask-based
//! multi-label representation shared by reference between a scan and its
//! companion mask.
//!
//! # Features
//!
//! - DICOM series reading with per-directory series disambiguation and
//!   slope/intercept rescaling
//! - NIfTI reading and writing with frame geometry carried in the header
//! - Legacy bin codec: raw 16-bit scan dumps and run-length mask records,
//!   bit-for-bit round-trips
//! - Trilinear / nearest-neighbor resampling keeping a scan and its mask
//!   in lock-step
//! - A session manager holding one scan plus one 32-label bitmask mask,
//!   with synchronous observer notifications
//! - Import of the segmentation tool's compressed containers through an
//!   external extractor
//!
//! The crate is synchronous and single-threaded by design: every call
//! blocks, the manager has no internal locking, and all mutation goes
//! through [`VolumeManager`].
//!
//! # Example
//!
//! ```rust,ignore
//! use medvol::{MaskSource, VolumeManager};
//!
//! # fn example() -> medvol::Result<()> {
//! let mut session = VolumeManager::new();
//! session.subscribe(|event| println!("{:?}", event));
//! session.load_scan("scans/ct-head/slice-001.dcm", true)?;
//! session.resample((0.4, 0.4, 0.4))?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod dicom;
pub mod error;
pub mod frame;
pub mod identifier;
pub mod io;
pub mod legacy;
pub mod manager;
pub mod resample;
pub mod volume;

// Re-exports
pub use self::dicom::SeriesSelection;
pub use error::{MedvolError, Result};
pub use frame::Frame;
pub use identifier::{Identifier, PrivacyPolicy};
pub use io::{ImageFormat, ReadOptions};
pub use manager::{
    EventKind, ExistingScanPolicy, ManagerConfig, MaskSource, ObserverId, VolumeEvent,
    VolumeManager,
};
pub use resample::Interpolation;
pub use volume::{Action, SampleBuffer, ScalarType, VolumeAsset, VolumeKind, VoxelSelector};

/// Version of the medvol crate
pub const MEDVOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of labels a mask voxel can carry, one per bit of its u32 sample
pub const MAX_LABELS: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!MEDVOL_VERSION.is_empty());
    }

    #[test]
    fn test_label_capacity_matches_sample_width() {
        assert_eq!(MAX_LABELS, u32::BITS as usize);
    }
}
