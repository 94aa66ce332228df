//! Integration tests driving a whole session: legacy container import,
//! codec round-trips through real files, and manager state transitions.

use medvol::{
    legacy, ExistingScanPolicy, Frame, MaskSource, SampleBuffer, VolumeAsset, VolumeKind,
    VolumeManager,
};
use ndarray::Array3;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn init_logs() {
    // repeated init attempts across tests are fine to ignore
    let _ = simple_logger::init();
}

fn fixture_frame() -> Frame {
    Frame::new((6, 5, 3), (0.5, 0.5, 0.8), (1.0, 2.0, 3.0)).unwrap()
}

fn ramp_samples(frame: &Frame) -> Array3<i16> {
    Array3::from_shape_fn(frame.shape(), |(z, y, x)| (z * 100 + y * 10 + x) as i16)
}

/// `read -> write -> compare raw bytes` for the legacy scan codec
#[test]
fn test_legacy_scan_file_roundtrip() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let frame = fixture_frame();
    let original = dir.path().join("patient.bin");
    let rewritten = dir.path().join("patient_rewrite.bin");

    legacy::write_scan(&SampleBuffer::I16(ramp_samples(&frame)), &original).unwrap();
    let decoded = legacy::read_scan(&original, &frame).unwrap();
    legacy::write_scan(&SampleBuffer::I16(decoded), &rewritten).unwrap();

    assert_eq!(fs::read(&original).unwrap(), fs::read(&rewritten).unwrap());
}

/// `read -> write -> compare raw bytes` for the legacy mask codec
#[test]
fn test_legacy_mask_file_roundtrip() {
    let dir = TempDir::new().unwrap();
    let frame = fixture_frame();

    let mut labels = Array3::from_elem(frame.shape(), 0u32);
    labels[[0, 1, 1]] = 1;
    labels[[0, 1, 2]] = 1;
    labels[[2, 4, 5]] = 1;

    let original = dir.path().join("0.bin");
    let rewritten = dir.path().join("0_rewrite.bin");
    legacy::write_mask(&labels, &original, false).unwrap();

    let decoded = legacy::read_mask(&original, &frame).unwrap();
    legacy::write_mask(&decoded.mapv(|b| b as u32), &rewritten, false).unwrap();

    assert_eq!(fs::read(&original).unwrap(), fs::read(&rewritten).unwrap());
}

/// Loading a NIfTI scan through the manager, with the sensitivity assertion
/// redacting metadata
#[test]
fn test_load_nifti_scan_through_manager() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scan.nii");

    let frame = Arc::new(fixture_frame());
    let asset = VolumeAsset::new(
        VolumeKind::Scan,
        SampleBuffer::I16(ramp_samples(&frame)),
        Arc::clone(&frame),
        medvol::Identifier::fresh(),
    )
    .unwrap();
    medvol::io::save(&asset, &path).unwrap();

    let mut manager = VolumeManager::new();
    manager.load_scan(&path, false).unwrap();

    let scan = manager.scan().unwrap();
    assert_eq!(scan.frame().size(), (6, 5, 3));
    assert!(!scan.identifier().has_sensitive_data());
    assert!(manager.mask().is_some());

    // a second load is a rejected operation
    assert!(manager.load_scan(&path, false).is_err());
}

#[cfg(unix)]
mod container {
    use super::*;
    use medvol::{ManagerConfig, PrivacyPolicy};
    use std::path::Path;

    /// Write a stand-in extractor: a shell script that ignores the archive
    /// argument and copies the fixture members into the working directory.
    fn fake_extractor(dir: &Path, fixture: &Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("extract.sh");
        fs::write(
            &script,
            format!("#!/bin/sh\ncp \"{}\"/*.bin . 2>/dev/null\nexit 0\n", fixture.display()),
        )
        .unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();
        script
    }

    fn build_fixture(fixture: &Path, frame: &Frame) -> Array3<i16> {
        let samples = ramp_samples(frame);
        legacy::write_scan(
            &SampleBuffer::I16(samples.clone()),
            fixture.join("Patient_data.bin"),
        )
        .unwrap();

        let mut first = Array3::from_elem(frame.shape(), false);
        first[[0, 1, 1]] = true;
        first[[0, 1, 2]] = true;
        let mut second = Array3::from_elem(frame.shape(), false);
        second[[2, 4, 5]] = true;
        legacy::write_mask(&first.mapv(|b| b as u32), fixture.join("0.bin"), false).unwrap();
        legacy::write_mask(&second.mapv(|b| b as u32), fixture.join("1.bin"), false).unwrap();

        // name, study date, sex, _, _, size-z/y/x, spacing-x/y/z, _,
        // origin-x/y/z, trailing fields
        fs::write(
            fixture.join("Patient_info.bin"),
            "SMITH^ALEX,20210403,F,0,0,3,5,6,0.5,0.5,0.8,0,1,2,3,0",
        )
        .unwrap();
        fs::write(fixture.join("Mask_Info.bin"), "2;0;0;").unwrap();

        samples
    }

    #[test]
    fn test_import_container_end_to_end() {
        init_logs();
        let dir = TempDir::new().unwrap();
        let fixture = dir.path().join("fixture");
        fs::create_dir(&fixture).unwrap();

        let frame = fixture_frame();
        let samples = build_fixture(&fixture, &frame);
        let extractor = fake_extractor(dir.path(), &fixture);

        let config = ManagerConfig::new().with_extractor(&extractor);
        let manager =
            VolumeManager::import_archive(dir.path().join("case.archive"), config).unwrap();

        // scan round-tripped through the legacy codec
        let scan = manager.scan().unwrap();
        assert_eq!(scan.frame(), &frame);
        match scan.samples() {
            SampleBuffer::I16(decoded) => assert_eq!(decoded, &samples),
            _ => panic!("scan should decode as i16"),
        }

        // header record populated the identifier
        assert_eq!(scan.identifier().get_metadata("PatientName"), Some("SMITH^ALEX"));
        assert_eq!(scan.identifier().get_metadata("StudyDate"), Some("20210403"));
        assert_eq!(scan.identifier().get_metadata("PatientSex"), Some("F"));
        assert!(scan.identifier().has_sensitive_data());

        // each mask file became one label, in file order
        assert_eq!(manager.label_ids(), vec![0, 1]);
        let labels = manager.mask().unwrap().samples().as_labels().unwrap();
        assert_eq!(labels[[0, 1, 1]], 0b01);
        assert_eq!(labels[[0, 1, 2]], 0b01);
        assert_eq!(labels[[2, 4, 5]], 0b10);
        assert_eq!(labels.iter().filter(|&&v| v != 0).count(), 3);
    }

    #[test]
    fn test_import_then_resample_keeps_alignment() {
        let dir = TempDir::new().unwrap();
        let fixture = dir.path().join("fixture");
        fs::create_dir(&fixture).unwrap();

        let frame = fixture_frame();
        build_fixture(&fixture, &frame);
        let extractor = fake_extractor(dir.path(), &fixture);

        let config = ManagerConfig::new().with_extractor(&extractor);
        let mut manager =
            VolumeManager::import_archive(dir.path().join("case.archive"), config).unwrap();

        manager.resample((0.25, 0.25, 0.4)).unwrap();

        let scan = manager.scan().unwrap();
        let mask = manager.mask().unwrap();
        assert_eq!(scan.frame().size(), (12, 10, 6));
        assert_eq!(scan.frame().spacing(), (0.25, 0.25, 0.4));
        assert_eq!(mask.frame(), scan.frame());
        assert_eq!(manager.label_ids(), vec![0, 1]);

        // labels survive nearest-neighbor resampling without new values
        let present = mask.labels_present().unwrap();
        assert_eq!(present, vec![0, 1]);
    }

    #[test]
    fn test_import_respects_strict_privacy() {
        let dir = TempDir::new().unwrap();
        let fixture = dir.path().join("fixture");
        fs::create_dir(&fixture).unwrap();

        let frame = fixture_frame();
        build_fixture(&fixture, &frame);
        let extractor = fake_extractor(dir.path(), &fixture);

        let config = ManagerConfig::new()
            .with_extractor(&extractor)
            .with_privacy(PrivacyPolicy::strict());
        let err = VolumeManager::import_archive(dir.path().join("case.archive"), config)
            .unwrap_err();
        assert!(matches!(err, medvol::MedvolError::SensitiveDataRejected));
    }

    #[test]
    fn test_import_fails_on_missing_members() {
        let dir = TempDir::new().unwrap();
        let fixture = dir.path().join("fixture");
        fs::create_dir(&fixture).unwrap();
        // fixture left empty: extraction "succeeds" but produces nothing
        let extractor = fake_extractor(dir.path(), &fixture);

        let config = ManagerConfig::new().with_extractor(&extractor);
        let err = VolumeManager::import_archive(dir.path().join("case.archive"), config)
            .unwrap_err();
        assert!(matches!(err, medvol::MedvolError::Extraction(_)));
    }
}

/// Import followed by re-export reproduces the legacy mask file bit-for-bit
#[test]
fn test_mask_export_matches_import() {
    let dir = TempDir::new().unwrap();
    let frame = fixture_frame();

    let mut labels = Array3::from_elem(frame.shape(), 0u32);
    labels[[1, 2, 0]] = 1;
    labels[[1, 2, 1]] = 1;
    labels[[1, 2, 2]] = 1;
    labels[[0, 0, 5]] = 1;

    let exported = dir.path().join("roi.bin");
    legacy::write_mask(&labels, &exported, false).unwrap();
    let bytes = fs::read(&exported).unwrap();

    let decoded = legacy::decode_mask(&bytes, &frame).unwrap();
    let reencoded = legacy::encode_mask(&decoded.mapv(|b| b as u32), false).unwrap();
    assert_eq!(reencoded.len(), 1);
    assert_eq!(reencoded[0].1, bytes);
}

/// A full in-memory session: set_scan, add labels, resample, save
#[test]
fn test_session_scenario() {
    let dir = TempDir::new().unwrap();
    let frame = Arc::new(Frame::new((4, 4, 2), (1.0, 1.0, 1.0), (0.0, 0.0, 0.0)).unwrap());
    let scan = VolumeAsset::new(
        VolumeKind::Scan,
        SampleBuffer::I16(Array3::from_elem(frame.shape(), 40i16)),
        Arc::clone(&frame),
        medvol::Identifier::fresh(),
    )
    .unwrap();

    let mut manager = VolumeManager::new();
    manager.set_scan(scan, ExistingScanPolicy::Error).unwrap();

    let mut stencil = Array3::from_elem((2, 4, 4), false);
    stencil[[0, 0, 0]] = true;
    stencil[[1, 1, 1]] = true;
    manager.add_mask(MaskSource::Binary(stencil), Some(0)).unwrap();

    let labels = manager.mask().unwrap().samples().as_labels().unwrap();
    assert_eq!(labels[[0, 0, 0]], 0b1);
    assert_eq!(labels[[1, 1, 1]], 0b1);
    assert_eq!(labels.iter().filter(|&&v| v != 0).count(), 2);

    manager.resample((0.5, 0.5, 0.5)).unwrap();
    assert_eq!(manager.scan().unwrap().frame().size(), (8, 8, 4));

    let out = dir.path().join("resampled.nii");
    medvol::io::save(manager.scan().unwrap(), &out).unwrap();
    assert!(out.is_file());
}
