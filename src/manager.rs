//! Session aggregate: one scan, one companion multi-label mask, and the
//! observers the UI layer hangs off it

use crate::archive::{self, MASK_INFO_MEMBER, PATIENT_DATA_MEMBER, PATIENT_INFO_MEMBER};
use crate::error::{MedvolError, Result};
use crate::identifier::{Identifier, PrivacyPolicy};
use crate::io::{self, ReadOptions};
use crate::legacy;
use crate::resample::{resample, Interpolation};
use crate::volume::{Action, SampleBuffer, VolumeAsset, VolumeKind, VoxelSelector};
use crate::MAX_LABELS;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// What `set_scan` does when a scan is already loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExistingScanPolicy {
    /// Discard the loaded scan, its mask, and the label registry, then load
    Reset,
    /// Reject with [`MedvolError::ConfirmationRequired`]; a UI prompts and
    /// re-invokes with `Reset`
    Confirm,
    /// Reject with [`MedvolError::ScanAlreadyLoaded`]
    #[default]
    Error,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Policy applied when confirming asset sensitivity
    pub privacy: PrivacyPolicy,

    /// External program used to unpack legacy containers
    pub extractor: PathBuf,
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self {
            privacy: PrivacyPolicy::default(),
            extractor: PathBuf::from("unrar"),
        }
    }

    pub fn with_privacy(mut self, privacy: PrivacyPolicy) -> Self {
        self.privacy = privacy;
        self
    }

    pub fn with_extractor(mut self, extractor: impl Into<PathBuf>) -> Self {
        self.extractor = extractor.into();
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of state change an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A scan (and its fresh empty mask) entered the session
    ScanLoaded,
    /// Geometry or identity changed; viewers rebuild their pipelines
    FullReload,
    /// Sample data changed under stable geometry; viewers refresh in place
    DataUpdated,
}

/// Change notification delivered to registered observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEvent {
    pub kind: EventKind,
    pub affected: VolumeKind,
}

/// Handle for removing a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverCallback = Box<dyn FnMut(&VolumeEvent)>;

/// Voxel data fed to [`VolumeManager::add_mask`]
#[derive(Debug, Clone)]
pub enum MaskSource {
    /// True voxels join one label (given or next available)
    Binary(Array3<bool>),
    /// Each distinct non-zero value becomes its own label, ascending
    Labeled(Array3<u32>),
}

/// The session-level aggregate the UI layer talks to.
///
/// Holds at most one scan and, once a scan is loaded, exactly one companion
/// multi-label mask sharing the scan's frame. All mutation goes through the
/// manager so that the pair stays geometrically aligned; observers are
/// notified synchronously, in registration order. Not safe for concurrent
/// mutation — single-threaded by design.
pub struct VolumeManager {
    config: ManagerConfig,
    scan: Option<VolumeAsset>,
    mask: Option<VolumeAsset>,
    label_ids: BTreeSet<u8>,
    observers: Vec<(ObserverId, ObserverCallback)>,
    next_observer_id: u64,
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("config", &self.config)
            .field("scan", &self.scan)
            .field("mask", &self.mask)
            .field("label_ids", &self.label_ids)
            .field("observers", &self.observers.len())
            .field("next_observer_id", &self.next_observer_id)
            .finish()
    }
}

fn next_free_label(ids: &BTreeSet<u8>) -> Result<u8> {
    (0..MAX_LABELS as u8)
        .find(|id| !ids.contains(id))
        .ok_or(MedvolError::LabelsExhausted(MAX_LABELS))
}

impl VolumeManager {
    /// Empty session with default configuration
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::new())
    }

    /// Empty session with explicit configuration
    pub fn with_config(config: ManagerConfig) -> Self {
        Self {
            config,
            scan: None,
            mask: None,
            label_ids: BTreeSet::new(),
            observers: Vec::new(),
            next_observer_id: 0,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn scan_is_loaded(&self) -> bool {
        self.scan.is_some()
    }

    /// The loaded scan, if any
    pub fn scan(&self) -> Option<&VolumeAsset> {
        self.scan.as_ref()
    }

    /// The companion mask; exists exactly when a scan is loaded
    pub fn mask(&self) -> Option<&VolumeAsset> {
        self.mask.as_ref()
    }

    /// Label ids currently registered, ascending
    pub fn label_ids(&self) -> Vec<u8> {
        self.label_ids.iter().copied().collect()
    }

    /// Register an observer; callbacks run synchronously in registration
    /// order on every state change
    pub fn subscribe<F>(&mut self, callback: F) -> ObserverId
    where
        F: FnMut(&VolumeEvent) + 'static,
    {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(registered, _)| *registered != id);
        self.observers.len() != before
    }

    fn emit(&mut self, kind: EventKind, affected: VolumeKind) {
        let event = VolumeEvent { kind, affected };
        for (_, callback) in self.observers.iter_mut() {
            callback(&event);
        }
    }

    /// Load a scan into the session.
    ///
    /// On success an empty companion mask is created over the scan's shared
    /// frame and a `ScanLoaded` event fires. An occupied manager resolves
    /// through `policy`.
    pub fn set_scan(&mut self, scan: VolumeAsset, policy: ExistingScanPolicy) -> Result<()> {
        if scan.kind() != VolumeKind::Scan {
            return Err(MedvolError::InvalidFormat(
                "set_scan expects a scan asset".to_string(),
            ));
        }

        if self.scan_is_loaded() {
            match policy {
                ExistingScanPolicy::Error => return Err(MedvolError::ScanAlreadyLoaded),
                ExistingScanPolicy::Confirm => return Err(MedvolError::ConfirmationRequired),
                ExistingScanPolicy::Reset => {
                    log::info!("resetting session for a new scan");
                    self.scan = None;
                    self.mask = None;
                    self.label_ids.clear();
                }
            }
        }

        let mask = VolumeAsset::empty(VolumeKind::MultiLabelMask, scan.shared_frame());
        self.scan = Some(scan);
        self.mask = Some(mask);
        self.emit(EventKind::ScanLoaded, VolumeKind::Scan);
        Ok(())
    }

    /// Read a scan from a file or DICOM directory and load it.
    ///
    /// `has_sensitive_data` is the caller's assertion about the source;
    /// the configured privacy policy settles what happens to the metadata.
    pub fn load_scan(&mut self, path: impl AsRef<Path>, has_sensitive_data: bool) -> Result<()> {
        self.load_scan_with(path, &ReadOptions::default(), has_sensitive_data)
    }

    /// [`VolumeManager::load_scan`] with explicit read options, e.g. for
    /// series disambiguation
    pub fn load_scan_with(
        &mut self,
        path: impl AsRef<Path>,
        options: &ReadOptions,
        has_sensitive_data: bool,
    ) -> Result<()> {
        let mut asset = io::read(path, options)?;
        asset
            .identifier_mut()
            .confirm_sensitivity(has_sensitive_data, &self.config.privacy)?;
        self.set_scan(asset, ExistingScanPolicy::Error)
    }

    /// Flag voxels as members of one or more labels.
    ///
    /// `MaskSource::Binary` flags true voxels with `label` (or the next
    /// available id); a label that already has voxels is cleared first.
    /// `MaskSource::Labeled` assigns each distinct non-zero value a fresh
    /// id in ascending value order; an explicit `label` is rejected there.
    /// Returns the assigned label ids and fires one `DataUpdated` event.
    pub fn add_mask(&mut self, source: MaskSource, label: Option<u8>) -> Result<Vec<u8>> {
        let mask = self.mask.as_mut().ok_or(MedvolError::NoScanLoaded)?;

        let mut assigned = Vec::new();
        match source {
            MaskSource::Binary(stencil) => {
                let id = match label {
                    Some(id) => {
                        if id as usize >= MAX_LABELS {
                            return Err(MedvolError::InvalidLabel(format!(
                                "label id {} out of range 0..{}",
                                id, MAX_LABELS
                            )));
                        }
                        id
                    }
                    None => next_free_label(&self.label_ids)?,
                };

                if mask.label_present(id)? {
                    log::info!("label {} already has voxels flagged, clearing first", id);
                    mask.set_label(id, VoxelSelector::All, false)?;
                }
                mask.set_label(id, VoxelSelector::Stencil(&stencil), true)?;
                self.label_ids.insert(id);
                assigned.push(id);
            }
            MaskSource::Labeled(values) => {
                if label.is_some() {
                    return Err(MedvolError::InvalidLabel(
                        "a labeled volume assigns its own ids; explicit label not allowed"
                            .to_string(),
                    ));
                }

                let distinct: BTreeSet<u32> =
                    values.iter().copied().filter(|&v| v != 0).collect();
                for value in distinct {
                    let id = next_free_label(&self.label_ids)?;
                    let stencil = values.mapv(|v| v == value);
                    if mask.label_present(id)? {
                        log::info!("label {} already has voxels flagged, clearing first", id);
                        mask.set_label(id, VoxelSelector::All, false)?;
                    }
                    mask.set_label(id, VoxelSelector::Stencil(&stencil), true)?;
                    self.label_ids.insert(id);
                    assigned.push(id);
                }
            }
        }

        self.emit(EventKind::DataUpdated, VolumeKind::MultiLabelMask);
        Ok(assigned)
    }

    /// Set or clear one label on selected voxels of the companion mask
    pub fn set_label(&mut self, label: u8, selector: VoxelSelector<'_>, value: bool) -> Result<()> {
        let mask = self.mask.as_mut().ok_or(MedvolError::NoScanLoaded)?;
        mask.set_label(label, selector, value)?;
        if value {
            self.label_ids.insert(label);
        }
        self.emit(EventKind::DataUpdated, VolumeKind::MultiLabelMask);
        Ok(())
    }

    /// Resample the scan and its mask to a new voxel spacing.
    ///
    /// The scan takes the smooth intensity policy, the mask the
    /// label-preserving nearest policy; both buffers and the one shared
    /// frame are replaced together, after both resamples have succeeded.
    /// Identifiers and provenance logs survive, each gaining a resample
    /// entry before the swap. Fires `FullReload`.
    pub fn resample(&mut self, new_spacing: (f64, f64, f64)) -> Result<()> {
        let scan = self.scan.as_mut().ok_or(MedvolError::NoScanLoaded)?;
        let mask = self.mask.as_mut().ok_or(MedvolError::NoScanLoaded)?;

        let old_spacing = scan.frame().spacing();
        let new_scan = resample(scan.samples(), old_spacing, new_spacing, Interpolation::Smooth)?;
        let new_mask = resample(mask.samples(), old_spacing, new_spacing, Interpolation::Nearest)?;
        if new_scan.shape() != new_mask.shape() {
            return Err(MedvolError::ShapeMismatch(format!(
                "resampled scan {:?} and mask {:?} disagree",
                new_scan.shape(),
                new_mask.shape()
            )));
        }

        let frame = Arc::new(scan.frame().resampled(new_scan.size(), new_spacing)?);

        let entry = |component: &str| {
            Action::new(component, "resample").with_option(
                "new_spacing",
                format!("({}, {}, {})", new_spacing.0, new_spacing.1, new_spacing.2),
            )
        };
        scan.record(entry("scan"));
        mask.record(entry("mask"));

        scan.replace_samples(new_scan, Arc::clone(&frame))?;
        mask.replace_samples(new_mask, frame)?;

        self.emit(EventKind::FullReload, VolumeKind::Scan);
        Ok(())
    }

    /// Build a session from a compressed container of the external
    /// segmentation tool.
    ///
    /// Members are unpacked by the configured extractor into a scoped
    /// temporary directory that is removed on every exit path, including
    /// extraction and parse failures. The patient header record supplies
    /// the frame and identifier metadata; the scan bin and the index-named
    /// mask bins supply the assets, each mask registered as one label.
    pub fn import_archive(path: impl AsRef<Path>, config: ManagerConfig) -> Result<Self> {
        let path = path.as_ref();
        let workdir = TempDir::new()?;

        let fixed: Vec<String> = [PATIENT_INFO_MEMBER, PATIENT_DATA_MEMBER, MASK_INFO_MEMBER]
            .iter()
            .map(|m| m.to_string())
            .collect();
        archive::extract_members(&config.extractor, path, &fixed, workdir.path())?;

        let record = archive::parse_patient_record(&std::fs::read_to_string(
            workdir.path().join(PATIENT_INFO_MEMBER),
        )?)?;
        let num_masks = archive::parse_mask_count(&std::fs::read_to_string(
            workdir.path().join(MASK_INFO_MEMBER),
        )?)?;

        let frame = Arc::new(record.frame.clone());
        let samples = legacy::read_scan(workdir.path().join(PATIENT_DATA_MEMBER), &frame)?;

        let mut identifier = Identifier::fresh();
        identifier.insert_metadata("PatientName", record.name);
        identifier.insert_metadata("StudyDate", record.study_date);
        identifier.insert_metadata("PatientSex", record.sex);
        identifier.confirm_sensitivity(true, &config.privacy)?;

        let mut scan = VolumeAsset::new(
            VolumeKind::Scan,
            SampleBuffer::I16(samples),
            Arc::clone(&frame),
            identifier,
        )?;
        scan.record(Action::new("scan", "read_bin").with_arg(path.display().to_string()));

        let mut manager = Self::with_config(config);
        manager.set_scan(scan, ExistingScanPolicy::Error)?;

        if num_masks > 0 {
            let members: Vec<String> = (0..num_masks).map(|i| format!("{}.bin", i)).collect();
            archive::extract_members(&manager.config.extractor, path, &members, workdir.path())?;
            for member in &members {
                let dense = legacy::read_mask(workdir.path().join(member), &frame)?;
                manager.add_mask(MaskSource::Binary(dense), None)?;
            }
        }

        Ok(manager)
    }
}

impl Default for VolumeManager {
    fn default() -> Self {
        Self::new()
    }
}
