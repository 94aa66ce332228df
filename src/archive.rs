//! Import support for the compressed container of the external segmentation
//! tool: member extraction via an external program, and the fixed-format
//! patient header record

use crate::error::{MedvolError, Result};
use crate::frame::Frame;
use std::path::Path;
use std::process::{Command, Stdio};

/// Text header member carrying the patient record
pub(crate) const PATIENT_INFO_MEMBER: &str = "Patient_info.bin";
/// Raw scan samples member
pub(crate) const PATIENT_DATA_MEMBER: &str = "Patient_data.bin";
/// Companion record carrying the mask count
pub(crate) const MASK_INFO_MEMBER: &str = "Mask_Info.bin";

/// Parsed first record of the container's patient header.
///
/// The record is comma-separated:
/// `name, study_date, sex, _, _, size_z, size_y, size_x, spacing_x,
/// spacing_y, spacing_z, _, origin_x, origin_y, origin_z, ...`
/// (further fields unused here).
#[derive(Debug, Clone, PartialEq)]
pub struct PatientRecord {
    pub name: String,
    pub study_date: String,
    pub sex: String,
    pub frame: Frame,
}

pub fn parse_patient_record(text: &str) -> Result<PatientRecord> {
    let fields: Vec<&str> = text.split(',').map(str::trim).collect();
    if fields.len() < 15 {
        return Err(MedvolError::InvalidFormat(format!(
            "patient record has {} fields, expected at least 15",
            fields.len()
        )));
    }

    let int = |index: usize, what: &str| -> Result<u32> {
        fields[index].parse::<u32>().map_err(|_| {
            MedvolError::InvalidFormat(format!("{} field {:?} is not an integer", what, fields[index]))
        })
    };
    let float = |index: usize, what: &str| -> Result<f64> {
        fields[index].parse::<f64>().map_err(|_| {
            MedvolError::InvalidFormat(format!("{} field {:?} is not a number", what, fields[index]))
        })
    };

    let size = (int(7, "size-x")?, int(6, "size-y")?, int(5, "size-z")?);
    let spacing = (float(8, "spacing-x")?, float(9, "spacing-y")?, float(10, "spacing-z")?);
    let origin = (float(12, "origin-x")?, float(13, "origin-y")?, float(14, "origin-z")?);

    Ok(PatientRecord {
        name: fields[0].to_string(),
        study_date: fields[1].to_string(),
        sex: fields[2].to_string(),
        frame: Frame::new(size, spacing, origin)?,
    })
}

/// Parse the semicolon-delimited companion record; its first field is the
/// number of mask files in the container
pub fn parse_mask_count(text: &str) -> Result<usize> {
    let first = text.trim().split(';').next().unwrap_or("").trim();
    first.parse::<usize>().map_err(|_| {
        MedvolError::InvalidFormat(format!("mask count field {:?} is not an integer", first))
    })
}

/// Probe whether the extractor program can be spawned at all
pub fn extractor_available(program: impl AsRef<Path>) -> bool {
    Command::new(program.as_ref())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Extract the named members of an archive into `dest`.
///
/// Delegates to the external extractor (`<program> x -idq <archive>
/// <members...>` in `dest`), synchronously. A run that exits successfully
/// but leaves a requested member missing counts as a failed extraction.
pub(crate) fn extract_members(
    extractor: &Path,
    archive: &Path,
    members: &[String],
    dest: &Path,
) -> Result<()> {
    let status = Command::new(extractor)
        .arg("x")
        .arg("-idq")
        .arg(archive)
        .args(members)
        .current_dir(dest)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| {
            MedvolError::Extraction(format!("failed to run {}: {}", extractor.display(), e))
        })?;

    if !status.success() {
        return Err(MedvolError::Extraction(format!(
            "{} exited with {} while extracting from {}",
            extractor.display(),
            status,
            archive.display()
        )));
    }

    for member in members {
        if !dest.join(member).is_file() {
            return Err(MedvolError::Extraction(format!(
                "member {} missing after extraction",
                member
            )));
        }
    }
    Ok(())
}
