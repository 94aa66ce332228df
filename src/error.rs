//! Error types for medvol operations

use thiserror::Error;

/// Main error type for volume session operations
#[derive(Error, Debug)]
pub enum MedvolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("DICOM error: {0}")]
    Dicom(String),

    #[error("NIfTI error: {0}")]
    Nifti(String),

    #[error("No DICOM series found under {0}")]
    SeriesNotFound(String),

    #[error("Directory contains {0} DICOM series; caller must select one")]
    AmbiguousSeries(usize),

    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    #[error("All {0} label ids are in use")]
    LabelsExhausted(usize),

    #[error("A scan is already loaded; construct a new manager or reset")]
    ScanAlreadyLoaded,

    #[error("A scan is already loaded; replacing it requires confirmation")]
    ConfirmationRequired,

    #[error("No scan is loaded")]
    NoScanLoaded,

    #[error("Buffer contains {0} distinct mask values and splitting is not allowed")]
    MultipleMasks(usize),

    #[error("Sensitive metadata is present but disallowed by the privacy policy")]
    SensitiveDataRejected,

    #[error("Archive extraction failed: {0}")]
    Extraction(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Specialized Result type for volume session operations
pub type Result<T> = std::result::Result<T, MedvolError>;
