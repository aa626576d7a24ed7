use std::fmt;

/// Reason an archive was rejected before extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsafeArchiveKind {
    TooManyEntries,
    TotalSizeExceeded,
    CompressionRatioExceeded,
    PathTraversal,
    SymlinkEntry,
}

impl fmt::Display for UnsafeArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsafeArchiveKind::TooManyEntries => write!(f, "too many entries"),
            UnsafeArchiveKind::TotalSizeExceeded => write!(f, "uncompressed size limit exceeded"),
            UnsafeArchiveKind::CompressionRatioExceeded => {
                write!(f, "compression ratio limit exceeded")
            }
            UnsafeArchiveKind::PathTraversal => write!(f, "entry path escapes extraction root"),
            UnsafeArchiveKind::SymlinkEntry => write!(f, "entry is a symlink"),
        }
    }
}

#[derive(Debug)]
pub enum TranslateError {
    /// Archive failed a safety check (zip bomb, zip slip, symlink).
    UnsafeArchive { subkind: UnsafeArchiveKind, detail: String },
    /// No imsmanifest.xml entry anywhere in the archive.
    NotAScorm,
    /// imsmanifest.xml could not be parsed.
    MalformedManifest(String),
    /// Provider error that survived all retries.
    ProviderTransient(String),
    /// Job cancelled through the cancel token.
    Cancelled,
    Io(std::io::Error),
    Zip(zip::result::ZipError),
    Xml(quick_xml::Error),
    Serialization(serde_json::Error),
    Network(reqwest::Error),
    Internal(String),
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslateError::UnsafeArchive { subkind, detail } => {
                write!(f, "unsafe archive ({}): {}", subkind, detail)
            }
            TranslateError::NotAScorm => write!(f, "not a SCORM package: imsmanifest.xml not found"),
            TranslateError::MalformedManifest(msg) => write!(f, "malformed manifest: {}", msg),
            TranslateError::ProviderTransient(msg) => write!(f, "translation provider error: {}", msg),
            TranslateError::Cancelled => write!(f, "job cancelled"),
            TranslateError::Io(e) => write!(f, "IO error: {}", e),
            TranslateError::Zip(e) => write!(f, "ZIP error: {}", e),
            TranslateError::Xml(e) => write!(f, "XML error: {}", e),
            TranslateError::Serialization(e) => write!(f, "serialization error: {}", e),
            TranslateError::Network(e) => write!(f, "network error: {}", e),
            TranslateError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for TranslateError {}

impl TranslateError {
    /// Message safe to show to end users: no filesystem paths, no backend payloads.
    pub fn sanitized_message(&self) -> String {
        match self {
            TranslateError::UnsafeArchive { subkind, .. } => {
                format!("The uploaded archive was rejected: {}", subkind)
            }
            TranslateError::NotAScorm => {
                "The archive does not contain a SCORM manifest".to_string()
            }
            TranslateError::MalformedManifest(_) => {
                "The SCORM manifest could not be parsed".to_string()
            }
            TranslateError::ProviderTransient(_) => {
                "The translation backend is temporarily unavailable".to_string()
            }
            TranslateError::Cancelled => "The job was cancelled".to_string(),
            _ => "An internal error occurred while processing the package".to_string(),
        }
    }
}

// Automatic conversions
impl From<std::io::Error> for TranslateError {
    fn from(err: std::io::Error) -> Self {
        TranslateError::Io(err)
    }
}

impl From<zip::result::ZipError> for TranslateError {
    fn from(err: zip::result::ZipError) -> Self {
        TranslateError::Zip(err)
    }
}

impl From<quick_xml::Error> for TranslateError {
    fn from(err: quick_xml::Error) -> Self {
        TranslateError::Xml(err)
    }
}

impl From<serde_json::Error> for TranslateError {
    fn from(err: serde_json::Error) -> Self {
        TranslateError::Serialization(err)
    }
}

impl From<reqwest::Error> for TranslateError {
    fn from(err: reqwest::Error) -> Self {
        TranslateError::Network(err)
    }
}

pub type Result<T> = std::result::Result<T, TranslateError>;
