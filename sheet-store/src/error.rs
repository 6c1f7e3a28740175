use std::{io, path::PathBuf};

use thiserror::Error;

/// Everything that can go wrong while reading or rewriting a store file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The file exists but is not a workbook we can parse. It is never
    /// recreated in place, the caller has to move it away first.
    #[error("store file {} is not a readable workbook: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("{0} not found in workbook")]
    MissingPart(String),

    #[error("sheet '{0}' not found")]
    MissingSheet(String),

    #[error("malformed {part}: {reason}")]
    Malformed { part: String, reason: String },
}

impl StoreError {
    pub(crate) fn malformed(part: &str, reason: impl Into<String>) -> Self {
        StoreError::Malformed {
            part: part.to_owned(),
            reason: reason.into(),
        }
    }

    /// Failures that mean the bytes on disk are not a usable workbook, as
    /// opposed to the disk itself misbehaving.
    pub(crate) fn is_format_error(&self) -> bool {
        match self {
            // truncated archives run out of bytes while the directory is parsed
            StoreError::Zip(zip::result::ZipError::Io(e)) => {
                e.kind() == io::ErrorKind::UnexpectedEof
            }
            StoreError::Zip(_)
            | StoreError::Xml(_)
            | StoreError::MissingPart(_)
            | StoreError::Malformed { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
