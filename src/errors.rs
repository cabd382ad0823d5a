use std::io;

use thiserror::Error;

/// Process-fatal error kinds for the classification pipeline. Workers do
/// not recover from any of these; the driver surfaces the first one and the
/// binary maps it to a sysexits-style code.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{path}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("data error: {0}")]
    Data(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClassifyError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ClassifyError::Config(_) => 64,
            ClassifyError::Data(_) => 65,
            ClassifyError::Internal(_) => 70,
            ClassifyError::Io(_) | ClassifyError::File { .. } => 74,
        }
    }

    /// Attach a filename to a bare I/O error.
    pub fn in_file(path: &str, source: io::Error) -> Self {
        ClassifyError::File {
            path: path.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClassifyError>;
