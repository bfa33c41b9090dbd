use std::path::PathBuf;

/// Errors produced while building, matching and refining reconstructions.
///
/// `NoMatchFound`, `MissingObservation` and `DegenerateGeometry` are reported for a single pair or
/// track. The stage that hits them counts them and moves on. All other variants abort the stage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("no match found between {0} and {1}")]
    NoMatchFound(String, String),
    #[error("missing observation: {0}")]
    MissingObservation(String),
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("i/o error on {path}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps an i/o error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::StoreIo {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Error::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Errors that only affect one pair or track.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NoMatchFound(..) | Error::MissingObservation(_) | Error::DegenerateGeometry(_)
        )
    }
}
