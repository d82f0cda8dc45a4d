use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Per-file errors – recovered by the assembler (file is skipped)
// ---------------------------------------------------------------------------

/// Why a single instrument file could not be turned into a spectrum.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path}: no {column} column (headers: {headers:?})")]
    MissingColumn {
        path: PathBuf,
        column: &'static str,
        headers: Vec<String>,
    },

    #[error("{path}: no numeric rows after cleaning")]
    NoData { path: PathBuf },
}

impl ParseError {
    /// The file this error refers to.
    pub fn path(&self) -> &std::path::Path {
        match self {
            ParseError::Io { path, .. }
            | ParseError::Csv { path, .. }
            | ParseError::MissingColumn { path, .. }
            | ParseError::NoData { path } => path,
        }
    }
}

// ---------------------------------------------------------------------------
// Crate error – surfaced to the caller
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// None of the files of a batch could be loaded.
    #[error("no valid spectrum could be loaded ({attempted} file(s) attempted)")]
    EmptyBatch { attempted: usize },

    /// Too few points, or a flat signal, to fit a sigmoid.
    #[error("insufficient data for sigmoid fit: {0}")]
    InsufficientData(String),

    /// The nonlinear solver failed; carries the solver diagnostic.
    #[error("sigmoid fit failed to converge: {0}")]
    FitConvergence(String),

    #[error("metadata: {0}")]
    Metadata(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
}

pub type Result<T> = std::result::Result<T, Error>;
