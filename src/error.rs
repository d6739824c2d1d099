//! Typed failures for the report execution core.
//!
//! `acquire`, `retrieve`, and `project` surface these to their callers.
//! The scheduler never propagates them upward: it logs and moves on.
//!
//! Every variant carries owned strings so a single failure can be cloned
//! and handed to all callers waiting on the same connection build.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReportError {
    #[error("unsupported source kind: {0}")]
    UnsupportedSourceKind(String),

    #[error("connection failed for {key}: {message}")]
    Connection { key: String, message: String },

    #[error("source file not found: {}", .0.display())]
    SourceFileMissing(PathBuf),

    #[error("missing query text for source {source_id}")]
    MissingQueryText { source_id: String },

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("sheet not found: {0}")]
    SheetNotFound(String),

    #[error("descriptor does not match source kind {kind}")]
    DescriptorMismatch { kind: String },

    #[error("data source not found: {0}")]
    SourceNotFound(String),

    #[error("report not found: {0}")]
    ReportNotFound(String),

    #[error("store error: {0}")]
    Store(String),
}

impl ReportError {
    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ReportError::UnsupportedSourceKind(_) => "unsupported_source_kind",
            ReportError::Connection { .. } => "connection_error",
            ReportError::SourceFileMissing(_) => "source_file_missing",
            ReportError::MissingQueryText { .. } => "missing_query_text",
            ReportError::Retrieval(_) => "retrieval_error",
            ReportError::InvalidCronExpression { .. } => "invalid_cron_expression",
            ReportError::SheetNotFound(_) => "sheet_not_found",
            ReportError::DescriptorMismatch { .. } => "descriptor_mismatch",
            ReportError::SourceNotFound(_) | ReportError::ReportNotFound(_) => "not_found",
            ReportError::Store(_) => "internal",
        }
    }

    pub(crate) fn retrieval(err: impl std::fmt::Display) -> Self {
        ReportError::Retrieval(err.to_string())
    }
}

impl From<std::io::Error> for ReportError {
    fn from(err: std::io::Error) -> Self {
        ReportError::Retrieval(err.to_string())
    }
}

pub type Result<T, E = ReportError> = std::result::Result<T, E>;
