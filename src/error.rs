//! Error types for georeferencing and tile generation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::control_point::TransformFamily;
use crate::domain::document::{DocumentId, FitId};
use crate::domain::job::TileJobId;

/// Result type alias using the georeferencer error type.
pub type Result<T> = std::result::Result<T, GeoreferenceError>;

/// Rejections raised before any numeric work starts.
///
/// These are always caller mistakes and are never retried automatically.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Fewer correspondences than the family needs to be determined.
    #[error("insufficient control points: {family} needs at least {required}, got {provided}")]
    InsufficientPoints {
        family: TransformFamily,
        required: usize,
        provided: usize,
    },

    /// Points are coincident or too close to collinear/co-conic for the family.
    #[error("degenerate control point geometry: {detail}")]
    DegenerateGeometry {
        detail: String,
        condition_number: Option<f64>,
    },

    /// A geographic coordinate is outside the valid WGS84 range (or not finite).
    #[error("control point {index} has out-of-range coordinate (lon {longitude}, lat {latitude})")]
    OutOfRangeCoordinate {
        index: usize,
        longitude: f64,
        latitude: f64,
    },

    /// A pixel coordinate is NaN or infinite.
    #[error("control point {index} has a non-finite pixel coordinate")]
    NonFinitePixel { index: usize },

    /// The requested zoom levels are empty or outside the supported range.
    #[error("invalid zoom levels: {0}")]
    InvalidZoomLevels(String),
}

/// Failures of the numeric solve itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericError {
    /// A pivot fell below tolerance; the caller must supply different or more points.
    #[error("singular system while fitting {family}: pivot {pivot:e} below tolerance")]
    SingularSystem { family: TransformFamily, pivot: f64 },

    /// The family (or its order) is not one the solver knows how to fit.
    #[error("unsupported transform family: {0}")]
    UnsupportedFamily(String),
}

/// Main error type for the georeferencing system.
#[derive(Error, Debug)]
pub enum GeoreferenceError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Numeric error: {0}")]
    Numeric(#[from] NumericError),

    /// Membership or permission failure. Carries no detail about whether the
    /// resource exists.
    #[error("Access denied")]
    AccessDenied,

    #[error("Quota exceeded: requested {requested} tiles, {remaining} remaining")]
    QuotaExceeded { requested: u64, remaining: u64 },

    #[error("Document {0} has no active transform")]
    NotGeoreferenced(DocumentId),

    #[error("Document {document_id} already has a live tile job {job_id}")]
    JobAlreadyActive {
        document_id: DocumentId,
        job_id: TileJobId,
    },

    #[error("Document {document_id} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification {
        document_id: DocumentId,
        expected: u64,
        actual: u64,
    },

    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("Fit not found: {0}")]
    FitNotFound(FitId),

    #[error("Tile job not found: {0}")]
    JobNotFound(TileJobId),

    /// Tile job is in an invalid state for the requested operation
    #[error("Invalid state transition: job {0} is in state '{1}', expected '{2}'")]
    InvalidState(TileJobId, String, String),

    /// Tile rendering or storage failed outside of a job's retry loop.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Daemon is shutting down
    #[error("Daemon is shutting down")]
    Shutdown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error classification exposed to transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Numeric,
    Authorization,
    Quota,
    Pipeline,
    NotFound,
    Conflict,
    Internal,
}

/// Structured error payload: kind + message + optional context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl GeoreferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GeoreferenceError::Validation(_) | GeoreferenceError::NotGeoreferenced(_) => {
                ErrorKind::Validation
            }
            GeoreferenceError::Numeric(_) => ErrorKind::Numeric,
            GeoreferenceError::AccessDenied => ErrorKind::Authorization,
            GeoreferenceError::QuotaExceeded { .. } => ErrorKind::Quota,
            GeoreferenceError::Pipeline(_) => ErrorKind::Pipeline,
            GeoreferenceError::DocumentNotFound(_)
            | GeoreferenceError::FitNotFound(_)
            | GeoreferenceError::JobNotFound(_) => ErrorKind::NotFound,
            GeoreferenceError::JobAlreadyActive { .. }
            | GeoreferenceError::ConcurrentModification { .. }
            | GeoreferenceError::InvalidState(..) => ErrorKind::Conflict,
            GeoreferenceError::Shutdown
            | GeoreferenceError::Serialization(_)
            | GeoreferenceError::Other(_) => ErrorKind::Internal,
            #[cfg(feature = "postgres")]
            GeoreferenceError::Database(_) => ErrorKind::Internal,
        }
    }

    /// Render this error for a client. Internal errors are reduced to a
    /// generic message so raw error text never leaves the process.
    pub fn to_body(&self) -> ErrorBody {
        let kind = self.kind();
        let context = match self {
            GeoreferenceError::Validation(ValidationError::InsufficientPoints {
                family,
                required,
                provided,
            }) => Some(serde_json::json!({
                "reason": "insufficient_points",
                "family": family.to_string(),
                "required": required,
                "provided": provided,
            })),
            GeoreferenceError::Validation(ValidationError::DegenerateGeometry {
                condition_number,
                ..
            }) => Some(serde_json::json!({
                "reason": "degenerate_geometry",
                "condition_number": condition_number,
            })),
            GeoreferenceError::Validation(ValidationError::OutOfRangeCoordinate {
                index, ..
            }) => Some(serde_json::json!({
                "reason": "out_of_range_coordinate",
                "index": index,
            })),
            GeoreferenceError::QuotaExceeded {
                requested,
                remaining,
            } => Some(serde_json::json!({
                "requested": requested,
                "remaining": remaining,
            })),
            GeoreferenceError::JobAlreadyActive { job_id, .. } => Some(serde_json::json!({
                "job_id": job_id.0,
            })),
            _ => None,
        };
        let message = match kind {
            ErrorKind::Internal => "Internal error".to_string(),
            _ => self.to_string(),
        };
        ErrorBody {
            kind,
            message,
            context,
        }
    }
}
