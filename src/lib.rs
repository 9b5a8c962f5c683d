//! Control-point georeferencing and map tile generation.
//!
//! This crate fits a geometric transform (affine, projective, polynomial or
//! thin-plate spline) from a scanned document's pixel space to WGS84, keeps
//! an append-only history of every fit, and renders Web-Mercator XYZ tiles
//! for georeferenced documents through a prioritized background job queue.
//!
//! [`GeoreferenceService`] is the request-path entry point; [`TileDaemon`]
//! processes queued tile jobs in the background.

pub mod access;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod geometry;
pub mod manager;
pub mod quota;
pub mod render;
pub mod service;
pub mod tile_store;
pub mod tiles;

// Re-export commonly used types
pub use access::{AccessControl, Permission, StaticAccessControl};
pub use daemon::{DaemonConfig, DaemonStats, TileDaemon};
pub use domain::control_point::{ControlPoint, GeoPoint, PointSource, TransformFamily};
pub use domain::document::{
    ActiveFit, Document, DocumentId, DocumentInput, FitId, FitRecord, OrganizationId, UserId,
};
pub use domain::job::{AnyTileJob, FailureReason, JobState, JobStatus, RetryConfig, TileJobId};
pub use error::{ErrorBody, ErrorKind, GeoreferenceError, NumericError, Result, ValidationError};
pub use geometry::{
    AccuracyReport, FitConfig, FitOutcome, FittedTransform, GeoBounds, fit_control_points,
};
pub use manager::Storage;
pub use manager::memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use manager::postgres::PostgresStorage;
pub use quota::{FixedQuota, QuotaDecision, QuotaGate, UnlimitedQuota};
pub use render::{MockTileRenderer, RenderError, RenderRequest, TileImage, TileRenderer};
pub use service::{GenerateTilesResponse, GeoreferenceResponse, GeoreferenceService};
pub use tile_store::{HttpTileStore, InMemoryTileStore, StoreError, TileStore};
pub use tiles::{MAX_ZOOM, TileCoord};

/// Get the georeferencer database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
