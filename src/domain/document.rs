//! Documents and the fit history ledger.
//!
//! A document is one scanned raster page. It starts ungeoreferenced, gains an
//! active fit on its first successful georeference, and may be re-fitted any
//! number of times. Every fit is also recorded in an append-only ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::control_point::{ControlPoint, TransformFamily};
use super::uuid_id;
use crate::geometry::{AccuracyReport, FitOutcome, FittedTransform, GeoBounds};

uuid_id!(
    /// Unique identifier for a document.
    DocumentId
);
uuid_id!(
    /// Organization that owns documents and is charged for tiles.
    OrganizationId
);
uuid_id!(
    /// An authenticated user.
    UserId
);
uuid_id!(
    /// Identifier of a ledger entry (one fit attempt).
    FitId
);

/// Input parameters for registering an uploaded document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentInput {
    pub name: String,
    /// Raster size in pixels, if known. Widens the active bounds to the
    /// whole page footprint.
    pub width_px: Option<u32>,
    pub height_px: Option<u32>,
}

/// The transform a document currently resolves pixels with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveFit {
    pub fit_id: FitId,
    pub transform: FittedTransform,
    pub accuracy: AccuracyReport,
    pub bounds: GeoBounds,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub width_px: Option<u32>,
    pub height_px: Option<u32>,
    /// Control points of the active fit.
    pub control_points: Vec<ControlPoint>,
    pub active: Option<ActiveFit>,
    /// Bumped on every change to the active fit.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub created_by: UserId,
}

impl Document {
    pub fn new(organization_id: OrganizationId, created_by: UserId, input: DocumentInput) -> Self {
        Self {
            id: DocumentId::new(),
            organization_id,
            name: input.name,
            width_px: input.width_px,
            height_px: input.height_px,
            control_points: Vec::new(),
            active: None,
            version: 0,
            created_at: Utc::now(),
            created_by,
        }
    }

    pub fn is_georeferenced(&self) -> bool {
        self.active.is_some()
    }

    pub fn raster_size(&self) -> Option<(u32, u32)> {
        Some((self.width_px?, self.height_px?))
    }

    /// Replace the active fit and bump the version.
    pub fn activate(&mut self, fit_id: FitId, points: Vec<ControlPoint>, outcome: FitOutcome) {
        self.control_points = points;
        self.active = Some(ActiveFit {
            fit_id,
            transform: outcome.transform,
            accuracy: outcome.accuracy,
            bounds: outcome.bounds,
            activated_at: Utc::now(),
        });
        self.version += 1;
    }
}

/// One ledger entry. Written once per successful fit and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    pub id: FitId,
    pub document_id: DocumentId,
    pub family: TransformFamily,
    pub point_count: usize,
    pub rmse_meters: f64,
    pub fitted_at: DateTime<Utc>,
    pub fitted_by: UserId,
    pub transform: FittedTransform,
    pub control_points: Vec<ControlPoint>,
    /// False when the fit lost a concurrent update and never became active.
    pub activated: bool,
}

impl FitRecord {
    pub fn new(
        document_id: DocumentId,
        fitted_by: UserId,
        points: Vec<ControlPoint>,
        outcome: &FitOutcome,
    ) -> Self {
        Self {
            id: FitId::new(),
            document_id,
            family: outcome.transform.family(),
            point_count: points.len(),
            rmse_meters: outcome.accuracy.rmse_meters,
            fitted_at: Utc::now(),
            fitted_by,
            transform: outcome.transform.clone(),
            control_points: points,
            activated: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{FitConfig, fit_control_points};
    use crate::geometry::solver::tests::scenario_points;

    #[test]
    fn test_activate_bumps_version() {
        let mut doc = Document::new(
            OrganizationId::new(),
            UserId::new(),
            DocumentInput {
                name: "survey.png".into(),
                width_px: Some(100),
                height_px: None,
            },
        );
        assert!(!doc.is_georeferenced());
        assert_eq!(doc.raster_size(), None);

        let outcome = fit_control_points(
            &scenario_points(),
            TransformFamily::Affine,
            doc.raster_size(),
            &FitConfig::default(),
        )
        .unwrap();
        let record = FitRecord::new(doc.id, doc.created_by, scenario_points(), &outcome);
        doc.activate(record.id, scenario_points(), outcome);

        assert!(doc.is_georeferenced());
        assert_eq!(doc.version, 1);
        assert_eq!(doc.active.as_ref().unwrap().fit_id, record.id);
        assert_eq!(record.point_count, 3);
        assert!(record.activated);
    }

    #[test]
    fn test_id_display_is_short() {
        let id = DocumentId::new();
        assert_eq!(id.to_string().len(), 8);
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json.as_str().unwrap().len(), 36);
    }
}
