//! Axis-aligned geographic bounding boxes.
//!
//! Boxes never wrap the antimeridian: `west <= east` always holds, and a
//! footprint that leaves the valid coordinate range is clamped to it.

use serde::{Deserialize, Serialize};

use crate::domain::control_point::{ControlPoint, GeoPoint};
use crate::geometry::transform::FittedTransform;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl GeoBounds {
    /// Min/max envelope of `points`, or `None` when there are none or any is
    /// not finite.
    pub fn from_points(points: &[GeoPoint]) -> Option<Self> {
        let first = points.first()?;
        let mut bounds = Self {
            north: first.latitude,
            south: first.latitude,
            east: first.longitude,
            west: first.longitude,
        };
        for point in points {
            if !point.is_finite() {
                return None;
            }
            bounds.extend(*point);
        }
        Some(bounds)
    }

    pub fn from_control_points(points: &[ControlPoint]) -> Option<Self> {
        let geo: Vec<GeoPoint> = points.iter().map(ControlPoint::geo).collect();
        Self::from_points(&geo)
    }

    /// Envelope of the four raster corners pushed through `transform`.
    ///
    /// Returns `None` if a corner maps to a non-finite coordinate, or if a
    /// projective transform's line at infinity crosses the raster. Corners
    /// on both sides of that line map to opposite ends of the plane, so
    /// their envelope says nothing about the footprint.
    pub fn raster_footprint(transform: &FittedTransform, width: u32, height: u32) -> Option<Self> {
        let (w, h) = (width as f64, height as f64);
        let pixels = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)];
        if let FittedTransform::Projective(p) = transform {
            let positive = pixels.map(|(x, y)| p.denominator(x, y) > 0.0);
            if positive.iter().any(|&side| side != positive[0]) {
                tracing::warn!(width, height, "Projective horizon crosses the raster, no footprint");
                return None;
            }
        }
        let corners = pixels.map(|(x, y)| transform.apply(x, y));
        let bounds = Self::from_points(&corners)?;
        let clamped = bounds.clamped();
        if clamped != bounds {
            tracing::warn!(
                north = bounds.north,
                south = bounds.south,
                east = bounds.east,
                west = bounds.west,
                "Raster footprint leaves the valid coordinate range, clamping"
            );
        }
        Some(clamped)
    }

    pub fn extend(&mut self, point: GeoPoint) {
        self.north = self.north.max(point.latitude);
        self.south = self.south.min(point.latitude);
        self.east = self.east.max(point.longitude);
        self.west = self.west.min(point.longitude);
    }

    pub fn union(&self, other: &GeoBounds) -> GeoBounds {
        GeoBounds {
            north: self.north.max(other.north),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            west: self.west.min(other.west),
        }
    }

    /// Clamp to [-180, 180] x [-90, 90].
    pub fn clamped(&self) -> GeoBounds {
        GeoBounds {
            north: self.north.clamp(-90.0, 90.0),
            south: self.south.clamp(-90.0, 90.0),
            east: self.east.clamp(-180.0, 180.0),
            west: self.west.clamp(-180.0, 180.0),
        }
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        (self.south..=self.north).contains(&point.latitude)
            && (self.west..=self.east).contains(&point.longitude)
    }

    pub fn width_degrees(&self) -> f64 {
        self.east - self.west
    }

    pub fn height_degrees(&self) -> f64 {
        self.north - self.south
    }
}

/// Bounds recorded as a document's active bounds: the control point
/// envelope, widened by the raster footprint when the raster size is known.
pub fn document_bounds(
    transform: &FittedTransform,
    points: &[ControlPoint],
    raster_size: Option<(u32, u32)>,
) -> Option<GeoBounds> {
    let from_points = GeoBounds::from_control_points(points);
    let footprint =
        raster_size.and_then(|(w, h)| GeoBounds::raster_footprint(transform, w, h));
    match (from_points, footprint) {
        (Some(a), Some(b)) => Some(a.union(&b)),
        (a, b) => a.or(b),
    }
}
