//! Web Mercator XYZ tile addressing.
//!
//! Tiles are numbered the "slippy map" way: `x` grows eastward from the
//! antimeridian, `y` grows southward from the northern Mercator limit, and
//! zoom `z` has `2^z × 2^z` tiles.

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::geometry::GeoBounds;

/// Deepest zoom level tiles may be requested for.
pub const MAX_ZOOM: u8 = 22;

/// Latitude at which Web Mercator's square world ends.
pub const MAX_MERCATOR_LATITUDE: f64 = 85.05112878;

/// Address of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Geographic extent covered by this tile.
    pub fn bounds(&self) -> GeoBounds {
        let n = tiles_per_axis(self.z) as f64;
        let lon = |x: f64| x / n * 360.0 - 180.0;
        let lat = |y: f64| (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
        GeoBounds {
            north: lat(self.y as f64),
            south: lat(self.y as f64 + 1.0),
            west: lon(self.x as f64),
            east: lon(self.x as f64 + 1.0),
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

fn tiles_per_axis(z: u8) -> u32 {
    1u32 << z
}

/// Tile column containing `longitude` at zoom `z`.
pub fn longitude_to_tile_x(longitude: f64, z: u8) -> u32 {
    let n = tiles_per_axis(z);
    let x = ((longitude.clamp(-180.0, 180.0) + 180.0) / 360.0 * n as f64).floor();
    (x.max(0.0) as u32).min(n - 1)
}

/// Tile row containing `latitude` at zoom `z`, clamping to the Mercator limit.
pub fn latitude_to_tile_y(latitude: f64, z: u8) -> u32 {
    let n = tiles_per_axis(z);
    let lat = latitude
        .clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE)
        .to_radians();
    let y = ((1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n as f64).floor();
    (y.max(0.0) as u32).min(n - 1)
}

/// Inclusive rectangle of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRange {
    pub z: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    pub fn count(&self) -> u64 {
        (self.max_x - self.min_x + 1) as u64 * (self.max_y - self.min_y + 1) as u64
    }

    /// Tiles in row-major order (north to south, west to east).
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (self.min_y..=self.max_y)
            .flat_map(move |y| (self.min_x..=self.max_x).map(move |x| TileCoord::new(self.z, x, y)))
    }
}

/// Tiles at zoom `z` intersecting `bounds`.
pub fn tiles_for_bounds(bounds: &GeoBounds, z: u8) -> TileRange {
    TileRange {
        z,
        min_x: longitude_to_tile_x(bounds.west, z),
        max_x: longitude_to_tile_x(bounds.east, z),
        min_y: latitude_to_tile_y(bounds.north, z),
        max_y: latitude_to_tile_y(bounds.south, z),
    }
}

/// Exact number of tiles covering `bounds` across `zoom_levels`.
pub fn estimate_tile_count(bounds: &GeoBounds, zoom_levels: &[u8]) -> u64 {
    zoom_levels
        .iter()
        .map(|&z| tiles_for_bounds(bounds, z).count())
        .fold(0u64, u64::saturating_add)
}

/// Upper bound on tiles for `zoom_levels`: the whole world at each level.
pub fn max_tile_count(zoom_levels: &[u8]) -> u64 {
    zoom_levels
        .iter()
        .map(|&z| 4u64.saturating_pow(z as u32))
        .fold(0u64, u64::saturating_add)
}

/// Deduplicate and sort zoom levels, rejecting empty or too-deep requests.
pub fn normalize_zoom_levels(zoom_levels: &[u8]) -> Result<Vec<u8>, ValidationError> {
    if zoom_levels.is_empty() {
        return Err(ValidationError::InvalidZoomLevels(
            "at least one zoom level is required".to_string(),
        ));
    }
    if let Some(&z) = zoom_levels.iter().find(|&&z| z > MAX_ZOOM) {
        return Err(ValidationError::InvalidZoomLevels(format!(
            "zoom level {z} exceeds maximum {MAX_ZOOM}"
        )));
    }
    let mut levels = zoom_levels.to_vec();
    levels.sort_unstable();
    levels.dedup();
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_bounds() -> GeoBounds {
        GeoBounds {
            north: 37.001,
            south: 37.0,
            east: -121.999,
            west: -122.0,
        }
    }

    #[test]
    fn test_world_at_zoom_zero_is_one_tile() {
        let world = GeoBounds {
            north: 90.0,
            south: -90.0,
            east: 180.0,
            west: -180.0,
        };
        let range = tiles_for_bounds(&world, 0);
        assert_eq!(range.count(), 1);
        assert_eq!(tiles_for_bounds(&world, 3).count(), 64);
    }

    #[test]
    fn test_known_tile_address() {
        // San Francisco at z=10.
        assert_eq!(longitude_to_tile_x(-122.4194, 10), 163);
        assert_eq!(latitude_to_tile_y(37.7749, 10), 395);
    }

    #[test]
    fn test_tile_bounds_contain_their_own_origin() {
        let tile = TileCoord::new(10, 163, 395);
        let b = tile.bounds();
        assert!(b.north > b.south && b.east > b.west);
        assert_eq!(longitude_to_tile_x((b.west + b.east) / 2.0, 10), 163);
        assert_eq!(latitude_to_tile_y((b.north + b.south) / 2.0, 10), 395);
    }

    #[test]
    fn test_estimate_is_exact_and_below_upper_bound() {
        let bounds = scenario_bounds();
        let zooms = [0, 5, 10, 15];
        let exact = estimate_tile_count(&bounds, &zooms);
        let manual: u64 = zooms.iter().map(|&z| tiles_for_bounds(&bounds, z).iter().count() as u64).sum();
        assert_eq!(exact, manual);
        assert!(exact <= max_tile_count(&zooms));
        assert_eq!(max_tile_count(&[0, 1, 2]), 1 + 4 + 16);
    }

    #[test]
    fn test_iteration_is_row_major() {
        let range = TileRange {
            z: 4,
            min_x: 2,
            max_x: 3,
            min_y: 5,
            max_y: 6,
        };
        let tiles: Vec<_> = range.iter().collect();
        assert_eq!(
            tiles,
            vec![
                TileCoord::new(4, 2, 5),
                TileCoord::new(4, 3, 5),
                TileCoord::new(4, 2, 6),
                TileCoord::new(4, 3, 6),
            ]
        );
    }

    #[test]
    fn test_zoom_normalization() {
        assert_eq!(normalize_zoom_levels(&[5, 3, 5, 0]).unwrap(), vec![0, 3, 5]);
        assert!(matches!(
            normalize_zoom_levels(&[]),
            Err(ValidationError::InvalidZoomLevels(_))
        ));
        assert!(matches!(
            normalize_zoom_levels(&[3, 23]),
            Err(ValidationError::InvalidZoomLevels(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(TileCoord::new(3, 1, 2).to_string(), "3/1/2");
    }
}
