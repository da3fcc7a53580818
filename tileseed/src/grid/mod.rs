//! Tile grid geometry.
//!
//! Provides the immutable mapping between zoom levels, resolutions and tile
//! coordinates for one spatial reference system ([`TileGrid`]), and the
//! meta-tile grouping layered on top of it ([`MetaGrid`]).
//!
//! # Coordinate conventions
//!
//! ```text
//! Origin::UpperLeft              Origin::LowerLeft
//! ┌──────┬──────┐ max_y          ┌──────┬──────┐ max_y
//! │ 0,0  │ 1,0  │                │ 0,1  │ 1,1  │
//! ├──────┼──────┤                ├──────┼──────┤
//! │ 0,1  │ 1,1  │                │ 0,0  │ 1,0  │
//! └──────┴──────┘ min_y          └──────┴──────┘ min_y
//! ```
//!
//! Iteration is always row-major starting with the top row of the map, so
//! traversal order does not depend on the grid origin.

mod meta;
mod tile_grid;

pub use meta::{AffectedTiles, LevelTiles, MetaGrid};
pub use tile_grid::{Origin, TileGrid, GEODETIC_SRS, WEB_MERCATOR_EXTENT, WEB_MERCATOR_SRS};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while constructing or querying a grid.
#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    /// The resolution list was empty.
    #[error("grid needs at least one resolution")]
    NoResolutions,

    /// Resolutions must be positive and strictly decreasing.
    #[error("resolutions must be strictly decreasing and positive (level {level}: {resolution})")]
    InvalidResolution { level: usize, resolution: f64 },

    /// Tile width or height of zero.
    #[error("invalid tile size {width}x{height}")]
    InvalidTileSize { width: u32, height: u32 },

    /// Bounding box with min > max on an axis.
    #[error("invalid bbox: {0}")]
    InvalidBBox(String),

    /// Meta size of zero on an axis.
    #[error("invalid meta size {0}x{1}")]
    InvalidMetaSize(u32, u32),

    /// Level outside the resolution table.
    #[error("level {level} outside grid (max {max})")]
    LevelOutOfRange { level: u8, max: u8 },

    /// Coordinate outside the tile range of its level.
    #[error("tile {0} outside grid")]
    TileOutOfRange(TileCoord),
}

/// A tile address in the pyramid.
///
/// `x` grows to the east, `y` grows away from the grid origin, `z` is the
/// zoom level. Valid coordinates satisfy `x < cols(z)` and `y < rows(z)`,
/// which for the quadtree presets is `2^z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoord {
    pub const fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Axis-aligned rectangle in map units.
///
/// The SRS is carried by whoever owns the box (grid or coverage); the box
/// itself is plain geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BBox {
    /// Creates a bbox, rejecting inverted or non-finite corners.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self, GridError> {
        let finite = [min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite());
        if !finite || min_x > max_x || min_y > max_y {
            return Err(GridError::InvalidBBox(format!(
                "({}, {}, {}, {})",
                min_x, min_y, max_x, max_y
            )));
        }
        Ok(Self {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// True if the interiors overlap. Boxes that only share an edge do not.
    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }

    /// True if `other` lies completely inside `self` (edges inclusive).
    pub fn contains(&self, other: &BBox) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    /// Overlapping part of two boxes, `None` if the interiors are disjoint.
    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        if !self.intersects(other) {
            return None;
        }
        Some(BBox {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        })
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Grows the box by `dx` horizontally and `dy` vertically on each side.
    pub fn buffered(&self, dx: f64, dy: f64) -> BBox {
        BBox {
            min_x: self.min_x - dx,
            min_y: self.min_y - dy,
            max_x: self.max_x + dx,
            max_y: self.max_y + dy,
        }
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.5},{:.5},{:.5},{:.5}",
            self.min_x, self.min_y, self.max_x, self.max_y
        )
    }
}
