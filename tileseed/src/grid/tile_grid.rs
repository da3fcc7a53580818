//! Resolution table and coordinate math for one SRS.

use super::{BBox, GridError, TileCoord};

/// SRS identifier of the spherical mercator preset.
pub const WEB_MERCATOR_SRS: &str = "EPSG:3857";

/// SRS identifier of the geodetic preset.
pub const GEODETIC_SRS: &str = "EPSG:4326";

/// Half the equatorial circumference used by spherical mercator.
pub const WEB_MERCATOR_EXTENT: f64 = 20037508.342789244;

/// Relative tolerance when deriving tile counts from floating point spans.
const GRID_SIZE_EPSILON: f64 = 1e-6;

/// Corner of the grid bbox where tile `(0, 0)` sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    /// Tile rows count downwards from the top edge (XYZ / WMTS style).
    #[default]
    UpperLeft,
    /// Tile rows count upwards from the bottom edge (TMS style).
    LowerLeft,
}

impl std::str::FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ul" | "nw" | "upper-left" | "upper_left" => Ok(Self::UpperLeft),
            "ll" | "sw" | "lower-left" | "lower_left" => Ok(Self::LowerLeft),
            other => Err(format!("unknown origin '{}'", other)),
        }
    }
}

/// Immutable mapping between level, resolution and tile coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct TileGrid {
    srs: String,
    bbox: BBox,
    resolutions: Vec<f64>,
    tile_size: (u32, u32),
    origin: Origin,
    grid_sizes: Vec<(u32, u32)>,
}

impl TileGrid {
    /// Creates a grid from an explicit resolution table.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] if the table is empty or not strictly decreasing,
    /// if a tile dimension is zero, or if the bbox is degenerate.
    pub fn new(
        srs: impl Into<String>,
        bbox: BBox,
        resolutions: Vec<f64>,
        tile_size: (u32, u32),
        origin: Origin,
    ) -> Result<Self, GridError> {
        if resolutions.is_empty() {
            return Err(GridError::NoResolutions);
        }
        if resolutions.len() > u8::MAX as usize + 1 {
            return Err(GridError::LevelOutOfRange {
                level: u8::MAX,
                max: u8::MAX,
            });
        }
        for (level, res) in resolutions.iter().enumerate() {
            let decreasing = level == 0 || *res < resolutions[level - 1];
            if !(res.is_finite() && *res > 0.0 && decreasing) {
                return Err(GridError::InvalidResolution {
                    level,
                    resolution: *res,
                });
            }
        }
        if tile_size.0 == 0 || tile_size.1 == 0 {
            return Err(GridError::InvalidTileSize {
                width: tile_size.0,
                height: tile_size.1,
            });
        }
        if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
            return Err(GridError::InvalidBBox(bbox.to_string()));
        }

        let grid_sizes = resolutions
            .iter()
            .map(|res| {
                (
                    tile_count(bbox.width(), res * tile_size.0 as f64),
                    tile_count(bbox.height(), res * tile_size.1 as f64),
                )
            })
            .collect();

        Ok(Self {
            srs: srs.into(),
            bbox,
            resolutions,
            tile_size,
            origin,
            grid_sizes,
        })
    }

    /// Spherical mercator quadtree with a single 256px tile at level 0.
    pub fn web_mercator(levels: u8) -> Result<Self, GridError> {
        let bbox = BBox::new(
            -WEB_MERCATOR_EXTENT,
            -WEB_MERCATOR_EXTENT,
            WEB_MERCATOR_EXTENT,
            WEB_MERCATOR_EXTENT,
        )?;
        let res0 = 2.0 * WEB_MERCATOR_EXTENT / 256.0;
        Self::new(
            WEB_MERCATOR_SRS,
            bbox,
            halving_resolutions(res0, levels),
            (256, 256),
            Origin::UpperLeft,
        )
    }

    /// Geodetic grid with two 256px tiles at level 0.
    pub fn geodetic(levels: u8) -> Result<Self, GridError> {
        let bbox = BBox::new(-180.0, -90.0, 180.0, 90.0)?;
        Self::new(
            GEODETIC_SRS,
            bbox,
            halving_resolutions(180.0 / 256.0, levels),
            (256, 256),
            Origin::LowerLeft,
        )
    }

    pub fn srs(&self) -> &str {
        &self.srs
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn tile_size(&self) -> (u32, u32) {
        self.tile_size
    }

    /// Number of levels in the resolution table.
    pub fn levels(&self) -> usize {
        self.resolutions.len()
    }

    /// Highest valid level.
    pub fn max_level(&self) -> u8 {
        (self.resolutions.len() - 1) as u8
    }

    pub fn resolution(&self, level: u8) -> Result<f64, GridError> {
        self.resolutions
            .get(level as usize)
            .copied()
            .ok_or(GridError::LevelOutOfRange {
                level,
                max: self.max_level(),
            })
    }

    /// Tile columns and rows at `level`.
    pub fn grid_size(&self, level: u8) -> Result<(u32, u32), GridError> {
        self.grid_sizes
            .get(level as usize)
            .copied()
            .ok_or(GridError::LevelOutOfRange {
                level,
                max: self.max_level(),
            })
    }

    /// True if the coordinate addresses an existing tile.
    pub fn is_valid(&self, coord: &TileCoord) -> bool {
        match self.grid_sizes.get(coord.z as usize) {
            Some((cols, rows)) => coord.x < *cols && coord.y < *rows,
            None => false,
        }
    }

    /// Unclipped column/row of the tile containing a map point.
    ///
    /// May be negative or beyond the grid size for points outside the grid.
    pub(crate) fn tile_index(&self, px: f64, py: f64, level: u8) -> Result<(i64, i64), GridError> {
        let res = self.resolution(level)?;
        let span_x = res * self.tile_size.0 as f64;
        let span_y = res * self.tile_size.1 as f64;
        let x = ((px - self.bbox.min_x) / span_x).floor() as i64;
        let y = match self.origin {
            Origin::UpperLeft => ((self.bbox.max_y - py) / span_y).floor() as i64,
            Origin::LowerLeft => ((py - self.bbox.min_y) / span_y).floor() as i64,
        };
        Ok((x, y))
    }

    /// Tile containing a map point, `None` if the point is outside the grid.
    pub fn tile(&self, px: f64, py: f64, level: u8) -> Result<Option<TileCoord>, GridError> {
        let (x, y) = self.tile_index(px, py, level)?;
        let (cols, rows) = self.grid_size(level)?;
        if x < 0 || y < 0 || x >= cols as i64 || y >= rows as i64 {
            return Ok(None);
        }
        Ok(Some(TileCoord::new(x as u32, y as u32, level)))
    }

    /// Map extent of one tile.
    pub fn tile_bbox(&self, coord: &TileCoord) -> Result<BBox, GridError> {
        let res = self.resolution(coord.z)?;
        let span_x = res * self.tile_size.0 as f64;
        let span_y = res * self.tile_size.1 as f64;
        let min_x = self.bbox.min_x + coord.x as f64 * span_x;
        let (min_y, max_y) = match self.origin {
            Origin::UpperLeft => {
                let max_y = self.bbox.max_y - coord.y as f64 * span_y;
                (max_y - span_y, max_y)
            }
            Origin::LowerLeft => {
                let min_y = self.bbox.min_y + coord.y as f64 * span_y;
                (min_y, min_y + span_y)
            }
        };
        Ok(BBox {
            min_x,
            min_y,
            max_x: min_x + span_x,
            max_y,
        })
    }

    /// Clips a bbox to the grid extent.
    pub fn limit_bbox(&self, bbox: &BBox) -> Option<BBox> {
        self.bbox.intersection(bbox)
    }
}

fn halving_resolutions(res0: f64, levels: u8) -> Vec<f64> {
    let levels = levels.max(1);
    (0..levels).map(|i| res0 / 2f64.powi(i as i32)).collect()
}

/// Number of tiles of `span` needed to cover `length`, tolerant of rounding.
fn tile_count(length: f64, span: f64) -> u32 {
    let n = length / span;
    let rounded = n.round();
    let count = if (n - rounded).abs() < GRID_SIZE_EPSILON * n.max(1.0) {
        rounded
    } else {
        n.ceil()
    };
    count.max(1.0) as u32
}
