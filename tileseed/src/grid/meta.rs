//! Meta-tile grouping on top of a [`TileGrid`].
//!
//! A meta-tile is a rectangular block of `mx × my` base tiles that is fetched
//! or processed as one batch. Meta-tiles are addressed by their main tile, the
//! base tile with the smallest `x` and `y` in the block.
//!
//! ```text
//! meta size 2×2, level 2 (4×4 tiles)
//! ┌────┬────┬────┬────┐
//! │0,0 │    │2,0 │    │   main tiles: (0,0) (2,0) (0,2) (2,2)
//! ├────┼────┼────┼────┤
//! │    │    │    │    │
//! ├────┼────┼────┼────┤
//! │0,2 │    │2,2 │    │
//! ├────┼────┼────┼────┤
//! │    │    │    │    │
//! └────┴────┴────┴────┘
//! ```
//!
//! Blocks at the right and bottom edges of a level are clipped to the tiles
//! that exist, so a meta size larger than a level's tile count simply yields
//! the whole level.

use super::{BBox, GridError, Origin, TileCoord, TileGrid};

/// Meta-tile view of a tile grid.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaGrid {
    grid: TileGrid,
    meta_size: (u32, u32),
    buffer: u32,
}

/// Result of [`MetaGrid::get_affected_level_tiles`].
#[derive(Debug, Clone)]
pub struct AffectedTiles {
    /// Extent of all affected tiles (unbuffered), `None` if nothing is affected.
    pub bbox: Option<BBox>,
    /// Number of meta-tile columns and rows that are affected.
    pub grid_size: (u32, u32),
    /// Main tiles of the affected meta-tiles in row-major order.
    pub tiles: LevelTiles,
}

impl AffectedTiles {
    /// Total number of affected meta-tiles.
    pub fn total(&self) -> u32 {
        self.grid_size.0 * self.grid_size.1
    }

    fn empty(level: u8) -> Self {
        Self {
            bbox: None,
            grid_size: (0, 0),
            tiles: LevelTiles {
                level,
                x0: 0,
                step_x: 1,
                cols: 0,
                rows: Vec::new(),
                pos: 0,
            },
        }
    }
}

/// Row-major iterator over meta-tile main coordinates of one level.
#[derive(Debug, Clone)]
pub struct LevelTiles {
    level: u8,
    x0: u32,
    step_x: u32,
    cols: u32,
    rows: Vec<u32>,
    pos: usize,
}

impl LevelTiles {
    fn total(&self) -> usize {
        self.cols as usize * self.rows.len()
    }
}

impl Iterator for LevelTiles {
    type Item = TileCoord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.total() {
            return None;
        }
        let row = self.pos / self.cols as usize;
        let col = (self.pos % self.cols as usize) as u32;
        self.pos += 1;
        Some(TileCoord::new(
            self.x0 + col * self.step_x,
            self.rows[row],
            self.level,
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total() - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for LevelTiles {}

impl MetaGrid {
    /// Wraps `grid` with the given meta size and pixel buffer.
    pub fn new(grid: TileGrid, meta_size: (u32, u32), buffer: u32) -> Result<Self, GridError> {
        if meta_size.0 == 0 || meta_size.1 == 0 {
            return Err(GridError::InvalidMetaSize(meta_size.0, meta_size.1));
        }
        Ok(Self {
            grid,
            meta_size,
            buffer,
        })
    }

    /// Meta grid where every meta-tile is a single base tile.
    pub fn single(grid: TileGrid) -> Self {
        Self {
            grid,
            meta_size: (1, 1),
            buffer: 0,
        }
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn meta_size(&self) -> (u32, u32) {
        self.meta_size
    }

    pub fn buffer(&self) -> u32 {
        self.buffer
    }

    /// Meta size at `level`, clamped to the number of tiles that exist.
    pub fn meta_size_for_level(&self, level: u8) -> Result<(u32, u32), GridError> {
        let (cols, rows) = self.grid.grid_size(level)?;
        Ok((self.meta_size.0.min(cols), self.meta_size.1.min(rows)))
    }

    /// Main tile of the meta-tile containing `coord`.
    pub fn main_tile(&self, coord: &TileCoord) -> Result<TileCoord, GridError> {
        if !self.grid.is_valid(coord) {
            return Err(GridError::TileOutOfRange(*coord));
        }
        let (mx, my) = self.meta_size_for_level(coord.z)?;
        Ok(TileCoord::new(
            coord.x / mx * mx,
            coord.y / my * my,
            coord.z,
        ))
    }

    /// Meta-tiles at `level` intersecting `bbox`.
    ///
    /// The query box is shrunk by a tenth of a pixel so tiles that only touch
    /// the box are not included, then clipped to the grid. An empty result is
    /// not an error.
    pub fn get_affected_level_tiles(
        &self,
        bbox: &BBox,
        level: u8,
    ) -> Result<AffectedTiles, GridError> {
        let res = self.grid.resolution(level)?;
        let (cols, rows) = self.grid.grid_size(level)?;
        let Some(limited) = self.grid.limit_bbox(bbox) else {
            return Ok(AffectedTiles::empty(level));
        };

        let delta = res / 10.0;
        let (qx0, qx1) = shrink(limited.min_x, limited.max_x, delta);
        let (qy0, qy1) = shrink(limited.min_y, limited.max_y, delta);
        let (xa, ya) = self.grid.tile_index(qx0, qy0, level)?;
        let (xb, yb) = self.grid.tile_index(qx1, qy1, level)?;

        let x0 = xa.min(xb).clamp(0, cols as i64 - 1) as u32;
        let x1 = xa.max(xb).clamp(0, cols as i64 - 1) as u32;
        let y0 = ya.min(yb).clamp(0, rows as i64 - 1) as u32;
        let y1 = ya.max(yb).clamp(0, rows as i64 - 1) as u32;

        let (mx, my) = self.meta_size_for_level(level)?;
        let (x0, x1) = (x0 / mx * mx, x1 / mx * mx);
        let (y0, y1) = (y0 / my * my, y1 / my * my);
        let meta_cols = (x1 - x0) / mx + 1;
        let meta_rows = (y1 - y0) / my + 1;

        let mut row_starts: Vec<u32> = (0..meta_rows).map(|r| y0 + r * my).collect();
        if self.grid.origin() == Origin::LowerLeft {
            row_starts.reverse();
        }

        let last_x = (x1 + mx).min(cols) - 1;
        let last_y = (y1 + my).min(rows) - 1;
        let first = self.grid.tile_bbox(&TileCoord::new(x0, y0, level))?;
        let last = self.grid.tile_bbox(&TileCoord::new(last_x, last_y, level))?;

        Ok(AffectedTiles {
            bbox: Some(first.union(&last)),
            grid_size: (meta_cols, meta_rows),
            tiles: LevelTiles {
                level,
                x0,
                step_x: mx,
                cols: meta_cols,
                rows: row_starts,
                pos: 0,
            },
        })
    }

    /// Base tiles of the meta-tile starting at `meta_coord`, row-major.
    ///
    /// The block is clipped at the grid edge: it holds
    /// `min(mx, cols - x0) × min(my, rows - y0)` tiles. A coordinate outside
    /// the grid yields an empty list.
    pub fn tile_list(&self, meta_coord: &TileCoord) -> Result<Vec<TileCoord>, GridError> {
        let (w, h) = self.block_size(meta_coord)?;
        let mut ys: Vec<u32> = (meta_coord.y..meta_coord.y + h).collect();
        if self.grid.origin() == Origin::LowerLeft {
            ys.reverse();
        }
        let mut tiles = Vec::with_capacity((w * h) as usize);
        for y in ys {
            for x in meta_coord.x..meta_coord.x + w {
                tiles.push(TileCoord::new(x, y, meta_coord.z));
            }
        }
        Ok(tiles)
    }

    /// Extent of a meta-tile grown by the pixel buffer.
    ///
    /// With `limit` the result is clipped to the grid extent.
    pub fn meta_bbox(&self, meta_coord: &TileCoord, limit: bool) -> Result<BBox, GridError> {
        let (w, h) = self.block_size(meta_coord)?;
        if w == 0 || h == 0 {
            return Err(GridError::TileOutOfRange(*meta_coord));
        }
        let first = self.grid.tile_bbox(meta_coord)?;
        let last = self.grid.tile_bbox(&TileCoord::new(
            meta_coord.x + w - 1,
            meta_coord.y + h - 1,
            meta_coord.z,
        ))?;
        let bbox = first.union(&last);
        if self.buffer == 0 {
            return Ok(bbox);
        }

        let pad = self.buffer as f64 * self.grid.resolution(meta_coord.z)?;
        let buffered = bbox.buffered(pad, pad);
        if limit {
            Ok(self.grid.limit_bbox(&buffered).unwrap_or(bbox))
        } else {
            Ok(buffered)
        }
    }

    fn block_size(&self, meta_coord: &TileCoord) -> Result<(u32, u32), GridError> {
        let (mx, my) = self.meta_size_for_level(meta_coord.z)?;
        let (cols, rows) = self.grid.grid_size(meta_coord.z)?;
        Ok((
            mx.min(cols.saturating_sub(meta_coord.x)),
            my.min(rows.saturating_sub(meta_coord.y)),
        ))
    }
}

/// Moves both ends inwards by `delta`, collapsing to the center if the
/// interval is narrower than `2 * delta`.
fn shrink(lo: f64, hi: f64, delta: f64) -> (f64, f64) {
    if hi - lo > 2.0 * delta {
        (lo + delta, hi - delta)
    } else {
        let mid = (lo + hi) / 2.0;
        (mid, mid)
    }
}
