//! Geometric coverage predicates.
//!
//! A coverage restricts seeding and cleanup to a region of the grid. The
//! walker asks it one question per subtile bbox: does the region miss,
//! touch or fully contain this box?
//!
//! Only rectangle coverages are provided here; polygon coverages plug in
//! through the [`Coverage`] trait. Reprojection is not supported, so a
//! coverage is only meaningful for grids in the same SRS.

use std::fmt;
use std::sync::Arc;

use crate::grid::BBox;

/// Relation between a coverage and a queried bbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Intersection {
    /// No overlap: the subtree can be skipped.
    None,
    /// Partial overlap: descendants must be tested again.
    Intersects,
    /// The box lies completely inside: descendants need no further tests.
    Contains,
}

impl Intersection {
    /// True for anything but [`Intersection::None`].
    pub fn is_some(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Bbox with the SRS it is expressed in.
#[derive(Debug, Clone, PartialEq)]
pub struct Extent {
    pub bbox: BBox,
    pub srs: String,
}

/// Geometric region used to filter tiles.
pub trait Coverage: Send + Sync + fmt::Debug {
    /// Classifies `bbox` (expressed in `srs`) against the region.
    ///
    /// A box in a different SRS never intersects.
    fn intersects(&self, bbox: &BBox, srs: &str) -> Intersection;

    /// Bounding box of the whole region.
    fn bbox(&self) -> BBox;

    /// SRS the region is expressed in.
    fn srs(&self) -> &str;

    fn extent(&self) -> Extent {
        Extent {
            bbox: self.bbox(),
            srs: self.srs().to_string(),
        }
    }
}

/// Axis-aligned rectangle coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct BBoxCoverage {
    bbox: BBox,
    srs: String,
}

impl BBoxCoverage {
    pub fn new(bbox: BBox, srs: impl Into<String>) -> Self {
        Self {
            bbox,
            srs: srs.into(),
        }
    }
}

impl Coverage for BBoxCoverage {
    fn intersects(&self, bbox: &BBox, srs: &str) -> Intersection {
        if srs != self.srs {
            return Intersection::None;
        }
        if self.bbox.contains(bbox) {
            Intersection::Contains
        } else if self.bbox.intersects(bbox) {
            Intersection::Intersects
        } else {
            Intersection::None
        }
    }

    fn bbox(&self) -> BBox {
        self.bbox
    }

    fn srs(&self) -> &str {
        &self.srs
    }
}

/// Union of several coverages in one SRS.
///
/// A box counts as contained if a single member contains it. Boxes spread
/// over several members report [`Intersection::Intersects`], which only costs
/// extra geometry tests further down the pyramid.
#[derive(Debug, Clone)]
pub struct MultiCoverage {
    members: Vec<Arc<dyn Coverage>>,
    srs: String,
}

impl MultiCoverage {
    /// Returns `None` for an empty member list.
    pub fn new(members: Vec<Arc<dyn Coverage>>) -> Option<Self> {
        let srs = members.first()?.srs().to_string();
        Some(Self { members, srs })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Coverage for MultiCoverage {
    fn intersects(&self, bbox: &BBox, srs: &str) -> Intersection {
        self.members
            .iter()
            .map(|m| m.intersects(bbox, srs))
            .max()
            .unwrap_or(Intersection::None)
    }

    fn bbox(&self) -> BBox {
        let mut members = self.members.iter().map(|m| m.bbox());
        let first = members.next().unwrap_or(BBox {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 0.0,
            max_y: 0.0,
        });
        members.fold(first, |acc, b| acc.union(&b))
    }

    fn srs(&self) -> &str {
        &self.srs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> BBox {
        BBox::new(min_x, min_y, max_x, max_y).unwrap()
    }

    #[test]
    fn test_bbox_coverage_classification() {
        let cov = BBoxCoverage::new(rect(0.0, 0.0, 10.0, 10.0), "EPSG:4326");
        assert_eq!(
            cov.intersects(&rect(2.0, 2.0, 3.0, 3.0), "EPSG:4326"),
            Intersection::Contains
        );
        assert_eq!(
            cov.intersects(&rect(5.0, 5.0, 15.0, 15.0), "EPSG:4326"),
            Intersection::Intersects
        );
        assert_eq!(
            cov.intersects(&rect(20.0, 20.0, 30.0, 30.0), "EPSG:4326"),
            Intersection::None
        );
    }

    #[test]
    fn test_other_srs_never_intersects() {
        let cov = BBoxCoverage::new(rect(0.0, 0.0, 10.0, 10.0), "EPSG:4326");
        assert_eq!(
            cov.intersects(&rect(2.0, 2.0, 3.0, 3.0), "EPSG:3857"),
            Intersection::None
        );
    }

    #[test]
    fn test_multi_coverage_takes_strongest_member() {
        let a: Arc<dyn Coverage> = Arc::new(BBoxCoverage::new(rect(0.0, 0.0, 10.0, 10.0), "X"));
        let b: Arc<dyn Coverage> =
            Arc::new(BBoxCoverage::new(rect(20.0, 0.0, 30.0, 10.0), "X"));
        let multi = MultiCoverage::new(vec![a, b]).unwrap();

        assert_eq!(multi.bbox(), rect(0.0, 0.0, 30.0, 10.0));
        assert_eq!(
            multi.intersects(&rect(21.0, 1.0, 22.0, 2.0), "X"),
            Intersection::Contains
        );
        assert_eq!(
            multi.intersects(&rect(5.0, 5.0, 25.0, 6.0), "X"),
            Intersection::Intersects
        );
        assert_eq!(
            multi.intersects(&rect(12.0, 1.0, 18.0, 2.0), "X"),
            Intersection::None
        );
        assert!(MultiCoverage::new(Vec::new()).is_none());
    }

    #[test]
    fn test_intersection_is_some() {
        assert!(!Intersection::None.is_some());
        assert!(Intersection::Intersects.is_some());
        assert!(Intersection::Contains.is_some());
    }
}
