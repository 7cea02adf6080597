//! Cluster nodes, viewport bounds and query results

use crate::{Coordinates, StationId, utils};
use geo::{Coord, Rect};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Children of an aggregate node, one zoom level finer
pub type Children = SmallVec<[Arc<ClusterNode>; 4]>;

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// SplitMix64 finaliser
#[inline]
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Stable identifier of a cluster node
///
/// Leaves hash their station id. Aggregates hash the member set through an
/// order-independent sum of member hashes, so the id only changes when
/// membership changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u64);

impl ClusterId {
    pub fn for_station(id: &StationId) -> Self {
        let mut hasher = FxHasher::default();
        id.as_str().hash(&mut hasher);
        Self(mix64(hasher.finish()))
    }

    fn for_members(member_sum: u64, member_count: usize) -> Self {
        Self(mix64(
            member_sum ^ (member_count as u64).wrapping_mul(GOLDEN_GAMMA),
        ))
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Leaf(StationId),
    Aggregate(Children),
}

/// A single station (leaf) or an aggregate of nearby stations
///
/// Positions are kept in normalised Web Mercator space; see [`utils::project`].
#[derive(Clone, Debug)]
pub struct ClusterNode {
    id: ClusterId,
    kind: NodeKind,
    x: f64,
    y: f64,
    member_count: usize,
    /// Wrapping sum of the member leaf ids, the basis of `id`
    member_sum: u64,
    /// Upper bound on the distance from the centroid to any member
    radius: f64,
    /// Zoom level that created this node (the finest level it appears at)
    zoom: u8,
}

impl ClusterNode {
    pub(crate) fn leaf(station: StationId, position: Coordinates, zoom: u8) -> Self {
        let id = ClusterId::for_station(&station);
        let point = utils::project(position.lat, position.lon);
        Self {
            id,
            kind: NodeKind::Leaf(station),
            x: point.x(),
            y: point.y(),
            member_count: 1,
            member_sum: id.0,
            radius: 0.0,
            zoom,
        }
    }

    /// Merge nodes into one aggregate at `zoom`
    ///
    /// The centroid is the point-count-weighted mean of the children's
    /// centroids. `children` must not be empty.
    pub(crate) fn aggregate(children: Children, zoom: u8) -> Self {
        let mut member_count = 0usize;
        let mut member_sum = 0u64;
        let mut wx = 0.0;
        let mut wy = 0.0;
        for child in &children {
            let weight = child.member_count as f64;
            wx += child.x * weight;
            wy += child.y * weight;
            member_count += child.member_count;
            member_sum = member_sum.wrapping_add(child.member_sum);
        }
        let x = wx / member_count as f64;
        let y = wy / member_count as f64;

        let radius = children
            .iter()
            .map(|child| ((child.x - x).powi(2) + (child.y - y).powi(2)).sqrt() + child.radius)
            .fold(0.0, f64::max);

        Self {
            id: ClusterId::for_members(member_sum, member_count),
            kind: NodeKind::Aggregate(children),
            x,
            y,
            member_count,
            member_sum,
            radius,
            zoom,
        }
    }

    #[inline]
    pub fn id(&self) -> ClusterId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    /// Station id of a leaf node
    #[inline]
    pub fn station_id(&self) -> Option<&StationId> {
        match &self.kind {
            NodeKind::Leaf(id) => Some(id),
            NodeKind::Aggregate(_) => None,
        }
    }

    /// Finer-grained nodes merged into this one; empty for leaves
    #[inline]
    pub fn children(&self) -> &[Arc<ClusterNode>] {
        match &self.kind {
            NodeKind::Leaf(_) => &[],
            NodeKind::Aggregate(children) => children,
        }
    }

    #[inline]
    pub fn member_count(&self) -> usize {
        self.member_count
    }

    /// Centroid in normalised Web Mercator space
    #[inline]
    pub fn world_position(&self) -> Coord<f64> {
        Coord {
            x: self.x,
            y: self.y,
        }
    }

    /// Centroid in WGS84 degrees
    pub fn centroid(&self) -> Coordinates {
        let (lat, lon) = utils::unproject(self.x, self.y);
        Coordinates::new(lat, lon)
    }

    /// Bounding radius in normalised world units
    #[inline]
    pub fn world_radius(&self) -> f64 {
        self.radius
    }

    /// Bounding radius in ground meters at the centroid's latitude
    pub fn bounding_radius_meters(&self) -> f64 {
        utils::world_to_meters(self.radius, self.centroid().lat)
    }

    #[inline]
    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// Whether the node's bounding circle touches a world-space rectangle
    pub fn intersects(&self, rect: &Rect<f64>) -> bool {
        let min = rect.min();
        let max = rect.max();
        let dx = (min.x - self.x).max(0.0).max(self.x - max.x);
        let dy = (min.y - self.y).max(0.0).max(self.y - max.y);
        dx * dx + dy * dy <= self.radius * self.radius
    }

    /// Same membership and same children, so the node can be reused as is
    pub(crate) fn same_structure(&self, other: &ClusterNode) -> bool {
        self.id == other.id
            && self.zoom == other.zoom
            && self.children().len() == other.children().len()
            && self
                .children()
                .iter()
                .zip(other.children())
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

/// Geographic viewport bounds in WGS84 degrees
///
/// `west > east` denotes a viewport crossing the antimeridian.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// The whole world
    pub fn world() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    #[inline]
    pub fn crosses_antimeridian(&self) -> bool {
        self.west > self.east
    }

    pub fn contains(&self, position: Coordinates) -> bool {
        let lat_ok = position.lat >= self.south && position.lat <= self.north;
        let lon_ok = if self.crosses_antimeridian() {
            position.lon >= self.west || position.lon <= self.east
        } else {
            position.lon >= self.west && position.lon <= self.east
        };
        lat_ok && lon_ok
    }

    /// Project to one or two rectangles in normalised Web Mercator space
    pub fn to_world_rects(&self) -> SmallVec<[Rect<f64>; 2]> {
        let south = self.south.min(self.north);
        let north = self.south.max(self.north);
        let rect = |west: f64, east: f64| {
            let top_left = utils::project(north, west);
            let bottom_right = utils::project(south, east);
            Rect::new(
                Coord {
                    x: top_left.x(),
                    y: top_left.y(),
                },
                Coord {
                    x: bottom_right.x(),
                    y: bottom_right.y(),
                },
            )
        };

        let mut rects = SmallVec::new();
        if self.crosses_antimeridian() {
            rects.push(rect(self.west, 180.0));
            rects.push(rect(-180.0, self.east));
        } else {
            rects.push(rect(self.west, self.east));
        }
        rects
    }
}

/// One renderable item returned by a viewport query
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryItem {
    pub id: ClusterId,
    pub is_leaf: bool,
    /// Set for leaves only
    pub station_id: Option<StationId>,
    pub centroid: Coordinates,
    pub member_count: usize,
    /// Bounding radius in meters
    pub bounding_radius: f64,
    /// Zoom levels at which this node is part of the result set
    pub zoom_range: RangeInclusive<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str, lat: f64, lon: f64) -> Arc<ClusterNode> {
        Arc::new(ClusterNode::leaf(
            StationId::new(id).unwrap(),
            Coordinates::new(lat, lon),
            17,
        ))
    }

    #[test]
    fn test_leaf_node() {
        let node = leaf("a", 10.0, 20.0);
        assert!(node.is_leaf());
        assert_eq!(node.member_count(), 1);
        assert_eq!(node.world_radius(), 0.0);
        assert_eq!(node.station_id().map(|s| s.as_str()), Some("a"));
        let centroid = node.centroid();
        assert!((centroid.lat - 10.0).abs() < 1e-9);
        assert!((centroid.lon - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_weighted_centroid() {
        let a = leaf("a", 0.0, 0.0);
        let b = leaf("b", 0.0, 1.0);
        let c = leaf("c", 0.0, 1.0);
        let bc = Arc::new(ClusterNode::aggregate(SmallVec::from_vec(vec![b, c]), 10));
        let abc = ClusterNode::aggregate(SmallVec::from_vec(vec![a, bc.clone()]), 9);

        assert_eq!(abc.member_count(), 3);
        // Two of the three members sit at lon 1, so the centroid is at 2/3
        assert!((abc.centroid().lon - 2.0 / 3.0).abs() < 1e-9);
        assert!(abc.world_radius() > 0.0);
        assert_eq!(abc.children().len(), 2);
        assert_eq!(bc.zoom(), 10);
    }

    #[test]
    fn test_cluster_id_is_order_independent() {
        let a = leaf("a", 0.0, 0.0);
        let b = leaf("b", 1.0, 1.0);
        let ab = ClusterNode::aggregate(SmallVec::from_vec(vec![a.clone(), b.clone()]), 5);
        let ba = ClusterNode::aggregate(SmallVec::from_vec(vec![b, a]), 7);
        assert_eq!(ab.id(), ba.id());
    }

    #[test]
    fn test_cluster_id_depends_on_members() {
        let ab = ClusterNode::aggregate(
            SmallVec::from_vec(vec![leaf("a", 0.0, 0.0), leaf("b", 0.0, 0.0)]),
            5,
        );
        let ac = ClusterNode::aggregate(
            SmallVec::from_vec(vec![leaf("a", 0.0, 0.0), leaf("c", 0.0, 0.0)]),
            5,
        );
        assert_ne!(ab.id(), ac.id());
        assert_ne!(ab.id(), leaf("a", 0.0, 0.0).id());
    }

    #[test]
    fn test_intersects_uses_radius() {
        let node = ClusterNode::aggregate(
            SmallVec::from_vec(vec![leaf("a", 0.0, -1.0), leaf("b", 0.0, 1.0)]),
            3,
        );
        // A rectangle just east of the centroid but within the radius
        let p = utils::project(0.5, 0.5);
        let q = utils::project(-0.5, 2.0);
        let near = Rect::new(Coord { x: p.x(), y: p.y() }, Coord { x: q.x(), y: q.y() });
        assert!(node.intersects(&near));

        let p = utils::project(0.5, 5.0);
        let q = utils::project(-0.5, 6.0);
        let far = Rect::new(Coord { x: p.x(), y: p.y() }, Coord { x: q.x(), y: q.y() });
        assert!(!node.intersects(&far));
    }

    #[test]
    fn test_bounds_antimeridian() {
        let bounds = Bounds::new(170.0, -10.0, -170.0, 10.0);
        assert!(bounds.crosses_antimeridian());
        assert!(bounds.contains(Coordinates::new(0.0, 175.0)));
        assert!(bounds.contains(Coordinates::new(0.0, -175.0)));
        assert!(!bounds.contains(Coordinates::new(0.0, 0.0)));
        assert_eq!(bounds.to_world_rects().len(), 2);
        assert_eq!(Bounds::world().to_world_rects().len(), 1);
    }

    #[test]
    fn test_world_rect_orientation() {
        let rects = Bounds::new(-10.0, -5.0, 10.0, 5.0).to_world_rects();
        let rect = rects[0];
        assert!(rect.min().x < 0.5 && rect.max().x > 0.5);
        assert!(rect.min().y < 0.5 && rect.max().y > 0.5);
    }
}
