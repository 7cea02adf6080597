//! Multi-resolution grid clustering index
//!
//! One level per zoom band, built finest first. Every level partitions the
//! normalised Web Mercator plane into square cells whose side corresponds to
//! the cluster radius in pixels at that zoom. The nodes a level emits are the
//! inputs of the next coarser level, so coarser bands reference finer bands as
//! children.
//!
//! The finest level (`max_zoom + 1`) never merges: it holds the station leaves
//! and serves queries above `max_zoom`.
//!
//! Each level remembers, per cell, which nodes went in and which came out. A
//! structural change re-clusters only the touched cells and forwards the
//! difference in outputs to the next coarser level.

use crate::cluster::{Bounds, ClusterId, ClusterNode, QueryItem};
use crate::cow::CowMap;
use crate::{Config, Coordinates, DataError, Result, StationId};

use geo::Rect;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, warn};

type CellKey = (u32, u32);
type Nodes = SmallVec<[Arc<ClusterNode>; 4]>;

/// Inputs of one grid cell and the nodes it emits to the next coarser level
#[derive(Debug, Default)]
struct Cell {
    /// Sorted by id
    inputs: Nodes,
    outputs: Nodes,
}

/// A single zoom band of the index
#[derive(Debug, Clone)]
struct Level {
    zoom: u8,
    cell_size: f64,
    cells_per_axis: u32,
    /// The leaf level passes every input through
    merges: bool,
    cells: CowMap<CellKey, Arc<Cell>>,
    /// Number of nodes emitted by this level
    node_count: usize,
    /// Upper bound on the radius of any emitted node since the last full build
    max_radius: f64,
}

impl Level {
    fn new(zoom: u8, cell_size: f64, merges: bool) -> Self {
        Self {
            zoom,
            cell_size,
            cells_per_axis: (1.0 / cell_size).ceil().max(1.0) as u32,
            merges,
            cells: CowMap::new(),
            node_count: 0,
            max_radius: 0.0,
        }
    }

    /// Cell index along one axis; intervals are half-open except the last
    #[inline]
    fn axis_index(&self, value: f64) -> u32 {
        let index = (value / self.cell_size).floor();
        if index > 0.0 {
            (index as u32).min(self.cells_per_axis - 1)
        } else {
            0
        }
    }

    #[inline]
    fn cell_of(&self, node: &ClusterNode) -> CellKey {
        let position = node.world_position();
        (self.axis_index(position.x), self.axis_index(position.y))
    }

    /// Whether `node` is emitted by this level
    fn emits(&self, node: &Arc<ClusterNode>) -> bool {
        self.cells
            .get(&self.cell_of(node))
            .is_some_and(|cell| cell.outputs.iter().any(|o| Arc::ptr_eq(o, node)))
    }

    /// Collect emitted nodes whose bounding circle intersects `rect`
    fn collect(&self, rect: &Rect<f64>, out: &mut Vec<Arc<ClusterNode>>) {
        let margin = self.max_radius;
        let min = rect.min();
        let max = rect.max();
        let (x0, y0) = (
            self.axis_index(min.x - margin),
            self.axis_index(min.y - margin),
        );
        let (x1, y1) = (
            self.axis_index(max.x + margin),
            self.axis_index(max.y + margin),
        );

        let mut visit = |cell: &Cell| {
            out.extend(
                cell.outputs
                    .iter()
                    .filter(|node| node.intersects(rect))
                    .cloned(),
            );
        };

        let span = u64::from(x1 - x0 + 1) * u64::from(y1 - y0 + 1);
        if span > self.cells.len() as u64 {
            self.cells.values().for_each(|cell| visit(&**cell));
        } else {
            for cx in x0..=x1 {
                for cy in y0..=y1 {
                    if let Some(cell) = self.cells.get(&(cx, cy)) {
                        visit(&**cell);
                    }
                }
            }
        }
    }
}

/// Cluster the (id-sorted) inputs of one cell
///
/// `previous` holds the cell's former outputs; an aggregate with the same
/// membership and children is reused so that unchanged nodes keep their
/// identity by pointer as well as by id.
fn cluster_cell(
    zoom: u8,
    merges: bool,
    min_cluster_size: usize,
    inputs: &[Arc<ClusterNode>],
    previous: &[Arc<ClusterNode>],
) -> Nodes {
    if !merges || inputs.len() < 2 {
        return inputs.iter().cloned().collect();
    }
    let total: usize = inputs.iter().map(|node| node.member_count()).sum();
    if total < min_cluster_size {
        return inputs.iter().cloned().collect();
    }

    let merged = ClusterNode::aggregate(inputs.iter().cloned().collect(), zoom);
    match previous.iter().find(|node| node.same_structure(&merged)) {
        Some(node) => smallvec![node.clone()],
        None => smallvec![Arc::new(merged)],
    }
}

/// Per-level counters reported by [`SpatialIndex::stats`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelStats {
    pub zoom: u8,
    pub cells: usize,
    pub nodes: usize,
    pub max_radius_world: f64,
}

/// Summary of the index state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStats {
    /// Stations with a valid position
    pub station_count: usize,
    /// Aggregate nodes across all levels
    pub cluster_count: usize,
    pub levels: Vec<LevelStats>,
    pub updates_since_rebuild: usize,
    pub full_rebuilds: usize,
}

/// Hierarchical cluster index over station positions
///
/// Cloning is cheap: levels and lookup tables are copy-on-write maps, so a
/// clone shares all cells until either side modifies them.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    min_zoom: u8,
    max_zoom: u8,
    min_cluster_size: usize,
    full_rebuild_threshold: usize,
    /// `levels[i]` covers zoom `min_zoom + i`; the last one is the leaf level
    levels: Vec<Level>,
    leaves: CowMap<StationId, Arc<ClusterNode>>,
    /// Aggregates by id, registered at the level that created them
    clusters: CowMap<ClusterId, Arc<ClusterNode>>,
    updates_since_rebuild: usize,
    full_rebuilds: usize,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SpatialIndex {
    /// Create an empty index
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let mut levels: Vec<Level> = (config.min_zoom..=config.max_zoom)
            .map(|zoom| Level::new(zoom, config.cell_size(zoom), true))
            .collect();
        let leaf_zoom = config.max_zoom + 1;
        levels.push(Level::new(leaf_zoom, config.cell_size(leaf_zoom), false));

        Ok(Self {
            min_zoom: config.min_zoom,
            max_zoom: config.max_zoom,
            min_cluster_size: config.min_cluster_size,
            full_rebuild_threshold: config.full_rebuild_threshold,
            levels,
            leaves: CowMap::new(),
            clusters: CowMap::new(),
            updates_since_rebuild: 0,
            full_rebuilds: 0,
        })
    }

    /// Build an index over a bulk set of positions
    ///
    /// Stations with invalid coordinates are skipped with a warning. When an
    /// id appears more than once the last position wins.
    pub fn build(
        config: &Config,
        stations: impl IntoIterator<Item = (StationId, Coordinates)>,
    ) -> Result<Self> {
        #[cfg(feature = "profiling")]
        profiling::scope!("index::build");

        let mut index = Self::new(config)?;
        let leaf_zoom = index.leaf_zoom();

        let valid: Vec<(StationId, Coordinates)> = stations
            .into_iter()
            .filter(|(id, position)| {
                let ok = position.is_valid();
                if !ok {
                    warn!(
                        station = %id,
                        lat = position.lat,
                        lon = position.lon,
                        "Excluding station with invalid coordinates from the index"
                    );
                }
                ok
            })
            .collect();

        let leaves: Vec<Arc<ClusterNode>> = valid
            .into_par_iter()
            .map(|(id, position)| Arc::new(ClusterNode::leaf(id, position, leaf_zoom)))
            .collect();
        for leaf in leaves {
            if let Some(id) = leaf.station_id().cloned() {
                index.leaves.insert(id, leaf);
            }
        }

        index.build_levels();
        debug!(
            stations = index.len(),
            clusters = index.clusters.len(),
            "Built spatial index"
        );
        Ok(index)
    }

    #[inline]
    pub fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    #[inline]
    pub fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    /// Zoom of the leaf level, one above `max_zoom`
    #[inline]
    pub fn leaf_zoom(&self) -> u8 {
        self.max_zoom + 1
    }

    /// Number of indexed stations
    #[inline]
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: &StationId) -> bool {
        self.leaves.contains_key(id)
    }

    /// Position of an indexed station
    pub fn position_of(&self, id: &StationId) -> Option<Coordinates> {
        self.leaves.get(id).map(|leaf| leaf.centroid())
    }

    /// Look up an aggregate node by id
    pub fn cluster(&self, id: ClusterId) -> Option<&Arc<ClusterNode>> {
        self.clusters.get(&id)
    }

    /// Insert a station or move it to a new position
    ///
    /// Returns `Ok(false)` when the station already sits at that position, in
    /// which case the index is left untouched.
    pub fn upsert(&mut self, id: StationId, position: Coordinates) -> Result<bool> {
        if !position.is_valid() {
            return Err(DataError::InvalidCoordinates {
                id: id.to_string(),
                lat: position.lat,
                lon: position.lon,
            });
        }

        let leaf = Arc::new(ClusterNode::leaf(id.clone(), position, self.leaf_zoom()));
        let unchanged = self
            .leaves
            .get(&id)
            .is_some_and(|current| current.world_position() == leaf.world_position());
        if unchanged {
            return Ok(false);
        }

        let previous = self.leaves.insert(id, leaf.clone());
        self.apply(previous.into_iter().collect(), vec![leaf]);
        Ok(true)
    }

    /// Remove a station; returns whether it was indexed
    pub fn remove(&mut self, id: &StationId) -> bool {
        match self.leaves.remove(id) {
            Some(leaf) => {
                self.apply(vec![leaf], Vec::new());
                true
            }
            None => false,
        }
    }

    /// Discard all levels and rebuild them from the current leaves
    pub fn rebuild(&mut self) {
        self.build_levels();
        self.full_rebuilds += 1;
    }

    /// Number of full rebuilds triggered after the initial build
    #[inline]
    pub fn full_rebuilds(&self) -> usize {
        self.full_rebuilds
    }

    /// Localized updates applied since the last full build
    #[inline]
    pub fn updates_since_rebuild(&self) -> usize {
        self.updates_since_rebuild
    }

    fn apply(&mut self, removed: Vec<Arc<ClusterNode>>, added: Vec<Arc<ClusterNode>>) {
        self.patch(removed, added);
        self.updates_since_rebuild += 1;

        if self.full_rebuild_threshold > 0
            && self.updates_since_rebuild >= self.full_rebuild_threshold
        {
            debug!(
                updates = self.updates_since_rebuild,
                "Localized update threshold reached, rebuilding index"
            );
            self.rebuild();
        }
    }

    fn build_levels(&mut self) {
        #[cfg(feature = "profiling")]
        profiling::scope!("index::build_levels");

        let mut inputs: Vec<Arc<ClusterNode>> = self.leaves.values().cloned().collect();
        let min_cluster_size = self.min_cluster_size;
        self.clusters.clear();

        for level in self.levels.iter_mut().rev() {
            let mut groups: FxHashMap<CellKey, Nodes> = FxHashMap::default();
            for node in inputs {
                groups.entry(level.cell_of(&node)).or_default().push(node);
            }

            let (zoom, merges) = (level.zoom, level.merges);
            let cells: Vec<(CellKey, Cell)> = groups
                .into_par_iter()
                .map(|(key, mut members)| {
                    members.sort_unstable_by_key(|node| node.id());
                    let outputs = cluster_cell(zoom, merges, min_cluster_size, &members, &[]);
                    (
                        key,
                        Cell {
                            inputs: members,
                            outputs,
                        },
                    )
                })
                .collect();

            let mut next = Vec::with_capacity(cells.len());
            let mut max_radius: f64 = 0.0;
            let mut map = CowMap::new();
            for (key, cell) in cells {
                for node in &cell.outputs {
                    max_radius = max_radius.max(node.world_radius());
                    if !node.is_leaf() && node.zoom() == zoom {
                        self.clusters.insert(node.id(), node.clone());
                    }
                    next.push(node.clone());
                }
                map.insert(key, Arc::new(cell));
            }

            level.cells = map;
            level.node_count = next.len();
            level.max_radius = max_radius;
            inputs = next;
        }

        self.updates_since_rebuild = 0;
    }

    /// Propagate removed and added nodes from the leaf level upwards
    fn patch(&mut self, mut removed: Vec<Arc<ClusterNode>>, mut added: Vec<Arc<ClusterNode>>) {
        #[cfg(feature = "profiling")]
        profiling::scope!("index::patch");

        let min_cluster_size = self.min_cluster_size;

        for level in self.levels.iter_mut().rev() {
            if removed.is_empty() && added.is_empty() {
                break;
            }

            let mut touched: BTreeMap<CellKey, (Nodes, Nodes)> = BTreeMap::new();
            for node in removed.drain(..) {
                touched.entry(level.cell_of(&node)).or_default().0.push(node);
            }
            for node in added.drain(..) {
                touched.entry(level.cell_of(&node)).or_default().1.push(node);
            }

            for (key, (gone, new)) in touched {
                let (mut inputs, old_outputs) = match level.cells.get(&key) {
                    Some(cell) => (cell.inputs.clone(), cell.outputs.clone()),
                    None => (Nodes::new(), Nodes::new()),
                };
                inputs.retain(|node| !gone.iter().any(|g| Arc::ptr_eq(g, node)));
                inputs.extend(new);
                inputs.sort_unstable_by_key(|node| node.id());

                let outputs = cluster_cell(
                    level.zoom,
                    level.merges,
                    min_cluster_size,
                    &inputs,
                    &old_outputs,
                );

                for node in &old_outputs {
                    if !outputs.iter().any(|o| Arc::ptr_eq(o, node)) {
                        removed.push(node.clone());
                    }
                }
                for node in &outputs {
                    if !old_outputs.iter().any(|o| Arc::ptr_eq(o, node)) {
                        level.max_radius = level.max_radius.max(node.world_radius());
                        added.push(node.clone());
                    }
                }

                if inputs.is_empty() {
                    level.cells.remove(&key);
                } else {
                    level.cells.insert(key, Arc::new(Cell { inputs, outputs }));
                }
            }

            level.node_count = level.node_count + added.len() - removed.len();

            // Removals first: a replacement may carry the same id. A finer
            // aggregate merged away here is still emitted by its own level.
            for node in &removed {
                if node.is_leaf() || node.zoom() != level.zoom {
                    continue;
                }
                let registered = self
                    .clusters
                    .get(&node.id())
                    .is_some_and(|current| Arc::ptr_eq(current, node));
                if registered {
                    self.clusters.remove(&node.id());
                }
            }
            for node in &added {
                if !node.is_leaf() && node.zoom() == level.zoom {
                    self.clusters.insert(node.id(), node.clone());
                }
            }
        }
    }

    /// Index of the level serving a fractional zoom
    fn level_index(&self, zoom: f64) -> usize {
        let zoom = zoom.floor();
        if zoom > f64::from(self.max_zoom) {
            self.levels.len() - 1
        } else if zoom >= f64::from(self.min_zoom) {
            (zoom as u8 - self.min_zoom) as usize
        } else {
            // Below min_zoom, and NaN
            0
        }
    }

    #[inline]
    fn level_of_zoom(&self, zoom: u8) -> usize {
        (zoom.clamp(self.min_zoom, self.leaf_zoom()) - self.min_zoom) as usize
    }

    /// Zoom levels at which `node`, found at `levels[level_index]`, is emitted
    fn zoom_range(&self, node: &Arc<ClusterNode>, level_index: usize) -> RangeInclusive<u8> {
        let mut min = self.levels[level_index].zoom;
        for level in self.levels[..level_index].iter().rev() {
            if !level.emits(node) {
                break;
            }
            min = level.zoom;
        }
        min..=node.zoom()
    }

    fn item(&self, node: &Arc<ClusterNode>, level_index: usize) -> QueryItem {
        QueryItem {
            id: node.id(),
            is_leaf: node.is_leaf(),
            station_id: node.station_id().cloned(),
            centroid: node.centroid(),
            member_count: node.member_count(),
            bounding_radius: node.bounding_radius_meters(),
            zoom_range: self.zoom_range(node, level_index),
        }
    }

    /// Nodes of the band for `floor(zoom)` whose bounding circle intersects
    /// `bounds`, sorted by id
    pub fn query(&self, bounds: &Bounds, zoom: f64) -> Vec<QueryItem> {
        #[cfg(feature = "profiling")]
        profiling::scope!("index::query");

        let level_index = self.level_index(zoom);
        let level = &self.levels[level_index];

        let mut nodes = Vec::new();
        for rect in bounds.to_world_rects() {
            level.collect(&rect, &mut nodes);
        }
        nodes.sort_unstable_by_key(|node| node.id());
        nodes.dedup_by(|a, b| Arc::ptr_eq(a, b));

        nodes
            .iter()
            .map(|node| self.item(node, level_index))
            .collect()
    }

    fn require_cluster(&self, id: ClusterId) -> Result<&Arc<ClusterNode>> {
        self.clusters.get(&id).ok_or(DataError::UnknownCluster(id))
    }

    /// The next-finer nodes merged into a cluster
    pub fn children(&self, id: ClusterId) -> Result<Vec<QueryItem>> {
        let node = self.require_cluster(id)?;
        let level_index = self.level_of_zoom(node.zoom() + 1);
        Ok(node
            .children()
            .iter()
            .map(|child| self.item(child, level_index))
            .collect())
    }

    /// Station ids under a cluster, paged with `offset` and `limit`
    pub fn leaves(&self, id: ClusterId, limit: usize, offset: usize) -> Result<Vec<StationId>> {
        let root = self.require_cluster(id)?;
        let mut stack: Vec<&Arc<ClusterNode>> = root.children().iter().rev().collect();
        let mut skipped = 0;
        let mut out = Vec::with_capacity(limit.min(root.member_count()));

        while let Some(node) = stack.pop() {
            if out.len() >= limit {
                break;
            }
            // Whole subtrees inside the offset are skipped without descending
            if skipped + node.member_count() <= offset {
                skipped += node.member_count();
                continue;
            }
            match node.station_id() {
                Some(station) => out.push(station.clone()),
                None => stack.extend(node.children().iter().rev()),
            }
        }
        Ok(out)
    }

    /// Smallest zoom at which a cluster is shown as its children
    pub fn expansion_zoom(&self, id: ClusterId) -> Result<u8> {
        Ok(self.require_cluster(id)?.zoom() + 1)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            station_count: self.leaves.len(),
            cluster_count: self.clusters.len(),
            levels: self
                .levels
                .iter()
                .map(|level| LevelStats {
                    zoom: level.zoom,
                    cells: level.cells.len(),
                    nodes: level.node_count,
                    max_radius_world: level.max_radius,
                })
                .collect(),
            updates_since_rebuild: self.updates_since_rebuild,
            full_rebuilds: self.full_rebuilds,
        }
    }
}
