//! 高度图
//! 自适应的四叉树，每个节点记录落在其范围内的z的均值、方差和最大值。
//! 叶节点缓存原始点，点数和方差都足够时分裂成4个子节点，缓存的点重新插入子节点后丢弃。
//! HeightMapAggregation把八叉树的叶节点投影到任意平面上，生成2.5维的高度摘要。

use nalgebra::{Point2, Point3, Vector2, Vector3};
use pi_slotmap::{DefaultKey, SlotMap};

use crate::config::HeightMapConfig;
use crate::error::{OctreeError, Result};
use crate::geometry::{from_count, to_f64, Real};
use crate::octree::Octree;
use crate::payload::LeafPayload;
use crate::policy::InsertPolicy;
use crate::query::Query;
use crate::serialize::OctreeSink;

/// 一个叶节点的统计摘要
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeightCell<S: Real> {
    pub center: Point2<S>,
    pub half_extents: Vector2<S>,
    pub count: u64,
    pub mean: S,
    /// 总体方差
    pub variance: S,
    pub max: S,
}

#[derive(Debug, Clone)]
struct HeightNode<S: Real> {
    center: Point2<S>,
    half_extents: Vector2<S>,
    count: u64,
    mean: S,
    m2: S,
    max: S,
    points: Vec<Point3<S>>, // 只有叶节点缓存点
    children: Option<[DefaultKey; 4]>,
}

impl<S: Real> HeightNode<S> {
    fn new(center: Point2<S>, half_extents: Vector2<S>) -> Self {
        HeightNode {
            center,
            half_extents,
            count: 0,
            mean: S::zero(),
            m2: S::zero(),
            max: -S::INFINITY,
            points: Vec::new(),
            children: None,
        }
    }

    #[inline]
    fn accumulate(&mut self, z: S) {
        self.count += 1;
        let d = z - self.mean;
        self.mean += d / from_count::<S>(self.count);
        self.m2 += d * (z - self.mean);
        self.max = self.max.max(z);
    }

    #[inline]
    fn variance(&self) -> S {
        if self.count == 0 {
            S::zero()
        } else {
            self.m2 / from_count::<S>(self.count)
        }
    }

    // bit0为x，bit1为y，分界线上归到正半边
    #[inline]
    fn quadrant(&self, point: &Point3<S>) -> usize {
        let mut i = 0;
        if point.x >= self.center.x {
            i |= 1;
        }
        if point.y >= self.center.y {
            i |= 2;
        }
        i
    }

    fn cell(&self) -> HeightCell<S> {
        HeightCell {
            center: self.center,
            half_extents: self.half_extents,
            count: self.count,
            mean: self.mean,
            variance: self.variance(),
            max: self.max,
        }
    }
}

/// 高度图
#[derive(Debug, Clone)]
pub struct HeightMap<S: Real> {
    nodes: SlotMap<DefaultKey, HeightNode<S>>,
    root: DefaultKey,
    center: Point2<S>,
    half_extents: Vector2<S>,
    config: HeightMapConfig<S>,
}

impl<S: Real> HeightMap<S> {
    /// 需传入xy平面上的中心和半边长
    pub fn new(center: Point2<S>, half_extents: Vector2<S>) -> Result<Self> {
        Self::with_config(center, half_extents, HeightMapConfig::default())
    }

    pub fn with_config(
        center: Point2<S>,
        half_extents: Vector2<S>,
        config: HeightMapConfig<S>,
    ) -> Result<Self> {
        let valid = |h: S| h.is_finite() && h > S::zero();
        if !valid(half_extents.x) || !valid(half_extents.y) {
            return Err(OctreeError::InvalidHeightMapExtent(
                to_f64(half_extents.x),
                to_f64(half_extents.y),
            ));
        }
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(HeightNode::new(center, half_extents));
        Ok(HeightMap {
            nodes,
            root,
            center,
            half_extents,
            config,
        })
    }

    #[inline]
    pub fn center(&self) -> Point2<S> {
        self.center
    }

    #[inline]
    pub fn half_extents(&self) -> Vector2<S> {
        self.half_extents
    }

    #[inline]
    pub fn config(&self) -> &HeightMapConfig<S> {
        &self.config
    }

    /// 节点数量，包括内部节点
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// 检查点是否在范围内，边界算在内
    #[inline]
    pub fn contains(&self, x: S, y: S) -> bool {
        (x - self.center.x).abs() <= self.half_extents.x
            && (y - self.center.y).abs() <= self.half_extents.y
    }

    /// 插入一个点，范围外的点被忽略并返回false
    pub fn insert(&mut self, x: S, y: S, z: S) -> bool {
        if !self.contains(x, y) {
            return false;
        }
        let limits = SplitLimits {
            split_count: self.config.split_count,
            min_variance: self.config.min_variance,
            min_half_extents: self.half_extents * self.config.min_extent_ratio,
        };
        insert(&mut self.nodes, self.root, Point3::new(x, y, z), &limits);
        true
    }

    /// 返回包含该位置的叶节点的(点数, 最大高度)
    /// 范围外或没有数据时返回(0, +∞)
    pub fn estimate_height_at_location(&self, x: S, y: S) -> (u64, S) {
        let empty = (0, S::INFINITY);
        if !self.contains(x, y) {
            return empty;
        }
        let p = Point3::new(x, y, S::zero());
        let mut id = self.root;
        while let Some(node) = self.nodes.get(id) {
            match node.children {
                Some(children) => id = children[node.quadrant(&p)],
                None if node.count == 0 => return empty,
                None => return (node.count, node.max),
            }
        }
        empty
    }

    /// 所有叶节点的摘要，深度优先顺序
    pub fn cells(&self) -> Vec<HeightCell<S>> {
        let mut r = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                match node.children {
                    Some(children) => stack.extend(children.iter().rev()),
                    None => r.push(node.cell()),
                }
            }
        }
        r
    }
}

/// 把八叉树的叶节点投影到高度图
///
/// 投影基会被正交归一化，法向为x × y。
/// 每个被命中过的叶节点取中心在基上的坐标，高度取立方体各角点沿法向投影的最大值。
#[derive(Debug, Clone)]
pub struct HeightMapAggregation<S: Real> {
    height_map: HeightMap<S>,
    basis_x: Vector3<S>,
    basis_y: Vector3<S>,
    normal: Vector3<S>,
    skipped: u64,
}

impl<S: Real> HeightMapAggregation<S> {
    pub fn new(height_map: HeightMap<S>, basis_x: &Vector3<S>, basis_y: &Vector3<S>) -> Result<Self> {
        let x = basis_x
            .try_normalize(S::EPSILON)
            .ok_or(OctreeError::DegenerateBasis)?;
        let y = (basis_y - x * x.dot(basis_y))
            .try_normalize(S::EPSILON)
            .ok_or(OctreeError::DegenerateBasis)?;
        Ok(HeightMapAggregation {
            height_map,
            basis_x: x,
            basis_y: y,
            normal: x.cross(&y),
            skipped: 0,
        })
    }

    #[inline]
    pub fn height_map(&self) -> &HeightMap<S> {
        &self.height_map
    }

    pub fn into_height_map(self) -> HeightMap<S> {
        self.height_map
    }

    /// 正交归一化后的基(x, y, 法向)
    pub fn basis(&self) -> (Vector3<S>, Vector3<S>, Vector3<S>) {
        (self.basis_x, self.basis_y, self.normal)
    }

    /// 落在高度图范围外或坐标无效而被跳过的体素数量
    #[inline]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// 加入一个体素，需传入体素中心和半边长
    pub fn add_voxel(&mut self, center: &Point3<S>, half_extent: S) -> bool {
        let c = center.coords;
        let n = &self.normal;
        let x = c.dot(&self.basis_x);
        let y = c.dot(&self.basis_y);
        let z = c.dot(n) + half_extent * (n.x.abs() + n.y.abs() + n.z.abs());
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            log::warn!("height map aggregation skipped a voxel with non-finite projection");
            self.skipped += 1;
            return false;
        }
        if !self.height_map.insert(x, y, z) {
            self.skipped += 1;
            return false;
        }
        true
    }

    /// 把查询到的叶节点加入高度图
    pub fn aggregate<L, P, Q>(&mut self, tree: &Octree<S, L, P>, query: &Q)
    where
        L: LeafPayload<S>,
        P: InsertPolicy<S>,
        Q: Query<S> + ?Sized,
    {
        tree.query(query, |leaf, center, half| self.visit_leaf(leaf, center, half));
    }

    #[inline]
    fn visit_leaf<L: LeafPayload<S>>(&mut self, leaf: &L, center: &Point3<S>, half_extent: S) {
        if leaf.occupied_count() > 0 {
            self.add_voxel(center, half_extent);
        }
    }
}

impl<S: Real, L: LeafPayload<S>, P: InsertPolicy<S>> OctreeSink<S, L, P>
    for HeightMapAggregation<S>
{
    fn header(&mut self, tree: &Octree<S, L, P>) {
        log::debug!(
            "height map aggregation started, leaves: {}, voxel half extent: {}",
            tree.len(),
            to_f64(tree.voxel_half_extent())
        );
    }

    fn visit(&mut self, leaf: &L, center: &Point3<S>, half_extent: S) {
        self.visit_leaf(leaf, center, half_extent);
    }
}

//////////////////////////////////////////////////////本地/////////////////////////////////////////////////////////////////

struct SplitLimits<S: Real> {
    split_count: usize,
    min_variance: S,
    min_half_extents: Vector2<S>,
}

// 从id开始下降，沿途累计统计，在叶节点缓存点，需要时分裂
fn insert<S: Real>(
    nodes: &mut SlotMap<DefaultKey, HeightNode<S>>,
    mut id: DefaultKey,
    point: Point3<S>,
    limits: &SplitLimits<S>,
) {
    loop {
        let node = match nodes.get_mut(id) {
            Some(node) => node,
            None => return,
        };
        node.accumulate(point.z);
        match node.children {
            Some(children) => id = children[node.quadrant(&point)],
            None => {
                node.points.push(point);
                if should_split(node, limits) {
                    split(nodes, id, limits);
                }
                return;
            }
        }
    }
}

#[inline]
fn should_split<S: Real>(node: &HeightNode<S>, limits: &SplitLimits<S>) -> bool {
    let two = S::one() + S::one();
    let child_half = node.half_extents / two;
    node.points.len() >= limits.split_count
        && node.variance() >= limits.min_variance
        && child_half.x >= limits.min_half_extents.x
        && child_half.y >= limits.min_half_extents.y
}

// 分裂叶节点，缓存的点重新插入子节点
fn split<S: Real>(
    nodes: &mut SlotMap<DefaultKey, HeightNode<S>>,
    id: DefaultKey,
    limits: &SplitLimits<S>,
) {
    let (center, half_extents, points) = match nodes.get_mut(id) {
        Some(node) => (
            node.center,
            node.half_extents,
            std::mem::take(&mut node.points),
        ),
        None => return,
    };
    let two = S::one() + S::one();
    let child_half = half_extents / two;
    let children = [0usize, 1, 2, 3].map(|q| {
        let sx = if q & 1 != 0 { S::one() } else { -S::one() };
        let sy = if q & 2 != 0 { S::one() } else { -S::one() };
        let c = center + Vector2::new(sx * child_half.x, sy * child_half.y);
        nodes.insert(HeightNode::new(c, child_half))
    });
    log::trace!(
        "height map split at ({}, {}), points: {}",
        to_f64(center.x),
        to_f64(center.y),
        points.len()
    );
    let quadrants: Vec<usize> = match nodes.get_mut(id) {
        Some(node) => {
            node.children = Some(children);
            points.iter().map(|p| node.quadrant(p)).collect()
        }
        None => return,
    };
    for (p, q) in points.into_iter().zip(quadrants) {
        insert(nodes, children[q], p, limits);
    }
}

#[cfg(test)]
fn grid_points() -> Vec<Point3<f64>> {
    vec![
        Point3::new(-0.5, -0.5, 1.0),
        Point3::new(-0.25, -0.75, 2.0),
        Point3::new(-0.75, -0.25, 3.0),
        Point3::new(0.5, -0.5, 4.0),
        Point3::new(0.25, -0.75, 5.0),
        Point3::new(-0.5, 0.5, 6.0),
        Point3::new(-0.25, 0.75, 7.0),
        Point3::new(0.5, 0.5, 8.0),
        Point3::new(0.25, 0.75, 9.0),
        Point3::new(0.75, 0.25, 10.0),
    ]
}

#[test]
fn test_height_map_split() {
    let mut map = HeightMap::new(Point2::origin(), Vector2::new(1.0, 1.0)).unwrap();
    let points = grid_points();
    for p in points[..9].iter() {
        assert!(map.insert(p.x, p.y, p.z));
    }
    assert_eq!(map.node_count(), 1);
    assert_eq!(map.estimate_height_at_location(0.9, 0.9), (9, 9.0));

    let last = points[9];
    assert!(map.insert(last.x, last.y, last.z));
    assert_eq!(map.node_count(), 5);
    assert_eq!(map.estimate_height_at_location(-0.5, -0.5), (3, 3.0));
    assert_eq!(map.estimate_height_at_location(0.5, -0.5), (2, 5.0));
    assert_eq!(map.estimate_height_at_location(-0.5, 0.5), (2, 7.0));
    assert_eq!(map.estimate_height_at_location(0.5, 0.5), (3, 10.0));

    let cells = map.cells();
    assert_eq!(cells.len(), 4);
    assert_eq!(cells.iter().map(|c| c.count).sum::<u64>(), 10);
    assert_eq!(cells[0].center, Point2::new(-0.5, -0.5));
    assert_eq!(cells[0].half_extents, Vector2::new(0.5, 0.5));
    assert_eq!(cells[0].mean, 2.0);
    assert!((cells[0].variance - 2.0 / 3.0).abs() < 1e-12);

    // 范围外
    assert!(!map.insert(1.5, 0.0, 1.0));
    assert_eq!(map.estimate_height_at_location(1.5, 0.0), (0, f64::INFINITY));
    // 边界算在内
    assert!(map.insert(1.0, 1.0, 0.0));
}

#[test]
fn test_height_map_thresholds() {
    // 高度没有变化，不分裂
    let mut flat = HeightMap::new(Point2::new(10.0, 10.0), Vector2::new(2.0, 1.0)).unwrap();
    for p in grid_points() {
        flat.insert(p.x + 10.0, p.y + 10.0, 3.0);
    }
    assert_eq!(flat.node_count(), 1);
    assert_eq!(flat.estimate_height_at_location(10.0, 10.0), (10, 3.0));

    // 子节点太小，不分裂
    let config = HeightMapConfig {
        min_extent_ratio: 0.6,
        ..HeightMapConfig::default()
    };
    let mut coarse =
        HeightMap::with_config(Point2::origin(), Vector2::new(1.0, 1.0), config).unwrap();
    for p in grid_points() {
        coarse.insert(p.x, p.y, p.z);
    }
    assert_eq!(coarse.node_count(), 1);

    // 分裂后没有数据的格子
    let config = HeightMapConfig {
        split_count: 4,
        ..HeightMapConfig::default()
    };
    let mut map = HeightMap::with_config(Point2::origin(), Vector2::new(1.0, 1.0), config).unwrap();
    for p in [
        Point3::new(0.5, 0.5, 1.0),
        Point3::new(0.25, 0.75, 2.0),
        Point3::new(0.75, 0.25, 3.0),
        Point3::new(0.75, 0.75, 4.0),
    ] {
        map.insert(p.x, p.y, p.z);
    }
    assert_eq!(map.node_count(), 9);
    assert_eq!(map.estimate_height_at_location(-0.5, -0.5), (0, f64::INFINITY));
    assert_eq!(map.estimate_height_at_location(0.8, 0.8), (2, 4.0));

    assert_eq!(
        HeightMap::new(Point2::origin(), Vector2::new(0.0, 1.0)).unwrap_err(),
        OctreeError::InvalidHeightMapExtent(0.0, 1.0)
    );
    assert!(HeightMap::new(Point2::origin(), Vector2::new(1.0, f64::NAN)).is_err());
}

#[test]
fn test_aggregation() {
    use crate::payload::ExplicitFreeSpaceLeaf;
    use crate::policy::TraverseSegmentInsertPolicy;
    use crate::query::AabbQuery;
    use approx::assert_relative_eq;

    let mut tree: Octree<f64, ExplicitFreeSpaceLeaf<f64>, TraverseSegmentInsertPolicy> =
        Octree::new(4.0, 3).unwrap();
    tree.insert(&Point3::new(1.5, 1.5, 3.9), &Point3::new(1.5, 1.5, 0.5));
    tree.insert(&Point3::new(1.5, 1.5, 3.9), &Point3::new(1.3, 1.4, 2.6));
    tree.insert(&Point3::new(-2.5, 0.5, 3.9), &Point3::new(-2.5, 0.5, -3.5));

    let map = HeightMap::new(Point2::origin(), Vector2::new(4.0, 4.0)).unwrap();
    let mut agg = HeightMapAggregation::new(
        map,
        &Vector3::new(2.0, 0.0, 0.0),
        &Vector3::new(1.0, 1.0, 0.0),
    )
    .unwrap();
    let (x, y, n) = agg.basis();
    assert_relative_eq!(x, Vector3::x(), epsilon = 1e-12);
    assert_relative_eq!(y, Vector3::y(), epsilon = 1e-12);
    assert_relative_eq!(n, Vector3::z(), epsilon = 1e-12);

    tree.serialize_into(&mut agg);
    // 只有命中过的体素被计入，点数不足，不分裂
    assert!(tree.len() > 3);
    assert_eq!(agg.height_map().node_count(), 1);
    assert_eq!(agg.height_map().estimate_height_at_location(1.5, 1.5), (3, 3.0));
    assert_relative_eq!(agg.height_map().cells()[0].mean, 1.0 / 3.0, epsilon = 1e-12);
    assert_eq!(agg.skipped(), 0);

    // 查询只覆盖x正半边
    let map = HeightMap::new(Point2::origin(), Vector2::new(4.0, 4.0)).unwrap();
    let mut agg = HeightMapAggregation::new(map, &Vector3::x(), &Vector3::y()).unwrap();
    let q = AabbQuery::from_min_max(&Point3::new(0.1, -4.0, -4.0), &Point3::new(4.0, 4.0, 4.0));
    agg.aggregate(&tree, &q);
    assert_eq!(agg.height_map().estimate_height_at_location(-2.5, 0.5), (2, 3.0));

    // 投影到yz平面，体素中心的x坐标超出范围
    let map = HeightMap::new(Point2::origin(), Vector2::new(1.0, 4.0)).unwrap();
    let mut agg = HeightMapAggregation::new(map, &Vector3::y(), &Vector3::z()).unwrap();
    tree.serialize_into(&mut agg);
    assert_eq!(agg.skipped(), 2);
    assert_eq!(agg.into_height_map().estimate_height_at_location(0.5, -3.5), (1, -2.0));

    let map = HeightMap::new(Point2::origin(), Vector2::new(4.0, 4.0)).unwrap();
    assert_eq!(
        HeightMapAggregation::new(map, &Vector3::x(), &Vector3::new(-3.0, 0.0, 0.0)).unwrap_err(),
        OctreeError::DegenerateBasis
    );
}
