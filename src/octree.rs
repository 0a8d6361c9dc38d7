//! 稠密建图八叉树
//! 空间为以原点为中心的立方体，节点用VoxelKey寻址。
//! 叶节点数据存放在连续的Vec中，另有键到下标的映射；
//! 每个内部节点用一个字节记录哪些子节点被访问过(占用草图)，查询时只进入置位的子节点。
//! 树只会通过insert增长，合并会产生一棵新树，不修改输入。

use std::collections::HashMap;
use std::marker::PhantomData;

use nalgebra::{Point3, Vector3};

use crate::config::OctreeConfig;
use crate::error::{OctreeError, Result};
use crate::geometry::{point_intersects_aabb, reciprocal, to_f64, Real};
use crate::key::{box_center_from_index, child_key, octant_of, octant_offset, VoxelKey, ROOT_KEY};
use crate::payload::LeafPayload;
use crate::policy::InsertPolicy;
use crate::query::{AabbQuery, Query};

/// 八叉树
///
/// + `S`: 标量，f32/f64
/// + `L`: 叶节点数据
/// + `P`: 插入策略
#[derive(Debug, Clone)]
pub struct Octree<S: Real, L: LeafPayload<S>, P: InsertPolicy<S>> {
    volume_half_extent: S,
    max_depth: u32,
    leaves: Vec<L>,                        // 按插入顺序存放的叶节点
    leaf_index: HashMap<VoxelKey, usize>,  // 叶节点的键到下标
    sketch: HashMap<VoxelKey, u8>,         // 内部节点的键到子节点占用位
    policy: PhantomData<P>,
}

impl<S: Real, L: LeafPayload<S>, P: InsertPolicy<S>> Octree<S, L, P> {
    /// 构建树
    ///
    /// 需传入立方体空间的半边长，及叶节点深度(不超过16)
    pub fn new(volume_half_extent: S, max_depth: u32) -> Result<Self> {
        Self::with_config(&OctreeConfig::new(volume_half_extent, max_depth))
    }

    pub fn with_config(config: &OctreeConfig<S>) -> Result<Self> {
        config.validate()?;
        log::debug!(
            "octree created, half extent: {}, max depth: {}",
            to_f64(config.volume_half_extent),
            config.max_depth
        );
        Ok(Octree {
            volume_half_extent: config.volume_half_extent,
            max_depth: config.max_depth,
            leaves: Vec::new(),
            leaf_index: HashMap::new(),
            sketch: HashMap::new(),
            policy: PhantomData,
        })
    }

    #[inline]
    pub fn volume_half_extent(&self) -> S {
        self.volume_half_extent
    }

    #[inline]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    #[inline]
    pub fn config(&self) -> OctreeConfig<S> {
        OctreeConfig::new(self.volume_half_extent, self.max_depth)
    }

    /// 叶节点的半边长
    #[inline]
    pub fn voxel_half_extent(&self) -> S {
        self.config().voxel_half_extent()
    }

    /// 叶节点数量
    #[inline]
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// 所有叶节点，插入产生的树为插入顺序，合并产生的树按键排序
    #[inline]
    pub fn leaves(&self) -> &[L] {
        &self.leaves
    }

    /// 获取指定键的叶节点
    pub fn get(&self, key: VoxelKey) -> Option<&L> {
        self.leaf_index.get(&key).map(|&i| &self.leaves[i])
    }

    /// 检查是否包含某个叶节点
    pub fn contains_key(&self, key: VoxelKey) -> bool {
        self.leaf_index.contains_key(&key)
    }

    /// 内部节点的子节点占用位，bit i 置位表示第i个子节点被访问过
    pub fn occupancy(&self, key: VoxelKey) -> Option<u8> {
        self.sketch.get(&key).copied()
    }

    /// 解码指定键的节点中心
    pub fn voxel_center(&self, key: VoxelKey) -> Result<Point3<S>> {
        box_center_from_index(key, self.volume_half_extent)
    }

    /// 包含该点的叶节点的键，不检查叶节点是否存在，空间外返回None
    /// 点在分界面上时归到正半边
    pub fn key_at(&self, point: &Point3<S>) -> Option<VoxelKey> {
        let mut center = Point3::origin();
        let mut half = self.volume_half_extent;
        if !point_intersects_aabb(point, &center, half) {
            return None;
        }
        let two = S::one() + S::one();
        let mut key = ROOT_KEY;
        for _ in 0..self.max_depth {
            let octant = octant_of(point, &center);
            half /= two;
            center += octant_offset::<S>(octant) * half;
            key = child_key(key, octant);
        }
        Some(key)
    }

    /// 获取包含该点的叶节点
    pub fn leaf_at(&self, point: &Point3<S>) -> Option<&L> {
        self.key_at(point).and_then(|key| self.get(key))
    }

    /// 插入一条从source到target的观测，返回经过的节点数量(内部节点及叶节点)
    pub fn insert(&mut self, source: &Point3<S>, target: &Point3<S>) -> u64 {
        let reciprocal_direction = reciprocal(&(target - source));
        let mut args = InsertArgs {
            leaves: &mut self.leaves,
            leaf_index: &mut self.leaf_index,
            sketch: &mut self.sketch,
            source,
            target,
            reciprocal_direction: &reciprocal_direction,
        };
        insert::<S, L, P>(
            &mut args,
            ROOT_KEY,
            &Point3::origin(),
            self.volume_half_extent,
            self.max_depth,
        )
    }

    /// 查询，只进入查询接受并且被访问过的子节点，叶节点交给visitor
    ///
    /// visitor的参数为叶节点、叶节点中心、叶节点半边长
    pub fn query<Q, F>(&self, query: &Q, mut visitor: F)
    where
        Q: Query<S> + ?Sized,
        F: FnMut(&L, &Point3<S>, S),
    {
        // 深度为0时根节点就是叶节点，也要经过查询判断
        if !query.should_enter(&Point3::origin(), self.volume_half_extent) {
            return;
        }
        query_node(
            self,
            query,
            &mut visitor,
            ROOT_KEY,
            &Point3::origin(),
            self.volume_half_extent,
            self.max_depth,
        );
    }

    /// 遍历所有叶节点
    pub fn visit_all_leaves<F>(&self, visitor: F)
    where
        F: FnMut(&L, &Point3<S>, S),
    {
        let all = AabbQuery::new(Point3::origin(), Vector3::repeat(self.volume_half_extent));
        self.query(&all, visitor);
    }

    /// 合并两棵树，产生新树，两棵树的半边长和深度必须一致
    ///
    /// 合并结果的叶节点按键排序，所以与合并方向无关
    pub fn merge(&self, other: &Self) -> Result<Self> {
        if self.volume_half_extent != other.volume_half_extent || self.max_depth != other.max_depth
        {
            return Err(OctreeError::IncompatibleTrees {
                left_half_extent: to_f64(self.volume_half_extent),
                right_half_extent: to_f64(other.volume_half_extent),
                left_depth: self.max_depth,
                right_depth: other.max_depth,
            });
        }
        let mut leaves = Vec::with_capacity(self.leaves.len() + other.leaves.len());
        for (key, &i) in self.leaf_index.iter() {
            match other.leaf_index.get(key) {
                Some(&j) => leaves.push(L::merge(&self.leaves[i], &other.leaves[j])),
                None => leaves.push(self.leaves[i].clone()),
            }
        }
        for (key, &j) in other.leaf_index.iter() {
            if !self.leaf_index.contains_key(key) {
                leaves.push(other.leaves[j].clone());
            }
        }
        leaves.sort_unstable_by_key(|leaf| leaf.sort_key());
        let leaf_index = leaves
            .iter()
            .enumerate()
            .map(|(i, leaf)| (leaf.sort_key(), i))
            .collect();

        let mut sketch = self.sketch.clone();
        for (key, bits) in other.sketch.iter() {
            *sketch.entry(*key).or_insert(0) |= *bits;
        }
        log::debug!(
            "octree merged, leaves: {} + {} -> {}, interior nodes: {}",
            self.leaves.len(),
            other.leaves.len(),
            leaves.len(),
            sketch.len()
        );
        Ok(Octree {
            volume_half_extent: self.volume_half_extent,
            max_depth: self.max_depth,
            leaves,
            leaf_index,
            sketch,
            policy: PhantomData,
        })
    }
}

//////////////////////////////////////////////////////本地/////////////////////////////////////////////////////////////////

// 插入时不变的参数
struct InsertArgs<'a, S: Real, L> {
    leaves: &'a mut Vec<L>,
    leaf_index: &'a mut HashMap<VoxelKey, usize>,
    sketch: &'a mut HashMap<VoxelKey, u8>,
    source: &'a Point3<S>,
    target: &'a Point3<S>,
    reciprocal_direction: &'a Vector3<S>,
}

// 递归下降插入，返回经过的节点数
fn insert<S: Real, L: LeafPayload<S>, P: InsertPolicy<S>>(
    args: &mut InsertArgs<S, L>,
    key: VoxelKey,
    center: &Point3<S>,
    half_extent: S,
    remaining_depth: u32,
) -> u64 {
    if remaining_depth == 0 {
        let leaves = &mut *args.leaves;
        let index = *args.leaf_index.entry(key).or_insert_with(|| {
            let mut leaf = L::default();
            leaf.set_sort_key(key);
            leaves.push(leaf);
            leaves.len() - 1
        });
        leaves[index].update(center, half_extent, args.source, args.target);
        return 1;
    }
    let child_half = half_extent / (S::one() + S::one());
    let mut visited = 1;
    for octant in 0..8 {
        let child_center = center + octant_offset::<S>(octant) * child_half;
        if P::should_enter(
            &child_center,
            child_half,
            args.source,
            args.target,
            args.reciprocal_direction,
        ) {
            *args.sketch.entry(key).or_insert(0) |= 1 << octant;
            visited += insert::<S, L, P>(
                args,
                child_key(key, octant),
                &child_center,
                child_half,
                remaining_depth - 1,
            );
        }
    }
    visited
}

// 递归查询
fn query_node<S, L, P, Q, F>(
    tree: &Octree<S, L, P>,
    query: &Q,
    visitor: &mut F,
    key: VoxelKey,
    center: &Point3<S>,
    half_extent: S,
    remaining_depth: u32,
) where
    S: Real,
    L: LeafPayload<S>,
    P: InsertPolicy<S>,
    Q: Query<S> + ?Sized,
    F: FnMut(&L, &Point3<S>, S),
{
    if remaining_depth == 0 {
        if let Some(&i) = tree.leaf_index.get(&key) {
            visitor(&tree.leaves[i], center, half_extent);
        }
        return;
    }
    let bits = match tree.sketch.get(&key) {
        Some(bits) => *bits,
        _ => return,
    };
    let child_half = half_extent / (S::one() + S::one());
    for octant in 0..8 {
        if bits & (1 << octant) == 0 {
            continue;
        }
        let child_center = center + octant_offset::<S>(octant) * child_half;
        if query.should_enter(&child_center, child_half) {
            query_node(
                tree,
                query,
                visitor,
                child_key(key, octant),
                &child_center,
                child_half,
                remaining_depth - 1,
            );
        }
    }
}

#[cfg(test)]
use crate::payload::{ExplicitFreeSpaceLeaf, OccupiedOnlyLeaf};
#[cfg(test)]
use crate::policy::{TraverseBoxInsertPolicy, TraverseSegmentInsertPolicy};

#[cfg(test)]
type OccupiedTree = Octree<f64, OccupiedOnlyLeaf<f64>, TraverseBoxInsertPolicy>;
#[cfg(test)]
type FreeSpaceTree = Octree<f64, ExplicitFreeSpaceLeaf<f64>, TraverseSegmentInsertPolicy>;

#[test]
fn test_new() {
    assert!(OccupiedTree::new(1.0, 16).is_ok());
    assert!(OccupiedTree::new(1.0, 0).is_ok());
    assert_eq!(
        OccupiedTree::new(1.0, 17).unwrap_err(),
        OctreeError::InvalidDepth {
            depth: 17,
            limit: 16
        }
    );
    assert_eq!(
        OccupiedTree::new(0.0, 4).unwrap_err(),
        OctreeError::InvalidHalfExtent(0.0)
    );
    assert!(OccupiedTree::new(-1.0, 4).is_err());
    let tree = OccupiedTree::new(2.0, 3).unwrap();
    assert!(tree.is_empty());
    assert_eq!(tree.voxel_half_extent(), 0.25);
}

#[test]
fn test_insert_single_point() {
    let mut tree = OccupiedTree::new(1.0, 3).unwrap();
    let target = Point3::new(0.3, -0.6, 0.1);
    // 根、第一层、第二层、叶
    assert_eq!(tree.insert(&Point3::new(5.0, 5.0, 5.0), &target), 4);
    assert_eq!(tree.len(), 1);
    let leaf = &tree.leaves()[0];
    assert_eq!(leaf.occupied_count(), 1);
    assert_eq!(leaf.centroid(), target);
    let key = tree.key_at(&target).unwrap();
    assert_eq!(leaf.sort_key(), key);
    assert_eq!(tree.get(key), Some(leaf));
    assert_eq!(tree.leaf_at(&target), Some(leaf));
    assert_eq!(tree.occupancy(ROOT_KEY), Some(1 << octant_of(&target, &Point3::origin())));

    let center = tree.voxel_center(key).unwrap();
    let h = tree.voxel_half_extent();
    assert!(point_intersects_aabb(&target, &center, h));
    assert!(tree.key_at(&Point3::new(1.5, 0.0, 0.0)).is_none());
}

#[test]
fn test_insert_twice() {
    let mut tree = OccupiedTree::new(1.0, 4).unwrap();
    let source = Point3::new(0.0, 0.0, 3.0);
    let target = Point3::new(0.21, 0.43, -0.77);
    tree.insert(&source, &target);
    let keys: Vec<_> = tree.leaves().iter().map(|l| l.sort_key()).collect();
    let count = tree.leaves()[0].occupied_count();
    tree.insert(&source, &target);
    let again: Vec<_> = tree.leaves().iter().map(|l| l.sort_key()).collect();
    assert_eq!(keys, again);
    assert_eq!(tree.leaves()[0].occupied_count(), count * 2);
}

#[test]
fn test_corner_fan_out() {
    for depth in 2..6 {
        let mut tree = FreeSpaceTree::new(0.5, depth).unwrap();
        tree.insert(&Point3::new(10.0, 20.0, 30.0), &Point3::origin());
        let mut occupied = 0;
        tree.visit_all_leaves(|leaf, center, half| {
            if leaf.occupied_count() > 0 {
                occupied += 1;
                assert!(point_intersects_aabb(&Point3::origin(), center, half));
            }
        });
        // 原点是8个叶节点共有的角点
        assert_eq!(occupied, 8, "depth {}", depth);
    }
}

#[test]
fn test_free_space_ray() {
    let mut tree = FreeSpaceTree::new(4.0, 3).unwrap();
    let source = Point3::new(-3.9, 0.5, 0.5);
    let target = Point3::new(3.5, 0.5, 0.5);
    tree.insert(&source, &target);
    // 半边长为0.5的叶节点，沿x轴排成一行
    assert_eq!(tree.len(), 8);
    let hit = tree.leaf_at(&target).unwrap();
    assert_eq!(hit.occupied_count(), 1);
    assert_eq!(hit.empty_count, 0);
    let passed = tree.leaf_at(&Point3::new(0.5, 0.5, 0.5)).unwrap();
    assert_eq!(passed.occupied_count(), 0);
    assert_eq!(passed.empty_count, 1);
}

#[test]
fn test_zero_depth() {
    let mut tree = OccupiedTree::new(1.0, 0).unwrap();
    assert_eq!(tree.insert(&Point3::origin(), &Point3::new(0.5, 0.5, 0.5)), 1);
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.leaves()[0].sort_key(), ROOT_KEY);
    let mut visited = 0;
    tree.visit_all_leaves(|_, center, half| {
        visited += 1;
        assert_eq!(*center, Point3::origin());
        assert_eq!(half, 1.0);
    });
    assert_eq!(visited, 1);

    // 与空间不相交的查询不会访问根叶节点
    let far = AabbQuery::new(Point3::new(100.0, 100.0, 100.0), Vector3::new(1.0, 1.0, 1.0));
    let mut visited = 0;
    tree.query(&far, |_, _, _| visited += 1);
    assert_eq!(visited, 0);
    let near = AabbQuery::new(Point3::new(1.5, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0));
    tree.query(&near, |_, _, _| visited += 1);
    assert_eq!(visited, 1);
}

#[test]
fn test_query() {
    let mut tree = OccupiedTree::new(8.0, 4).unwrap();
    let origin = Point3::origin();
    let targets = [
        Point3::new(1.2, 1.2, 1.2),
        Point3::new(-5.1, 2.2, 0.3),
        Point3::new(6.3, -7.1, 3.3),
        Point3::new(1.7, 1.1, 1.4),
    ];
    for t in targets.iter() {
        tree.insert(&origin, t);
    }
    let mut found = Vec::new();
    let q = AabbQuery::new(Point3::new(1.5, 1.5, 1.5), Vector3::new(0.4, 0.4, 0.4));
    tree.query(&q, |leaf, _, _| found.push(leaf.sort_key()));
    found.sort();
    let mut expect = vec![
        tree.key_at(&targets[0]).unwrap(),
        tree.key_at(&targets[3]).unwrap(),
    ];
    expect.sort();
    expect.dedup();
    assert_eq!(found, expect);

    let mut all = 0;
    tree.visit_all_leaves(|_, _, _| all += 1);
    assert_eq!(all, tree.len());

    // 闭包查询
    let mut negative_x = 0;
    tree.query(&|c: &Point3<f64>, h: f64| c.x - h < 0.0, |_, _, _| negative_x += 1);
    assert_eq!(negative_x, 1);
}

#[test]
fn test_merge() {
    let mut a = OccupiedTree::new(1.0, 3).unwrap();
    let mut b = OccupiedTree::new(1.0, 3).unwrap();
    let origin = Point3::new(0.0, 0.0, 2.0);
    let shared = Point3::new(0.1, 0.1, 0.1);
    a.insert(&origin, &shared);
    a.insert(&origin, &Point3::new(-0.6, 0.2, 0.9));
    b.insert(&origin, &shared);
    b.insert(&origin, &Point3::new(0.7, -0.7, -0.1));

    let ab = a.merge(&b).unwrap();
    let ba = b.merge(&a).unwrap();
    assert_eq!(ab.len(), 3);
    assert_eq!(ab.leaves(), ba.leaves());
    assert_eq!(ab.leaf_at(&shared).unwrap().occupied_count(), 2);
    let keys: Vec<_> = ab.leaves().iter().map(|l| l.sort_key()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    for k in [ROOT_KEY, ab.key_at(&shared).unwrap() >> 4] {
        assert_eq!(
            ab.occupancy(k),
            Some(a.occupancy(k).unwrap_or(0) | b.occupancy(k).unwrap_or(0))
        );
    }
    // 输入不变
    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);
}

#[test]
fn test_merge_incompatible() {
    let a = OccupiedTree::new(1.0, 3).unwrap();
    let b = OccupiedTree::new(2.0, 3).unwrap();
    let c = OccupiedTree::new(1.0, 4).unwrap();
    assert_eq!(
        a.merge(&b).unwrap_err(),
        OctreeError::IncompatibleTrees {
            left_half_extent: 1.0,
            right_half_extent: 2.0,
            left_depth: 3,
            right_depth: 3
        }
    );
    assert!(a.merge(&c).is_err());
}
