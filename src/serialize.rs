//! 序列化接口
//! 先传入树的头信息，再逐个传入叶节点，具体的输出格式由实现方决定。

use nalgebra::Point3;

use crate::geometry::Real;
use crate::key::VoxelKey;
use crate::octree::Octree;
use crate::payload::LeafPayload;
use crate::policy::InsertPolicy;

/// 接收树数据的对象
pub trait OctreeSink<S: Real, L: LeafPayload<S>, P: InsertPolicy<S>> {
    /// 遍历前调用一次
    fn header(&mut self, tree: &Octree<S, L, P>);
    /// 每个叶节点调用一次，需传入叶节点中心和半边长
    fn visit(&mut self, leaf: &L, center: &Point3<S>, half_extent: S);
}

/// 把整棵树写入sink
pub fn serialize<S, L, P, K>(tree: &Octree<S, L, P>, sink: &mut K)
where
    S: Real,
    L: LeafPayload<S>,
    P: InsertPolicy<S>,
    K: OctreeSink<S, L, P> + ?Sized,
{
    sink.header(tree);
    tree.visit_all_leaves(|leaf, center, half| sink.visit(leaf, center, half));
}

impl<S: Real, L: LeafPayload<S>, P: InsertPolicy<S>> Octree<S, L, P> {
    pub fn serialize_into<K: OctreeSink<S, L, P> + ?Sized>(&self, sink: &mut K) {
        serialize(self, sink)
    }
}

/// 一个叶节点的摘要
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelRecord<S: Real> {
    pub key: VoxelKey,
    pub center: Point3<S>,
    pub half_extent: S,
    pub occupied_count: u64,
    pub centroid: Point3<S>,
}

/// 收集叶节点摘要的sink，可作为点云输出的中间结果
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelCloud<S: Real> {
    /// 叶节点的边长
    pub voxel_size: S,
    pub records: Vec<VoxelRecord<S>>,
}

impl<S: Real> Default for VoxelCloud<S> {
    fn default() -> Self {
        VoxelCloud {
            voxel_size: S::zero(),
            records: Vec::new(),
        }
    }
}

impl<S: Real> VoxelCloud<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只保留被命中过的叶节点
    pub fn occupied(&self) -> impl Iterator<Item = &VoxelRecord<S>> {
        self.records.iter().filter(|r| r.occupied_count > 0)
    }
}

impl<S: Real, L: LeafPayload<S>, P: InsertPolicy<S>> OctreeSink<S, L, P> for VoxelCloud<S> {
    fn header(&mut self, tree: &Octree<S, L, P>) {
        self.voxel_size = tree.voxel_half_extent() * (S::one() + S::one());
        self.records.clear();
        self.records.reserve(tree.len());
    }

    fn visit(&mut self, leaf: &L, center: &Point3<S>, half_extent: S) {
        self.records.push(VoxelRecord {
            key: leaf.sort_key(),
            center: *center,
            half_extent,
            occupied_count: leaf.occupied_count(),
            centroid: leaf.centroid(),
        });
    }
}

#[test]
fn test_voxel_cloud() {
    use crate::payload::ExplicitFreeSpaceLeaf;
    use crate::policy::TraverseSegmentInsertPolicy;

    let mut tree: Octree<f64, ExplicitFreeSpaceLeaf<f64>, TraverseSegmentInsertPolicy> =
        Octree::new(2.0, 2).unwrap();
    tree.insert(&Point3::new(-1.9, 0.25, 0.25), &Point3::new(1.5, 0.25, 0.25));

    let mut cloud = VoxelCloud::new();
    tree.serialize_into(&mut cloud);
    assert_eq!(cloud.voxel_size, 1.0);
    assert_eq!(cloud.records.len(), tree.len());
    assert_eq!(cloud.records.len(), 4);
    let hits: Vec<_> = cloud.occupied().collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].center, Point3::new(1.5, 0.5, 0.5));
    assert_eq!(hits[0].centroid, Point3::new(1.5, 0.25, 0.25));
    for r in cloud.records.iter() {
        assert_eq!(tree.voxel_center(r.key).unwrap(), r.center);
        assert_eq!(r.half_extent, 0.5);
    }

    // 再次写入会覆盖之前的数据
    serialize(&tree, &mut cloud);
    assert_eq!(cloud.records.len(), 4);
}
