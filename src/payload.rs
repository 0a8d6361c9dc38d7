//! 叶节点的统计数据
//! 每种统计是一个独立的状态结构，具体的叶节点类型按固定顺序组合它们:
//! 先更新OccupiedCount，后面的统计要读取刚加1的计数。
//! 合并与参数顺序无关，merge(a, b)与merge(b, a)逐位相等。

use std::fmt::Debug;

use nalgebra::{Matrix3, Point3, Vector3};

use crate::geometry::{from_count, point_intersects_aabb, Real};
use crate::key::VoxelKey;

/// 命中计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OccupiedCount {
    pub count: u64,
}

impl OccupiedCount {
    #[inline]
    pub fn update(&mut self) {
        self.count += 1;
    }

    #[inline]
    pub fn merge(a: &Self, b: &Self) -> Self {
        OccupiedCount {
            count: a.count + b.count,
        }
    }
}

/// 依赖命中计数的统计
pub trait Mixin<S: Real>: Clone + Default {
    /// count为本次更新之后的计数
    fn update(&mut self, count: u64, origin: &Point3<S>, target: &Point3<S>);
    /// 计数为0的一边直接忽略
    fn merge(a: &Self, count_a: u64, b: &Self, count_b: u64) -> Self;
}

/// 质心及未归一化的二阶中心矩
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialMoments<S: Real> {
    pub centroid: Point3<S>,
    pub xx: S,
    pub xy: S,
    pub xz: S,
    pub yy: S,
    pub yz: S,
    pub zz: S,
}

impl<S: Real> Default for SpatialMoments<S> {
    fn default() -> Self {
        let zero = S::zero();
        SpatialMoments {
            centroid: Point3::origin(),
            xx: zero,
            xy: zero,
            xz: zero,
            yy: zero,
            yz: zero,
            zz: zero,
        }
    }
}

impl<S: Real> SpatialMoments<S> {
    #[inline]
    pub fn centroid(&self) -> Point3<S> {
        self.centroid
    }

    /// 对称的二阶矩矩阵
    pub fn second_moments(&self) -> Matrix3<S> {
        Matrix3::new(
            self.xx, self.xy, self.xz, //
            self.xy, self.yy, self.yz, //
            self.xz, self.yz, self.zz,
        )
    }

    /// 样本协方差，少于2个点时没有定义
    pub fn covariance(&self, count: u64) -> Option<Matrix3<S>> {
        if count < 2 {
            return None;
        }
        Some(self.second_moments() / from_count::<S>(count - 1))
    }
}

impl<S: Real> Mixin<S> for SpatialMoments<S> {
    fn update(&mut self, count: u64, _origin: &Point3<S>, target: &Point3<S>) {
        // Welford: 更新前的偏差乘以更新后的偏差
        let d = target - self.centroid;
        self.centroid += d / from_count::<S>(count);
        let d2 = target - self.centroid;
        self.xx += d.x * d2.x;
        self.xy += d.x * d2.y;
        self.xz += d.x * d2.z;
        self.yy += d.y * d2.y;
        self.yz += d.y * d2.z;
        self.zz += d.z * d2.z;
    }

    fn merge(a: &Self, count_a: u64, b: &Self, count_b: u64) -> Self {
        if count_a == 0 {
            return *b;
        }
        if count_b == 0 {
            return *a;
        }
        let na = from_count::<S>(count_a);
        let nb = from_count::<S>(count_b);
        let n = na + nb;
        let d = b.centroid - a.centroid;
        let w = na * nb / n;
        // Chan等人的并行合并公式
        SpatialMoments {
            centroid: Point3::from((a.centroid.coords * na + b.centroid.coords * nb) / n),
            xx: a.xx + b.xx + d.x * d.x * w,
            xy: a.xy + b.xy + d.x * d.y * w,
            xz: a.xz + b.xz + d.x * d.z * w,
            yy: a.yy + b.yy + d.y * d.y * w,
            yz: a.yz + b.yz + d.y * d.z * w,
            zz: a.zz + b.zz + d.z * d.z * w,
        }
    }
}

/// 观测方向的均值，方向为起点指向终点的单位向量
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewDirection<S: Real> {
    pub mean: Vector3<S>,
}

impl<S: Real> Default for ViewDirection<S> {
    fn default() -> Self {
        ViewDirection {
            mean: Vector3::zeros(),
        }
    }
}

impl<S: Real> Mixin<S> for ViewDirection<S> {
    fn update(&mut self, count: u64, origin: &Point3<S>, target: &Point3<S>) {
        // 起点终点重合时没有方向，按零向量计入
        let dir = (target - origin)
            .try_normalize(S::zero())
            .unwrap_or_else(Vector3::zeros);
        self.mean += (dir - self.mean) / from_count::<S>(count);
    }

    fn merge(a: &Self, count_a: u64, b: &Self, count_b: u64) -> Self {
        if count_a == 0 {
            return *b;
        }
        if count_b == 0 {
            return *a;
        }
        let na = from_count::<S>(count_a);
        let nb = from_count::<S>(count_b);
        ViewDirection {
            mean: (a.mean * na + b.mean * nb) / (na + nb),
        }
    }
}

/// 叶节点数据
pub trait LeafPayload<S: Real>: Clone + Default + Debug {
    /// 叶节点的键，合并时用来排序
    fn sort_key(&self) -> VoxelKey;
    fn set_sort_key(&mut self, key: VoxelKey);
    /// 一次插入经过该叶节点，需传入叶节点的中心和半边长、射线起点和终点
    fn update(
        &mut self,
        volume_center: &Point3<S>,
        volume_half_extent: S,
        origin: &Point3<S>,
        target: &Point3<S>,
    );
    /// 合并同一个键的两个叶节点
    fn merge(a: &Self, b: &Self) -> Self;
    /// 终点落在该叶节点的次数
    fn occupied_count(&self) -> u64;
    fn centroid(&self) -> Point3<S>;
}

/// 只记录终点的叶节点，配合TraverseBoxInsertPolicy使用
#[derive(Debug, Clone, PartialEq)]
pub struct OccupiedOnlyLeaf<S: Real> {
    pub sort_key: VoxelKey,
    pub occupied: OccupiedCount,
    pub moments: SpatialMoments<S>,
}

impl<S: Real> Default for OccupiedOnlyLeaf<S> {
    fn default() -> Self {
        OccupiedOnlyLeaf {
            sort_key: 0,
            occupied: OccupiedCount::default(),
            moments: SpatialMoments::default(),
        }
    }
}

impl<S: Real> OccupiedOnlyLeaf<S> {
    pub fn covariance(&self) -> Option<Matrix3<S>> {
        self.moments.covariance(self.occupied.count)
    }
}

impl<S: Real> LeafPayload<S> for OccupiedOnlyLeaf<S> {
    #[inline]
    fn sort_key(&self) -> VoxelKey {
        self.sort_key
    }
    #[inline]
    fn set_sort_key(&mut self, key: VoxelKey) {
        self.sort_key = key;
    }

    // 是否进入该叶节点由插入策略决定，这里无条件更新
    #[inline]
    fn update(
        &mut self,
        _volume_center: &Point3<S>,
        _volume_half_extent: S,
        origin: &Point3<S>,
        target: &Point3<S>,
    ) {
        self.occupied.update();
        self.moments.update(self.occupied.count, origin, target);
    }

    fn merge(a: &Self, b: &Self) -> Self {
        OccupiedOnlyLeaf {
            sort_key: a.sort_key,
            occupied: OccupiedCount::merge(&a.occupied, &b.occupied),
            moments: SpatialMoments::merge(
                &a.moments,
                a.occupied.count,
                &b.moments,
                b.occupied.count,
            ),
        }
    }

    #[inline]
    fn occupied_count(&self) -> u64 {
        self.occupied.count
    }
    #[inline]
    fn centroid(&self) -> Point3<S> {
        self.moments.centroid
    }
}

/// 同时记录空闲空间的叶节点，配合TraverseSegmentInsertPolicy使用
/// 射线穿过但终点不在其中的叶节点只增加empty_count
#[derive(Debug, Clone, PartialEq)]
pub struct ExplicitFreeSpaceLeaf<S: Real> {
    pub sort_key: VoxelKey,
    pub empty_count: u64,
    pub occupied: OccupiedCount,
    pub moments: SpatialMoments<S>,
    pub view: ViewDirection<S>,
}

impl<S: Real> Default for ExplicitFreeSpaceLeaf<S> {
    fn default() -> Self {
        ExplicitFreeSpaceLeaf {
            sort_key: 0,
            empty_count: 0,
            occupied: OccupiedCount::default(),
            moments: SpatialMoments::default(),
            view: ViewDirection::default(),
        }
    }
}

impl<S: Real> ExplicitFreeSpaceLeaf<S> {
    pub fn covariance(&self) -> Option<Matrix3<S>> {
        self.moments.covariance(self.occupied.count)
    }

    /// 平均观测方向，不一定是单位向量
    pub fn mean_view_direction(&self) -> Vector3<S> {
        self.view.mean
    }

    /// 命中次数占经过次数的比例
    pub fn occupancy_ratio(&self) -> S {
        let total = self.occupied.count + self.empty_count;
        if total == 0 {
            return S::zero();
        }
        from_count::<S>(self.occupied.count) / from_count::<S>(total)
    }
}

impl<S: Real> LeafPayload<S> for ExplicitFreeSpaceLeaf<S> {
    #[inline]
    fn sort_key(&self) -> VoxelKey {
        self.sort_key
    }
    #[inline]
    fn set_sort_key(&mut self, key: VoxelKey) {
        self.sort_key = key;
    }

    fn update(
        &mut self,
        volume_center: &Point3<S>,
        volume_half_extent: S,
        origin: &Point3<S>,
        target: &Point3<S>,
    ) {
        if point_intersects_aabb(target, volume_center, volume_half_extent) {
            self.occupied.update();
            let count = self.occupied.count;
            self.moments.update(count, origin, target);
            self.view.update(count, origin, target);
        } else {
            self.empty_count += 1;
        }
    }

    fn merge(a: &Self, b: &Self) -> Self {
        let (na, nb) = (a.occupied.count, b.occupied.count);
        ExplicitFreeSpaceLeaf {
            sort_key: a.sort_key,
            empty_count: a.empty_count + b.empty_count,
            occupied: OccupiedCount::merge(&a.occupied, &b.occupied),
            moments: SpatialMoments::merge(&a.moments, na, &b.moments, nb),
            view: ViewDirection::merge(&a.view, na, &b.view, nb),
        }
    }

    #[inline]
    fn occupied_count(&self) -> u64 {
        self.occupied.count
    }
    #[inline]
    fn centroid(&self) -> Point3<S> {
        self.moments.centroid
    }
}

#[cfg(test)]
fn accumulate(points: &[Point3<f64>]) -> OccupiedOnlyLeaf<f64> {
    let mut leaf = OccupiedOnlyLeaf::default();
    for p in points {
        leaf.update(&Point3::origin(), 1.0, &Point3::origin(), p);
    }
    leaf
}

#[test]
fn test_moments_update() {
    use approx::assert_relative_eq;

    let points = [
        Point3::new(1.0, 2.0, 3.0),
        Point3::new(-1.0, 0.5, 2.0),
        Point3::new(0.25, -3.0, 1.0),
        Point3::new(2.0, 2.0, -1.0),
    ];
    let leaf = accumulate(&points);
    assert_eq!(leaf.occupied_count(), 4);
    let mean = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / 4.0;
    assert_relative_eq!(leaf.centroid().coords, mean, epsilon = 1e-12);
    let mut m = Matrix3::zeros();
    for p in points.iter() {
        let d = p.coords - mean;
        m += d * d.transpose();
    }
    assert_relative_eq!(leaf.moments.second_moments(), m, epsilon = 1e-12);
    assert_relative_eq!(leaf.covariance().unwrap(), m / 3.0, epsilon = 1e-12);
    assert!(accumulate(&points[..1]).covariance().is_none());
}

#[test]
fn test_moments_merge() {
    use approx::assert_relative_eq;

    let points: Vec<_> = (0..20)
        .map(|i| {
            let t = i as f64;
            Point3::new(t.sin() * 3.0, (t * 0.7).cos(), t * 0.1 - 1.0)
        })
        .collect();
    let whole = accumulate(&points);
    let a = accumulate(&points[..7]);
    let b = accumulate(&points[7..]);
    let ab = OccupiedOnlyLeaf::merge(&a, &b);
    let ba = OccupiedOnlyLeaf::merge(&b, &a);
    // 合并与参数顺序无关
    assert_eq!(ab, ba);
    assert_eq!(ab.occupied_count(), 20);
    // 交叉项可能接近0，用二阶矩的迹作为量级
    let scale = whole.moments.xx + whole.moments.yy + whole.moments.zz;
    let tolerance = 50.0 * f64::EPSILON * scale;
    for (x, y) in [
        (ab.moments.xx, whole.moments.xx),
        (ab.moments.xy, whole.moments.xy),
        (ab.moments.xz, whole.moments.xz),
        (ab.moments.yy, whole.moments.yy),
        (ab.moments.yz, whole.moments.yz),
        (ab.moments.zz, whole.moments.zz),
    ] {
        assert!((x - y).abs() <= tolerance, "{} vs {}", x, y);
    }
    assert_relative_eq!(ab.centroid(), whole.centroid(), epsilon = 1e-12);

    // 空的一边直接复制
    let empty = OccupiedOnlyLeaf::default();
    assert_eq!(OccupiedOnlyLeaf::merge(&a, &empty).moments, a.moments);
    assert_eq!(OccupiedOnlyLeaf::merge(&empty, &a).moments, a.moments);
}

#[test]
fn test_free_space_leaf() {
    use approx::assert_relative_eq;

    let center = Point3::new(0.5f64, 0.5, 0.5);
    let mut leaf = ExplicitFreeSpaceLeaf::default();
    let origin = Point3::new(0.5, 0.5, -10.0);
    // 终点不在体素内，只记空闲
    leaf.update(&center, 0.5, &origin, &Point3::new(0.5, 0.5, 5.0));
    assert_eq!(leaf.empty_count, 1);
    assert_eq!(leaf.occupied_count(), 0);
    assert_eq!(leaf.occupancy_ratio(), 0.0);

    leaf.update(&center, 0.5, &origin, &Point3::new(0.5, 0.5, 0.75));
    leaf.update(&center, 0.5, &Point3::new(0.5, 10.0, 0.5), &Point3::new(0.5, 0.25, 0.5));
    assert_eq!(leaf.empty_count, 1);
    assert_eq!(leaf.occupied_count(), 2);
    assert_relative_eq!(
        leaf.mean_view_direction(),
        Vector3::new(0.0, -0.5, 0.5),
        epsilon = 1e-12
    );
    assert_relative_eq!(leaf.occupancy_ratio(), 2.0 / 3.0, epsilon = 1e-12);

    let other = leaf.clone();
    let merged = ExplicitFreeSpaceLeaf::merge(&leaf, &other);
    assert_eq!(merged.empty_count, 2);
    assert_eq!(merged.occupied_count(), 4);
    assert_relative_eq!(merged.mean_view_direction(), leaf.mean_view_direction(), epsilon = 1e-12);
}
