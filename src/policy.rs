//! 插入策略，下降时决定射线是否进入某个子节点，与叶节点类型无关

use nalgebra::{Point3, Vector3};

use crate::geometry::{point_intersects_aabb, segment_intersects_aabb, Real};

/// 插入策略
pub trait InsertPolicy<S: Real> {
    /// 需传入子节点中心和半边长、射线起点和终点、射线方向的倒数
    fn should_enter(
        child_center: &Point3<S>,
        child_half_extent: S,
        origin: &Point3<S>,
        target: &Point3<S>,
        reciprocal_direction: &Vector3<S>,
    ) -> bool;
}

/// 只进入包含终点的子节点，用于只记录命中的模型
#[derive(Debug, Clone, Copy, Default)]
pub struct TraverseBoxInsertPolicy;

impl<S: Real> InsertPolicy<S> for TraverseBoxInsertPolicy {
    #[inline]
    fn should_enter(
        child_center: &Point3<S>,
        child_half_extent: S,
        _origin: &Point3<S>,
        target: &Point3<S>,
        _reciprocal_direction: &Vector3<S>,
    ) -> bool {
        point_intersects_aabb(target, child_center, child_half_extent)
    }
}

/// 进入线段经过的所有子节点，用于记录空闲空间
#[derive(Debug, Clone, Copy, Default)]
pub struct TraverseSegmentInsertPolicy;

impl<S: Real> InsertPolicy<S> for TraverseSegmentInsertPolicy {
    #[inline]
    fn should_enter(
        child_center: &Point3<S>,
        child_half_extent: S,
        origin: &Point3<S>,
        _target: &Point3<S>,
        reciprocal_direction: &Vector3<S>,
    ) -> bool {
        segment_intersects_aabb(child_half_extent, child_center, origin, reciprocal_direction)
    }
}

#[test]
fn test_policies() {
    let origin = Point3::new(-4.0f64, 0.5, 0.5);
    let target = Point3::new(0.5, 0.5, 0.5);
    let rd = crate::geometry::reciprocal(&(target - origin));
    let passed = Point3::new(-1.5, 0.5, 0.5);
    let hit = Point3::new(0.5, 0.5, 0.5);
    let beside = Point3::new(-1.5, 2.5, 0.5);

    assert!(!TraverseBoxInsertPolicy::should_enter(&passed, 0.5, &origin, &target, &rd));
    assert!(TraverseBoxInsertPolicy::should_enter(&hit, 0.5, &origin, &target, &rd));
    assert!(TraverseSegmentInsertPolicy::should_enter(&passed, 0.5, &origin, &target, &rd));
    assert!(TraverseSegmentInsertPolicy::should_enter(&hit, 0.5, &origin, &target, &rd));
    assert!(!TraverseSegmentInsertPolicy::should_enter(&beside, 0.5, &origin, &target, &rd));
}
