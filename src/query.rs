//! 查询对象，遍历时决定是否进入某个节点
//! 应用方为了功能和性能，也可以直接传入闭包作为查询

use nalgebra::{Point3, Vector3};

use crate::geometry::{
    aabb_intersects_aabb, frustum_intersects_aabb, obb_intersects_aabb, reciprocal,
    ray_intersects_aabb, segment_intersects_aabb, Frustum, Obb, Real,
};

/// 查询
pub trait Query<S: Real> {
    /// 需传入节点中心和半边长
    fn should_enter(&self, voxel_center: &Point3<S>, voxel_half_extent: S) -> bool;
}

impl<S: Real, F: Fn(&Point3<S>, S) -> bool> Query<S> for F {
    #[inline]
    fn should_enter(&self, voxel_center: &Point3<S>, voxel_half_extent: S) -> bool {
        self(voxel_center, voxel_half_extent)
    }
}

/// 轴对齐包围盒查询，接触也算相交
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AabbQuery<S: Real> {
    pub center: Point3<S>,
    pub half_extents: Vector3<S>,
}

impl<S: Real> AabbQuery<S> {
    pub fn new(center: Point3<S>, half_extents: Vector3<S>) -> Self {
        AabbQuery {
            center,
            half_extents,
        }
    }

    pub fn from_min_max(mins: &Point3<S>, maxs: &Point3<S>) -> Self {
        let two = S::one() + S::one();
        AabbQuery {
            center: nalgebra::center(mins, maxs),
            half_extents: (maxs - mins) / two,
        }
    }
}

impl<S: Real> Query<S> for AabbQuery<S> {
    #[inline]
    fn should_enter(&self, voxel_center: &Point3<S>, voxel_half_extent: S) -> bool {
        aabb_intersects_aabb(
            &self.center,
            &self.half_extents,
            voxel_center,
            &Vector3::repeat(voxel_half_extent),
        )
    }
}

impl From<&parry3d::bounding_volume::Aabb> for AabbQuery<f32> {
    fn from(aabb: &parry3d::bounding_volume::Aabb) -> Self {
        AabbQuery::new(aabb.center(), aabb.half_extents())
    }
}

/// 视锥体查询
#[derive(Debug, Clone, PartialEq)]
pub struct FrustumQuery<S: Real> {
    pub frustum: Frustum<S>,
}

impl<S: Real> FrustumQuery<S> {
    pub fn new(
        apex: Point3<S>,
        rotation_vector: &Vector3<S>,
        horizontal_half_angle: S,
        vertical_half_angle: S,
    ) -> Self {
        FrustumQuery {
            frustum: Frustum::new(apex, rotation_vector, horizontal_half_angle, vertical_half_angle),
        }
    }
}

impl<S: Real> Query<S> for FrustumQuery<S> {
    #[inline]
    fn should_enter(&self, voxel_center: &Point3<S>, voxel_half_extent: S) -> bool {
        frustum_intersects_aabb(&self.frustum, voxel_center, voxel_half_extent)
    }
}

/// 线段查询
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentQuery<S: Real> {
    pub source: Point3<S>,
    pub reciprocal_direction: Vector3<S>,
}

impl<S: Real> SegmentQuery<S> {
    pub fn new(source: Point3<S>, target: &Point3<S>) -> Self {
        SegmentQuery {
            source,
            reciprocal_direction: reciprocal(&(target - source)),
        }
    }
}

impl<S: Real> Query<S> for SegmentQuery<S> {
    #[inline]
    fn should_enter(&self, voxel_center: &Point3<S>, voxel_half_extent: S) -> bool {
        segment_intersects_aabb(
            voxel_half_extent,
            voxel_center,
            &self.source,
            &self.reciprocal_direction,
        )
    }
}

/// 射线查询
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayQuery<S: Real> {
    pub origin: Point3<S>,
    pub reciprocal_direction: Vector3<S>,
}

impl<S: Real> RayQuery<S> {
    pub fn new(origin: Point3<S>, direction: &Vector3<S>) -> Self {
        RayQuery {
            origin,
            reciprocal_direction: reciprocal(direction),
        }
    }
}

impl<S: Real> Query<S> for RayQuery<S> {
    #[inline]
    fn should_enter(&self, voxel_center: &Point3<S>, voxel_half_extent: S) -> bool {
        ray_intersects_aabb(
            voxel_half_extent,
            voxel_center,
            &self.origin,
            &self.reciprocal_direction,
        )
    }
}

/// 有向包围盒查询
#[derive(Debug, Clone, PartialEq)]
pub struct ObbQuery<S: Real> {
    pub obb: Obb<S>,
}

impl<S: Real> ObbQuery<S> {
    pub fn new(center: Point3<S>, half_extents: Vector3<S>, rotation_vector: &Vector3<S>) -> Self {
        ObbQuery {
            obb: Obb::new(center, half_extents, rotation_vector),
        }
    }
}

impl<S: Real> Query<S> for ObbQuery<S> {
    #[inline]
    fn should_enter(&self, voxel_center: &Point3<S>, voxel_half_extent: S) -> bool {
        obb_intersects_aabb(&self.obb, voxel_center, voxel_half_extent)
    }
}

#[test]
fn test_queries() {
    let c = Point3::new(0.5f64, 0.5, 0.5);
    let q = AabbQuery::from_min_max(&Point3::new(1.0, 0.0, 0.0), &Point3::new(2.0, 1.0, 1.0));
    assert_eq!(q.center, Point3::new(1.5, 0.5, 0.5));
    assert!(q.should_enter(&c, 0.5));
    assert!(!q.should_enter(&Point3::new(-0.5, 0.5, 0.5), 0.4));

    let s = SegmentQuery::new(Point3::new(-3.0, 0.5, 0.5), &Point3::new(-1.0, 0.5, 0.5));
    assert!(!s.should_enter(&c, 0.5));
    let r = RayQuery::new(Point3::new(-3.0, 0.5, 0.5), &Vector3::new(1.0, 0.0, 0.0));
    assert!(r.should_enter(&c, 0.5));

    let f = FrustumQuery::new(Point3::new(0.5, 0.5, -5.0), &Vector3::zeros(), 0.2, 0.2);
    assert!(f.should_enter(&c, 0.5));
    assert!(!f.should_enter(&Point3::new(5.5, 0.5, 0.5), 0.5));

    let o = ObbQuery::new(Point3::new(2.0, 0.5, 0.5), Vector3::new(1.2, 0.1, 0.1), &Vector3::zeros());
    assert!(o.should_enter(&c, 0.5));

    let closure = |center: &Point3<f64>, _half: f64| center.x > 0.0;
    assert!(closure.should_enter(&c, 0.5));
}

#[test]
fn test_parry_aabb() {
    let aabb = parry3d::bounding_volume::Aabb::new(
        parry3d::math::Point::new(0.0, 0.0, 0.0),
        parry3d::math::Point::new(2.0, 4.0, 6.0),
    );
    let q = AabbQuery::from(&aabb);
    assert_eq!(q.center, Point3::new(1.0, 2.0, 3.0));
    assert_eq!(q.half_extents, Vector3::new(1.0, 2.0, 3.0));
}
