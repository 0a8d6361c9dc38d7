//! 几何求交相关接口
//! 所有函数都是纯函数，不分配内存。包围盒统一用中心点和半边长表示。

use nalgebra::{Matrix3, Point3, RealField, Vector3};
use num_traits::ToPrimitive;

/// 标量类型，实际使用的时候就是f32/f64
pub trait Real: RealField + Copy + ToPrimitive {
    /// 机器精度
    const EPSILON: Self;
    /// 正无穷
    const INFINITY: Self;
}

impl Real for f32 {
    const EPSILON: f32 = f32::EPSILON;
    const INFINITY: f32 = f32::INFINITY;
}

impl Real for f64 {
    const EPSILON: f64 = f64::EPSILON;
    const INFINITY: f64 = f64::INFINITY;
}

/// 转成f64，只用于错误信息和日志
#[inline]
pub(crate) fn to_f64<S: Real>(v: S) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}

/// 计数转成标量
#[inline]
pub(crate) fn from_count<S: Real>(n: u64) -> S {
    S::from_u64(n).unwrap_or_else(|| nalgebra::convert(n as f64))
}

/// 方向的倒数，分量为0时得到带符号的无穷
#[inline]
pub(crate) fn reciprocal<S: Real>(direction: &Vector3<S>) -> Vector3<S> {
    direction.map(|d| S::one() / d)
}

// 距离为0并且该轴方向退化时，直接给出无穷，避免 0 * inf 得到NaN
#[inline]
fn slab_distance<S: Real>(distance: S, reciprocal: S, degenerate: S) -> S {
    if distance == S::zero() && !reciprocal.is_finite() {
        degenerate
    } else {
        distance * reciprocal
    }
}

// slab法，根据方向倒数的符号选择近平面和远平面
#[inline]
fn slab<S: Real>(
    half_extents: &Vector3<S>,
    box_center: &Point3<S>,
    source: &Point3<S>,
    reciprocal_direction: &Vector3<S>,
) -> (S, S) {
    let mut t_min = -S::INFINITY;
    let mut t_max = S::INFINITY;
    for i in 0..3 {
        let r = reciprocal_direction[i];
        let (near, far) = if r.is_sign_negative() {
            (box_center[i] + half_extents[i], box_center[i] - half_extents[i])
        } else {
            (box_center[i] - half_extents[i], box_center[i] + half_extents[i])
        };
        let t_near = slab_distance(near - source[i], r, -S::INFINITY);
        let t_far = slab_distance(far - source[i], r, S::INFINITY);
        if t_near > t_min {
            t_min = t_near;
        }
        if t_far < t_max {
            t_max = t_far;
        }
    }
    (t_min, t_max)
}

/// 线段与包围盒的求交结果，t以线段长度归一化，t=0为起点，t=1为终点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentAabbIntersection<S: Real> {
    pub t_min: S,
    pub t_max: S,
}

impl<S: Real> SegmentAabbIntersection<S> {
    /// 需传入包围盒半边长、包围盒中心、线段起点、线段方向(终点减起点)的倒数
    #[inline]
    pub fn new(
        box_half_extent: S,
        box_center: &Point3<S>,
        source: &Point3<S>,
        reciprocal_direction: &Vector3<S>,
    ) -> Self {
        let (t_min, t_max) = slab(
            &Vector3::repeat(box_half_extent),
            box_center,
            source,
            reciprocal_direction,
        );
        SegmentAabbIntersection { t_min, t_max }
    }

    /// 由线段方向构造，内部计算方向的倒数
    #[inline]
    pub fn from_direction(
        source: &Point3<S>,
        direction: &Vector3<S>,
        box_center: &Point3<S>,
        box_half_extent: S,
    ) -> Self {
        Self::new(box_half_extent, box_center, source, &reciprocal(direction))
    }

    /// 是否相交。长度为0的线段退化为点是否在盒内
    #[inline]
    pub fn intersects(&self) -> bool {
        let eps = S::EPSILON;
        self.t_max >= -eps && self.t_min <= S::one() + eps && self.t_max > self.t_min - eps
    }
}

/// 射线与包围盒的求交结果，不限制线段长度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayAabbIntersection<S: Real> {
    pub t_min: S,
    pub t_max: S,
}

impl<S: Real> RayAabbIntersection<S> {
    #[inline]
    pub fn new(
        box_half_extent: S,
        box_center: &Point3<S>,
        origin: &Point3<S>,
        reciprocal_direction: &Vector3<S>,
    ) -> Self {
        let (t_min, t_max) = slab(
            &Vector3::repeat(box_half_extent),
            box_center,
            origin,
            reciprocal_direction,
        );
        RayAabbIntersection { t_min, t_max }
    }

    #[inline]
    pub fn from_direction(
        origin: &Point3<S>,
        direction: &Vector3<S>,
        box_center: &Point3<S>,
        box_half_extent: S,
    ) -> Self {
        Self::new(box_half_extent, box_center, origin, &reciprocal(direction))
    }

    /// 射线所在直线穿过包围盒即相交
    #[inline]
    pub fn intersects(&self) -> bool {
        self.t_max >= self.t_min
    }
}

/// 线段是否与包围盒相交
#[inline]
pub fn segment_intersects_aabb<S: Real>(
    box_half_extent: S,
    box_center: &Point3<S>,
    source: &Point3<S>,
    reciprocal_direction: &Vector3<S>,
) -> bool {
    SegmentAabbIntersection::new(box_half_extent, box_center, source, reciprocal_direction)
        .intersects()
}

/// 射线是否与包围盒相交
#[inline]
pub fn ray_intersects_aabb<S: Real>(
    box_half_extent: S,
    box_center: &Point3<S>,
    origin: &Point3<S>,
    reciprocal_direction: &Vector3<S>,
) -> bool {
    RayAabbIntersection::new(box_half_extent, box_center, origin, reciprocal_direction)
        .intersects()
}

/// 点是否在包围盒内，边界为闭区间
#[inline]
pub fn point_intersects_aabb<S: Real>(
    point: &Point3<S>,
    box_center: &Point3<S>,
    box_half_extent: S,
) -> bool {
    (0..3).all(|i| {
        point[i] >= box_center[i] - box_half_extent && point[i] <= box_center[i] + box_half_extent
    })
}

/// 两个轴对齐包围盒是否相交，接触也算相交
#[inline]
pub fn aabb_intersects_aabb<S: Real>(
    center_a: &Point3<S>,
    half_extents_a: &Vector3<S>,
    center_b: &Point3<S>,
    half_extents_b: &Vector3<S>,
) -> bool {
    (0..3).all(|i| (center_a[i] - center_b[i]).abs() <= half_extents_a[i] + half_extents_b[i])
}

/// 旋转向量转旋转矩阵(Rodrigues公式)，零向量直接返回单位矩阵
pub fn rotation_matrix_from_rotation_vector<S: Real>(rotation_vector: &Vector3<S>) -> Matrix3<S> {
    let theta2 = rotation_vector.norm_squared();
    if theta2 == S::zero() {
        return Matrix3::identity();
    }
    let theta = theta2.sqrt();
    let k = (rotation_vector / theta).cross_matrix();
    let (sin, cos) = theta.sin_cos();
    Matrix3::identity() + k * sin + k * k * (S::one() - cos)
}

// 包围盒在轴上的投影区间
#[inline]
fn aabb_interval<S: Real>(axis: &Vector3<S>, center: &Point3<S>, half_extent: S) -> (S, S) {
    let p = center.coords.dot(axis);
    let r = half_extent * (axis.x.abs() + axis.y.abs() + axis.z.abs());
    (p - r, p + r)
}

#[inline]
fn separated<S: Real>(a: (S, S), b: (S, S)) -> bool {
    a.0 > b.1 || a.1 < b.0
}

// 叉乘得到的轴，接近0说明两条边平行，跳过
#[inline]
fn degenerate_axis<S: Real>(axis: &Vector3<S>) -> bool {
    axis.norm_squared() <= S::EPSILON
}

#[inline]
fn unit_axis<S: Real>(i: usize) -> Vector3<S> {
    Vector3::ith(i, S::one())
}

/// 视锥体，4个平面都经过顶点，没有近远平面
/// 法线朝内，相机局部坐标系中+Z为视线方向
#[derive(Debug, Clone, PartialEq)]
pub struct Frustum<S: Real> {
    pub apex: Point3<S>,
    /// 顺序为 上 下 左 右
    pub normals: [Vector3<S>; 4],
    /// 相邻平面的交线方向，都指向视线一侧
    pub edges: [Vector3<S>; 4],
}

impl<S: Real> Frustum<S> {
    pub const TOP: usize = 0;
    pub const BOTTOM: usize = 1;
    pub const LEFT: usize = 2;
    pub const RIGHT: usize = 3;

    /// 需传入顶点、姿态的旋转向量、水平和垂直的半张角(弧度)
    pub fn new(
        apex: Point3<S>,
        rotation_vector: &Vector3<S>,
        horizontal_half_angle: S,
        vertical_half_angle: S,
    ) -> Self {
        let (sh, ch) = horizontal_half_angle.sin_cos();
        let (sv, cv) = vertical_half_angle.sin_cos();
        let zero = S::zero();
        let rotation = rotation_matrix_from_rotation_vector(rotation_vector);
        let normals = [
            rotation * Vector3::new(zero, -cv, sv),
            rotation * Vector3::new(zero, cv, sv),
            rotation * Vector3::new(ch, zero, sh),
            rotation * Vector3::new(-ch, zero, sh),
        ];
        let boresight = rotation * Vector3::new(zero, zero, S::one());
        let edge = |a: usize, b: usize| {
            let e = normals[a].cross(&normals[b]);
            if e.dot(&boresight) < zero {
                -e
            } else {
                e
            }
        };
        let edges = [
            edge(Self::TOP, Self::LEFT),
            edge(Self::TOP, Self::RIGHT),
            edge(Self::BOTTOM, Self::RIGHT),
            edge(Self::BOTTOM, Self::LEFT),
        ];
        Frustum {
            apex,
            normals,
            edges,
        }
    }

    /// 点是否在视锥体内，边界算在内
    pub fn contains(&self, point: &Point3<S>) -> bool {
        let d = point - self.apex;
        self.normals.iter().all(|n| n.dot(&d) >= S::zero())
    }

    // 无限锥体在轴上的投影区间
    #[inline]
    fn interval(&self, axis: &Vector3<S>) -> (S, S) {
        let p = self.apex.coords.dot(axis);
        let (mut lo, mut hi) = (p, p);
        for e in self.edges.iter() {
            let d = e.dot(axis);
            if d < S::zero() {
                lo = -S::INFINITY;
            } else if d > S::zero() {
                hi = S::INFINITY;
            }
        }
        (lo, hi)
    }
}

/// 视锥体与轴对齐包围盒是否相交，分离轴测试，保守判断
pub fn frustum_intersects_aabb<S: Real>(
    frustum: &Frustum<S>,
    box_center: &Point3<S>,
    box_half_extent: S,
) -> bool {
    // 盒子所有角点都在某个锥面外
    let d = box_center - frustum.apex;
    for n in frustum.normals.iter() {
        let r = box_half_extent * (n.x.abs() + n.y.abs() + n.z.abs());
        if n.dot(&d) + r < S::zero() {
            return false;
        }
    }
    for i in 0..3 {
        let axis = unit_axis::<S>(i);
        // 锥体整个在盒子某个面外
        if separated(
            frustum.interval(&axis),
            aabb_interval(&axis, box_center, box_half_extent),
        ) {
            return false;
        }
        for e in frustum.edges.iter() {
            let cross = axis.cross(e);
            if degenerate_axis(&cross) {
                continue;
            }
            if separated(
                frustum.interval(&cross),
                aabb_interval(&cross, box_center, box_half_extent),
            ) {
                return false;
            }
        }
    }
    true
}

/// 有向包围盒
#[derive(Debug, Clone, PartialEq)]
pub struct Obb<S: Real> {
    pub center: Point3<S>,
    pub half_extents: Vector3<S>,
    /// 列向量为盒子的三个轴
    pub rotation: Matrix3<S>,
}

impl<S: Real> Obb<S> {
    pub fn new(center: Point3<S>, half_extents: Vector3<S>, rotation_vector: &Vector3<S>) -> Self {
        Obb {
            center,
            half_extents,
            rotation: rotation_matrix_from_rotation_vector(rotation_vector),
        }
    }

    #[inline]
    pub fn axis(&self, i: usize) -> Vector3<S> {
        self.rotation.column(i).into_owned()
    }

    /// 8个角点
    pub fn corners(&self) -> [Point3<S>; 8] {
        let mut corners = [self.center; 8];
        for (i, c) in corners.iter_mut().enumerate() {
            for k in 0..3 {
                let h = if i & (1 << k) != 0 {
                    self.half_extents[k]
                } else {
                    -self.half_extents[k]
                };
                *c += self.axis(k) * h;
            }
        }
        corners
    }

    #[inline]
    fn interval(&self, axis: &Vector3<S>) -> (S, S) {
        let p = self.center.coords.dot(axis);
        let mut r = S::zero();
        for k in 0..3 {
            r += self.half_extents[k] * self.axis(k).dot(axis).abs();
        }
        (p - r, p + r)
    }
}

/// 有向包围盒与轴对齐包围盒是否相交，分离轴测试
pub fn obb_intersects_aabb<S: Real>(obb: &Obb<S>, box_center: &Point3<S>, box_half_extent: S) -> bool {
    for k in 0..3 {
        let axis = obb.axis(k);
        if separated(obb.interval(&axis), aabb_interval(&axis, box_center, box_half_extent)) {
            return false;
        }
    }
    for i in 0..3 {
        let axis = unit_axis::<S>(i);
        if separated(obb.interval(&axis), aabb_interval(&axis, box_center, box_half_extent)) {
            return false;
        }
        for k in 0..3 {
            let cross = axis.cross(&obb.axis(k));
            if degenerate_axis(&cross) {
                continue;
            }
            if separated(obb.interval(&cross), aabb_interval(&cross, box_center, box_half_extent)) {
                return false;
            }
        }
    }
    true
}

#[test]
fn test_segment_boundary() {
    let center = Point3::origin();
    let source = Point3::new(0.0f64, 0.0, 10.0);
    let on_face = Point3::new(0.0, 0.0, 1.0);
    let r = SegmentAabbIntersection::from_direction(&source, &(on_face - source), &center, 1.0);
    assert!(r.intersects());
    assert!((r.t_min - 1.0).abs() <= f64::EPSILON);

    let outside = Point3::new(0.0, 0.0, 1.0 + 1e-9);
    let r = SegmentAabbIntersection::from_direction(&source, &(outside - source), &center, 1.0);
    assert!(!r.intersects());

    let source = Point3::new(0.0f32, 0.0, 10.0);
    let outside = Point3::new(0.0f32, 0.0, 1.0001);
    assert!(!SegmentAabbIntersection::from_direction(
        &source,
        &(outside - source),
        &Point3::origin(),
        1.0
    )
    .intersects());
}

#[test]
fn test_segment_degenerate() {
    let center = Point3::new(1.0f64, 1.0, 1.0);
    // 长度为0的线段就是点
    for (p, expect) in [
        (Point3::new(1.0, 1.0, 1.0), true),
        (Point3::new(1.5, 0.5, 1.5), true),
        (Point3::new(1.5, 1.0, 1.0), true),
        (Point3::new(1.5 + 1e-9, 1.0, 1.0), false),
        (Point3::new(-3.0, 1.0, 1.0), false),
    ] {
        let r = SegmentAabbIntersection::from_direction(&p, &Vector3::zeros(), &center, 0.5);
        assert_eq!(r.intersects(), expect, "{:?}", p);
        assert!(!r.t_min.is_nan() && !r.t_max.is_nan());
    }
    // 在面上平行滑过
    let source = Point3::new(-5.0f64, 1.5, 1.0);
    let r = SegmentAabbIntersection::from_direction(
        &source,
        &Vector3::new(10.0, 0.0, 0.0),
        &center,
        0.5,
    );
    assert!(r.intersects());
    // 未到达
    let r = SegmentAabbIntersection::from_direction(
        &source,
        &Vector3::new(2.0, 0.0, 0.0),
        &center,
        0.5,
    );
    assert!(!r.intersects());
    // 已越过
    let r = SegmentAabbIntersection::from_direction(
        &Point3::new(3.0, 1.0, 1.0),
        &Vector3::new(2.0, 0.0, 0.0),
        &center,
        0.5,
    );
    assert!(!r.intersects());
}

#[test]
fn test_ray() {
    let center = Point3::origin();
    let origin = Point3::new(-5.0f64, 0.2, 0.0);
    assert!(RayAabbIntersection::from_direction(&origin, &Vector3::new(1.0, 0.0, 0.0), &center, 1.0).intersects());
    // 不受线段长度限制
    assert!(!SegmentAabbIntersection::from_direction(&origin, &Vector3::new(1.0, 0.0, 0.0), &center, 1.0).intersects());
    assert!(!RayAabbIntersection::from_direction(&origin, &Vector3::new(0.0, 1.0, 0.0), &center, 1.0).intersects());
    assert!(ray_intersects_aabb(1.0, &center, &origin, &reciprocal(&Vector3::new(1.0, 0.1, 0.0))));
}

#[test]
fn test_point_and_box() {
    let c = Point3::new(0.0f64, 0.0, 0.0);
    assert!(point_intersects_aabb(&Point3::new(1.0, -1.0, 0.5), &c, 1.0));
    assert!(!point_intersects_aabb(&Point3::new(1.0, -1.0, 1.5), &c, 1.0));
    let h = Vector3::new(1.0, 1.0, 1.0);
    assert!(aabb_intersects_aabb(&c, &h, &Point3::new(2.0, 0.0, 0.0), &h));
    assert!(!aabb_intersects_aabb(&c, &h, &Point3::new(2.0, 2.1, 0.0), &h));
}

#[test]
fn test_rotation_vector() {
    use approx::assert_relative_eq;

    assert_eq!(
        rotation_matrix_from_rotation_vector(&Vector3::<f64>::zeros()),
        Matrix3::identity()
    );
    let r = rotation_matrix_from_rotation_vector(&Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2));
    assert_relative_eq!(r * Vector3::x(), Vector3::y(), epsilon = 1e-12);
    let v = Vector3::new(0.3, -0.2, 0.9);
    let r = rotation_matrix_from_rotation_vector(&v);
    // 旋转轴不变，矩阵正交
    assert_relative_eq!(r * v, v, epsilon = 1e-12);
    assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
}

#[test]
fn test_frustum() {
    let angle = 30f64.to_radians();
    let f = Frustum::new(Point3::new(0.0, 0.0, -10.0), &Vector3::zeros(), angle, angle);
    assert!(f.contains(&Point3::origin()));
    assert!(!f.contains(&Point3::new(0.0, 0.0, -11.0)));
    for n in f.normals.iter() {
        assert!((n.norm() - 1.0).abs() < 1e-12);
    }
    assert!(frustum_intersects_aabb(&f, &Point3::origin(), 1.0));
    assert!(!frustum_intersects_aabb(&f, &Point3::new(0.0, 0.0, -20.0), 1.0));
    assert!(!frustum_intersects_aabb(&f, &Point3::new(20.0, 0.0, 0.0), 1.0));
    // 包含顶点的盒子
    assert!(frustum_intersects_aabb(&f, &Point3::new(0.0, 0.0, -10.5), 1.0));

    // 绕y轴转90度，视线变为+X
    let f = Frustum::new(
        Point3::origin(),
        &Vector3::new(0.0, std::f64::consts::FRAC_PI_2, 0.0),
        angle,
        angle,
    );
    assert!(frustum_intersects_aabb(&f, &Point3::new(10.0, 0.0, 0.0), 1.0));
    assert!(!frustum_intersects_aabb(&f, &Point3::new(0.0, 0.0, 10.0), 1.0));
    assert!(!frustum_intersects_aabb(&f, &Point3::new(-10.0, 0.0, 0.0), 1.0));
}

#[test]
fn test_obb() {
    let quarter = std::f64::consts::FRAC_PI_4;
    let h = Vector3::new(1.0, 1.0, 1.0);
    let rotated = Obb::new(Point3::new(2.3, 0.0, 0.0), h, &Vector3::new(0.0, 0.0, quarter));
    assert!(obb_intersects_aabb(&rotated, &Point3::origin(), 1.0));
    let rotated = Obb::new(Point3::new(2.5, 0.0, 0.0), h, &Vector3::new(0.0, 0.0, quarter));
    assert!(!obb_intersects_aabb(&rotated, &Point3::origin(), 1.0));
    let aligned = Obb::new(Point3::new(1.9, 0.0, 0.0), h, &Vector3::zeros());
    assert!(obb_intersects_aabb(&aligned, &Point3::origin(), 1.0));
    let aligned = Obb::new(Point3::new(2.5, 0.0, 0.0), h, &Vector3::zeros());
    assert!(!obb_intersects_aabb(&aligned, &Point3::origin(), 1.0));
    for c in rotated.corners().iter() {
        assert!(((c - rotated.center).norm() - 3f64.sqrt()).abs() < 1e-12);
    }
}
