//! 构建参数

use crate::error::{OctreeError, Result};
use crate::geometry::{to_f64, Real};

/// 最大深度，64位键每层4位
pub const MAX_DEPTH: u32 = 16;
/// 高度图叶节点分裂所需的最少点数
pub const DEFAULT_SPLIT_COUNT: usize = 10;
/// 高度图叶节点分裂所需的最小高度方差
pub const DEFAULT_MIN_VARIANCE: f64 = 1e-8;
/// 子节点半边长与整图半边长的最小比例，防止无限细分
pub const DEFAULT_MIN_EXTENT_RATIO: f64 = 0.01;

/// 八叉树参数，构建后不可变
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OctreeConfig<S: Real> {
    /// 立方体空间的半边长，中心为原点
    pub volume_half_extent: S,
    /// 叶节点所在的深度，0表示只有根节点
    pub max_depth: u32,
}

impl<S: Real> OctreeConfig<S> {
    pub fn new(volume_half_extent: S, max_depth: u32) -> Self {
        OctreeConfig {
            volume_half_extent,
            max_depth,
        }
    }

    /// 检查参数，非法参数不会构建出树
    pub fn validate(&self) -> Result<()> {
        let h = self.volume_half_extent;
        if !h.is_finite() || h <= S::zero() {
            return Err(OctreeError::InvalidHalfExtent(to_f64(h)));
        }
        if self.max_depth > MAX_DEPTH {
            return Err(OctreeError::InvalidDepth {
                depth: self.max_depth,
                limit: MAX_DEPTH,
            });
        }
        Ok(())
    }

    /// 叶节点的半边长
    #[inline]
    pub fn voxel_half_extent(&self) -> S {
        let mut h = self.volume_half_extent;
        let two = S::one() + S::one();
        for _ in 0..self.max_depth {
            h /= two;
        }
        h
    }
}

/// 高度图的分裂阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeightMapConfig<S: Real> {
    pub split_count: usize,
    pub min_variance: S,
    pub min_extent_ratio: S,
}

impl<S: Real> Default for HeightMapConfig<S> {
    fn default() -> Self {
        HeightMapConfig {
            split_count: DEFAULT_SPLIT_COUNT,
            min_variance: nalgebra::convert(DEFAULT_MIN_VARIANCE),
            min_extent_ratio: nalgebra::convert(DEFAULT_MIN_EXTENT_RATIO),
        }
    }
}

#[test]
fn test_octree_config() {
    assert!(OctreeConfig::new(1.0f64, 0).validate().is_ok());
    assert!(OctreeConfig::new(1.0f64, 16).validate().is_ok());
    assert_eq!(
        OctreeConfig::new(1.0f64, 17).validate(),
        Err(OctreeError::InvalidDepth {
            depth: 17,
            limit: 16
        })
    );
    assert_eq!(
        OctreeConfig::new(0.0f32, 4).validate(),
        Err(OctreeError::InvalidHalfExtent(0.0))
    );
    assert!(OctreeConfig::new(-2.0f64, 4).validate().is_err());
    assert!(OctreeConfig::new(f64::NAN, 4).validate().is_err());
    assert!(OctreeConfig::new(f64::INFINITY, 4).validate().is_err());

    assert_eq!(OctreeConfig::new(8.0f64, 3).voxel_half_extent(), 1.0);
    assert_eq!(OctreeConfig::new(8.0f64, 0).voxel_half_extent(), 8.0);
}

#[test]
fn test_height_map_config_default() {
    let c: HeightMapConfig<f64> = HeightMapConfig::default();
    assert_eq!(c.split_count, 10);
    assert_eq!(c.min_variance, 1e-8);
    assert_eq!(c.min_extent_ratio, 0.01);
}
