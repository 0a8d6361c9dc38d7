//! 体素键
//! 64位整数表达从根到节点的路径，每层4位，最高的已用半字节为第一层。
//! 已用的半字节最高位为标记位，低3位为子节点序号: bit0为x，bit1为y，bit2为z，置位表示正半边。
//! 0表示根节点。

use nalgebra::{Point3, Vector3};

use crate::config::MAX_DEPTH;
use crate::error::{OctreeError, Result};
use crate::geometry::Real;

/// 体素键
pub type VoxelKey = u64;

/// 根节点的键
pub const ROOT_KEY: VoxelKey = 0;

const MARKER: u64 = 0x8;
const OCTANT_MASK: u64 = 0x7;

/// 子节点的键
#[inline]
pub fn child_key(key: VoxelKey, octant: usize) -> VoxelKey {
    (key << 4) | (MARKER | (octant as u64 & OCTANT_MASK))
}

/// 父节点的键，根节点的父节点仍为根
#[inline]
pub fn parent_key(key: VoxelKey) -> VoxelKey {
    key >> 4
}

/// 节点在树中的深度，不检查编码
#[inline]
pub fn key_depth(key: VoxelKey) -> u32 {
    (64 - key.leading_zeros() + 3) / 4
}

/// 节点在父节点中的序号，根节点返回None
#[inline]
pub fn key_octant(key: VoxelKey) -> Option<usize> {
    if key == ROOT_KEY {
        None
    } else {
        Some((key & OCTANT_MASK) as usize)
    }
}

/// 子节点中心相对父节点中心的方向，每个分量为±1
#[inline]
pub fn octant_offset<S: Real>(octant: usize) -> Vector3<S> {
    let sign = |bit: usize| {
        if octant & bit != 0 {
            S::one()
        } else {
            -S::one()
        }
    };
    Vector3::new(sign(1), sign(2), sign(4))
}

/// 点落在哪个子节点，点在分界面上时归到正半边
#[inline]
pub fn octant_of<S: Real>(point: &Point3<S>, center: &Point3<S>) -> usize {
    let mut i = 0;
    if point.x >= center.x {
        i |= 1;
    }
    if point.y >= center.y {
        i |= 2;
    }
    if point.z >= center.z {
        i |= 4;
    }
    i
}

/// 检查键的编码，返回深度
pub fn validate_key(key: VoxelKey) -> Result<u32> {
    let mut depth = 0;
    for nibble in (0..MAX_DEPTH).rev() {
        let bits = (key >> (nibble * 4)) & 0xf;
        if depth == 0 && bits == 0 {
            continue;
        }
        // 开始之后不能再出现空层，已用的层必须有标记位
        if bits & MARKER == 0 {
            return Err(OctreeError::InvalidKey { key, nibble });
        }
        depth += 1;
    }
    Ok(depth)
}

/// 由键解码出节点的中心，需传入根节点(中心为原点)的半边长
pub fn box_center_from_index<S: Real>(key: VoxelKey, half_extent: S) -> Result<Point3<S>> {
    let depth = validate_key(key)?;
    let two = S::one() + S::one();
    let mut center = Point3::origin();
    let mut half = half_extent;
    for level in (0..depth).rev() {
        half /= two;
        let octant = ((key >> (level * 4)) & OCTANT_MASK) as usize;
        center += octant_offset::<S>(octant) * half;
    }
    Ok(center)
}

#[test]
fn test_key_layout() {
    let k1 = child_key(ROOT_KEY, 5);
    assert_eq!(k1, 0xd);
    let k2 = child_key(k1, 0);
    assert_eq!(k2, 0xd8);
    assert_eq!(parent_key(k2), k1);
    assert_eq!(key_depth(ROOT_KEY), 0);
    assert_eq!(key_depth(k1), 1);
    assert_eq!(key_depth(k2), 2);
    assert_eq!(key_octant(k2), Some(0));
    assert_eq!(key_octant(k1), Some(5));
    assert_eq!(key_octant(ROOT_KEY), None);

    let mut deepest = ROOT_KEY;
    for _ in 0..MAX_DEPTH {
        deepest = child_key(deepest, 7);
    }
    assert_eq!(deepest, u64::MAX);
    assert_eq!(key_depth(deepest), 16);
    assert_eq!(validate_key(deepest), Ok(16));
}

#[test]
fn test_box_center_from_index() {
    let c = box_center_from_index(ROOT_KEY, 4.0f64).unwrap();
    assert_eq!(c, Point3::origin());
    // +x -y +z
    let k = child_key(ROOT_KEY, 0b101);
    assert_eq!(box_center_from_index(k, 4.0f64).unwrap(), Point3::new(2.0, -2.0, 2.0));
    let k = child_key(k, 0b010);
    assert_eq!(box_center_from_index(k, 4.0f64).unwrap(), Point3::new(1.0, -1.0, 1.0));
}

#[test]
fn test_invalid_keys() {
    // 缺少标记位
    assert_eq!(
        box_center_from_index(0x5u64, 1.0f64),
        Err(OctreeError::InvalidKey { key: 0x5, nibble: 0 })
    );
    // 空层后面还有数据
    assert_eq!(
        box_center_from_index(0x809u64, 1.0f64),
        Err(OctreeError::InvalidKey { key: 0x809, nibble: 1 })
    );
    // 最低层为空
    assert!(box_center_from_index(0x80u64, 1.0f64).is_err());
    assert!(box_center_from_index(0x8f3u64, 1.0f64).is_err());
    assert_eq!(validate_key(0x8f9), Ok(3));
}

#[test]
fn test_octant_of() {
    let c = Point3::new(0.0f32, 0.0, 0.0);
    assert_eq!(octant_of(&Point3::new(1.0, -1.0, 1.0), &c), 5);
    assert_eq!(octant_of(&Point3::new(0.0, 0.0, 0.0), &c), 7);
    assert_eq!(octant_of(&Point3::new(-1.0, -1.0, -1.0), &c), 0);
    let o: Vector3<f32> = octant_offset(5);
    assert_eq!(o, Vector3::new(1.0, -1.0, 1.0));
}
