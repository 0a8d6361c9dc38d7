//! 错误类型

/// 结果别名
pub type Result<T> = std::result::Result<T, OctreeError>;

/// 八叉树及高度图的错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OctreeError {
    /// 空间半边长必须为正的有限值
    #[error("invalid volume half extent: {0}")]
    InvalidHalfExtent(f64),

    /// 深度超出上限
    #[error("invalid max depth {depth}, limit is {limit}")]
    InvalidDepth {
        /// 传入的深度
        depth: u32,
        /// 允许的最大深度
        limit: u32,
    },

    /// 两棵树的参数不一致，不能合并
    #[error(
        "incompatible trees: half extent {left_half_extent} vs {right_half_extent}, depth {left_depth} vs {right_depth}"
    )]
    IncompatibleTrees {
        left_half_extent: f64,
        right_half_extent: f64,
        left_depth: u32,
        right_depth: u32,
    },

    /// 键的编码损坏
    #[error("invalid voxel key {key:#018x}: bad nibble at level {nibble}")]
    InvalidKey {
        /// 原始键
        key: u64,
        /// 出错的半字节位置，0为最低位
        nibble: u32,
    },

    /// 高度图的范围必须为正的有限值
    #[error("invalid height map extent: ({0}, {1})")]
    InvalidHeightMapExtent(f64, f64),

    /// 高度图的投影基退化
    #[error("degenerate projection basis")]
    DegenerateBasis,
}
