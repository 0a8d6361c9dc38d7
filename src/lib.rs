//! 稠密建图八叉树
//！体素键用64位整数表达路径，每层4位，最多16层。叶节点连续存放，内部节点只记录子节点占用位。
//！插入策略和叶节点数据都是类型参数，同一份遍历代码支持只记录命中和记录空闲空间两种模型。
//！两棵参数相同的树可以合并，合并结果与合并方向无关。

pub mod config;
pub mod error;
pub mod geometry;
pub mod height_map;
pub mod key;
pub mod octree;
pub mod payload;
pub mod policy;
pub mod query;
pub mod serialize;

pub use config::*;
pub use error::{OctreeError, Result};
pub use geometry::*;
pub use height_map::*;
pub use key::*;
pub use octree::*;
pub use payload::*;
pub use policy::*;
pub use query::*;
pub use serialize::*;
