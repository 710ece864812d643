#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 提供分块存储的 3D 医学扫描 (CT/MRI volume) 数据集的惰性访问、
//! 标注策略和 per-item 可复现的变换流水线.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 底层分块存储 (npz 归档或内存数组) 被视为只读外部协作者,
//!   本 crate 不负责其写入路径和磁盘布局.
//! 2. 对于编程错误 (如 `get` 索引越界), 程序会直接 panic, 而不会导致内存错误.
//!   As what Rust promises. 可恢复的配置/数据错误则通过 `Result` 返回.
//!
//! # 功能总览
//!
//! ### 只读分块存储接口 ✅
//!
//! `VolumeStore` trait 及其两个实现: `NpzStore` (npz 归档, 多工作通道)
//! 与 `MemStore` (内存数组, 便于实验与测试).
//!
//! 实现位于 `scan-berry/src/store`.
//!
//! ### 列式元数据表 ✅
//!
//! 按行索引与列名访问, 可用作划分谓词与标签来源.
//!
//! 实现位于 `scan-berry/src/meta.rs`.
//!
//! ### 惰性数据集与划分 ✅
//!
//! 序号 -> 解码体数据 + 标签 + 元数据行. 划分后的视图共享底层存储与
//! 变换参数缓存, 保证同一原始索引在任何视图下解析出相同的缓存参数.
//!
//! 实现位于 `scan-berry/src/dataset`.
//!
//! ### 变换流水线 ✅
//!
//! 两阶段协议 (resolve + apply). patch 类变换的随机参数按 item 解析一次,
//! 跨 epoch 复用; stateless 类变换每次调用独立解析.
//!
//! 实现位于 `scan-berry/src/transform.rs`.
//!
//! ### 标注策略 ✅
//!
//! 单类别 / 稠密分割掩膜 / 分类 + 分割并行三种标注, 以 tagged enum 建模.
//!
//! 实现位于 `scan-berry/src/dataset/label.rs`.

/// 三维索引, 同时也可一定程度上用作非负整数向量. 格式为 (D, H, W).
pub type Idx3d = (usize, usize, usize);

/// 数据集内部使用的原始存储索引.
pub type RawIdx = usize;

pub mod error;
pub mod meta;
pub mod store;

mod item;
mod transform;

pub use item::{ItemData, ItemKind, VolumeItem};
pub use transform::{ParamCache, TfmKind, TfmParams, TransformOp, TransformPipeline};

pub mod dataset;
pub mod prelude;
