//! 运行时错误.
//!
//! 错误分类遵循 "让调用者能区分配置错误与数据错误" 的原则:
//! 配置类错误 ([`ConfigError`]) 在构建/配置阶段立即返回,
//! 词表类错误 ([`VocabError`]) 在推理/取值阶段返回.
//! `get` 的索引越界属于编程错误, 程序直接 panic.

use crate::store::StoreError;

/// 数据集构建或配置错误.
#[derive(Debug)]
pub enum ConfigError {
    /// 元数据表中不存在请求的列.
    ColumnNotFound(String),

    /// 数据集未挂载元数据表, 但请求了依赖元数据的操作.
    NoMetadata,

    /// 两个按索引对齐的集合长度不一致.
    ///
    /// 第一个参数为输入存储长度, 第二个参数为对侧 (标签存储或元数据表) 长度.
    LengthMismatch(usize, usize),

    /// 一次性归一化配置被重复执行. 首次配置保持不变.
    AlreadyNormalized,
}

/// 类别词表错误.
#[derive(Debug, Clone)]
pub enum VocabError {
    /// 推理时遇到了建立词表时从未观测到的标签值.
    UnknownClass(String),

    /// 类别编码超出词表范围.
    UnknownCode(usize),
}

/// 取 item 或标签时的运行时错误.
#[derive(Debug)]
pub enum ReadError {
    /// 底层存储读取失败.
    Store(StoreError),

    /// 标签值不在词表内.
    Vocab(VocabError),
}

impl From<StoreError> for ReadError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<VocabError> for ReadError {
    fn from(e: VocabError) -> Self {
        Self::Vocab(e)
    }
}
