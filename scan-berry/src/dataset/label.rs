//! 标注策略.
//!
//! 以 tagged enum 建模 "为原始索引产出一个标签" 的能力:
//! 无标注 / 单类别 / 稠密分割掩膜 / 分类 + 分割并行.
//! 每个变体只携带自己需要的状态 (词表, 或第二存储, 或两者).

use ndarray::{ArrayD, Axis, IxDyn, Zip};
use ordered_float::OrderedFloat;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ReadError, VocabError};
use crate::store::VolumeStore;
use crate::{RawIdx, VolumeItem};

/// 类别词表.
///
/// 由观测到的标签值去重、排序后一次性建成, 每个类别获得 `0..K-1`
/// 的稠密整数编码. 建成后只读; 所有派生/划分视图共享同一实例.
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    classes: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocab {
    /// 从观测值建立词表. 输入可含重复, 顺序任意.
    pub fn build<S: Into<String>, I: IntoIterator<Item = S>>(values: I) -> Self {
        let mut classes: Vec<String> = values.into_iter().map(Into::into).collect();
        classes.sort_unstable();
        classes.dedup();
        let index = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self { classes, index }
    }

    /// 类别个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// 词表是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// 全部类别, 按编码升序.
    #[inline]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// 标签值的整数编码. 值未在建表时观测到则返回 `VocabError::UnknownClass`.
    pub fn code(&self, value: &str) -> Result<usize, VocabError> {
        self.index
            .get(value)
            .copied()
            .ok_or_else(|| VocabError::UnknownClass(value.to_owned()))
    }

    /// 编码对应的标签值. 编码越界则返回 `VocabError::UnknownCode`.
    pub fn name(&self, code: usize) -> Result<&str, VocabError> {
        self.classes
            .get(code)
            .map(String::as_str)
            .ok_or(VocabError::UnknownCode(code))
    }
}

/// 数据集为某个索引产出的标签.
#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    /// 无标注.
    None,

    /// 单类别: (整数编码, 人类可读取值). 下游损失计算消费编码, 展示消费取值.
    Category {
        /// 类别编码.
        code: usize,
        /// 类别取值.
        name: String,
    },

    /// 稠密分割掩膜.
    Mask(ArrayD<i64>),

    /// (分割掩膜, 类别编码, 类别取值) 三元组.
    Parallel {
        /// 分割掩膜.
        mask: ArrayD<i64>,
        /// 类别编码.
        code: usize,
        /// 类别取值.
        name: String,
    },
}

/// 下游损失函数族选择.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LossKind {
    /// 普通分类损失.
    Category,

    /// 稠密分割交叉熵.
    SegCrossEntropy,

    /// 分类 + 分割联合损失.
    Parallel,
}

/// 推理输出 (外部训练框架的原始预测张量).
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// 单头输出: 分类 logits `(K,)` 或分割 logits `(K, D, H, W)`.
    Single(ArrayD<f32>),

    /// 双头输出: 分割 logits + 分类 logits.
    Pair {
        /// 分割头输出 `(K, D, H, W)`.
        mask: ArrayD<f32>,
        /// 分类头输出 `(K,)`.
        category: ArrayD<f32>,
    },
}

/// 标注策略.
#[derive(Clone)]
pub enum LabelStrategy {
    /// 无标注.
    Plain,

    /// 单类别标注. `values` 以原始索引寻址, 覆盖整个底层存储.
    Categorical {
        /// 每条记录的原始标签值.
        values: Arc<Vec<String>>,
        /// 共享类别词表.
        vocab: Arc<Vocab>,
    },

    /// 稠密分割标注, 掩膜来自与输入存储逐索引对齐的第二存储.
    Segmentation {
        /// 掩膜存储.
        masks: Arc<dyn VolumeStore>,
    },

    /// 并行标注: 掩膜 + 类别.
    Parallel {
        /// 掩膜存储.
        masks: Arc<dyn VolumeStore>,
        /// 每条记录的原始标签值.
        values: Arc<Vec<String>>,
        /// 共享类别词表.
        vocab: Arc<Vocab>,
    },
}

impl LabelStrategy {
    /// 为原始索引 `idx` 产出标签.
    pub fn get(&self, idx: RawIdx) -> Result<Label, ReadError> {
        match self {
            Self::Plain => Ok(Label::None),
            Self::Categorical { values, vocab } => {
                let name = values[idx].clone();
                let code = vocab.code(&name)?;
                Ok(Label::Category { code, name })
            }
            Self::Segmentation { masks } => {
                let mask = masks.read(idx)?.mapv(|v| v as i64);
                Ok(Label::Mask(mask))
            }
            Self::Parallel {
                masks,
                values,
                vocab,
            } => {
                let mask = masks.read(idx)?.mapv(|v| v as i64);
                let name = values[idx].clone();
                let code = vocab.code(&name)?;
                Ok(Label::Parallel { mask, code, name })
            }
        }
    }

    /// 本策略适用的损失函数族.
    ///
    /// 无标注数据集沿用普通分类损失作为缺省 (与有监督微调时的默认口径一致).
    pub fn loss_kind(&self) -> LossKind {
        match self {
            Self::Plain | Self::Categorical { .. } => LossKind::Category,
            Self::Segmentation { .. } => LossKind::SegCrossEntropy,
            Self::Parallel { .. } => LossKind::Parallel,
        }
    }

    /// 共享词表 (仅类别相关策略持有).
    pub fn vocab(&self) -> Option<&Arc<Vocab>> {
        match self {
            Self::Categorical { vocab, .. } | Self::Parallel { vocab, .. } => Some(vocab),
            _ => None,
        }
    }

    /// 推理后处理: 将原始预测约简为标签.
    ///
    /// 单类别预测约简为 arg-max 类别; 分割预测沿通道轴做逐体素 arg-max;
    /// 并行预测对两部分独立约简. 输出形态与策略不匹配属于编程错误,
    /// 程序 panic.
    pub fn analyze_pred(&self, pred: &ModelOutput) -> Result<Label, VocabError> {
        match (self, pred) {
            (Self::Plain, _) => Ok(Label::None),
            (Self::Categorical { vocab, .. }, ModelOutput::Single(p)) => {
                let code = argmax_flat(p);
                let name = vocab.name(code)?.to_owned();
                Ok(Label::Category { code, name })
            }
            (Self::Segmentation { .. }, ModelOutput::Single(p)) => {
                Ok(Label::Mask(argmax_channels(p)))
            }
            (Self::Parallel { vocab, .. }, ModelOutput::Pair { mask, category }) => {
                let code = argmax_flat(category);
                let name = vocab.name(code)?.to_owned();
                Ok(Label::Parallel {
                    mask: argmax_channels(mask),
                    code,
                    name,
                })
            }
            _ => panic!("模型输出形态与标注策略不匹配"),
        }
    }

    /// 将外部模型输出重建为可展示的 item (供展示层使用).
    ///
    /// `code` 仅对并行策略有意义, 取分类头 arg-max 后的类别编码;
    /// 并行策略下缺失 `code` 属于编程错误, 程序 panic.
    pub fn reconstruct(
        &self,
        tensor: ArrayD<f32>,
        code: Option<usize>,
    ) -> Result<VolumeItem, VocabError> {
        match self {
            Self::Plain | Self::Categorical { .. } => {
                Ok(VolumeItem::scan(tensor, None, None, None))
            }
            Self::Segmentation { .. } => Ok(VolumeItem::mask(tensor, None)),
            Self::Parallel { vocab, .. } => {
                let code = code.expect("并行策略的 reconstruct 需要类别编码");
                let name = vocab.name(code)?.to_owned();
                Ok(VolumeItem::mask_labeled(tensor, None, code, name))
            }
        }
    }
}

/// 一维预测的 arg-max 编码. 空预测属于编程错误, 程序 panic.
fn argmax_flat(pred: &ArrayD<f32>) -> usize {
    pred.iter()
        .enumerate()
        .max_by_key(|(_, v)| OrderedFloat(**v))
        .map(|(i, _)| i)
        .expect("arg-max 的输入不能为空")
}

/// 沿首维 (通道轴) 的逐体素 arg-max. 输入形状 `(K, ...)`, 输出形状 `(...)`.
fn argmax_channels(pred: &ArrayD<f32>) -> ArrayD<i64> {
    assert!(pred.ndim() >= 2, "分割预测至少应有通道轴与空间轴");
    let k = pred.shape()[0];
    assert!(k > 0, "分割预测的通道数不能为零");

    let mut out = ArrayD::<i64>::zeros(IxDyn(&pred.shape()[1..]));
    let mut best = pred.index_axis(Axis(0), 0).to_owned();
    for c in 1..k {
        let channel = pred.index_axis(Axis(0), c);
        Zip::from(&mut out)
            .and(&mut best)
            .and(&channel)
            .for_each(|o, b, &v| {
                if v > *b {
                    *b = v;
                    *o = c as i64;
                }
            });
    }
    out
}
