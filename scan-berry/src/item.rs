//! 单个已解码的体数据 item.

use ndarray::ArrayD;
use std::fmt;

use crate::meta::MetaRow;
use crate::transform::{TfmParams, TransformPipeline};
use crate::{Idx3d, RawIdx};

/// item 的消费语义.
///
/// 原始扫描以浮点消费, 分割掩膜以整数类别消费,
/// 并行 item 额外携带一个类别标签.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    /// 原始扫描体数据.
    Scan,

    /// 稠密分割掩膜.
    Mask,

    /// 稠密分割掩膜 + 类别标签.
    MaskLabeled {
        /// 类别编码.
        code: usize,
        /// 类别的人类可读取值.
        name: String,
    },
}

/// `data()` 的返回值: 按 item 消费语义类型转换后的张量.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemData {
    /// 浮点体数据.
    Float(ArrayD<f32>),

    /// 整数类别掩膜.
    Classes(ArrayD<i64>),

    /// (整数类别掩膜, 类别编码) 对.
    Labeled(ArrayD<i64>, usize),
}

/// 单个已解码的体数据, 连同其身份信息、可选元数据行与可选的已缓存变换参数.
///
/// 张量形状为 `(C, D, H, W)` 或 `(D, H, W)`. 身份字段 (`idx`, `metadata`)
/// 构建后不可变; 张量只能通过 [`VolumeItem::apply_tfms`] 原地修改.
///
/// item 在每次数据集访问时重新构建, 除 per-item 参数缓存外不跨访问持久化.
#[derive(Debug, Clone)]
pub struct VolumeItem {
    tensor: ArrayD<f32>,
    idx: Option<RawIdx>,
    metadata: Option<MetaRow>,
    tfm_params: Option<TfmParams>,
    kind: ItemKind,
}

impl VolumeItem {
    /// 创建原始扫描 item.
    pub fn scan(
        tensor: ArrayD<f32>,
        idx: Option<RawIdx>,
        metadata: Option<MetaRow>,
        tfm_params: Option<TfmParams>,
    ) -> Self {
        Self {
            tensor,
            idx,
            metadata,
            tfm_params,
            kind: ItemKind::Scan,
        }
    }

    /// 创建分割掩膜 item.
    pub fn mask(tensor: ArrayD<f32>, idx: Option<RawIdx>) -> Self {
        Self {
            tensor,
            idx,
            metadata: None,
            tfm_params: None,
            kind: ItemKind::Mask,
        }
    }

    /// 创建带类别标签的分割掩膜 item.
    pub fn mask_labeled(
        tensor: ArrayD<f32>,
        idx: Option<RawIdx>,
        code: usize,
        name: String,
    ) -> Self {
        Self {
            tensor,
            idx,
            metadata: None,
            tfm_params: None,
            kind: ItemKind::MaskLabeled { code, name },
        }
    }

    /// 张量形状.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    /// 空间尺寸, 即形状的末三维 (D, H, W).
    ///
    /// 张量维数小于 3 时程序 panic.
    pub fn size(&self) -> Idx3d {
        let s = self.shape();
        assert!(s.len() >= 3, "体数据张量至少应有 3 维");
        (s[s.len() - 3], s[s.len() - 2], s[s.len() - 1])
    }

    /// item 对应的原始存储索引. 游离 item (如 `reconstruct` 的产物) 为 `None`.
    #[inline]
    pub fn idx(&self) -> Option<RawIdx> {
        self.idx
    }

    /// item 关联的元数据行.
    #[inline]
    pub fn metadata(&self) -> Option<&MetaRow> {
        self.metadata.as_ref()
    }

    /// item 携带的已解析变换参数.
    #[inline]
    pub fn tfm_params(&self) -> Option<&TfmParams> {
        self.tfm_params.as_ref()
    }

    /// item 的消费语义.
    #[inline]
    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    /// 底层张量的只读引用.
    #[inline]
    pub fn tensor(&self) -> &ArrayD<f32> {
        &self.tensor
    }

    /// 按消费语义类型转换后的数据. 这是读取时的纯视图转换, 不修改 item.
    pub fn data(&self) -> ItemData {
        match &self.kind {
            ItemKind::Scan => ItemData::Float(self.tensor.clone()),
            ItemKind::Mask => ItemData::Classes(self.tensor.mapv(|v| v as i64)),
            ItemKind::MaskLabeled { code, .. } => {
                ItemData::Labeled(self.tensor.mapv(|v| v as i64), *code)
            }
        }
    }

    /// 消费语义层 (归一化等) 的张量替换入口. 身份字段保持不变.
    pub(crate) fn map_tensor<F: FnOnce(ArrayD<f32>) -> ArrayD<f32>>(&mut self, f: F) {
        let tensor = std::mem::replace(&mut self.tensor, ArrayD::zeros(ndarray::IxDyn(&[0])));
        self.tensor = f(tensor);
    }

    /// 解析并按序应用变换流水线, 原地修改张量并返回 `&mut self` 以便链式调用.
    ///
    /// `do_resolve` 为真时执行解析阶段: 若 item 已携带缓存参数则直接复用,
    /// 否则按 `(流水线种子, idx)` 解析一组新参数并记入 item.
    /// `do_resolve` 为假时要求参数已经解析完毕 (流水线含 patch
    /// 变换而参数缺失属于编程错误, 程序 panic).
    pub fn apply_tfms(&mut self, pipeline: &TransformPipeline, do_resolve: bool) -> &mut Self {
        if do_resolve && self.tfm_params.is_none() {
            self.tfm_params = Some(pipeline.draw_patch_params(self.idx));
        }
        let params = match &self.tfm_params {
            Some(p) => p.clone(),
            None => TfmParams::new(Vec::new()),
        };
        let tensor = std::mem::replace(&mut self.tensor, ArrayD::zeros(ndarray::IxDyn(&[0])));
        self.tensor = pipeline.apply(tensor, &params);
        self
    }
}

impl fmt::Display for VolumeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ItemKind::Scan => write!(f, "VolumeItem {:?}", self.shape()),
            ItemKind::Mask => write!(f, "VolumeMask {:?}", self.shape()),
            ItemKind::MaskLabeled { name, .. } => {
                write!(f, "VolumeMask {:?} label:{name:?}", self.shape())
            }
        }
    }
}
