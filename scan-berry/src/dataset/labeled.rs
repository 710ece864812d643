//! 带标注数据集与一次性归一化.

use ndarray::{ArrayD, Axis};

use crate::dataset::label::{Label, LabelStrategy, LossKind};
use crate::dataset::VolumeDataset;
use crate::error::{ConfigError, ReadError};
use crate::transform::TransformPipeline;
use crate::VolumeItem;

/// 归一化选项.
#[derive(Copy, Clone, Debug)]
pub struct NormOptions {
    /// 为无通道轴的 `(D, H, W)` 张量补一个通道轴.
    pub format3d: bool,

    /// 对输入张量做逐通道自归一化 (减均值除标准差).
    pub do_x: bool,
}

impl Default for NormOptions {
    fn default() -> Self {
        Self {
            format3d: true,
            do_x: true,
        }
    }
}

/// 归一化配置状态. 只允许 Unconfigured -> Configured 一次转移.
#[derive(Copy, Clone, Debug)]
enum NormState {
    Unconfigured,
    Configured(NormOptions),
}

/// 带标注数据集.
///
/// 输入侧是一个 [`VolumeDataset`], 标签侧是与其 `items`
/// 序对齐的 [`LabelStrategy`]. 迭代产出 `(输入 item, 标签)` 对.
pub struct LabeledDataset {
    x: VolumeDataset,
    y: LabelStrategy,
    norm: NormState,
}

impl LabeledDataset {
    pub(crate) fn new(x: VolumeDataset, y: LabelStrategy) -> Self {
        Self {
            x,
            y,
            norm: NormState::Unconfigured,
        }
    }

    /// 输入侧数据集.
    #[inline]
    pub fn x(&self) -> &VolumeDataset {
        &self.x
    }

    /// 标注策略.
    #[inline]
    pub fn y(&self) -> &LabelStrategy {
        &self.y
    }

    /// 逻辑大小.
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// 本数据集适用的损失函数族.
    #[inline]
    pub fn loss_kind(&self) -> LossKind {
        self.y.loss_kind()
    }

    /// 配置一次性归一化.
    ///
    /// 重复调用返回 `ConfigError::AlreadyNormalized`, 且首次配置保持不变.
    pub fn normalize(&mut self, opts: NormOptions) -> Result<&mut Self, ConfigError> {
        if matches!(self.norm, NormState::Configured(_)) {
            return Err(ConfigError::AlreadyNormalized);
        }
        log::info!("normalize configured: {opts:?}");
        self.norm = NormState::Configured(opts);
        Ok(self)
    }

    /// 当前归一化配置.
    pub fn norm_options(&self) -> Option<&NormOptions> {
        match &self.norm {
            NormState::Unconfigured => None,
            NormState::Configured(o) => Some(o),
        }
    }

    /// 取第 `i` 对 `(输入 item, 标签)`. `i` 为视图内序号,
    /// 越界属于编程错误, 程序 panic.
    ///
    /// 若已配置归一化, 输入张量在返回前完成通道轴补齐与自归一化.
    pub fn get(&self, i: usize) -> Result<(VolumeItem, Label), ReadError> {
        let mut item = self.x.get(i)?;
        let label = self.y.get(self.x.items()[i])?;
        self.apply_norm(&mut item);
        Ok((item, label))
    }

    /// 取第 `i` 对并应用变换流水线.
    ///
    /// 输入侧走 [`VolumeDataset::get_tfmd`] (缓存未命中时解析并写回).
    /// `tfm_y` 为真时, 掩膜类标签与输入共用同一组参数经过流水线:
    /// patch 参数来自共享缓存, stateless 参数本次调用解析一次、两侧共用,
    /// 因此带随机性的 stateless 变换也不会破坏 x/y 的空间对齐.
    pub fn get_tfmd(
        &self,
        i: usize,
        pipeline: &TransformPipeline,
        tfm_y: bool,
    ) -> Result<(VolumeItem, Label), ReadError> {
        if !tfm_y {
            let mut item = self.x.get_tfmd(i, pipeline)?;
            let label = self.y.get(self.x.items()[i])?;
            self.apply_norm(&mut item);
            return Ok((item, label));
        }

        let idx = self.x.items()[i];
        let patch = self
            .x
            .params()
            .get_or_insert_with(idx, || pipeline.draw_patch_params(Some(idx)));
        let stateless = pipeline.draw_stateless_params();

        let mut item = self.x.get(i)?;
        item.map_tensor(|t| pipeline.apply_resolved(t, &patch, &stateless));

        let label = match self.y.get(idx)? {
            Label::Mask(mask) => {
                let tfmd = pipeline.apply_resolved(mask.mapv(|v| v as f32), &patch, &stateless);
                Label::Mask(tfmd.mapv(|v| v as i64))
            }
            Label::Parallel { mask, code, name } => {
                let tfmd = pipeline.apply_resolved(mask.mapv(|v| v as f32), &patch, &stateless);
                Label::Parallel {
                    mask: tfmd.mapv(|v| v as i64),
                    code,
                    name,
                }
            }
            other => other,
        };

        self.apply_norm(&mut item);
        Ok((item, label))
    }

    /// 按元数据列 `col` 的 0/1 谓词划分为 (训练集, 验证集).
    ///
    /// 两侧共享标注策略 (同一词表/掩膜存储实例) 与输入侧的参数缓存,
    /// 并继承当前归一化配置.
    pub fn split_by_metadata(&self, col: &str) -> Result<(Self, Self), ConfigError> {
        let (train, valid) = self.x.split_by_metadata(col)?;
        Ok((self.derive(train), self.derive(valid)))
    }

    /// 按比例随机划分为 (训练集, 验证集). 语义同
    /// [`VolumeDataset::split_by_pct`], 标注策略与归一化配置同上共享/继承.
    pub fn split_by_pct(&self, valid_pct: f64, seed: u64) -> (Self, Self) {
        let (train, valid) = self.x.split_by_pct(valid_pct, seed);
        (self.derive(train), self.derive(valid))
    }

    fn derive(&self, x: VolumeDataset) -> Self {
        Self {
            x,
            y: self.y.clone(),
            norm: self.norm,
        }
    }

    /// 顺序迭代全部 `(输入 item, 标签)` 对.
    pub fn iter(&self) -> impl Iterator<Item = Result<(VolumeItem, Label), ReadError>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    fn apply_norm(&self, item: &mut VolumeItem) {
        if let NormState::Configured(opts) = &self.norm {
            let opts = *opts;
            item.map_tensor(|mut t| {
                if opts.format3d && t.ndim() == 3 {
                    t = t.insert_axis(Axis(0));
                }
                if opts.do_x {
                    self_normalize(&mut t);
                }
                t
            });
        }
    }
}

/// 自归一化: 减均值、除标准差 (无偏估计).
///
/// 4 维张量 `(C, D, H, W)` 逐通道归一化; 未补通道轴的 3 维张量
/// `(D, H, W)` 整体归一化 (首维是深度而非通道, 不能按它切分).
///
/// 标准差为零的恒值通道会产生非有限值, 与上游口径一致, 由调用方保证数据合理.
fn self_normalize(t: &mut ArrayD<f32>) {
    if t.ndim() == 3 {
        let mean = t.mean().unwrap_or(0.0);
        let std = t.std(1.0);
        t.mapv_inplace(|v| (v - mean) / std);
        return;
    }
    for mut channel in t.axis_iter_mut(Axis(0)) {
        let mean = channel.mean().unwrap_or(0.0);
        let std = channel.std(1.0);
        channel.mapv_inplace(|v| (v - mean) / std);
    }
}
