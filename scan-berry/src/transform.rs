//! 变换流水线.
//!
//! 两阶段协议: 先解析 (resolve) 随机参数, 再按序应用 (apply).
//!
//! patch 类变换的参数对同一逻辑 item 解析一次并缓存, 跨 epoch 复用,
//! 从而保证同一原始索引的重复访问得到 bit 级一致的输出;
//! stateless 类变换每次调用独立解析, 不做任何持久化.
//!
//! 应用顺序由 `order` 字段稳定排序决定, 同序变换保持插入相对顺序.

use ndarray::ArrayD;
use ordered_float::OrderedFloat;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::RawIdx;

/// 变换种类.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TfmKind {
    /// 每次调用独立解析参数. 可以携带新鲜随机性, 也可以完全无随机性.
    Stateless,

    /// 参数按 item 解析一次并缓存, 重复应用到同一逻辑 item 时必须复用.
    Patch,
}

/// 一组已解析的变换参数.
///
/// 内容为 `[0, 1)` 区间的均匀抽样, 由各变换自行解释
/// (如裁剪偏移、翻转开关). 布局为流水线中所有 patch
/// 变换的参数按排序后顺序拼接.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TfmParams(Vec<f32>);

impl TfmParams {
    /// 从原始抽样直接创建.
    #[inline]
    pub fn new(draws: Vec<f32>) -> Self {
        Self(draws)
    }

    /// 抽样个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 参数集是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 原始抽样切片.
    #[inline]
    pub fn draws(&self) -> &[f32] {
        &self.0
    }
}

type ApplyFn = Box<dyn Fn(ArrayD<f32>, &[f32]) -> ArrayD<f32> + Send + Sync>;

/// 单个变换操作.
///
/// `apply` 接受张量与本操作的参数切片 (长度为 `param_len`),
/// 返回变换后的张量.
pub struct TransformOp {
    name: &'static str,
    order: OrderedFloat<f32>,
    kind: TfmKind,
    param_len: usize,
    apply: ApplyFn,
}

impl std::fmt::Debug for TransformOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformOp")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("kind", &self.kind)
            .field("param_len", &self.param_len)
            .finish_non_exhaustive()
    }
}

impl TransformOp {
    /// 创建 stateless 变换.
    pub fn stateless<F>(name: &'static str, order: f32, param_len: usize, apply: F) -> Self
    where
        F: Fn(ArrayD<f32>, &[f32]) -> ArrayD<f32> + Send + Sync + 'static,
    {
        Self {
            name,
            order: OrderedFloat(order),
            kind: TfmKind::Stateless,
            param_len,
            apply: Box::new(apply),
        }
    }

    /// 创建 patch 变换.
    pub fn patch<F>(name: &'static str, order: f32, param_len: usize, apply: F) -> Self
    where
        F: Fn(ArrayD<f32>, &[f32]) -> ArrayD<f32> + Send + Sync + 'static,
    {
        Self {
            name,
            order: OrderedFloat(order),
            kind: TfmKind::Patch,
            param_len,
            apply: Box::new(apply),
        }
    }

    /// 变换名.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 应用优先级. 数值小者先应用.
    #[inline]
    pub fn order(&self) -> f32 {
        self.order.0
    }

    /// 变换种类.
    #[inline]
    pub fn kind(&self) -> TfmKind {
        self.kind
    }

    /// 本变换需要的参数个数.
    #[inline]
    pub fn param_len(&self) -> usize {
        self.param_len
    }
}

/// 有序变换集合.
///
/// 输入集合本身无序, 应用前按 `order` 升序稳定排序.
/// `seed` 参与 patch 参数的按 item 解析, 使得首次解析也是可复现的.
pub struct TransformPipeline {
    ops: Vec<TransformOp>,
    seed: u64,
}

impl TransformPipeline {
    /// 创建空流水线.
    pub fn new(seed: u64) -> Self {
        Self {
            ops: Vec::new(),
            seed,
        }
    }

    /// 追加一个变换 (builder 风格).
    pub fn with(mut self, op: TransformOp) -> Self {
        self.ops.push(op);
        self
    }

    /// 追加一个变换.
    pub fn push(&mut self, op: TransformOp) {
        self.ops.push(op);
    }

    /// 变换个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// 流水线是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// 所有 patch 变换需要的参数总数.
    pub fn patch_param_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|o| o.kind == TfmKind::Patch)
            .map(|o| o.param_len)
            .sum()
    }

    /// 所有 stateless 变换需要的参数总数.
    pub fn stateless_param_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|o| o.kind == TfmKind::Stateless)
            .map(|o| o.param_len)
            .sum()
    }

    /// 按 `order` 升序稳定排序后的变换引用. 同序变换保持插入相对顺序.
    pub fn sorted(&self) -> Vec<&TransformOp> {
        let mut ops: Vec<&TransformOp> = self.ops.iter().collect();
        ops.sort_by_key(|o| o.order);
        ops
    }

    /// 为原始索引 `idx` 解析一组新的 patch 参数.
    ///
    /// 解析由 `(流水线种子, idx)` 决定: 同一流水线对同一索引总是解析出
    /// 相同的参数. `idx` 为 `None` 时 (游离 item) 退化为新鲜随机抽样.
    pub fn draw_patch_params(&self, idx: Option<RawIdx>) -> TfmParams {
        let n = self.patch_param_len();
        let mut draws = Vec::with_capacity(n);
        match idx {
            Some(idx) => {
                let mut rng =
                    SmallRng::seed_from_u64(self.seed ^ (idx as u64).wrapping_mul(0x9E37_79B9));
                draws.extend((0..n).map(|_| rng.gen::<f32>()));
            }
            None => {
                let mut rng = rand::thread_rng();
                draws.extend((0..n).map(|_| rng.gen::<f32>()));
            }
        }
        TfmParams(draws)
    }

    /// 为本次调用解析一组新鲜的 stateless 参数.
    ///
    /// stateless 参数不持久化, 但需要同步变换输入与掩膜时,
    /// 可将同一组抽样传给两次 [`TransformPipeline::apply_resolved`].
    pub fn draw_stateless_params(&self) -> TfmParams {
        let mut rng = rand::thread_rng();
        TfmParams(
            (0..self.stateless_param_len())
                .map(|_| rng.gen::<f32>())
                .collect(),
        )
    }

    /// 将整条流水线按序应用到 `tensor`.
    ///
    /// `params` 必须是本流水线解析出的 patch 参数
    /// (长度与 `patch_param_len()` 一致, 否则程序 panic).
    /// patch 变换按排序后顺序依次消费 `params` 中属于自己的切片;
    /// stateless 变换现场抽取新鲜参数.
    pub fn apply(&self, tensor: ArrayD<f32>, params: &TfmParams) -> ArrayD<f32> {
        self.apply_resolved(tensor, params, &self.draw_stateless_params())
    }

    /// 以完全解析好的参数应用整条流水线, 不引入任何新随机性.
    ///
    /// `patch` 与 `stateless` 的长度须分别与 `patch_param_len()` 和
    /// `stateless_param_len()` 一致, 否则程序 panic. 两类变换都按
    /// 排序后顺序依次消费属于自己的切片.
    pub fn apply_resolved(
        &self,
        tensor: ArrayD<f32>,
        patch: &TfmParams,
        stateless: &TfmParams,
    ) -> ArrayD<f32> {
        assert_eq!(
            patch.len(),
            self.patch_param_len(),
            "patch 参数与流水线不匹配"
        );
        assert_eq!(
            stateless.len(),
            self.stateless_param_len(),
            "stateless 参数与流水线不匹配"
        );
        let mut patch_offset = 0usize;
        let mut stateless_offset = 0usize;
        let mut out = tensor;
        for op in self.sorted() {
            match op.kind {
                TfmKind::Patch => {
                    let slice = &patch.draws()[patch_offset..patch_offset + op.param_len];
                    patch_offset += op.param_len;
                    out = (op.apply)(out, slice);
                }
                TfmKind::Stateless => {
                    let slice =
                        &stateless.draws()[stateless_offset..stateless_offset + op.param_len];
                    stateless_offset += op.param_len;
                    out = (op.apply)(out, slice);
                }
            }
        }
        out
    }
}

/// 跨视图共享的 per-item 变换参数缓存.
///
/// 每个底层存储记录一个槽位, 按原始索引寻址. 所有由同一数据集派生的
/// 视图 (划分、重标注) 共享同一个缓存实例, 从而让同一原始索引在任何
/// 视图下都解析出同一组参数.
///
/// 写入策略为 read-if-present, else generate-and-store;
/// 多 worker 场景由内部互斥锁保证首写安全.
#[derive(Clone)]
pub struct ParamCache {
    slots: Arc<Mutex<Vec<Option<TfmParams>>>>,
}

impl ParamCache {
    /// 创建 `len` 个空槽位的缓存. `len` 应等于底层存储记录数,
    /// 而非当前视图大小.
    pub fn new(len: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(vec![None; len])),
        }
    }

    /// 槽位个数.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// 缓存是否没有槽位.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取第 `idx` 槽已缓存的参数.
    pub fn get(&self, idx: RawIdx) -> Option<TfmParams> {
        self.slots.lock().unwrap()[idx].clone()
    }

    /// 取第 `idx` 槽的参数; 若槽位为空, 则用 `make` 生成并存入.
    ///
    /// 并发首写时只有一个生成结果会被保留.
    pub fn get_or_insert_with<F: FnOnce() -> TfmParams>(&self, idx: RawIdx, make: F) -> TfmParams {
        let mut slots = self.slots.lock().unwrap();
        slots[idx].get_or_insert_with(make).clone()
    }

    /// 判断两个缓存是否为同一实例 (而非内容相等).
    #[inline]
    pub fn shares_with(&self, other: &ParamCache) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn scalar(v: f32) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(&[1]), v)
    }

    fn add_one() -> TransformOp {
        TransformOp::stateless("add_one", 1.0, 0, |t, _| t + 1.0)
    }

    fn double() -> TransformOp {
        TransformOp::stateless("double", 1.0, 0, |t, _| t * 2.0)
    }

    #[test]
    fn test_sort_ascending() {
        // order 0.5 的变换后插入, 但必须先应用: (1 * 2 + 1) = 3.
        let pipe = TransformPipeline::new(0)
            .with(add_one())
            .with(TransformOp::stateless("double_first", 0.5, 0, |t, _| {
                t * 2.0
            }));
        let out = pipe.apply(scalar(1.0), &TfmParams::new(vec![]));
        assert_eq!(out[[0]], 3.0);
    }

    #[test]
    fn test_tie_keeps_insertion_order() {
        // 同序: 插入序即应用序. (1 + 1) * 2 = 4, 而非 1 * 2 + 1 = 3.
        let pipe = TransformPipeline::new(0).with(add_one()).with(double());
        let out = pipe.apply(scalar(1.0), &TfmParams::new(vec![]));
        assert_eq!(out[[0]], 4.0);

        let pipe = TransformPipeline::new(0).with(double()).with(add_one());
        let out = pipe.apply(scalar(1.0), &TfmParams::new(vec![]));
        assert_eq!(out[[0]], 3.0);
    }

    #[test]
    fn test_patch_params_deterministic_per_idx() {
        let pipe = TransformPipeline::new(7).with(TransformOp::patch("shift", 2.0, 3, |t, p| {
            t + p[0] + p[1] + p[2]
        }));
        assert_eq!(pipe.patch_param_len(), 3);

        let a = pipe.draw_patch_params(Some(5));
        let b = pipe.draw_patch_params(Some(5));
        assert_eq!(a, b);
        assert_ne!(a, pipe.draw_patch_params(Some(6)));

        let x = pipe.apply(scalar(0.0), &a);
        let y = pipe.apply(scalar(0.0), &b);
        assert_eq!(x, y);
    }

    #[test]
    fn test_param_layout_follows_sorted_order() {
        // 两个 patch 变换: 排序后 first (order 1) 消费前 1 个参数,
        // second (order 2) 消费后 1 个参数.
        let pipe = TransformPipeline::new(0)
            .with(TransformOp::patch("second", 2.0, 1, |t, p| t * p[0]))
            .with(TransformOp::patch("first", 1.0, 1, |t, p| t + p[0]));
        let params = TfmParams::new(vec![0.25, 0.5]);
        let out = pipe.apply(scalar(1.0), &params);
        assert_eq!(out[[0]], (1.0 + 0.25) * 0.5);
    }

    #[test]
    fn test_apply_resolved_is_deterministic() {
        // 同一组 patch + stateless 抽样应用两次, 输出 bit 级一致.
        let pipe = TransformPipeline::new(0)
            .with(TransformOp::patch("shift", 1.0, 1, |t, p| t + p[0]))
            .with(TransformOp::stateless("jitter", 2.0, 1, |t, p| t * p[0]));
        assert_eq!(pipe.stateless_param_len(), 1);

        let patch = pipe.draw_patch_params(Some(0));
        let stateless = pipe.draw_stateless_params();
        let a = pipe.apply_resolved(scalar(1.0), &patch, &stateless);
        let b = pipe.apply_resolved(scalar(1.0), &patch, &stateless);
        assert_eq!(a, b);
    }

    #[test]
    fn test_param_cache_shared_and_lazy() {
        let cache = ParamCache::new(4);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.get(2), None);

        let view = cache.clone();
        assert!(view.shares_with(&cache));

        let made = view.get_or_insert_with(2, || TfmParams::new(vec![0.5]));
        // 另一个句柄读到同一组参数, 且不会二次生成.
        let seen = cache.get_or_insert_with(2, || unreachable!());
        assert_eq!(made, seen);
        assert_eq!(cache.get(2), Some(made));
    }
}
