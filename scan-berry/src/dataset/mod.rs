//! 数据集操作.
//!
//! [`VolumeDataset`] 把序号映射为解码后的 [`VolumeItem`],
//! 并负责划分、标注与 per-item 变换参数的缓存共享.

use either::Either;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::meta::{MetaRow, MetaTable};
use crate::store::{StoreError, VolumeStore};
use crate::transform::{ParamCache, TransformPipeline};
use crate::{RawIdx, VolumeItem};

pub mod label;
mod labeled;

pub use label::{Label, LabelStrategy, LossKind, ModelOutput, Vocab};
pub use labeled::{LabeledDataset, NormOptions};

/// 惰性体数据集.
///
/// `items` 是原始存储索引的有序序列 (可以是 `[0, N)` 的子集或重排).
/// 数据集不缓存解码结果: 每次 `get` 都重新读取存储并构建新 item,
/// 唯一跨访问的状态是 per-item 变换参数缓存.
///
/// 由划分/重标注派生出的所有视图共享同一存储、元数据表与参数缓存实例.
#[derive(Clone)]
pub struct VolumeDataset {
    items: Vec<RawIdx>,
    store: Arc<dyn VolumeStore>,
    metadata: Option<Arc<MetaTable>>,
    params: ParamCache,
}

impl VolumeDataset {
    /// 在 `store` 的全部记录上创建数据集, 顺序为 `0..store.len()`.
    ///
    /// 空存储产生空数据集, 不是错误.
    pub fn from_store(store: Arc<dyn VolumeStore>) -> Self {
        let len = store.len();
        Self {
            items: (0..len).collect(),
            store,
            metadata: None,
            params: ParamCache::new(len),
        }
    }

    /// 挂载元数据表. 表的行数必须与底层存储记录数一致,
    /// 否则返回 `ConfigError::LengthMismatch`.
    pub fn with_metadata(mut self, metadata: Arc<MetaTable>) -> Result<Self, ConfigError> {
        if metadata.rows() != self.store.len() {
            return Err(ConfigError::LengthMismatch(
                self.store.len(),
                metadata.rows(),
            ));
        }
        self.metadata = Some(metadata);
        Ok(self)
    }

    /// 当前视图的逻辑大小.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// 当前视图是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 当前视图包含的原始索引序列.
    #[inline]
    pub fn items(&self) -> &[RawIdx] {
        &self.items
    }

    /// 底层存储.
    #[inline]
    pub fn store(&self) -> &Arc<dyn VolumeStore> {
        &self.store
    }

    /// 挂载的元数据表.
    #[inline]
    pub fn metadata(&self) -> Option<&Arc<MetaTable>> {
        self.metadata.as_ref()
    }

    /// 共享的变换参数缓存.
    #[inline]
    pub fn params(&self) -> &ParamCache {
        &self.params
    }

    /// 取第 `i` 个 item. `i` 是视图内序号, 不是原始存储索引.
    ///
    /// `i` 必须在 `[0, len)` 内, 否则程序 panic. 除分配外无副作用.
    pub fn get(&self, i: usize) -> Result<VolumeItem, StoreError> {
        let idx = self.items[i];
        let tensor = self.store.read(idx)?;
        let metadata = self
            .metadata
            .as_ref()
            .map(|t| MetaRow::new(t.clone(), idx));
        Ok(VolumeItem::scan(
            tensor,
            Some(idx),
            metadata,
            self.params.get(idx),
        ))
    }

    /// 取第 `i` 个 item 并应用变换流水线.
    ///
    /// 与裸 `get` + `apply_tfms` 的区别: 若索引的 patch 参数尚未缓存,
    /// 本方法会解析一组并 **写回共享缓存**, 使后续任何视图的访问
    /// 都复用同一组参数 (跨 epoch 确定性).
    pub fn get_tfmd(
        &self,
        i: usize,
        pipeline: &TransformPipeline,
    ) -> Result<VolumeItem, StoreError> {
        let idx = self.items[i];
        self.params
            .get_or_insert_with(idx, || pipeline.draw_patch_params(Some(idx)));
        let mut item = self.get(i)?;
        item.apply_tfms(pipeline, true);
        Ok(item)
    }

    /// 为当前视图的全部索引预解析并缓存 patch 参数.
    pub fn prepare_params(&self, pipeline: &TransformPipeline) {
        for &idx in &self.items {
            self.params
                .get_or_insert_with(idx, || pipeline.draw_patch_params(Some(idx)));
        }
    }

    /// 在不同的索引序列上派生新视图.
    ///
    /// 新视图与本数据集共享存储、元数据表与参数缓存实例 (共享而非复制),
    /// 这是划分/重标注后 per-item 参数保持稳定的前提.
    pub fn new_view(&self, items: Vec<RawIdx>) -> Self {
        Self {
            items,
            store: self.store.clone(),
            metadata: self.metadata.clone(),
            params: self.params.clone(),
        }
    }

    /// 按元数据列 `col` 的 0/1 谓词划分为 (训练集, 验证集).
    ///
    /// 谓词为真的行进入验证集. 两个子集内部保持原有相对顺序,
    /// 并集等于当前视图, 交集为空. 列不存在时返回
    /// `ConfigError::ColumnNotFound`.
    pub fn split_by_metadata(&self, col: &str) -> Result<(Self, Self), ConfigError> {
        let metadata = self.metadata.as_ref().ok_or(ConfigError::NoMetadata)?;
        let column = metadata.require_column(col)?;

        let (train, valid): (Vec<RawIdx>, Vec<RawIdx>) =
            self.items.iter().partition_map(|&idx| {
                if column[idx].is_truthy() {
                    Either::Right(idx)
                } else {
                    Either::Left(idx)
                }
            });

        log::debug!(
            "split by metadata {col:?}: {} train, {} valid",
            train.len(),
            valid.len()
        );
        Ok((self.new_view(train), self.new_view(valid)))
    }

    /// 按比例随机划分为 (训练集, 验证集).
    ///
    /// `valid_pct` 为验证集占比, 必须在 `[0, 1]` 内, 否则程序 panic.
    /// 抽样由 `seed` 完全决定; 两个子集内部保持原有相对顺序.
    pub fn split_by_pct(&self, valid_pct: f64, seed: u64) -> (Self, Self) {
        assert!((0.0..=1.0).contains(&valid_pct), "valid_pct 应在 [0, 1] 内");

        let mut shuffled = self.items.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
        let n_valid = (valid_pct * self.len() as f64) as usize;
        let picked: HashSet<RawIdx> = shuffled.into_iter().take(n_valid).collect();

        let (train, valid): (Vec<RawIdx>, Vec<RawIdx>) =
            self.items.iter().partition_map(|&idx| {
                if picked.contains(&idx) {
                    Either::Right(idx)
                } else {
                    Either::Left(idx)
                }
            });
        (self.new_view(train), self.new_view(valid))
    }

    /// 构建无标注的带标注数据集 (标签恒为 `Label::None`).
    ///
    /// 用于只需要输入流水线与归一化口径的推理场景.
    pub fn label_plain(&self) -> LabeledDataset {
        LabeledDataset::new(self.clone(), LabelStrategy::Plain)
    }

    /// 以元数据列 `col` 为类别标签, 构建带标注数据集.
    ///
    /// 类别词表从当前视图观测到的值建立 (排序去重).
    /// 划分后的视图应先划分再标注, 或通过共享的 `Vocab` 重建,
    /// 以保证两侧使用同一映射.
    pub fn label_from_metadata(&self, col: &str) -> Result<LabeledDataset, ConfigError> {
        let metadata = self.metadata.as_ref().ok_or(ConfigError::NoMetadata)?;
        let column = metadata.require_column(col)?;

        let values: Arc<Vec<String>> = Arc::new(column.iter().map(|v| v.to_string()).collect());
        let vocab = Arc::new(Vocab::build(self.items.iter().map(|&i| values[i].clone())));
        let strategy = LabelStrategy::Categorical { values, vocab };
        Ok(LabeledDataset::new(self.clone(), strategy))
    }

    /// 以第二存储 `masks` 为稠密分割标签, 构建带标注数据集.
    ///
    /// `masks` 必须与输入存储逐索引对齐 (长度一致), 否则返回
    /// `ConfigError::LengthMismatch`.
    pub fn label_from_store(
        &self,
        masks: Arc<dyn VolumeStore>,
    ) -> Result<LabeledDataset, ConfigError> {
        if masks.len() != self.store.len() {
            return Err(ConfigError::LengthMismatch(self.store.len(), masks.len()));
        }
        let strategy = LabelStrategy::Segmentation { masks };
        Ok(LabeledDataset::new(self.clone(), strategy))
    }

    /// 并行标注: 以 `masks` 为分割标签, 同时以元数据列 `col` 为类别标签.
    pub fn label_parallel(
        &self,
        masks: Arc<dyn VolumeStore>,
        col: &str,
    ) -> Result<LabeledDataset, ConfigError> {
        if masks.len() != self.store.len() {
            return Err(ConfigError::LengthMismatch(self.store.len(), masks.len()));
        }
        let metadata = self.metadata.as_ref().ok_or(ConfigError::NoMetadata)?;
        let column = metadata.require_column(col)?;

        let values: Arc<Vec<String>> = Arc::new(column.iter().map(|v| v.to_string()).collect());
        let vocab = Arc::new(Vocab::build(self.items.iter().map(|&i| values[i].clone())));
        let strategy = LabelStrategy::Parallel {
            masks,
            values,
            vocab,
        };
        Ok(LabeledDataset::new(self.clone(), strategy))
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

        /// 并发操作部分.
        impl VolumeDataset {
            /// 借助 `rayon`, 并行地为当前视图的全部索引预解析并缓存 patch 参数.
            ///
            /// 缓存槽位由互斥锁保护, 并发首写时只有一个解析结果会被保留.
            pub fn par_prepare_params(&self, pipeline: &TransformPipeline) {
                self.items.par_iter().for_each(|&idx| {
                    self.params
                        .get_or_insert_with(idx, || pipeline.draw_patch_params(Some(idx)));
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaValue;
    use crate::store::MemStore;
    use ndarray::{ArrayD, IxDyn};

    fn store10() -> Arc<dyn VolumeStore> {
        let records = (0..10)
            .map(|i| ArrayD::from_elem(IxDyn(&[1, 8, 8, 8]), i as f32))
            .collect();
        Arc::new(MemStore::new(records).unwrap())
    }

    fn meta10() -> Arc<MetaTable> {
        // 行 {2, 5, 7} 的 `valid` 为 1.
        let flags = (0..10i64).map(|i| MetaValue::Int(i64::from([2, 5, 7].contains(&i))));
        Arc::new(MetaTable::new().with_column("valid", flags).unwrap())
    }

    #[test]
    fn test_get_identity() {
        let ds = VolumeDataset::from_store(store10())
            .with_metadata(meta10())
            .unwrap();
        assert_eq!(ds.len(), 10);
        for i in 0..ds.len() {
            let item = ds.get(i).unwrap();
            assert_eq!(item.idx(), Some(ds.items()[i]));
            assert_eq!(item.metadata().unwrap().idx(), ds.items()[i]);
            assert_eq!(item.tensor()[[0, 0, 0, 0]], i as f32);
        }
    }

    #[test]
    fn test_empty_store_is_ok() {
        let ds = VolumeDataset::from_store(Arc::new(MemStore::new(Vec::new()).unwrap()));
        assert!(ds.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_get_out_of_bounds_panics() {
        let ds = VolumeDataset::from_store(store10());
        let _ = ds.get(10);
    }

    #[test]
    fn test_metadata_length_checked() {
        let short = Arc::new(
            MetaTable::new()
                .with_column("valid", [0i64; 3].map(MetaValue::Int))
                .unwrap(),
        );
        let bad = VolumeDataset::from_store(store10()).with_metadata(short);
        assert!(matches!(bad, Err(ConfigError::LengthMismatch(10, 3))));
    }

    #[test]
    fn test_split_by_metadata_scenario() {
        let ds = VolumeDataset::from_store(store10())
            .with_metadata(meta10())
            .unwrap();
        let (train, valid) = ds.split_by_metadata("valid").unwrap();
        assert_eq!(train.items(), &[0, 1, 3, 4, 6, 8, 9]);
        assert_eq!(valid.items(), &[2, 5, 7]);
        assert!(matches!(
            ds.split_by_metadata("missing"),
            Err(ConfigError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_split_by_float_predicate() {
        // 外部表格工具读入的 0/1 谓词列经常是浮点, 划分语义应与整数列一致.
        let flags = (0..10i32).map(|i| MetaValue::Float(f64::from([2, 5, 7].contains(&i))));
        let meta = Arc::new(MetaTable::new().with_column("valid", flags).unwrap());
        let ds = VolumeDataset::from_store(store10())
            .with_metadata(meta)
            .unwrap();
        let (train, valid) = ds.split_by_metadata("valid").unwrap();
        assert_eq!(train.items(), &[0, 1, 3, 4, 6, 8, 9]);
        assert_eq!(valid.items(), &[2, 5, 7]);
    }

    #[test]
    fn test_split_shares_param_cache() {
        let ds = VolumeDataset::from_store(store10())
            .with_metadata(meta10())
            .unwrap();
        let (train, valid) = ds.split_by_metadata("valid").unwrap();
        assert!(train.params().shares_with(valid.params()));
        assert!(train.params().shares_with(ds.params()));

        // 通过一侧解析的参数, 另一侧对同一原始索引可见.
        let pipe = crate::TransformPipeline::new(3)
            .with(crate::TransformOp::patch("shift", 1.0, 2, |t, p| t + p[0] + p[1]));
        valid.prepare_params(&pipe);
        assert!(train.params().get(5).is_some());

        // 两个独立构建的 item 使用同一缓存参数, 输出 bit 级一致.
        let i = valid.items().iter().position(|&x| x == 5).unwrap();
        let a = valid.get_tfmd(i, &pipe).unwrap();
        let b = valid.get_tfmd(i, &pipe).unwrap();
        assert_eq!(a.tensor(), b.tensor());
    }

    #[test]
    fn test_split_by_pct_seeded() {
        let ds = VolumeDataset::from_store(store10());
        let (train, valid) = ds.split_by_pct(0.3, 7);
        assert_eq!(train.len(), 7);
        assert_eq!(valid.len(), 3);

        // 并集完整, 两侧不相交, 种子可复现.
        let all: HashSet<RawIdx> = train.items().iter().chain(valid.items()).copied().collect();
        assert_eq!(all.len(), 10);
        let (_, valid2) = ds.split_by_pct(0.3, 7);
        assert_eq!(valid.items(), valid2.items());

        // 子集内部保持升序 (原有相对顺序).
        assert!(valid.items().windows(2).all(|w| w[0] < w[1]));
    }
}
