//! 只读分块体数据存储.
//!
//! 核心层按整数索引随机读取定形数值记录, 不关心磁盘布局.
//! 本模块提供统一的 [`VolumeStore`] 接口与两个实现:
//! npz 归档 ([`NpzStore`]) 和内存数组 ([`MemStore`]).

use ndarray::{ArrayD, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpzError};
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::RawIdx;

/// 存储层错误.
#[derive(Debug)]
pub enum StoreError {
    /// workers 太大. 最多支持 64.
    TooManyWorkers(u32),

    /// 读取 npz 文件错误.
    Npz(ReadNpzError),

    /// 其他底层 I/O 错误.
    Io(std::io::Error),

    /// 记录形状与存储的统一记录形状不一致.
    ///
    /// 第一个参数为期望形状, 第二个参数为实际形状.
    ShapeMismatch(Vec<usize>, Vec<usize>),
}

/// 只读、按整数索引寻址的定形体数据存储.
///
/// 所有记录共享同一形状 `(C, D, H, W)` 或 `(D, H, W)`.
/// 实现必须线程安全, 以便上层在多 worker 场景下共享同一存储实例.
pub trait VolumeStore: Send + Sync {
    /// 存储中的记录个数.
    fn len(&self) -> usize;

    /// 存储是否为空.
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 所有记录的统一形状. 空存储返回空切片.
    fn record_shape(&self) -> &[usize];

    /// 读取第 `idx` 条记录.
    ///
    /// `idx` 必须在 `[0, len)` 内, 否则程序 panic.
    /// 底层介质故障 (I/O、解压) 通过 `Err` 返回.
    fn read(&self, idx: RawIdx) -> Result<ArrayD<f32>, StoreError>;
}

/// Npz 体数据归档存储.
///
/// 该结构建模硬盘上已存储的多个 3D 扫描记录的压缩归档,
/// 记录以 `{idx}.npy` 为名, `idx` 覆盖 `[0, len)`.
pub struct NpzStore {
    entries: Vec<Mutex<NpzReader<File>>>,
    turn: AtomicUsize,
    len: usize,
    shape: Vec<usize>,
}

impl NpzStore {
    /// 打开 npz 归档.
    ///
    /// `workers` 指定了底层工作通道的个数, 最大为 64. 系统会从路径 `p` 打开文件
    /// `workers` 次, 并为每个打开通道指定一个排他入口点 (以期获得更高的并行度).
    ///
    /// 打开时会读取第 0 条记录以确定统一记录形状. 空归档的记录形状为空.
    pub fn open<P: AsRef<Path>>(workers: NonZeroUsize, p: P) -> Result<Self, StoreError> {
        let workers = workers.get();
        if workers > 64 {
            return Err(StoreError::TooManyWorkers(64));
        }
        let mut v = Vec::with_capacity(workers);
        for _ in 0..workers {
            let file = OpenOptions::new()
                .read(true)
                .open(p.as_ref())
                .map_err(StoreError::Io)?;
            v.push(Mutex::new(
                NpzReader::new(file).map_err(StoreError::Npz)?,
            ));
        }

        let mut first = v[0].lock().unwrap();
        let len = first.len();
        let shape = if len == 0 {
            Vec::new()
        } else {
            first
                .by_name::<OwnedRepr<f32>, IxDyn>("0.npy")
                .map_err(StoreError::Npz)?
                .shape()
                .to_vec()
        };
        drop(first);

        log::info!(
            "opened npz store {:?}: {len} records of shape {shape:?}, {workers} workers",
            p.as_ref()
        );
        Ok(Self {
            entries: v,
            turn: AtomicUsize::new(0),
            len,
            shape,
        })
    }

    /// 工作通道个数.
    #[inline]
    pub fn worker_len(&self) -> usize {
        self.entries.len()
    }

    fn next_slot(&self) -> usize {
        self.turn.fetch_add(1, Ordering::Relaxed) % self.worker_len()
    }
}

impl VolumeStore for NpzStore {
    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn record_shape(&self) -> &[usize] {
        &self.shape
    }

    fn read(&self, idx: RawIdx) -> Result<ArrayD<f32>, StoreError> {
        assert!(idx < self.len, "npz store 索引越界: {idx} >= {}", self.len);
        let slot = self.next_slot();
        let filename = format!("{idx}.npy");
        let mut file = self.entries[slot].lock().unwrap();
        let rec = file
            .by_name::<OwnedRepr<f32>, IxDyn>(filename.as_str())
            .map_err(StoreError::Npz)?;
        if rec.shape() != self.shape.as_slice() {
            return Err(StoreError::ShapeMismatch(
                self.shape.clone(),
                rec.shape().to_vec(),
            ));
        }
        Ok(rec)
    }
}

/// 内存体数据存储.
///
/// 将一组同形记录直接保存在内存中, 便于实验和测试.
/// 记录在构建后只读.
pub struct MemStore {
    records: Vec<ArrayD<f32>>,
    shape: Vec<usize>,
}

impl MemStore {
    /// 从一组记录直接创建存储.
    ///
    /// 所有记录形状必须一致, 否则返回 `StoreError::ShapeMismatch`.
    /// 空记录集是合法输入, 产生空存储.
    pub fn new(records: Vec<ArrayD<f32>>) -> Result<Self, StoreError> {
        let shape = records.first().map_or(Vec::new(), |r| r.shape().to_vec());
        for r in &records {
            if r.shape() != shape.as_slice() {
                return Err(StoreError::ShapeMismatch(shape, r.shape().to_vec()));
            }
        }
        Ok(Self { records, shape })
    }
}

impl VolumeStore for MemStore {
    #[inline]
    fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    fn record_shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    fn read(&self, idx: RawIdx) -> Result<ArrayD<f32>, StoreError> {
        Ok(self.records[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(shape: &[usize], fill: f32) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(shape), fill)
    }

    #[test]
    fn test_mem_store_uniform_shape() {
        let store = MemStore::new(vec![rec(&[1, 4, 4, 4], 0.5), rec(&[1, 4, 4, 4], 1.5)]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.record_shape(), &[1, 4, 4, 4]);
        assert_eq!(store.read(1).unwrap()[[0, 0, 0, 0]], 1.5);
    }

    #[test]
    fn test_mem_store_shape_mismatch() {
        let bad = MemStore::new(vec![rec(&[1, 4, 4, 4], 0.0), rec(&[1, 2, 4, 4], 0.0)]);
        assert!(matches!(bad, Err(StoreError::ShapeMismatch(_, _))));
    }

    #[test]
    fn test_mem_store_empty() {
        let store = MemStore::new(Vec::new()).unwrap();
        assert!(store.is_empty());
        assert!(store.record_shape().is_empty());
    }

    #[test]
    fn test_npz_store_round_trip() {
        use ndarray_npy::NpzWriter;
        use std::num::NonZeroUsize;

        let mut path = std::env::temp_dir();
        path.push(format!("scan-berry-npz-{}.npz", std::process::id()));

        {
            let mut w = NpzWriter::new(std::fs::File::create(&path).unwrap());
            for i in 0..3u32 {
                w.add_array(format!("{i}.npy"), &rec(&[2, 2, 2], i as f32))
                    .unwrap();
            }
            w.finish().unwrap();
        }

        let store = NpzStore::open(NonZeroUsize::new(2).unwrap(), &path).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.worker_len(), 2);
        assert_eq!(store.record_shape(), &[2, 2, 2]);
        assert_eq!(store.read(2).unwrap()[[1, 1, 1]], 2.0);

        std::fs::remove_file(&path).unwrap();
    }
}
