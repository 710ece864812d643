//! 列式元数据表.
//!
//! 与体数据存储共享同一整数索引空间: 第 `idx` 条记录对应表的第 `idx` 行.
//! 列按名字寻址, 既可用作数据集划分谓词, 也可用作类别标签来源.

use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::RawIdx;

/// 元数据单元格取值.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MetaValue {
    /// 整数.
    Int(i64),

    /// 浮点数.
    Float(f64),

    /// 文本.
    Text(String),
}

impl MetaValue {
    /// 该值作为划分谓词是否为真. 数值非零为真, 文本恒为假.
    ///
    /// 浮点列同样参与判定: 0/1 谓词列经外部表格工具读入后经常变成浮点.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Text(_) => false,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// 列式元数据表.
///
/// 行数固定, 列按插入顺序保存. 构建完成后只读.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetaTable {
    columns: Vec<(String, Vec<MetaValue>)>,
    rows: usize,
}

impl MetaTable {
    /// 创建空表.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一列.
    ///
    /// 第一列决定表的行数, 后续列的长度必须与其一致,
    /// 否则返回 `ConfigError::LengthMismatch`.
    pub fn with_column<S: Into<String>, I: IntoIterator<Item = MetaValue>>(
        mut self,
        name: S,
        values: I,
    ) -> Result<Self, ConfigError> {
        let values: Vec<MetaValue> = values.into_iter().collect();
        if self.columns.is_empty() {
            self.rows = values.len();
        } else if values.len() != self.rows {
            return Err(ConfigError::LengthMismatch(self.rows, values.len()));
        }
        self.columns.push((name.into(), values));
        Ok(self)
    }

    /// 表的行数.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// 表的列数.
    #[inline]
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// 按列名获取一列, 列与行序对齐. 列不存在时返回 `None`.
    pub fn column(&self, name: &str) -> Option<&[MetaValue]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// 按列名获取一列, 列不存在时返回 `ConfigError::ColumnNotFound`.
    pub fn require_column(&self, name: &str) -> Result<&[MetaValue], ConfigError> {
        self.column(name)
            .ok_or_else(|| ConfigError::ColumnNotFound(name.to_owned()))
    }
}

/// 元数据表中某一行的轻量引用.
///
/// 仅保存表的共享指针与行号, 克隆代价恒定.
#[derive(Debug, Clone)]
pub struct MetaRow {
    table: Arc<MetaTable>,
    idx: RawIdx,
}

impl MetaRow {
    /// 取表 `table` 的第 `idx` 行.
    ///
    /// `idx` 必须在 `[0, table.rows())` 内, 否则程序 panic.
    pub fn new(table: Arc<MetaTable>, idx: RawIdx) -> Self {
        assert!(idx < table.rows(), "元数据行越界: {idx} >= {}", table.rows());
        Self { table, idx }
    }

    /// 行号.
    #[inline]
    pub fn idx(&self) -> RawIdx {
        self.idx
    }

    /// 本行在列 `name` 处的取值. 列不存在时返回 `None`.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&MetaValue> {
        self.table.column(name).map(|col| &col[self.idx])
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "serde")] {
        use std::fs::File;
        use std::io::{BufReader, BufWriter};
        use std::path::Path;

        /// 持久化部分.
        impl MetaTable {
            /// 将表以 bincode 格式写入 `path`.
            pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
                let w = BufWriter::new(File::create(path)?);
                bincode::serialize_into(w, self)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }

            /// 从 `path` 读取 bincode 格式的表.
            pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
                let r = BufReader::new(File::open(path)?);
                bincode::deserialize_from(r)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MetaTable {
        MetaTable::new()
            .with_column("mort", [0i64, 1, 0, 1].map(MetaValue::Int))
            .unwrap()
            .with_column(
                "site",
                ["a", "b", "a", "c"].map(|s| MetaValue::Text(s.into())),
            )
            .unwrap()
    }

    #[test]
    fn test_column_lookup() {
        let t = table();
        assert_eq!(t.rows(), 4);
        assert_eq!(t.width(), 2);
        assert_eq!(t.column("mort").unwrap()[1], MetaValue::Int(1));
        assert!(t.column("age").is_none());
        assert!(matches!(
            t.require_column("age"),
            Err(ConfigError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_row_lookup() {
        let t = Arc::new(table());
        let row = MetaRow::new(t, 2);
        assert_eq!(row.idx(), 2);
        assert_eq!(row.get("site"), Some(&MetaValue::Text("a".into())));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_truthy() {
        assert!(MetaValue::Int(1).is_truthy());
        assert!(!MetaValue::Int(0).is_truthy());
        assert!(MetaValue::Float(1.0).is_truthy());
        assert!(!MetaValue::Float(0.0).is_truthy());
        assert!(!MetaValue::Text("1".into()).is_truthy());
    }

    #[test]
    fn test_ragged_column_rejected() {
        let bad = MetaTable::new()
            .with_column("a", [0i64, 1].map(MetaValue::Int))
            .unwrap()
            .with_column("b", [0i64, 1, 2].map(MetaValue::Int));
        assert!(matches!(bad, Err(ConfigError::LengthMismatch(2, 3))));
    }
}
