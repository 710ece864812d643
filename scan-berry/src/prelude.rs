//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, RawIdx};

pub use crate::error::{ConfigError, ReadError, VocabError};
pub use crate::meta::{MetaRow, MetaTable, MetaValue};
pub use crate::store::{MemStore, NpzStore, StoreError, VolumeStore};

pub use crate::{ItemData, ItemKind, VolumeItem};
pub use crate::{ParamCache, TfmKind, TfmParams, TransformOp, TransformPipeline};

pub use crate::dataset::{self, VolumeDataset};
pub use crate::dataset::{Label, LabelStrategy, LabeledDataset, LossKind, ModelOutput, NormOptions, Vocab};
