pub mod assemble;
pub mod numeric_array;
pub mod release;
pub mod string_array;

use std::fmt;
use std::sync::Arc;

use shardarray_error::Result;

use self::numeric_array::NumericArray;
use self::string_array::StringArray;
use crate::deferred::Deferred;
use crate::device::{DeviceList, MemoryKind};
use crate::dtype::DType;
use crate::shape::Shape;
use crate::sharding::Sharding;

pub type ArrayRef = Arc<dyn Array>;

/// Concrete variant behind an `ArrayRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    String,
    Numeric,
}

impl fmt::Display for ArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "StringArray"),
            Self::Numeric => write!(f, "NumericArray"),
        }
    }
}

/// Whether arrays derived from other arrays share or copy shard data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayCopySemantics {
    /// Derived arrays get their own copy of every shard.
    AlwaysCopy,
    /// Derived arrays reference the source shards and keep the source arrays
    /// alive until they're released.
    ReuseInput,
}

/// A reference counted handle to an array whose shards may live on multiple
/// devices, and whose buffers may not be materialized yet.
pub trait Array: fmt::Debug + Sync + Send {
    fn kind(&self) -> ArrayKind;

    fn dtype(&self) -> DType;

    fn shape(&self) -> &Shape;

    fn sharding(&self) -> &Arc<Sharding>;

    /// Resolves once the buffers backing this array are materialized, or have
    /// failed to materialize.
    fn ready_future(&self) -> Deferred<()>;

    /// Give up the buffers backing this array.
    ///
    /// Does not wait on buffers that are still pending. Idempotent.
    fn delete(&self);

    fn is_deleted(&self) -> bool;

    /// Split this array into one single device array per shard, in shard
    /// order.
    fn disassemble(self: Arc<Self>, semantics: ArrayCopySemantics) -> Result<Vec<ArrayRef>>;

    /// Place this array onto a different set of devices and/or memory kind.
    fn copy(
        self: Arc<Self>,
        devices: Option<DeviceList>,
        memory_kind: Option<MemoryKind>,
        semantics: ArrayCopySemantics,
    ) -> Result<ArrayRef>;

    fn as_string_array(&self) -> Option<&StringArray> {
        None
    }

    fn as_numeric_array(&self) -> Option<&NumericArray> {
        None
    }

    fn debug_string(&self) -> String {
        format!(
            "{}(shape={}, dtype={}, sharding={}, deleted={})",
            self.kind(),
            self.shape(),
            self.dtype(),
            self.sharding(),
            self.is_deleted(),
        )
    }
}
