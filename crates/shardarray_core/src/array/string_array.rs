use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use shardarray_error::{ArrayError, Result};
use tracing::{debug, trace};

use super::assemble::disassemble_string_array;
use super::release::{OnDoneWithBuffer, ReleaseGuard, keep_alive};
use super::{Array, ArrayCopySemantics, ArrayKind, ArrayRef};
use crate::deferred::Deferred;
use crate::device::{DeviceList, MemoryKind};
use crate::dtype::DType;
use crate::shape::Shape;
use crate::sharding::Sharding;

/// Elements of a single shard.
pub type StringBuffer = Arc<[String]>;

/// One buffer per shard, in shard order.
pub type StringBuffers = Vec<StringBuffer>;

impl ArrayCopySemantics {
    /// Produce the shard buffer a derived array should hold.
    pub(crate) fn apply(&self, buffer: &StringBuffer) -> StringBuffer {
        match self {
            Self::AlwaysCopy => buffer.iter().cloned().collect(),
            Self::ReuseInput => buffer.clone(),
        }
    }

    /// Release callback for an array derived from `sources`.
    ///
    /// Shared shards must outlive the derived array, so reusing inputs keeps
    /// the sources alive. Copies own their data outright.
    pub(crate) fn release_for<S>(&self, sources: S) -> Option<OnDoneWithBuffer>
    where
        S: Send + 'static,
    {
        match self {
            Self::AlwaysCopy => None,
            Self::ReuseInput => Some(keep_alive(sources)),
        }
    }
}

/// An array of variable length strings.
///
/// Shard buffers are delivered through a deferred value supplied by whoever
/// produces the array. The optional release callback runs exactly once, on
/// whichever of `delete` or drop happens first.
pub struct StringArray {
    shape: Shape,
    sharding: Arc<Sharding>,
    buffers: Deferred<StringBuffers>,
    ready: Deferred<()>,
    release: ReleaseGuard,
    deleted: AtomicBool,
}

impl StringArray {
    /// Create a new string array.
    ///
    /// `buffers` must be valid. Once resolved it must hold exactly one buffer
    /// per shard, otherwise the array's buffers resolve to an error.
    ///
    /// On error, `on_done_with_buffer` is dropped without being called.
    pub fn try_new(
        shape: Shape,
        sharding: Arc<Sharding>,
        buffers: Deferred<StringBuffers>,
        on_done_with_buffer: Option<OnDoneWithBuffer>,
    ) -> Result<Arc<Self>> {
        if !buffers.is_valid() {
            return Err(ArrayError::invalid_argument(
                "Got an invalid deferred value for string array buffers",
            ));
        }

        sharding.check_shape(&shape)?;

        let shard_count = sharding.shard_count();
        let buffers = buffers.map(move |buffers: &StringBuffers| {
            if buffers.len() != shard_count {
                return Err(ArrayError::internal(
                    "Number of shard buffers does not match the shard count",
                )
                .with_field("shard_count", shard_count)
                .with_field("buffers", buffers.len()));
            }
            Ok(buffers.clone())
        });
        let ready = buffers.ready_signal();

        debug!(%shape, %sharding, "created string array");

        Ok(Arc::new(StringArray {
            shape,
            sharding,
            buffers,
            ready,
            release: ReleaseGuard::new(on_done_with_buffer),
            deleted: AtomicBool::new(false),
        }))
    }

    /// Deferred shard buffers for this array.
    ///
    /// Every call returns a handle to the same value. Readers that obtained
    /// the buffers before deletion keep them.
    pub fn buffers(&self) -> Deferred<StringBuffers> {
        self.buffers.clone()
    }

    fn check_not_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(ArrayError::failed_precondition(
                "Array has already been deleted",
            ));
        }
        Ok(())
    }
}

impl Array for StringArray {
    fn kind(&self) -> ArrayKind {
        ArrayKind::String
    }

    fn dtype(&self) -> DType {
        DType::String
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn sharding(&self) -> &Arc<Sharding> {
        &self.sharding
    }

    fn ready_future(&self) -> Deferred<()> {
        self.ready.clone()
    }

    fn delete(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.release.release() {
            debug!(shape = %self.shape, "deleted string array, released buffers");
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn disassemble(self: Arc<Self>, semantics: ArrayCopySemantics) -> Result<Vec<ArrayRef>> {
        self.check_not_deleted()?;
        let arrays = disassemble_string_array(&self, semantics)?;
        Ok(arrays.into_iter().map(|a| a as ArrayRef).collect())
    }

    fn copy(
        self: Arc<Self>,
        devices: Option<DeviceList>,
        memory_kind: Option<MemoryKind>,
        semantics: ArrayCopySemantics,
    ) -> Result<ArrayRef> {
        self.check_not_deleted()?;

        let sharding = self
            .sharding
            .with_device_assignment(devices, memory_kind)?;
        let buffers = self
            .buffers
            .map(move |buffers: &StringBuffers| -> Result<StringBuffers> {
                Ok(buffers.iter().map(|b| semantics.apply(b)).collect())
            });
        let on_done = semantics.release_for(self.clone());

        let copied = StringArray::try_new(self.shape.clone(), sharding, buffers, on_done)?;
        Ok(copied)
    }

    fn as_string_array(&self) -> Option<&StringArray> {
        Some(self)
    }
}

impl Drop for StringArray {
    fn drop(&mut self) {
        if self.release.release() {
            trace!(shape = %self.shape, "released string array buffers on drop");
        }
    }
}

impl fmt::Debug for StringArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringArray")
            .field("shape", &self.shape)
            .field("sharding", &self.sharding)
            .field("buffers", &self.buffers)
            .field("release", &self.release)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

impl fmt::Display for StringArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.debug_string())
    }
}
