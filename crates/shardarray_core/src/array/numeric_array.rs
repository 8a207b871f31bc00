use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use shardarray_error::{ArrayError, Result};
use tracing::{debug, trace};

use super::release::{OnDoneWithBuffer, ReleaseGuard};
use super::{Array, ArrayCopySemantics, ArrayKind, ArrayRef};
use crate::deferred::Deferred;
use crate::device::{DeviceList, MemoryKind};
use crate::dtype::DType;
use crate::shape::Shape;
use crate::sharding::Sharding;

/// A dense, fixed width array living on a single device.
///
/// Elements are stored in row-major order in a single contiguous buffer.
pub struct NumericArray {
    dtype: DType,
    shape: Shape,
    sharding: Arc<Sharding>,
    data: Deferred<Bytes>,
    ready: Deferred<()>,
    release: ReleaseGuard,
    deleted: AtomicBool,
}

impl NumericArray {
    pub fn try_new(
        dtype: DType,
        shape: Shape,
        sharding: Arc<Sharding>,
        data: Deferred<Bytes>,
        on_done_with_buffer: Option<OnDoneWithBuffer>,
    ) -> Result<Arc<Self>> {
        let elem_size = dtype.byte_size().ok_or_else(|| {
            ArrayError::invalid_argument("Numeric arrays require a fixed width dtype")
                .with_field("dtype", dtype)
        })?;

        if !data.is_valid() {
            return Err(ArrayError::invalid_argument(
                "Got an invalid deferred value for numeric array data",
            ));
        }

        if !sharding.is_single_device() {
            return Err(ArrayError::invalid_argument(
                "Numeric arrays only support single device shardings",
            )
            .with_field("sharding", &sharding));
        }

        let expected = shape.checked_byte_len(elem_size).ok_or_else(|| {
            ArrayError::invalid_argument("Numeric array byte size overflows")
                .with_field("shape", &shape)
                .with_field("dtype", dtype)
        })?;
        let data = data.map(move |data: &Bytes| {
            if data.len() != expected {
                return Err(ArrayError::internal(
                    "Numeric array data length does not match its shape",
                )
                .with_field("expected", expected)
                .with_field("got", data.len()));
            }
            Ok(data.clone())
        });
        let ready = data.ready_signal();

        debug!(%dtype, %shape, %sharding, "created numeric array");

        Ok(Arc::new(NumericArray {
            dtype,
            shape,
            sharding,
            data,
            ready,
            release: ReleaseGuard::new(on_done_with_buffer),
            deleted: AtomicBool::new(false),
        }))
    }

    /// Deferred row-major element bytes.
    pub fn data(&self) -> Deferred<Bytes> {
        self.data.clone()
    }
}

impl Array for NumericArray {
    fn kind(&self) -> ArrayKind {
        ArrayKind::Numeric
    }

    fn dtype(&self) -> DType {
        self.dtype
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
            debug!(
                dtype = %self.dtype,
                shape = %self.shape,
                "deleted numeric array, released buffer"
            );
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn disassemble(self: Arc<Self>, _semantics: ArrayCopySemantics) -> Result<Vec<ArrayRef>> {
        if self.is_deleted() {
            return Err(ArrayError::failed_precondition(
                "Array has already been deleted",
            ));
        }
        // Already a single shard.
        Ok(vec![self as ArrayRef])
    }

    fn copy(
        self: Arc<Self>,
        devices: Option<DeviceList>,
        memory_kind: Option<MemoryKind>,
        semantics: ArrayCopySemantics,
    ) -> Result<ArrayRef> {
        if self.is_deleted() {
            return Err(ArrayError::failed_precondition(
                "Array has already been deleted",
            ));
        }

        let sharding = self
            .sharding
            .with_device_assignment(devices, memory_kind)?;
        let data = self.data.map(move |data: &Bytes| -> Result<Bytes> {
            Ok(match semantics {
                ArrayCopySemantics::AlwaysCopy => Bytes::copy_from_slice(data),
                ArrayCopySemantics::ReuseInput => data.clone(),
            })
        });
        let on_done = semantics.release_for(self.clone());

        let copied =
            NumericArray::try_new(self.dtype, self.shape.clone(), sharding, data, on_done)?;
        Ok(copied)
    }

    fn as_numeric_array(&self) -> Option<&NumericArray> {
        Some(self)
    }
}

impl Drop for NumericArray {
    fn drop(&mut self) {
        if self.release.release() {
            trace!(
                dtype = %self.dtype,
                shape = %self.shape,
                "released numeric array buffer on drop"
            );
        }
    }
}

impl fmt::Debug for NumericArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumericArray")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("sharding", &self.sharding)
            .field("data", &self.data)
            .field("release", &self.release)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
