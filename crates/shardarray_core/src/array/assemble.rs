//! Combining single device string arrays into a sharded array, and splitting
//! them back apart.

use std::sync::Arc;

use shardarray_error::{ArrayError, Result};
use tracing::debug;

use super::string_array::{StringArray, StringBuffers};
use super::{Array, ArrayCopySemantics, ArrayKind, ArrayRef};
use crate::deferred::join_all;
use crate::shape::Shape;
use crate::sharding::Sharding;

/// Assemble a string array from one single device string array per shard.
///
/// `arrays[i]` becomes shard `i` of the result, regardless of the order in
/// which the inputs' buffers resolve. The result's buffers resolve once every
/// input has resolved, or with the first input error observed.
///
/// The assembled array never takes over the inputs' release callbacks. Under
/// `ReuseInput` it holds references to the inputs until it's released.
pub fn assemble_string_array(
    shape: Shape,
    sharding: Arc<Sharding>,
    arrays: &[ArrayRef],
    semantics: ArrayCopySemantics,
) -> Result<Arc<StringArray>> {
    let mut inputs = Vec::with_capacity(arrays.len());
    for (idx, array) in arrays.iter().enumerate() {
        let string_array = array.as_string_array().ok_or_else(|| {
            ArrayError::invalid_argument("All arrays to assemble must be string arrays")
                .with_field("index", idx)
                .with_field("kind", array.kind())
        })?;
        inputs.push(string_array);
    }

    for (idx, array) in inputs.iter().enumerate() {
        if !array.sharding().is_single_device() {
            return Err(ArrayError::invalid_argument(
                "All arrays to assemble must be single device arrays",
            )
            .with_field("index", idx)
            .with_field("sharding", array.sharding()));
        }
    }

    if inputs.len() != sharding.shard_count() {
        return Err(ArrayError::invalid_argument(
            "Number of arrays to assemble does not match the shard count",
        )
        .with_field("arrays", inputs.len())
        .with_field("shard_count", sharding.shard_count()));
    }

    for (idx, array) in inputs.iter().enumerate() {
        if array.is_deleted() {
            return Err(ArrayError::invalid_argument(
                "Cannot assemble an array that has been deleted",
            )
            .with_field("index", idx));
        }
    }

    // Fail before attaching continuations to the inputs.
    sharding.check_shape(&shape)?;

    let input_buffers: Vec<_> = inputs.iter().map(|a| a.buffers()).collect();
    let buffers = join_all(&input_buffers).map(
        move |all: &Vec<StringBuffers>| -> Result<StringBuffers> {
            all.iter()
                .enumerate()
                .map(|(idx, buffers)| match buffers.as_slice() {
                    [buffer] => Ok(semantics.apply(buffer)),
                    _ => Err(ArrayError::internal(
                        "Single device array did not have exactly one shard buffer",
                    )
                    .with_field("index", idx)
                    .with_field("buffers", buffers.len())),
                })
                .collect()
        },
    );

    debug!(%shape, %sharding, num_arrays = arrays.len(), ?semantics, "assembling string array");

    StringArray::try_new(shape, sharding, buffers, semantics.release_for(arrays.to_vec()))
}

/// Split a string array into one single device array per shard.
///
/// Requires a sharding with known shard shapes, opaque shardings can't be
/// disassembled.
pub fn disassemble_string_array(
    array: &Arc<StringArray>,
    semantics: ArrayCopySemantics,
) -> Result<Vec<Arc<StringArray>>> {
    if array.is_deleted() {
        return Err(ArrayError::failed_precondition(
            "Cannot disassemble an array that has been deleted",
        ));
    }

    let parts = array.sharding().disassemble(array.shape())?;
    let buffers = array.buffers();

    debug!(shape = %array.shape(), shards = parts.len(), ?semantics, "disassembling string array");

    parts
        .into_iter()
        .enumerate()
        .map(|(idx, (shape, sharding))| {
            let shard = buffers.map(move |buffers: &StringBuffers| -> Result<StringBuffers> {
                let buffer = buffers.get(idx).ok_or_else(|| {
                    ArrayError::internal("Missing shard buffer for disassembled array")
                        .with_field("index", idx)
                })?;
                Ok(vec![semantics.apply(buffer)])
            });
            StringArray::try_new(shape, sharding, shard, semantics.release_for(array.clone()))
        })
        .collect()
}

/// Assemble arbitrary arrays, dispatching on the kind of the inputs.
pub fn assemble_arrays(
    shape: Shape,
    sharding: Arc<Sharding>,
    arrays: &[ArrayRef],
    semantics: ArrayCopySemantics,
) -> Result<ArrayRef> {
    let kind = match arrays.first() {
        Some(array) => array.kind(),
        None => {
            return Err(ArrayError::invalid_argument(
                "Cannot assemble an array from zero arrays",
            ));
        }
    };

    match kind {
        ArrayKind::String => {
            let assembled = assemble_string_array(shape, sharding, arrays, semantics)?;
            Ok(assembled)
        }
        ArrayKind::Numeric => {
            // Mixed inputs are still reported as a kind mismatch.
            if arrays.iter().any(|a| a.kind() != ArrayKind::Numeric) {
                return Err(ArrayError::invalid_argument(
                    "All arrays to assemble must have the same kind",
                ));
            }
            shardarray_error::not_implemented!("Assembling numeric arrays")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use shardarray_error::ErrorKind;

    use super::*;
    use crate::array::numeric_array::NumericArray;
    use crate::array::release::OnDoneWithBuffer;
    use crate::deferred::Deferred;
    use crate::device::{Device, DeviceId, DeviceList, MemoryKind};
    use crate::dtype::DType;

    fn device(id: u32) -> Device {
        Device::new(DeviceId(id), 0)
    }

    fn single(id: u32, strs: &[&str], on_done: Option<OnDoneWithBuffer>) -> ArrayRef {
        let buffer = strs.iter().map(|s| s.to_string()).collect();
        StringArray::try_new(
            Shape::new([strs.len()]),
            Sharding::single_device(device(id), MemoryKind::default()),
            Deferred::ready(vec![buffer]),
            on_done,
        )
        .unwrap()
    }

    fn opaque(n: u32) -> Arc<Sharding> {
        Sharding::opaque(DeviceList::new((0..n).map(device)), MemoryKind::default()).unwrap()
    }

    #[test]
    fn assemble_two_shards() {
        let arrays = [single(0, &["shard 0"], None), single(1, &["shard 1"], None)];
        let assembled = assemble_string_array(
            Shape::new([2]),
            opaque(2),
            &arrays,
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap();

        let buffers = assembled.buffers().wait().unwrap();
        assert_eq!(2, buffers.len());
        assert_eq!(["shard 0"], buffers[0][..]);
        assert_eq!(["shard 1"], buffers[1][..]);
    }

    #[test]
    fn concrete_shape_mismatch_leaves_inputs_untouched() {
        let (promise, buffers) = Deferred::pending();
        let pending: ArrayRef = StringArray::try_new(
            Shape::new([1]),
            Sharding::single_device(device(0), MemoryKind::default()),
            buffers,
            None,
        )
        .unwrap();
        let input_buffers = pending.as_string_array().unwrap().buffers();
        let waiting = input_buffers.pending_continuations();

        let sharding = Sharding::concrete(
            DeviceList::new([device(0), device(1)]),
            MemoryKind::default(),
            Shape::new([2]),
            vec![Shape::new([1]), Shape::new([1])],
        )
        .unwrap();
        let err = assemble_string_array(
            Shape::new([3]),
            sharding,
            &[pending, single(1, &["b"], None)],
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap_err();

        assert_eq!(ErrorKind::InvalidArgument, err.kind());
        assert_eq!(waiting, input_buffers.pending_continuations());

        promise.set_value(vec![vec!["a".to_string()].into()]);
        assert!(input_buffers.is_ready());
    }

    #[test]
    fn assemble_mixed_kinds() {
        let numeric: ArrayRef = NumericArray::try_new(
            DType::Int32,
            Shape::new([1]),
            Sharding::single_device(device(1), MemoryKind::default()),
            Deferred::ready(Bytes::from_static(&[0; 4])),
            None,
        )
        .unwrap();
        let arrays = [single(0, &["a"], None), numeric];

        let err = assemble_string_array(
            Shape::new([2]),
            opaque(2),
            &arrays,
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::InvalidArgument, err.kind());

        let err = assemble_arrays(
            Shape::new([2]),
            opaque(2),
            &[arrays[1].clone(), arrays[0].clone()],
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::InvalidArgument, err.kind());
    }

    #[test]
    fn assemble_multi_device_input() {
        let multi: ArrayRef = assemble_string_array(
            Shape::new([2]),
            opaque(2),
            &[single(0, &["a"], None), single(1, &["b"], None)],
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap();

        let err = assemble_string_array(
            Shape::new([3]),
            opaque(2),
            &[multi, single(2, &["c"], None)],
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::InvalidArgument, err.kind());
    }

    #[test]
    fn assemble_count_mismatch() {
        let err = assemble_string_array(
            Shape::new([3]),
            opaque(3),
            &[single(0, &["a"], None), single(1, &["b"], None)],
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::InvalidArgument, err.kind());
    }

    #[test]
    fn assemble_deleted_input() {
        let arrays = [single(0, &["a"], None), single(1, &["b"], None)];
        arrays[1].delete();

        let err = assemble_string_array(
            Shape::new([2]),
            opaque(2),
            &arrays,
            ArrayCopySemantics::ReuseInput,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::InvalidArgument, err.kind());
    }

    #[test]
    fn assemble_zero_arrays() {
        let err = assemble_arrays(
            Shape::new([0]),
            opaque(1),
            &[],
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::InvalidArgument, err.kind());
    }

    #[test]
    fn assemble_numeric_not_implemented() {
        let numeric = |id| -> ArrayRef {
            NumericArray::try_new(
                DType::UInt8,
                Shape::new([1]),
                Sharding::single_device(device(id), MemoryKind::default()),
                Deferred::ready(Bytes::from_static(&[7])),
                None,
            )
            .unwrap()
        };

        let err = assemble_arrays(
            Shape::new([2]),
            opaque(2),
            &[numeric(0), numeric(1)],
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap_err();
        assert_eq!(ErrorKind::Unimplemented, err.kind());
    }

    #[test]
    fn reuse_input_keeps_inputs_alive() {
        let count = Arc::new(AtomicUsize::new(0));
        let on_done = |count: &Arc<AtomicUsize>| -> Option<OnDoneWithBuffer> {
            let count = count.clone();
            Some(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
        };

        let arrays = vec![
            single(0, &["a"], on_done(&count)),
            single(1, &["b"], on_done(&count)),
        ];
        let assembled = assemble_string_array(
            Shape::new([2]),
            opaque(2),
            &arrays,
            ArrayCopySemantics::ReuseInput,
        )
        .unwrap();

        let assembled_buffers = assembled.buffers().wait().unwrap();
        let input_buffers = arrays[0].as_string_array().unwrap().buffers().wait().unwrap();
        assert!(Arc::ptr_eq(&input_buffers[0], &assembled_buffers[0]));

        std::mem::drop(arrays);
        assert_eq!(0, count.load(Ordering::SeqCst));

        // Deleting the composite never calls the inputs' callbacks itself,
        // it only lets go of its references.
        assembled.delete();
        assert_eq!(2, count.load(Ordering::SeqCst));
    }

    #[test]
    fn always_copy_does_not_retain_inputs() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let arrays = vec![
            single(
                0,
                &["a"],
                Some(Box::new(move || {
                    count2.fetch_add(1, Ordering::SeqCst);
                })),
            ),
            single(1, &["b"], None),
        ];
        let assembled = assemble_string_array(
            Shape::new([2]),
            opaque(2),
            &arrays,
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap();
        assembled.ready_future().wait().unwrap();

        std::mem::drop(arrays);
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert_eq!(["a"], assembled.buffers().wait().unwrap()[0][..]);
    }

    #[test]
    fn disassemble_concrete() {
        let sharding = Sharding::concrete(
            DeviceList::new([device(0), device(1)]),
            MemoryKind::default(),
            Shape::new([3]),
            vec![Shape::new([2]), Shape::new([1])],
        )
        .unwrap();
        let array = StringArray::try_new(
            Shape::new([3]),
            sharding,
            Deferred::ready(vec![
                ["a", "b"].iter().map(|s| s.to_string()).collect(),
                ["c"].iter().map(|s| s.to_string()).collect(),
            ]),
            None,
        )
        .unwrap();

        let parts = disassemble_string_array(&array, ArrayCopySemantics::ReuseInput).unwrap();
        assert_eq!(2, parts.len());
        assert_eq!(&Shape::new([2]), parts[0].shape());
        assert_eq!(&Shape::new([1]), parts[1].shape());
        assert!(parts[1].sharding().is_single_device());
        assert_eq!(["c"], parts[1].buffers().wait().unwrap()[0][..]);
    }

    #[test]
    fn disassemble_opaque_fails() {
        let assembled = assemble_string_array(
            Shape::new([2]),
            opaque(2),
            &[single(0, &["a"], None), single(1, &["b"], None)],
            ArrayCopySemantics::AlwaysCopy,
        )
        .unwrap();

        let err = disassemble_string_array(&assembled, ArrayCopySemantics::AlwaysCopy).unwrap_err();
        assert_eq!(ErrorKind::InvalidArgument, err.kind());
    }

    #[test]
    fn disassemble_deleted_fails() {
        let array = single(0, &["a"], None);
        array.delete();

        let err = array.disassemble(ArrayCopySemantics::AlwaysCopy).unwrap_err();
        assert_eq!(ErrorKind::FailedPrecondition, err.kind());
    }
}
