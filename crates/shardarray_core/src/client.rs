use std::sync::Arc;

use bytes::Bytes;
use shardarray_error::{ArrayError, OptionExt, Result, not_implemented};
use tracing::debug;

use crate::array::assemble::assemble_arrays;
use crate::array::numeric_array::NumericArray;
use crate::array::release::{OnDoneWithBuffer, keep_alive};
use crate::array::string_array::{StringArray, StringBuffer};
use crate::array::{ArrayCopySemantics, ArrayRef};
use crate::config::{ClientConfig, NumDevices};
use crate::deferred::Deferred;
use crate::device::{Device, DeviceId, DeviceList, MemoryKind};
use crate::dtype::DType;
use crate::shape::Shape;
use crate::sharding::Sharding;

/// How long the caller promises to keep host data alive and unmodified when
/// creating an array from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostBufferSemantics {
    /// Data may only be read during the call. The call copies it.
    ImmutableOnlyDuringCall,
    /// Data stays immutable until the transfer completes, signalled through
    /// the on-done callback.
    ImmutableUntilTransferCompletes,
    /// Data stays immutable for the lifetime of the array.
    ImmutableZeroCopy,
    /// The array may alias and mutate the data.
    MutableZeroCopy,
}

/// Host data to create an array from.
#[derive(Debug, Clone, Copy)]
pub enum HostBuffer<'a> {
    /// One element per string, for `DType::String`.
    Strings(&'a [&'a str]),
    /// Raw little endian elements, for fixed width dtypes.
    Bytes(&'a [u8]),
}

/// Creates arrays on a fixed set of addressable devices.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    devices: DeviceList,
}

impl Client {
    pub fn try_new(config: ClientConfig) -> Result<Self> {
        NumDevices::validate_value(config.num_devices)?;

        let process_index = config.process_index;
        let devices = DeviceList::new(
            (0..config.num_devices).map(|id| Device::new(DeviceId(id as u32), process_index)),
        );
        debug!(%devices, process_index = config.process_index, "created client");

        Ok(Client { config, devices })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceList {
        &self.devices
    }

    /// Devices this process may place arrays on.
    pub fn addressable_devices(&self) -> &DeviceList {
        // Every device a client creates belongs to its own process.
        &self.devices
    }

    pub fn lookup_device(&self, id: DeviceId) -> Result<Device> {
        self.devices
            .iter()
            .find(|d| d.id() == id)
            .copied()
            .required("device with the given id")
            .map_err(|e| e.with_field("id", id.0))
    }

    /// Create a single device array from host data.
    ///
    /// String data must hold exactly one string per element of `shape`.
    /// Extra strings are rejected, never silently dropped.
    ///
    /// On success `on_done_with_host_buffer` has run by the time this
    /// returns, since the data is always copied. On error it's dropped
    /// without being called.
    #[allow(clippy::too_many_arguments)]
    pub fn make_array_from_host_buffer(
        &self,
        data: HostBuffer<'_>,
        dtype: DType,
        shape: Shape,
        byte_strides: Option<&[i64]>,
        sharding: Arc<Sharding>,
        semantics: HostBufferSemantics,
        on_done_with_host_buffer: Option<OnDoneWithBuffer>,
    ) -> Result<ArrayRef> {
        self.check_devices(sharding.devices())?;
        if !sharding.is_single_device() {
            return Err(ArrayError::invalid_argument(
                "Only single device shardings are supported when creating an array from a host buffer",
            )
            .with_field("sharding", &sharding));
        }
        let sharding = self.apply_default_memory_kind(sharding)?;

        let array: ArrayRef = match (data, dtype) {
            (HostBuffer::Strings(strings), DType::String) => {
                if byte_strides.is_some() {
                    return Err(ArrayError::invalid_argument(
                        "Byte strides are not supported for string arrays",
                    ));
                }
                if semantics != HostBufferSemantics::ImmutableOnlyDuringCall {
                    return Err(ArrayError::invalid_argument(
                        "String arrays only support immutable-only-during-call host buffers",
                    )
                    .with_field("semantics", format!("{semantics:?}")));
                }
                if Some(strings.len()) != shape.checked_num_elements() {
                    return Err(ArrayError::invalid_argument(
                        "Number of strings does not match the number of elements in the shape",
                    )
                    .with_field("strings", strings.len())
                    .with_field("shape", &shape));
                }

                let buffer: StringBuffer = strings.iter().map(|s| s.to_string()).collect();
                StringArray::try_new(
                    shape,
                    sharding,
                    Deferred::ready(vec![buffer.clone()]),
                    Some(keep_alive(buffer)),
                )?
            }
            (HostBuffer::Bytes(bytes), dtype) if !dtype.is_string() => {
                let data =
                    self.copy_numeric_host_buffer(bytes, dtype, &shape, byte_strides, semantics)?;
                NumericArray::try_new(dtype, shape, sharding, Deferred::ready(data), None)?
            }
            (_, dtype) => {
                return Err(ArrayError::invalid_argument(
                    "Host buffer does not match the array dtype",
                )
                .with_field("dtype", dtype));
            }
        };

        // Data was copied, the caller may reuse its buffer.
        if let Some(on_done) = on_done_with_host_buffer {
            on_done();
        }

        debug!(array = %array.debug_string(), "created array from host buffer");

        Ok(array)
    }

    fn copy_numeric_host_buffer(
        &self,
        bytes: &[u8],
        dtype: DType,
        shape: &Shape,
        byte_strides: Option<&[i64]>,
        semantics: HostBufferSemantics,
    ) -> Result<Bytes> {
        match semantics {
            HostBufferSemantics::ImmutableOnlyDuringCall
            | HostBufferSemantics::ImmutableUntilTransferCompletes => (),
            HostBufferSemantics::ImmutableZeroCopy | HostBufferSemantics::MutableZeroCopy => {
                not_implemented!("Zero copy host buffers ({semantics:?})")
            }
        }

        let elem_size = dtype.byte_size().ok_or_else(|| {
            ArrayError::internal("Fixed width dtype without a byte size").with_field("dtype", dtype)
        })?;

        let expected = shape.checked_byte_len(elem_size).ok_or_else(|| {
            ArrayError::invalid_argument("Array byte size overflows")
                .with_field("shape", shape)
                .with_field("dtype", dtype)
        })?;

        if let Some(strides) = byte_strides {
            if strides.len() != shape.rank() {
                return Err(ArrayError::invalid_argument(
                    "Byte strides must have one entry per dimension",
                )
                .with_field("strides", strides.len())
                .with_field("rank", shape.rank()));
            }
            if Some(strides) != dense_byte_strides(shape, elem_size).as_deref() {
                not_implemented!("Non-dense byte strides {strides:?} for shape {shape}")
            }
        }

        if bytes.len() != expected {
            return Err(ArrayError::invalid_argument(
                "Host buffer length does not match the shape and dtype",
            )
            .with_field("expected", expected)
            .with_field("got", bytes.len()));
        }

        Ok(Bytes::copy_from_slice(bytes))
    }

    /// Assemble an array from one single device array per shard of
    /// `sharding`.
    pub fn assemble_array_from_single_device_arrays(
        &self,
        shape: Shape,
        sharding: Arc<Sharding>,
        arrays: &[ArrayRef],
        semantics: ArrayCopySemantics,
    ) -> Result<ArrayRef> {
        self.check_devices(sharding.devices())?;
        assemble_arrays(shape, sharding, arrays, semantics)
    }

    /// Split an array into one single device array per shard.
    pub fn disassemble_array(
        &self,
        array: &ArrayRef,
        semantics: ArrayCopySemantics,
    ) -> Result<Vec<ArrayRef>> {
        array.clone().disassemble(semantics)
    }

    /// Copy arrays to a new device assignment and/or memory kind.
    ///
    /// Every array must have the same number of shards as `devices`, when
    /// provided.
    pub fn copy_arrays(
        &self,
        arrays: &[ArrayRef],
        devices: Option<DeviceList>,
        memory_kind: Option<MemoryKind>,
        semantics: ArrayCopySemantics,
    ) -> Result<Vec<ArrayRef>> {
        if let Some(devices) = &devices {
            self.check_devices(devices)?;
        }

        arrays
            .iter()
            .enumerate()
            .map(|(idx, array)| {
                array
                    .clone()
                    .copy(devices.clone(), memory_kind.clone(), semantics)
                    .map_err(|e| e.with_field("array_index", idx))
            })
            .collect()
    }

    fn check_devices(&self, devices: &DeviceList) -> Result<()> {
        for device in devices.iter() {
            if !self.devices.contains(device) {
                return Err(ArrayError::invalid_argument(
                    "Device does not belong to this client",
                )
                .with_field("device", device)
                .with_field("client_devices", &self.devices));
            }
        }
        Ok(())
    }

    fn apply_default_memory_kind(&self, sharding: Arc<Sharding>) -> Result<Arc<Sharding>> {
        if sharding.memory_kind().is_default() && !self.config.default_memory_kind.is_default() {
            return sharding
                .with_device_assignment(None, Some(self.config.default_memory_kind.clone()));
        }
        Ok(sharding)
    }
}

/// Byte strides of a dense row-major layout, None if a stride doesn't fit in
/// an i64.
fn dense_byte_strides(shape: &Shape, elem_size: usize) -> Option<Vec<i64>> {
    let mut strides = vec![0; shape.rank()];
    let mut stride = i64::try_from(elem_size).ok()?;
    for (idx, dim) in shape.dims().iter().enumerate().rev() {
        strides[idx] = stride;
        stride = stride.checked_mul(i64::try_from(*dim).ok()?)?;
    }
    Some(strides)
}
