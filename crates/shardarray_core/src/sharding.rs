use std::fmt;
use std::sync::Arc;

use shardarray_error::{ArrayError, Result};

use crate::device::{Device, DeviceList, MemoryKind};
use crate::shape::Shape;

/// Describes how the shards of an array map onto devices.
///
/// Shardings are immutable and shared between arrays through an `Arc`.
/// Shard `i` of an array always lives on `devices()[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sharding {
    /// The whole array lives on one device.
    SingleDevice {
        devices: DeviceList,
        memory_kind: MemoryKind,
    },
    /// One shard per device with no known partition geometry. Callers are
    /// responsible for keeping the array shape and shard count consistent.
    Opaque {
        devices: DeviceList,
        memory_kind: MemoryKind,
    },
    /// One shard per device, with the shape of every shard recorded for a
    /// known overall shape.
    Concrete {
        devices: DeviceList,
        memory_kind: MemoryKind,
        shape: Shape,
        shard_shapes: Vec<Shape>,
    },
}

impl Sharding {
    pub fn single_device(device: Device, memory_kind: MemoryKind) -> Arc<Self> {
        Arc::new(Sharding::SingleDevice {
            devices: DeviceList::new([device]),
            memory_kind,
        })
    }

    pub fn opaque(devices: DeviceList, memory_kind: MemoryKind) -> Result<Arc<Self>> {
        if devices.is_empty() {
            return Err(ArrayError::invalid_argument(
                "Opaque sharding requires at least one device",
            ));
        }

        Ok(Arc::new(Sharding::Opaque {
            devices,
            memory_kind,
        }))
    }

    pub fn concrete(
        devices: DeviceList,
        memory_kind: MemoryKind,
        shape: Shape,
        shard_shapes: Vec<Shape>,
    ) -> Result<Arc<Self>> {
        if devices.is_empty() {
            return Err(ArrayError::invalid_argument(
                "Concrete sharding requires at least one device",
            ));
        }
        if devices.len() != shard_shapes.len() {
            return Err(ArrayError::invalid_argument(
                "Concrete sharding needs one shard shape per device",
            )
            .with_field("devices", devices.len())
            .with_field("shard_shapes", shard_shapes.len()));
        }

        Ok(Arc::new(Sharding::Concrete {
            devices,
            memory_kind,
            shape,
            shard_shapes,
        }))
    }

    pub fn devices(&self) -> &DeviceList {
        match self {
            Self::SingleDevice { devices, .. }
            | Self::Opaque { devices, .. }
            | Self::Concrete { devices, .. } => devices,
        }
    }

    pub fn memory_kind(&self) -> &MemoryKind {
        match self {
            Self::SingleDevice { memory_kind, .. }
            | Self::Opaque { memory_kind, .. }
            | Self::Concrete { memory_kind, .. } => memory_kind,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.devices().len()
    }

    pub fn is_single_device(&self) -> bool {
        matches!(self, Self::SingleDevice { .. })
    }

    /// Check that an array of `shape` may use this sharding.
    ///
    /// Only concrete shardings record the shape they were built for.
    pub fn check_shape(&self, shape: &Shape) -> Result<()> {
        if let Self::Concrete {
            shape: sharded_shape,
            ..
        } = self
        {
            if sharded_shape != shape {
                return Err(ArrayError::invalid_argument(
                    "Shape does not match the shape of the concrete sharding",
                )
                .with_field("sharding_shape", sharded_shape)
                .with_field("shape", shape));
            }
        }
        Ok(())
    }

    /// Build a sharding identical to this one but placed on other devices or
    /// in another memory kind.
    ///
    /// The new device list must have the same length as the current one.
    pub fn with_device_assignment(
        &self,
        devices: Option<DeviceList>,
        memory_kind: Option<MemoryKind>,
    ) -> Result<Arc<Self>> {
        let devices = match devices {
            Some(devices) => {
                if devices.len() != self.shard_count() {
                    return Err(ArrayError::invalid_argument(
                        "New device assignment must have the same number of devices",
                    )
                    .with_field("expected", self.shard_count())
                    .with_field("got", devices.len()));
                }
                devices
            }
            None => self.devices().clone(),
        };
        let memory_kind = memory_kind.unwrap_or_else(|| self.memory_kind().clone());

        Ok(Arc::new(match self {
            Self::SingleDevice { .. } => Self::SingleDevice {
                devices,
                memory_kind,
            },
            Self::Opaque { .. } => Self::Opaque {
                devices,
                memory_kind,
            },
            Self::Concrete {
                shape,
                shard_shapes,
                ..
            } => Self::Concrete {
                devices,
                memory_kind,
                shape: shape.clone(),
                shard_shapes: shard_shapes.clone(),
            },
        }))
    }

    /// Split an array of `shape` into the shape and single device sharding
    /// of each shard, in shard order.
    pub fn disassemble(&self, shape: &Shape) -> Result<Vec<(Shape, Arc<Sharding>)>> {
        match self {
            Self::SingleDevice { devices, .. } => {
                let device = *devices.get(0).ok_or_else(|| {
                    ArrayError::internal("Single device sharding without a device")
                })?;
                Ok(vec![(
                    shape.clone(),
                    Sharding::single_device(device, self.memory_kind().clone()),
                )])
            }
            Self::Opaque { .. } => Err(ArrayError::invalid_argument(
                "Opaque sharding does not have shard shape information",
            )),
            Self::Concrete {
                devices,
                memory_kind,
                shard_shapes,
                ..
            } => {
                self.check_shape(shape)?;

                Ok(devices
                    .iter()
                    .zip(shard_shapes)
                    .map(|(device, shard_shape)| {
                        (
                            shard_shape.clone(),
                            Sharding::single_device(*device, memory_kind.clone()),
                        )
                    })
                    .collect())
            }
        }
    }
}

impl fmt::Display for Sharding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleDevice {
                devices,
                memory_kind,
            } => write!(
                f,
                "SingleDeviceSharding(devices: {devices}, memory_kind: {memory_kind})"
            ),
            Self::Opaque {
                devices,
                memory_kind,
            } => write!(
                f,
                "OpaqueSharding(devices: {devices}, memory_kind: {memory_kind})"
            ),
            Self::Concrete {
                devices,
                memory_kind,
                shape,
                shard_shapes,
            } => {
                write!(f, "ConcreteSharding(devices: {devices}, shape: {shape}, shard_shapes: [")?;
                for (idx, shard_shape) in shard_shapes.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{shard_shape}")?;
                }
                write!(f, "], memory_kind: {memory_kind})")
            }
        }
    }
}
