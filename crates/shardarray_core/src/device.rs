use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single compute device.
///
/// Devices are owned by the client that created them, arrays only refer to
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    id: DeviceId,
    process_index: u32,
}

impl Device {
    pub const fn new(id: DeviceId, process_index: u32) -> Self {
        Device { id, process_index }
    }

    pub const fn id(&self) -> DeviceId {
        self.id
    }

    pub const fn process_index(&self) -> u32 {
        self.process_index
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host:{}/device:{}", self.process_index, self.id)
    }
}

/// Ordered list of devices. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceList(Arc<[Device]>);

impl DeviceList {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        DeviceList(devices.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Device> {
        self.0.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Device] {
        &self.0
    }

    pub fn contains(&self, device: &Device) -> bool {
        self.0.contains(device)
    }
}

impl fmt::Display for DeviceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, device) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", device.id)?;
        }
        write!(f, "]")
    }
}

/// Memory space on a device.
///
/// The unnamed kind refers to whatever the device uses by default.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MemoryKind(Option<Arc<str>>);

impl MemoryKind {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        MemoryKind(Some(name.into()))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_default(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "(default)"),
        }
    }
}
