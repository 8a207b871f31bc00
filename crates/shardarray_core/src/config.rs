use std::collections::HashMap;
use std::sync::LazyLock;

use shardarray_error::{ArrayError, ErrorKind, Result, ResultExt};
use tracing::debug;

use crate::device::MemoryKind;

/// Prefix for environment variables overriding settings.
pub const ENV_PREFIX: &str = "SHARDARRAY_";

/// Configuration for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub num_devices: usize,
    pub process_index: u32,
    pub default_memory_kind: MemoryKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            num_devices: DEFAULT_NUM_DEVICES,
            process_index: 0,
            default_memory_kind: MemoryKind::default(),
        }
    }
}

impl ClientConfig {
    /// Default config with overrides read from `SHARDARRAY_<NAME>` environment
    /// variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Default config with overrides provided by `lookup`, keyed by
    /// environment variable name.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut conf = Self::default();

        let mut names: Vec<_> = GET_SET_FUNCTIONS.keys().copied().collect();
        names.sort_unstable();

        for name in names {
            let var = format!("{ENV_PREFIX}{}", name.to_ascii_uppercase());
            if let Some(value) = lookup(&var) {
                debug!(%var, %value, "setting client config from environment");
                conf.set_from_str(name, &value)
                    .map_err(|e| e.with_field("variable", var))?;
            }
        }

        Ok(conf)
    }

    pub fn set_from_str(&mut self, name: &str, value: &str) -> Result<()> {
        let func = lookup_setting(name)?;
        (func.set)(value, self)
    }

    pub fn get_as_string(&self, name: &str) -> Result<String> {
        let func = lookup_setting(name)?;
        Ok((func.get)(self))
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        let func = lookup_setting(name)?;
        let default = (func.get)(&Self::default());
        (func.set)(&default, self)
    }

    pub fn reset_all(&mut self) {
        *self = Self::default();
    }

    /// Names and descriptions of every setting, sorted by name.
    pub fn describe() -> Vec<(&'static str, &'static str)> {
        let mut settings: Vec<_> = GET_SET_FUNCTIONS
            .iter()
            .map(|(name, funcs)| (*name, funcs.description))
            .collect();
        settings.sort_unstable();
        settings
    }
}

fn lookup_setting(name: &str) -> Result<&'static SettingFunctions> {
    GET_SET_FUNCTIONS.get(name).ok_or_else(|| {
        ArrayError::invalid_argument(format!("Missing setting for '{name}'"))
    })
}

struct SettingFunctions {
    description: &'static str,
    set: fn(value: &str, conf: &mut ClientConfig) -> Result<()>,
    get: fn(conf: &ClientConfig) -> String,
}

impl SettingFunctions {
    const fn new<S: ClientSetting>() -> Self {
        SettingFunctions {
            description: S::DESCRIPTION,
            set: S::set_from_str as _,
            get: S::get_as_string as _,
        }
    }
}

fn insert_setting<S: ClientSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<NumDevices>(&mut map);
    insert_setting::<ProcessIndex>(&mut map);
    insert_setting::<DefaultMemoryKind>(&mut map);

    map
});

pub trait ClientSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_str(value: &str, conf: &mut ClientConfig) -> Result<()>;
    fn get_as_string(conf: &ClientConfig) -> String;
}

pub const DEFAULT_NUM_DEVICES: usize = 2;

const MIN_NUM_DEVICES: usize = 1;
const MAX_NUM_DEVICES: usize = 1024;

pub struct NumDevices;

impl NumDevices {
    pub fn validate_value(val: usize) -> Result<()> {
        if val < MIN_NUM_DEVICES {
            return Err(ArrayError::invalid_argument(format!(
                "Device count cannot be less than {MIN_NUM_DEVICES}"
            )));
        }

        if val > MAX_NUM_DEVICES {
            return Err(ArrayError::invalid_argument(format!(
                "Device count cannot be greater than {MAX_NUM_DEVICES}"
            )));
        }

        Ok(())
    }
}

impl ClientSetting for NumDevices {
    const NAME: &'static str = "num_devices";
    const DESCRIPTION: &'static str = "Number of addressable devices the client creates";

    fn set_from_str(value: &str, conf: &mut ClientConfig) -> Result<()> {
        let val = parse_setting::<usize>(Self::NAME, value)?;
        Self::validate_value(val)?;

        conf.num_devices = val;
        Ok(())
    }

    fn get_as_string(conf: &ClientConfig) -> String {
        conf.num_devices.to_string()
    }
}

pub struct ProcessIndex;

impl ClientSetting for ProcessIndex {
    const NAME: &'static str = "process_index";
    const DESCRIPTION: &'static str = "Index of the process owning the client's devices";

    fn set_from_str(value: &str, conf: &mut ClientConfig) -> Result<()> {
        conf.process_index = parse_setting(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_string(conf: &ClientConfig) -> String {
        conf.process_index.to_string()
    }
}

pub struct DefaultMemoryKind;

impl ClientSetting for DefaultMemoryKind {
    const NAME: &'static str = "default_memory_kind";
    const DESCRIPTION: &'static str =
        "Memory kind used when a sharding doesn't name one. Empty for the device default";

    fn set_from_str(value: &str, conf: &mut ClientConfig) -> Result<()> {
        let value = value.trim();
        conf.default_memory_kind = if value.is_empty() {
            MemoryKind::default()
        } else {
            MemoryKind::new(value)
        };
        Ok(())
    }

    fn get_as_string(conf: &ClientConfig) -> String {
        conf.default_memory_kind
            .name()
            .unwrap_or_default()
            .to_string()
    }
}

fn parse_setting<T>(name: &'static str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .context_fn(|| format!("Failed to parse value for setting '{name}'"))
        .map_err(|e| {
            e.with_error_kind(ErrorKind::InvalidArgument)
                .with_field("setting", name)
                .with_field("value", value)
        })
}
