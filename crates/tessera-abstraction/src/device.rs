//! Devices and element types.

use crate::EngineError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A compute device a part can be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    /// Accelerator by ordinal.
    Cuda(usize),
}

impl Device {
    #[must_use]
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl FromStr for Device {
    type Err = EngineError;

    /// Accepts `cpu`, `cuda`, `cuda:N` and a bare ordinal `N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Self::Cpu);
        }
        if s == "cuda" {
            return Ok(Self::Cuda(0));
        }
        let ordinal = s.strip_prefix("cuda:").unwrap_or(&s);
        ordinal
            .parse::<usize>()
            .map(Self::Cuda)
            .map_err(|_| EngineError::InvalidDevice(s.clone()))
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Element type of a synthetic input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F16,
    #[default]
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    /// Maps a config dtype name to a type; unknown names fall back to `F32`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "int" | "int32" => Self::I32,
            "int64" => Self::I64,
            "double" => Self::F64,
            "half" => Self::F16,
            _ => Self::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!("1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn test_device_serde_uses_display_form() {
        let json = serde_json::to_string(&vec![Device::Cpu, Device::Cuda(2)]).unwrap();
        assert_eq!(json, r#"["cpu","cuda:2"]"#);
        let back: Vec<Device> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![Device::Cpu, Device::Cuda(2)]);
    }

    #[test]
    fn test_dtype_names() {
        assert_eq!(DType::from_name("int"), DType::I32);
        assert_eq!(DType::from_name("int32"), DType::I32);
        assert_eq!(DType::from_name("int64"), DType::I64);
        assert_eq!(DType::from_name("double"), DType::F64);
        assert_eq!(DType::from_name("half"), DType::F16);
        assert_eq!(DType::from_name("float"), DType::F32);
        assert_eq!(DType::from_name(""), DType::F32);
    }
}
