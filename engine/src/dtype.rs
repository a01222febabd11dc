use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::EngineErr;

/// The numeric element types a graph node may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Returns the textual tag used inside serialized graphs.
    pub fn tag(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// Returns the size in bytes of one element of this type.
    pub fn size(self) -> usize {
        match self {
            DType::F32 => size_of::<f32>(),
            DType::F64 => size_of::<f64>(),
        }
    }
}

impl FromStr for DType {
    type Err = EngineErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f32" | "float" => Ok(DType::F32),
            "f64" | "double" => Ok(DType::F64),
            other => Err(EngineErr::UnsupportedDType(other.to_string())),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
