//! Device settings document.
//!
//! Settings are read from a JSON file through the `config` crate; a missing
//! file falls back to defaults so tools can run with zero configuration.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Requested graphics API family.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsApi {
    Dx12,
    Vulkan,
    Default,
}

/// HLSL shader model requested for compilation. The device clamps this to
/// the adapter's highest supported model.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize)]
pub enum ShaderModel {
    #[serde(rename = "sm6_0")]
    Sm6_0,
    #[serde(rename = "sm6_1")]
    Sm6_1,
    #[serde(rename = "sm6_2")]
    Sm6_2,
    #[serde(rename = "sm6_3")]
    Sm6_3,
    #[serde(rename = "sm6_4")]
    Sm6_4,
    #[serde(rename = "sm6_5")]
    Sm6_5,
}

impl ShaderModel {
    pub fn as_str(self) -> &'static str {
        match self {
            ShaderModel::Sm6_0 => "sm6_0",
            ShaderModel::Sm6_1 => "sm6_1",
            ShaderModel::Sm6_2 => "sm6_2",
            ShaderModel::Sm6_3 => "sm6_3",
            ShaderModel::Sm6_4 => "sm6_4",
            ShaderModel::Sm6_5 => "sm6_5",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub enable_debug_device: bool,
    pub dump_shader_pdbs: bool,
    pub adapter_index: usize,
    pub graphics_api: GraphicsApi,
    pub shader_model: ShaderModel,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            enable_debug_device: false,
            dump_shader_pdbs: false,
            adapter_index: 0,
            graphics_api: GraphicsApi::Default,
            shader_model: ShaderModel::Sm6_5,
        }
    }
}

impl DeviceSettings {
    /// Loads settings from a JSON document. A missing file yields defaults;
    /// a malformed one is an error.
    pub fn load(path: &Path) -> Result<DeviceSettings> {
        if !path.exists() {
            return Ok(DeviceSettings::default());
        }

        let mut cfg = config::Config::new();
        cfg.merge(config::File::from(path.to_path_buf()).format(config::FileFormat::Json))
            .map_err(|e| Error::InvalidParameter(format!("settings file: {}", e)))?;
        cfg.try_into()
            .map_err(|e| Error::InvalidParameter(format!("settings file: {}", e)))
    }
}
