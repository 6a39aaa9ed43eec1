#![allow(dead_code)]

use ember::backend::software::{SoftwareDevice, SoftwareInstance};
use ember::{Device, DeviceConfig};
use std::sync::Arc;

/// A device on the software backend with barrier validation on, plus the
/// concrete backend for direct storage/latency access.
pub fn software_device() -> (Device, Arc<SoftwareDevice>) {
    let mut config = DeviceConfig::default();
    config.settings.enable_debug_device = true;
    software_device_with(config)
}

pub fn software_device_with(config: DeviceConfig) -> (Device, Arc<SoftwareDevice>) {
    let _ = pretty_env_logger::try_init();
    let backend = SoftwareInstance::new()
        .create_software_device(0, config.settings.enable_debug_device)
        .unwrap();
    let device = Device::with_backend(backend.clone(), config).unwrap();
    (device, backend)
}
