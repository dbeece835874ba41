//! Compute device detection.
//!
//! NVML is optional: on hosts without NVIDIA drivers only `cpu` is offered.

use fusion_core::settings::DeviceSet;
use nvml_wrapper::Nvml;

/// Probe the host for CUDA devices.
pub fn detect_devices() -> DeviceSet {
    match Nvml::init() {
        Ok(nvml) => {
            let count = nvml.device_count().unwrap_or(0);
            tracing::info!(gpus = count, "NVML initialised");
            DeviceSet::from_gpu_count(count)
        }
        Err(e) => {
            tracing::warn!(error = %e, "NVML unavailable -- only the cpu device will be offered");
            DeviceSet::from_gpu_count(0)
        }
    }
}
