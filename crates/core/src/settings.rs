//! Worker settings, the detected device set, and settings validation.
//!
//! Settings are replaced wholesale: [`Settings::validate`] reports every
//! violation at once so a client can fix them in a single round trip.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::naming::is_safe_filename;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Subdirectory of the data directory holding model weights.
pub const MODELS_DIR: &str = "models";

/// Subdirectory of the data directory holding model configs.
pub const CONFIGS_DIR: &str = "configs";

/// Native resolution assumed for models that do not declare one.
pub const DEFAULT_MODEL_SIZE: u32 = 512;

pub const DEFAULT_STEPS_PER_PREVIEW: u32 = 10;

/// Device priorities: the highest-priority detected device is the default.
const PRIORITY_CUDA: u8 = 20;
const PRIORITY_CUDA_INDEXED: u8 = 10;
const PRIORITY_CPU: u8 = 0;

pub fn models_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(MODELS_DIR)
}

pub fn configs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIGS_DIR)
}

// ---------------------------------------------------------------------------
// Device set
// ---------------------------------------------------------------------------

/// Compute devices the worker may be pointed at, highest priority first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSet {
    devices: Vec<(String, u8)>,
}

impl DeviceSet {
    /// `cpu`, plus `cuda` and `cuda:0..n` when `gpu_count > 0`.
    pub fn from_gpu_count(gpu_count: u32) -> Self {
        let mut names = vec!["cpu".to_string()];
        if gpu_count > 0 {
            names.push("cuda".to_string());
            names.extend((0..gpu_count).map(|i| format!("cuda:{i}")));
        }
        Self::from_names(names)
    }

    /// Build from explicit device names, e.g. a configured override.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut devices: Vec<(String, u8)> = Vec::new();
        for name in names {
            let name = name.into();
            if devices.iter().any(|(existing, _)| *existing == name) {
                continue;
            }
            let priority = device_priority(&name);
            devices.push((name, priority));
        }
        // Stable: equal priorities keep their given order.
        devices.sort_by(|a, b| b.1.cmp(&a.1));
        Self { devices }
    }

    pub fn contains(&self, device: &str) -> bool {
        self.devices.iter().any(|(name, _)| name == device)
    }

    /// Device names in priority order.
    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn default_device(&self) -> &str {
        self.devices
            .first()
            .map(|(name, _)| name.as_str())
            .unwrap_or("cpu")
    }
}

fn device_priority(name: &str) -> u8 {
    match name {
        "cuda" => PRIORITY_CUDA,
        n if n.starts_with("cuda:") => PRIORITY_CUDA_INDEXED,
        _ => PRIORITY_CPU,
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

fn default_model_size() -> u32 {
    DEFAULT_MODEL_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub name: String,
    /// File under `<data_dir>/models/`.
    pub weights_filename: String,
    /// File under `<data_dir>/configs/`.
    pub config_filename: String,
    #[serde(default = "default_model_size")]
    pub width: u32,
    #[serde(default = "default_model_size")]
    pub height: u32,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub models: Vec<ModelConfig>,
    pub device: String,
    pub use_full_precision: bool,
    pub show_previews: bool,
    /// Present iff `show_previews`.
    pub steps_per_preview: Option<u32>,
}

impl Settings {
    /// No models, the best detected device, half precision, previews every
    /// ten steps.
    pub fn defaults(devices: &DeviceSet) -> Self {
        Self {
            models: Vec::new(),
            device: devices.default_device().to_string(),
            use_full_precision: false,
            show_previews: true,
            steps_per_preview: Some(DEFAULT_STEPS_PER_PREVIEW),
        }
    }

    /// The single active model, if exactly one is active.
    pub fn active_model(&self) -> Option<&ModelConfig> {
        let mut active = self.models.iter().filter(|m| m.active);
        match (active.next(), active.next()) {
            (Some(model), None) => Some(model),
            _ => None,
        }
    }

    /// Collect every violation. An empty list means the settings are ready.
    pub fn validate(&self, data_dir: &Path, devices: &DeviceSet) -> Vec<String> {
        let mut errors = Vec::new();

        if self.models.is_empty() {
            errors.push("No models configured".to_string());
        } else {
            let active: Vec<&str> = self
                .models
                .iter()
                .filter(|m| m.active)
                .map(|m| m.name.as_str())
                .collect();
            match active.len() {
                0 => errors.push("no active model".to_string()),
                1 => {}
                _ => errors.push(format!("multiple active models: {}", active.join(", "))),
            }
        }

        let models_dir = models_dir(data_dir);
        let configs_dir = configs_dir(data_dir);
        for model in &self.models {
            check_model_file(
                &mut errors,
                &models_dir,
                &model.weights_filename,
                "model file",
            );
            check_model_file(
                &mut errors,
                &configs_dir,
                &model.config_filename,
                "model config",
            );
        }

        if !devices.contains(&self.device) {
            errors.push(format!("unsupported device: {}", self.device));
        }

        match (self.show_previews, self.steps_per_preview) {
            (true, None) => {
                errors.push("steps per preview is required when previews are enabled".to_string())
            }
            (false, Some(_)) => errors
                .push("steps per preview must not be set when previews are disabled".to_string()),
            (true, Some(0)) => errors.push("steps per preview must be at least 1".to_string()),
            _ => {}
        }

        errors
    }

    pub fn is_ready(&self, data_dir: &Path, devices: &DeviceSet) -> bool {
        self.validate(data_dir, devices).is_empty()
    }
}

/// Unsafe names are reported without touching the filesystem.
fn check_model_file(errors: &mut Vec<String>, dir: &Path, filename: &str, label: &str) {
    if !is_safe_filename(filename) {
        errors.push(format!("unsafe model filename '{filename}'"));
    } else if !dir.join(filename).is_file() {
        errors.push(format!("{label} '{filename}' does not exist"));
    }
}
