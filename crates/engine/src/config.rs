//! Engine configuration.
//!
//! | Variable          | Default                                          |
//! |-------------------|--------------------------------------------------|
//! | `FUSION_DATA_DIR` | `<platform data dir>/fusion-kit`                 |
//! | `DATABASE_URL`    | `sqlite://<data_dir>/fusion-kit.db?mode=rwc`     |
//! | `FUSION_DEVICES`  | detected (comma separated override, e.g. `cpu`)  |

use std::path::{Path, PathBuf};

use fusion_core::config::{env_opt, ConfigError};
use fusion_core::settings::DeviceSet;

const APP_DIR_NAME: &str = "fusion-kit";
const DATABASE_FILE: &str = "fusion-kit.db";

/// Directory under the data dir holding persisted dream images.
pub const IMAGES_DIR: &str = "images";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub database_url: String,
    /// Explicit device list; `None` means detect.
    pub devices: Option<Vec<String>>,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            database_url: default_database_url(&data_dir),
            data_dir,
            devices: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = match env_opt::<PathBuf>("FUSION_DATA_DIR")? {
            Some(dir) => dir,
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_DIR_NAME))
                .ok_or(ConfigError::Missing("FUSION_DATA_DIR"))?,
        };

        let mut config = Self::new(data_dir);
        if let Some(url) = env_opt::<String>("DATABASE_URL")? {
            config.database_url = url;
        }
        config.devices = env_opt::<String>("FUSION_DEVICES")?.map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        });
        Ok(config)
    }

    pub fn images_dir(&self) -> PathBuf {
        images_dir(&self.data_dir)
    }

    /// The configured device override, or whatever NVML reports.
    pub fn device_set(&self) -> DeviceSet {
        match &self.devices {
            Some(names) => DeviceSet::from_names(names.iter().map(String::as_str)),
            None => fusion_worker::devices::detect_devices(),
        }
    }
}

pub fn images_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(IMAGES_DIR)
}

fn default_database_url(data_dir: &Path) -> String {
    format!(
        "sqlite://{}?mode=rwc",
        data_dir.join(DATABASE_FILE).display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_lives_in_data_dir() {
        let config = EngineConfig::new("/srv/fusion");
        assert_eq!(config.database_url, "sqlite:///srv/fusion/fusion-kit.db?mode=rwc");
        assert_eq!(config.images_dir(), PathBuf::from("/srv/fusion/images"));
    }

    #[test]
    fn device_override_skips_detection() {
        let mut config = EngineConfig::new("/srv/fusion");
        config.devices = Some(vec!["cpu".to_string()]);
        assert_eq!(config.device_set().names(), vec!["cpu".to_string()]);
    }
}
