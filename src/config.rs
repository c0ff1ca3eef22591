use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::checkpoint::RetentionPolicy;
use crate::error::ConfigError;
use crate::training::controller::TrainerConfig;

/// Compute device requested for the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl Device {
    /// Pick the device for a run: an explicit setting wins, otherwise the
    /// first GPU when it is both wanted and present, otherwise the CPU.
    pub fn select(configured: Option<Device>, use_gpu: bool, gpu_available: bool) -> Device {
        match configured {
            Some(device) => device,
            None if use_gpu && gpu_available => Device::Cuda(0),
            None => Device::Cpu,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| format!("unknown device '{other}' (expected 'cpu', 'cuda' or 'cuda:N')")),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Workspace and hardware settings shared by every run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EnvSettings {
    /// Root for checkpoints. No checkpoints are written when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    /// Subdirectory of the workspace that namespaces this experiment.
    pub project_path: PathBuf,
    pub keep_last_checkpoints: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    pub use_gpu: bool,
}

impl Default for EnvSettings {
    fn default() -> Self {
        EnvSettings {
            workspace_dir: None,
            project_path: PathBuf::from("train_settings/default"),
            keep_last_checkpoints: 5,
            device: None,
            use_gpu: true,
        }
    }
}

impl EnvSettings {
    /// The workspace root with `~` expanded.
    pub fn workspace(&self) -> Option<PathBuf> {
        self.workspace_dir.as_deref().map(expand_home)
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_last_n: self.keep_last_checkpoints,
        }
    }
}

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub env: EnvSettings,
    pub training: TrainerConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.env.keep_last_checkpoints == 0 {
            return Err(ConfigError::Validation(
                "env.keep_last_checkpoints must be >= 1".into(),
            ));
        }
        if self.env.project_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "env.project_path must not be empty".into(),
            ));
        }
        if self
            .env
            .project_path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(ConfigError::Validation(
                "env.project_path must be a relative path without '..'".into(),
            ));
        }
        if self.training.max_epochs == 0 {
            return Err(ConfigError::Validation(
                "training.max_epochs must be >= 1".into(),
            ));
        }
        if self.training.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "training.max_attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&AppConfig::default())
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::NetTypeMatch;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[env]
workspace_dir = "/tmp/flow"
keep_last_checkpoints = 2
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.env.workspace_dir, Some(PathBuf::from("/tmp/flow")));
        assert_eq!(config.env.keep_last_checkpoints, 2);
        assert!(config.env.use_gpu);
        assert_eq!(config.training.max_attempts, 2);
        assert!(config.training.fail_safe);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        let default = AppConfig::default();
        assert_eq!(config.env.project_path, default.env.project_path);
        assert_eq!(config.training.max_epochs, default.training.max_epochs);
        assert_eq!(config.training.net_type_match, NetTypeMatch::Substring);
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_device_in_toml() {
        let config: AppConfig = toml::from_str("[env]\ndevice = \"cuda:1\"\n").unwrap();
        assert_eq!(config.env.device, Some(Device::Cuda(1)));
        assert!(toml::from_str::<AppConfig>("[env]\ndevice = \"gpu\"\n").is_err());
    }

    #[test]
    fn test_device_selection() {
        assert_eq!(Device::select(Some(Device::Cpu), true, true), Device::Cpu);
        assert_eq!(Device::select(None, true, true), Device::Cuda(0));
        assert_eq!(Device::select(None, true, false), Device::Cpu);
        assert_eq!(Device::select(None, false, true), Device::Cpu);
    }

    #[test]
    fn test_validation_rejects_zero_retention() {
        let mut config = AppConfig::default();
        config.env.keep_last_checkpoints = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_escaping_project_path() {
        let mut config = AppConfig::default();
        config.env.project_path = PathBuf::from("../elsewhere");
        assert!(config.validate().is_err());
        config.env.project_path = PathBuf::from("/abs");
        assert!(config.validate().is_err());
        config.env.project_path = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = AppConfig::default();
        config.training.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_epochs() {
        let mut config = AppConfig::default();
        config.training.max_epochs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default(Path::new("nonexistent_config.toml")).unwrap();
        assert_eq!(config.env.keep_last_checkpoints, 5);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[training]
max_epochs = 25
net_type_match = "exact"
"#
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.training.max_epochs, 25);
        assert_eq!(config.training.net_type_match, NetTypeMatch::Exact);
        assert_eq!(config.env.keep_last_checkpoints, 5);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        std::fs::write(&path, "[env]\nkeep_last_checkpoints = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load(&path),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_default_toml_roundtrips() {
        let toml_str = AppConfig::default_toml().unwrap();
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.validate().expect("roundtripped config should be valid");
    }

    #[test]
    fn test_expand_home() {
        let plain = Path::new("/data/workspace");
        assert_eq!(expand_home(plain), plain.to_path_buf());
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/runs")),
                PathBuf::from(home).join("runs")
            );
        }
    }

    #[test]
    fn test_retention_from_settings() {
        let mut env = EnvSettings::default();
        env.keep_last_checkpoints = 3;
        assert_eq!(env.retention().keep_last_n, 3);
    }
}
