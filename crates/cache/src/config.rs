//! Cache hierarchy configuration.
//!
//! Sizes for the disk, main memory and graphics memory levels, where the disk
//! cache puts its temporary directory, how much frame time the synchronous
//! levels may spend, and how meshes without resident data are displayed.
//! Configuration can be loaded from a file, environment variables, or created
//! programmatically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ooc_scheduler::LEVEL_WORK_BUDGET;

use crate::strategy::MissingMode;

const MB: usize = 1024 * 1024;

/// Environment variables read by [`CacheConfig::from_env`], with the file key
/// each one overrides
const ENV_KEYS: [(&str, &str); 7] = [
    ("OOC_ENABLED", "enabled"),
    ("OOC_DISK_CACHE_MB", "disk_cache_mb"),
    ("OOC_MAIN_MEMORY_MB", "main_memory_mb"),
    ("OOC_GRAPHICS_MEMORY_MB", "graphics_memory_mb"),
    ("OOC_CACHE_DIR", "disk_cache_dir"),
    ("OOC_WORK_BUDGET_MS", "work_budget_ms"),
    ("OOC_MISSING_MODE", "missing_mode"),
];

/// Configuration of the cache hierarchy.
///
/// A level size of 0 leaves that level out of the hierarchy built by
/// [`crate::CacheManager::from_config`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Whether newly added meshes go through the cache at all
    pub enabled: bool,
    /// Disk cache level budget in bytes
    pub disk_cache_size: usize,
    /// Main memory level budget in bytes
    pub main_memory_size: usize,
    /// Graphics memory level budget in bytes
    pub graphics_memory_size: usize,
    /// Parent of the disk cache's temporary directory
    pub disk_cache_dir: PathBuf,
    /// Wall-clock budget per frame for levels working on the calling thread
    pub work_budget: Duration,
    /// Display behavior for meshes whose data is not resident
    pub missing_mode: MissingMode,
    /// RGBA color of placeholder boxes
    pub placeholder_color: [f32; 4],
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disk_cache_size: 1024 * MB,
            main_memory_size: 256 * MB,
            graphics_memory_size: 512 * MB,
            disk_cache_dir: Self::default_cache_dir(),
            work_budget: LEVEL_WORK_BUDGET,
            missing_mode: MissingMode::default(),
            placeholder_color: [0.5, 0.5, 0.5, 1.0],
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with the given level sizes in megabytes.
    pub fn new(disk_mb: usize, main_memory_mb: usize, graphics_memory_mb: usize) -> Self {
        Self {
            disk_cache_size: disk_mb * MB,
            main_memory_size: main_memory_mb * MB,
            graphics_memory_size: graphics_memory_mb * MB,
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the disk cache size in megabytes, 0 to leave the level out.
    pub fn with_disk_mb(mut self, mb: usize) -> Self {
        self.disk_cache_size = mb * MB;
        self
    }

    /// Sets the main memory size in megabytes, 0 to leave the level out.
    pub fn with_main_memory_mb(mut self, mb: usize) -> Self {
        self.main_memory_size = mb * MB;
        self
    }

    /// Sets the graphics memory size in megabytes, 0 to leave the level out.
    pub fn with_graphics_memory_mb(mut self, mb: usize) -> Self {
        self.graphics_memory_size = mb * MB;
        self
    }

    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn with_work_budget(mut self, budget: Duration) -> Self {
        self.work_budget = budget;
        self
    }

    pub fn with_missing_mode(mut self, mode: MissingMode) -> Self {
        self.missing_mode = mode;
        self
    }

    pub fn with_placeholder_color(mut self, color: [f32; 4]) -> Self {
        self.placeholder_color = color;
        self
    }

    /// Returns the default parent directory for the disk cache.
    ///
    /// - macOS: ~/Library/Caches/ooc-mesh-cache
    /// - Linux: ~/.cache/ooc-mesh-cache
    /// - Windows: %LOCALAPPDATA%\ooc-mesh-cache
    pub fn default_cache_dir() -> PathBuf {
        match dirs::cache_dir() {
            Some(cache_dir) => cache_dir.join("ooc-mesh-cache"),
            None => std::env::temp_dir().join("ooc-mesh-cache"),
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// - `OOC_ENABLED`: `true`/`false`
    /// - `OOC_DISK_CACHE_MB`, `OOC_MAIN_MEMORY_MB`, `OOC_GRAPHICS_MEMORY_MB`: level sizes in MB
    /// - `OOC_CACHE_DIR`: disk cache parent directory
    /// - `OOC_WORK_BUDGET_MS`: per-frame work budget in milliseconds
    /// - `OOC_MISSING_MODE`: `skip`, `placeholder`, `depth-only` or `block`
    ///
    /// # Errors
    /// Returns an error if any variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (var, key) in ENV_KEYS {
            if let Ok(value) = std::env::var(var) {
                config.set(key, &value).map_err(|_| ConfigError::InvalidValue(var.to_string()))?;
            }
        }
        Ok(config)
    }

    /// Loads configuration from a file of `key = value` lines.
    ///
    /// ```toml
    /// enabled = true
    /// disk_cache_mb = 1024
    /// main_memory_mb = 256
    /// graphics_memory_mb = 512
    /// disk_cache_dir = "/path/to/cache"
    /// work_budget_ms = 10
    /// missing_mode = "placeholder"
    /// placeholder_color = "0.5, 0.5, 0.5, 1"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or holds an invalid value.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in toml_str.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"');
                if !config.set(key, value)? {
                    log::debug!("ignoring unknown cache config key {}", key);
                }
            }
        }

        Ok(config)
    }

    /// Apply one file-format setting; `Ok(false)` for unknown keys
    fn set(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        let invalid = || ConfigError::InvalidValue(key.to_string());
        let megabytes = |value: &str| value.parse::<usize>().map(|mb| mb * MB).map_err(|_| invalid());

        match key {
            "enabled" => {
                self.enabled = match value.to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => true,
                    "false" | "0" | "no" | "off" => false,
                    _ => return Err(invalid()),
                }
            }
            "disk_cache_mb" => self.disk_cache_size = megabytes(value)?,
            "main_memory_mb" => self.main_memory_size = megabytes(value)?,
            "graphics_memory_mb" => self.graphics_memory_size = megabytes(value)?,
            "disk_cache_dir" => self.disk_cache_dir = PathBuf::from(value),
            "work_budget_ms" => {
                self.work_budget = Duration::from_millis(value.parse::<u64>().map_err(|_| invalid())?)
            }
            "missing_mode" => self.missing_mode = value.parse().map_err(|_| invalid())?,
            "placeholder_color" => {
                let channels = value
                    .split(',')
                    .map(|channel| channel.trim().parse::<f32>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| invalid())?;
                self.placeholder_color = channels.try_into().map_err(|_| invalid())?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Saves configuration to a file readable by [`CacheConfig::from_file`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml())?;
        Ok(())
    }

    fn to_toml(&self) -> String {
        let [r, g, b, a] = self.placeholder_color;
        format!(
            "# Out-of-core mesh cache configuration\n\
             enabled = {}\n\
             disk_cache_mb = {}\n\
             main_memory_mb = {}\n\
             graphics_memory_mb = {}\n\
             disk_cache_dir = \"{}\"\n\
             work_budget_ms = {}\n\
             missing_mode = \"{}\"\n\
             placeholder_color = \"{}, {}, {}, {}\"\n",
            self.enabled,
            self.disk_cache_mb(),
            self.main_memory_mb(),
            self.graphics_memory_mb(),
            self.disk_cache_dir.display(),
            self.work_budget.as_millis(),
            self.missing_mode,
            r,
            g,
            b,
            a
        )
    }

    pub fn disk_cache_mb(&self) -> usize {
        self.disk_cache_size / MB
    }

    pub fn main_memory_mb(&self) -> usize {
        self.main_memory_size / MB
    }

    pub fn graphics_memory_mb(&self) -> usize {
        self.graphics_memory_size / MB
    }
}

/// Errors that can occur while loading or saving a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration key or environment variable
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.disk_cache_size, 1024 * MB);
        assert_eq!(config.main_memory_size, 256 * MB);
        assert_eq!(config.graphics_memory_size, 512 * MB);
        assert_eq!(config.work_budget, Duration::from_millis(10));
        assert_eq!(config.missing_mode, MissingMode::Placeholder);
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::new(0, 64, 0)
            .with_enabled(false)
            .with_disk_dir("/custom/path")
            .with_work_budget(Duration::from_millis(4))
            .with_missing_mode(MissingMode::DepthOnly);

        assert!(!config.enabled);
        assert_eq!(config.disk_cache_size, 0);
        assert_eq!(config.main_memory_mb(), 64);
        assert_eq!(config.graphics_memory_size, 0);
        assert_eq!(config.disk_cache_dir, PathBuf::from("/custom/path"));
        assert_eq!(config.work_budget, Duration::from_millis(4));
        assert_eq!(config.missing_mode, MissingMode::DepthOnly);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ENV_KEYS.map(|(var, _)| var));
        for (var, _) in ENV_KEYS {
            env::remove_var(var);
        }

        env::set_var("OOC_ENABLED", "false");
        env::set_var("OOC_MAIN_MEMORY_MB", "32");
        env::set_var("OOC_GRAPHICS_MEMORY_MB", "0");
        env::set_var("OOC_CACHE_DIR", "/tmp/ooc-test-cache");
        env::set_var("OOC_WORK_BUDGET_MS", "3");
        env::set_var("OOC_MISSING_MODE", "block");

        let config = CacheConfig::from_env().unwrap();
        assert!(!config.enabled);
        assert_eq!(config.main_memory_size, 32 * MB);
        assert_eq!(config.graphics_memory_size, 0);
        assert_eq!(config.disk_cache_size, 1024 * MB); // default
        assert_eq!(config.disk_cache_dir, PathBuf::from("/tmp/ooc-test-cache"));
        assert_eq!(config.work_budget, Duration::from_millis(3));
        assert_eq!(config.missing_mode, MissingMode::Block);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&["OOC_DISK_CACHE_MB"]);

        env::set_var("OOC_DISK_CACHE_MB", "lots");
        match CacheConfig::from_env() {
            Err(ConfigError::InvalidValue(var)) => assert_eq!(var, "OOC_DISK_CACHE_MB"),
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    // Saves and restores environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CacheConfig::new(16, 8, 4)
            .with_disk_dir("/tmp/cache")
            .with_missing_mode(MissingMode::Skip)
            .with_placeholder_color([1.0, 0.25, 0.0, 0.75]);
        let parsed = CacheConfig::from_toml(&config.to_toml()).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_from_toml_partial_and_unknown_keys() {
        let toml = r#"
            # only main memory
            main_memory_mb = 128
            shading = "flat"
        "#;

        let config = CacheConfig::from_toml(toml).unwrap();
        assert_eq!(config.main_memory_size, 128 * MB);
        assert_eq!(config.graphics_memory_size, 512 * MB); // default
    }

    #[test]
    fn test_from_toml_rejects_bad_color() {
        let err = CacheConfig::from_toml("placeholder_color = \"1, 0, 0\"").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(key) if key == "placeholder_color"));
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("cache.toml");

        let config = CacheConfig::new(0, 64, 128).with_disk_dir(dir.path());
        config.save_to_file(&config_path).unwrap();

        let loaded = CacheConfig::from_file(&config_path).unwrap();
        assert_eq!(config, loaded);
    }
}
