//! Service configuration.
//!
//! A small YAML file holds the monitoring tunables. It is loaded once into
//! a global cache; readers pick their polling cycles and timeouts up from
//! there so embedding applications can adjust them without code changes.

// ───── Std Lib ─────
use std::env;
use std::fs;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// ───── External Crates ─────
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Represents the configuration settings of the service.
#[derive(Serialize, Deserialize, Debug)]
pub struct ConfigurationFile {
    name: String,                         // The name of the service.
    version: String,                      // The version of the service.
    description: String,                  // A brief description of the service.
    monitoring: Option<MonitoringConfig>, // Optional monitoring tunables.
}

/// Monitoring tunables, part of [`ConfigurationFile`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Timeout handed to blocking insertion waits.
    pub insertion_timeout_ms: u64,
    /// Cycle of the active insertion polling job.
    pub insertion_cycle_ms: u64,
    /// Cycle of the active removal polling job.
    pub removal_cycle_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        let cycle_ms = crate::monitoring::DEFAULT_REMOVAL_CYCLE.as_millis() as u64;
        Self {
            insertion_timeout_ms: 10_000,
            insertion_cycle_ms: cycle_ms,
            removal_cycle_ms: cycle_ms,
        }
    }
}

/// Retrieves the configuration file path, creating the directories on the
/// way when they do not exist yet.
pub fn get_config_path() -> io::Result<PathBuf> {
    let mut config_path = PathBuf::new();

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let home_dir = env::var("HOME");

    #[cfg(target_os = "windows")]
    let home_dir = env::var("USERPROFILE");

    match &home_dir {
        Ok(home) => {
            log::debug!("Home directory found: {}", home);
            config_path.push(home);
        }
        Err(e) => {
            log::error!("Failed to get home directory environment variable: {}", e);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "Failed to get home directory environment variable",
            ));
        }
    }

    config_path.push(".config");
    config_path.push("card-terminal");

    log::debug!("Config directory path resolved to: {:?}", config_path);

    if let Err(e) = fs::create_dir_all(&config_path) {
        log::error!("Failed to create config directory {:?}: {}", config_path, e);
        return Err(e);
    }

    config_path.push("config.yaml");

    Ok(config_path)
}

/// Load the configuration from the file.
fn load_config(
    config_path: &Path,
) -> Result<ConfigurationFile, Box<dyn std::error::Error + Send + Sync>> {
    let mut config_contents = String::new();
    File::open(config_path)?.read_to_string(&mut config_contents)?;
    let config: ConfigurationFile = serde_yaml::from_str(&config_contents)?;
    Ok(config)
}

/// Saves the configuration to the file.
fn save_config(
    config_path: &Path,
    config: &ConfigurationFile,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let yaml = serde_yaml::to_string(config)?;
    File::create(config_path)?.write_all(yaml.as_bytes())?;
    Ok(())
}

/// Persists new monitoring tunables and refreshes the cache.
pub fn update_monitoring_config(
    config_path: &Path,
    monitoring: MonitoringConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut config = load_config(config_path)?;
    config.monitoring = Some(monitoring);

    save_config(config_path, &config)?;
    load_config_to_cache(&config);

    log::info!("Monitoring configuration updated");
    Ok(())
}

#[derive(Default, Debug)]
struct CacheConfigData {
    monitoring: Option<MonitoringConfig>,
}

lazy_static! {
    /// Global cache of the parsed configuration. Readers consult it at
    /// construction time instead of re-reading the file.
    static ref CACHE: Mutex<CacheConfigData> = Mutex::new(CacheConfigData::default());
}

/// Monitoring tunables from the cache, falling back to the defaults when
/// no configuration was initialized.
pub fn monitoring_config() -> MonitoringConfig {
    CACHE
        .lock()
        .unwrap()
        .monitoring
        .clone()
        .unwrap_or_default()
}

/// Loads the parsed configuration into the cache.
fn load_config_to_cache(config: &ConfigurationFile) {
    log::debug!("load_config_to_cache");

    let mut cache = CACHE.lock().unwrap();
    *cache = CacheConfigData {
        monitoring: config.monitoring.clone(),
    };
}

// Default structure config
fn generate_default_config() -> ConfigurationFile {
    ConfigurationFile {
        name: "Card Terminal Service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "Smart card application selection and reader observation".to_string(),
        monitoring: Some(MonitoringConfig::default()),
    }
}

/// Initializes the configuration file.
///
/// Creates a default configuration when none exists, then loads it into the
/// cache. Call once at startup; readers constructed before initialization
/// simply run on the defaults.
pub fn init_config() -> io::Result<()> {
    let config_path = get_config_path()?;
    let config: ConfigurationFile;

    if config_path.exists() {
        let mut contents = String::new();
        File::open(&config_path)?.read_to_string(&mut contents)?;

        match serde_yaml::from_str::<ConfigurationFile>(&contents) {
            Ok(mut loaded_config) => {
                loaded_config.version = env!("CARGO_PKG_VERSION").to_string();
                config = loaded_config;
            }
            Err(e) => {
                log::warn!("Config format mismatch ({}). Resetting to default config.", e);
                config = generate_default_config();
            }
        }
    } else {
        log::debug!("Config file not found. Generating default config.");
        config = generate_default_config();
    }

    save_config(&config_path, &config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    load_config_to_cache(&config);

    Ok(())
}
