//! Settings module for process-level meta-optimization configuration.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Folder receiving checkpoints and metric streams.
    pub save_folder: PathBuf,

    /// Zero-pad width of the step index in checkpoint file names.
    pub step_width: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            save_folder: PathBuf::from("./train_dir"),
            step_width: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,

    /// Also stream every scalar metric to `<save_folder>/metrics.jsonl`.
    pub jsonl_metrics: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            jsonl_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoSettings {
    /// Seed for the synthetic episode generator.
    pub seed: u64,

    /// Number of synthetic training batches.
    pub train_batches: usize,

    /// Number of synthetic validation batches per validation run.
    pub val_batches: usize,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            seed: 42,
            train_batches: 40,
            val_batches: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Checkpoint / metrics output
    pub output: OutputSettings,

    /// Logging
    pub logging: LoggingSettings,

    /// Synthetic demo run
    pub demo: DemoSettings,
}

impl Settings {
    /// Create a new Settings instance from an optional `metaopt.toml` and the environment.
    /// Environment variables are prefixed with "METAOPT__", e.g. `METAOPT__OUTPUT__STEP_WIDTH=3`.
    pub fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .set_default("output.save_folder", "./train_dir")?
            .set_default("output.step_width", 4)?
            .set_default("logging.filter", "info")?
            .set_default("logging.jsonl_metrics", true)?
            .set_default("demo.seed", 42)?
            .set_default("demo.train_batches", 40)?
            .set_default("demo.val_batches", 8)?
            .add_source(File::with_name("metaopt").required(false))
            .add_source(Environment::with_prefix("METAOPT").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

/// Global settings instance
static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Get the global settings instance, initializing it if necessary.
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| Settings::new().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.output.save_folder, PathBuf::from("./train_dir"));
        assert_eq!(settings.output.step_width, 4);
        assert_eq!(settings.logging.filter, "info");
        assert!(settings.logging.jsonl_metrics);
        assert_eq!(settings.demo.seed, 42);
    }

    #[test]
    fn test_settings_new_matches_defaults() {
        let loaded = Settings::new().expect("defaults alone must deserialize");
        let defaults = Settings::default();

        assert_eq!(loaded.output.step_width, defaults.output.step_width);
        assert_eq!(loaded.demo.train_batches, defaults.demo.train_batches);
        assert_eq!(loaded.demo.val_batches, defaults.demo.val_batches);
    }

    #[test]
    fn test_settings_serialization() {
        let settings = Settings::default();

        let json = serde_json::to_string(&settings).expect("Failed to serialize settings");
        let deserialized: Settings =
            serde_json::from_str(&json).expect("Failed to deserialize settings");

        assert_eq!(settings.output.save_folder, deserialized.output.save_folder);
        assert_eq!(settings.logging.filter, deserialized.logging.filter);
        assert_eq!(settings.demo.seed, deserialized.demo.seed);
    }
}
