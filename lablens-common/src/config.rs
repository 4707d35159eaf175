use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_results_file")]
    pub results_file: String,
    #[serde(default = "default_panels_file")]
    pub panels_file: String,
    #[serde(default = "default_repeats_file")]
    pub repeats_file: String,
}

fn default_data_dir() -> String {
    "data/processed".into()
}
fn default_results_file() -> String {
    "results.parquet".into()
}
fn default_panels_file() -> String {
    "panels.parquet".into()
}
fn default_repeats_file() -> String {
    "repeats.parquet".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            results_file: default_results_file(),
            panels_file: default_panels_file(),
            repeats_file: default_repeats_file(),
        }
    }
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}

/// What a rebuild trigger does while another rebuild is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RebuildPolicy {
    /// wait for the running rebuild, then run
    Queue,
    /// fail immediately with `PipelineError::RebuildInProgress`
    #[default]
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub rebuild_policy: RebuildPolicy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    65536
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rebuild_policy: RebuildPolicy::default(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_sort")]
    pub default_sort: String,
    #[serde(default = "default_order")]
    pub default_order: String,
}

fn default_limit() -> usize {
    100
}
fn default_max_limit() -> usize {
    5000
}
fn default_sort() -> String {
    "Date".into()
}
fn default_order() -> String {
    "DESC".into()
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            default_sort: default_sort(),
            default_order: default_order(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lablens")
            .join("config.toml")
    }

    pub fn load() -> crate::Result<Self> {
        let path = if let Ok(env_path) = std::env::var("LABLENS_CONFIG") {
            PathBuf::from(env_path) // $LABLENS_CONFIG overrides default config path
        } else {
            Self::config_path()
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::LabLensError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.query.default_limit, 100);
        assert_eq!(cfg.pipeline.rebuild_policy, RebuildPolicy::Reject);
        assert_eq!(cfg.storage.data_dir(), PathBuf::from("data/processed"));
        assert_eq!(cfg.storage.panels_file, "panels.parquet");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pipeline]\nrebuild_policy = \"queue\"\n\n[query]\nmax_limit = 50\n").unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.pipeline.rebuild_policy, RebuildPolicy::Queue);
        assert_eq!(cfg.pipeline.batch_size, 65536);
        assert_eq!(cfg.query.max_limit, 50);
        assert_eq!(cfg.query.default_sort, "Date");
        assert_eq!(cfg.logging.filter, "info");
    }

    #[test]
    fn bad_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[query\nmax_limit = ").unwrap();
        assert!(matches!(Config::load_from(&path), Err(crate::LabLensError::Config(_))));
    }
}
