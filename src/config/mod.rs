//! Configuration management for indexsync
//!
//! Three layers, all TOML:
//! - the application config (`etc/indexsync.toml`)
//! - one site config per dataset (`etc/sites/<site>/site.toml`)
//! - one data source config per database (`etc/datasources/<name>.toml`)

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

/// Application-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Value substituted for `{host}` in index settings and mappings
    #[serde(default = "default_app_host")]
    pub app_host: String,

    /// Directory containing `etc/` and `storage/`
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// Minimum success rate (percent) before the alias may be swapped
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Extraction settings
    #[serde(default)]
    pub import: ImportConfig,

    /// Bulk indexing settings
    #[serde(default)]
    pub export: ExportConfig,

    /// Paths configuration (derived, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Extraction engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Rows per staging INSERT
    #[serde(default = "default_import_batch_size")]
    pub batch_size: usize,

    /// Read and write worker count (0 = logical CPUs)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Primary keys per extraction chunk
    #[serde(default = "default_window_size")]
    pub window_size: i64,

    /// Key spans below this are read unpartitioned
    #[serde(default = "default_small_range")]
    pub small_range: i64,
}

/// Bulk indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Flush worker count (0 = logical CPUs)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Flush a buffer once it reaches this many bytes
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,

    /// Flush a buffer once it holds this many documents (legacy API)
    #[serde(default = "default_flush_items")]
    pub flush_items: usize,

    /// Retries for transient responses (current API)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Derived filesystem layout
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory
    pub base_dir: PathBuf,

    /// Path to the application config file
    pub config_file: PathBuf,

    /// `etc/` directory holding site and data source configs
    pub etc_dir: PathBuf,

    /// `storage/` directory holding staging databases and failure captures
    pub storage_dir: PathBuf,
}

impl PathsConfig {
    fn new(base_dir: PathBuf, config_file: PathBuf) -> Self {
        Self {
            etc_dir: base_dir.join("etc"),
            storage_dir: base_dir.join("storage"),
            config_file,
            base_dir,
        }
    }

    pub fn site_dir(&self, site: &str) -> PathBuf {
        self.etc_dir.join("sites").join(site)
    }

    pub fn site_file(&self, site: &str) -> PathBuf {
        self.site_dir(site).join("site.toml")
    }

    pub fn import_dir(&self, site: &str) -> PathBuf {
        self.site_dir(site).join("sql-import")
    }

    pub fn export_dir(&self, site: &str) -> PathBuf {
        self.site_dir(site).join("sql-export")
    }

    pub fn datasource_file(&self, name: &str) -> PathBuf {
        self.etc_dir.join("datasources").join(format!("{}.toml", name))
    }

    pub fn staging_db(&self, site: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.db", site))
    }

    pub fn lock_file(&self, site: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.lock", site))
    }

    /// File receiving raw bulk batches the legacy index engine rejected
    pub fn failure_capture(&self, index: &str) -> PathBuf {
        self.storage_dir.join(format!("error_{}", index))
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Self {
            app_host: default_app_host(),
            base_dir: default_base_dir(),
            success_threshold: default_success_threshold(),
            import: ImportConfig::default(),
            export: ExportConfig::default(),
            paths: PathsConfig::default(),
        };
        config.init_paths(None);
        config
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_import_batch_size(),
            workers: default_workers(),
            window_size: default_window_size(),
            small_range: default_small_range(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            flush_bytes: default_flush_bytes(),
            flush_items: default_flush_items(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ImportConfig {
    pub fn resolved_workers(&self) -> usize {
        resolve_workers(self.workers)
    }
}

impl ExportConfig {
    pub fn resolved_workers(&self) -> usize {
        resolve_workers(self.workers)
    }
}

fn resolve_workers(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    /// Default config file location relative to the working directory
    pub fn default_config_path() -> PathBuf {
        PathBuf::from("etc").join("indexsync.toml")
    }

    fn init_paths(&mut self, config_file: Option<PathBuf>) {
        let base = PathBuf::from(&self.base_dir);
        let config_file = config_file.unwrap_or_else(|| base.join("etc").join("indexsync.toml"));
        self.paths = PathsConfig::new(base, config_file);
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.init_paths(Some(config_path.to_path_buf()));
        config.validate()?;
        Ok(config)
    }

    /// Load from the given path, or fall back to defaults when no file exists
    pub fn load_or_default(config_path: Option<&Path>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_config_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    debug!("No config file found, using defaults");
                    Ok(Config::default())
                }
            }
        }
    }

    /// Use a different base directory (tests and embedding callers)
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        let base: PathBuf = base_dir.into();
        self.base_dir = base.display().to_string();
        self.init_paths(None);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.success_threshold > 100 {
            return Err(Error::Config(
                "success_threshold must be between 0 and 100".to_string(),
            ));
        }

        if self.import.batch_size == 0 {
            return Err(Error::Config("import.batch_size must be positive".to_string()));
        }

        if self.import.window_size <= 0 {
            return Err(Error::Config(
                "import.window_size must be positive".to_string(),
            ));
        }

        if self.import.small_range < 0 {
            return Err(Error::Config(
                "import.small_range must not be negative".to_string(),
            ));
        }

        if self.export.flush_bytes == 0 || self.export.flush_items == 0 {
            return Err(Error::Config(
                "export.flush_bytes and export.flush_items must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-site configuration, loaded once per sync invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Default data source name (file stem under `etc/datasources/`)
    pub data_source: String,

    /// Site identifier, filled from the directory name when omitted
    #[serde(default)]
    pub site: String,

    /// Index engine version, compared against 6.0 to pick the protocol
    #[serde(default)]
    pub es_version: String,

    /// Comma-separated index engine node URLs
    #[serde(default)]
    pub es_cluster: String,

    /// Optional API key sent as `Authorization: ApiKey <key>`
    #[serde(default)]
    pub es_api_key: Option<String>,

    /// Row cap appended as LIMIT to plain extraction SELECTs (0 = off)
    #[serde(default)]
    pub import_limit: u64,

    /// Index name prefix; physical indices are `<index_name>_<timestamp>`
    pub index_name: String,

    /// Alias readers query; defaults to `index_name`
    #[serde(default)]
    pub alias_name: String,

    /// Value substituted for `{lang}`
    #[serde(default)]
    pub lang: String,

    /// Timezone for index name timestamps (`UTC`, `+08:00`, ...)
    #[serde(default)]
    pub time_zone: String,

    /// Document type for the legacy API
    #[serde(default)]
    pub doc_type_name: String,

    /// Row field used as document id
    #[serde(default = "default_doc_id_key")]
    pub doc_id_key: String,
}

impl SiteConfig {
    /// Load `etc/sites/<site>/site.toml`
    pub fn load(paths: &PathsConfig, site: &str) -> Result<Self> {
        validate_site_name(site)?;

        let path = paths.site_file(site);
        if !path.exists() {
            return Err(Error::SiteNotFound(format!(
                "{} ({} does not exist)",
                site,
                path.display()
            )));
        }

        let content = std::fs::read_to_string(&path)?;
        let mut config: SiteConfig = toml::from_str(&content)?;
        if config.site.is_empty() {
            config.site = site.to_string();
        }
        config.normalize();
        config.validate()?;

        info!(
            site = %config.site,
            index = %config.index_name,
            alias = %config.alias_name,
            es_version = %config.es_version,
            "Loaded site config"
        );
        Ok(config)
    }

    /// Apply defaults that depend on other fields
    pub fn normalize(&mut self) {
        if self.alias_name.is_empty() {
            self.alias_name = self.index_name.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_site_name(&self.site)?;

        if self.index_name.is_empty() {
            return Err(Error::Config(format!(
                "site {}: index_name is required",
                self.site
            )));
        }

        if self.data_source.is_empty() {
            return Err(Error::Config(format!(
                "site {}: data_source is required",
                self.site
            )));
        }

        Ok(())
    }

    /// Cluster node URLs, trimmed, empties dropped
    pub fn cluster_nodes(&self) -> Vec<String> {
        self.es_cluster
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Source database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// `mysql` or `sqlite`
    #[serde(default = "default_driver")]
    pub driver: String,

    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub dbname: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Session timezone, e.g. `Asia/Shanghai` or `+08:00`
    #[serde(default)]
    pub time_zone: String,

    /// Statement run on every new connection
    #[serde(default)]
    pub init_sql: String,

    /// Database file for the sqlite driver
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DataSourceConfig {
    /// Load `etc/datasources/<name>.toml`
    pub fn load(paths: &PathsConfig, name: &str) -> Result<Self> {
        let path = paths.datasource_file(name);
        debug!("Loading data source {} from {:?}", name, path);
        if !path.exists() {
            return Err(Error::Config(format!(
                "Data source {} not found at {}",
                name,
                path.display()
            )));
        }
        let content = std::fs::read_to_string(&path)?;
        let config: DataSourceConfig = toml::from_str(&content)?;
        config.validate(name)?;
        Ok(config)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        match self.driver.to_lowercase().as_str() {
            "mysql" => {
                if self.host.is_empty() || self.dbname.is_empty() {
                    return Err(Error::Config(format!(
                        "data source {}: mysql requires host and dbname",
                        name
                    )));
                }
                Ok(())
            }
            "sqlite" => {
                if self.path.is_none() {
                    return Err(Error::Config(format!(
                        "data source {}: sqlite requires path",
                        name
                    )));
                }
                Ok(())
            }
            other => Err(Error::Config(format!(
                "data source {}: unsupported driver '{}'",
                name, other
            ))),
        }
    }
}

fn site_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9_\-@]+$").ok())
        .as_ref()
}

/// Site identifiers become path segments and staging file names
pub fn validate_site_name(site: &str) -> Result<()> {
    if site_name_pattern().is_some_and(|re| re.is_match(site)) {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid site: '{}'", site)))
    }
}
