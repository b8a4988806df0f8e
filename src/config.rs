use anyhow::{Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "sgbench.toml";
pub const ENV_PREFIX: &str = "SGBENCH_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CheckerType {
    /// Signed `HeadObject` calls through the AWS SDK
    S3,
    /// Look the key up under a local mount of the bucket
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub max_concurrent_copies: usize,
    /// Wait for every copied file to become visible remotely
    pub verify: bool,
    pub output: PathBuf,
    pub poll_interval_ms: u64,
    /// Upper bound for a single existence check
    pub check_timeout_ms: u64,
    /// Give up on a file after this long; unset means poll forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_timeout_secs: Option<u64>,
    pub checker: CheckerType,
    /// S3-compatible endpoint; unset uses AWS itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Overrides the region from the AWS environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_root: Option<PathBuf>,
    pub sync_files: bool,
    pub preserve_timestamps: bool,
    pub json_logs: bool,
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrent_copies: 100,
            verify: true,
            output: PathBuf::from("./report.csv"),
            poll_interval_ms: 250,
            check_timeout_ms: 10_000,
            verify_timeout_secs: None,
            checker: CheckerType::S3,
            endpoint: None,
            region: None,
            mirror_root: None,
            sync_files: false,
            preserve_timestamps: false,
            json_logs: false,
            verbose: false,
        }
    }
}

impl AppConfig {
    /// Load the layered config: defaults, TOML file, `SGBENCH_*` env vars, then
    /// CLI overrides.
    pub fn new<T: Serialize>(config_file: Option<&Path>, cli_overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        figment = match config_file {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                figment.merge(Toml::file(path))
            }
            None => figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        };

        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = cli_overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_copies == 0 {
            bail!("max_concurrent_copies must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be at least 1");
        }
        if self.check_timeout_ms == 0 {
            bail!("check_timeout_ms must be at least 1");
        }
        if self.verify && self.checker == CheckerType::Local && self.mirror_root.is_none() {
            bail!("the local checker requires mirror_root");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Option<Duration> {
        self.verify_timeout_secs.map(Duration::from_secs)
    }

    /// Effective config rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
