//! YAML configuration with environment overrides.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sabtrack_adapters::ArrCatalogConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/sabtrack.db";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub catalogs: Vec<ArrCatalogConfig>,
    /// Level name to upstream priority integer. There is no built-in table.
    #[serde(default)]
    pub priority_levels: BTreeMap<String, i32>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: String,
    pub history_limit: usize,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            history_limit: 100,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub completed_after_hours: u64,
    pub check_interval_minutes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_after_hours: 48,
            check_interval_minutes: 60,
        }
    }
}

impl RetentionConfig {
    pub fn window(&self) -> chrono::Duration {
        // Capped at a century so the subtraction from `now` cannot overflow.
        chrono::Duration::hours(self.completed_after_hours.min(24 * 365 * 100) as i64)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_minutes * 60)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub sync_interval_secs: u64,
    pub enrichment_interval_secs: u64,
    pub enrichment_batch_size: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 5,
            enrichment_interval_secs: 10,
            enrichment_batch_size: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

impl AppConfig {
    /// Read `path`, apply `SABNZBD_URL` / `SABNZBD_API_KEY` / `DATABASE_URL`
    /// from the process environment, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config = Self::from_yaml_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = set("SABNZBD_URL") {
            self.upstream.url = url;
        }
        if let Some(key) = set("SABNZBD_API_KEY") {
            self.upstream.api_key = key;
        }
        if let Some(url) = set("DATABASE_URL") {
            self.database_url = url;
        }
    }

    /// Commands that call SABnzbd need an address; `migrate` and replays do not.
    pub fn require_upstream(&self) -> Result<()> {
        if self.upstream.url.trim().is_empty() {
            bail!("upstream.url is required (or set SABNZBD_URL)");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream.history_limit == 0 {
            bail!("upstream.history_limit must be at least 1");
        }
        if self.schedule.sync_interval_secs == 0
            || self.schedule.enrichment_interval_secs == 0
            || self.retention.check_interval_minutes == 0
        {
            bail!("tick intervals must be greater than zero");
        }
        if self.schedule.enrichment_batch_size == 0 {
            bail!("schedule.enrichment_batch_size must be at least 1");
        }

        let mut names = HashSet::new();
        let mut categories = HashSet::new();
        for catalog in &self.catalogs {
            if catalog.category.trim().is_empty() {
                bail!("catalog {} has an empty category", catalog.name);
            }
            if !names.insert(catalog.name.as_str()) {
                bail!("catalog name {} is configured twice", catalog.name);
            }
            if !categories.insert(catalog.category.as_str()) {
                bail!(
                    "category {} is bound to more than one catalog (second: {})",
                    catalog.category,
                    catalog.name
                );
            }
        }

        let mut levels = HashSet::new();
        for level in self.priority_levels.keys() {
            if !levels.insert(level.to_lowercase()) {
                bail!("priority level {level} is configured twice with different case");
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sabtrack_core::MediaType;
    use std::io::Write;

    const FULL: &str = r#"
upstream:
  url: http://sabnzbd:8080
  api_key: secret
catalogs:
  - name: radarr
    kind: movie
    url: http://radarr:7878
    api_key: r
    category: movies
  - name: sonarr
    kind: tv
    url: http://sonarr:8989
    api_key: s
    category: tv
priority_levels:
  Low: -1
  Normal: 0
  High: 1
  Force: 2
retention:
  completed_after_hours: 24
"#;

    #[test]
    fn full_config_parses_with_defaults_filled() {
        let config = AppConfig::from_yaml_str(FULL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.catalogs[1].kind, MediaType::Tv);
        assert_eq!(config.priority_levels["Force"], 2);
        assert_eq!(config.retention.completed_after_hours, 24);
        assert_eq!(config.retention.check_interval_minutes, 60);
        assert_eq!(config.upstream.history_limit, 100);
        assert_eq!(config.schedule.enrichment_batch_size, 5);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.bind_address(), "0.0.0.0:3001");
        assert_eq!(config.retention.window(), chrono::Duration::hours(24));
    }

    #[test]
    fn environment_overrides_win() {
        let mut config = AppConfig::from_yaml_str("upstream: {}").unwrap();
        config.validate().unwrap();
        assert!(config.require_upstream().is_err());
        config.apply_overrides(|key| match key {
            "SABNZBD_URL" => Some("http://nas:8080".into()),
            "DATABASE_URL" => Some("sqlite::memory:".into()),
            "SABNZBD_API_KEY" => Some("  ".into()),
            _ => None,
        });
        config.validate().unwrap();
        config.require_upstream().unwrap();
        assert_eq!(config.upstream.url, "http://nas:8080");
        assert_eq!(config.upstream.api_key, "");
        assert_eq!(config.database_url, "sqlite::memory:");
    }

    #[test]
    fn duplicate_category_binding_is_rejected() {
        let text = FULL.replace("category: tv", "category: movies");
        let err = AppConfig::from_yaml_str(&text).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("more than one catalog"));
    }

    #[test]
    fn load_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.catalogs.len(), 2);
    }

    #[test]
    fn load_accepts_a_config_without_upstream() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"server:\n  port: 4000\n").unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.server.port, 4000);
        assert!(config.catalogs.is_empty());
    }

    #[test]
    fn unknown_catalog_kind_fails_to_parse() {
        let text = FULL.replace("kind: tv", "kind: music");
        assert!(AppConfig::from_yaml_str(&text).is_err());
    }
}
