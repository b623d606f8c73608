use anyhow::{bail, Context, Result};
use convo_analytics::AnalyticsConfig;
use convo_ingest::{BackoffPolicy, FetcherConfig, IngestionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "convo.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConvoConfig {
    pub storage: StorageSection,
    pub fetch: FetchSection,
    pub sync: SyncSection,
    pub verify: VerifySection,
    pub analytics: AnalyticsSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("convo.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchSection {
    pub page_size: usize,
    pub min_delay_ms: u64,
    pub backoff: BackoffPolicy,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            page_size: 1000,
            min_delay_ms: 250,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSection {
    pub max_pages_per_run: usize,
    pub poll_interval_secs: u64,
    pub lock_dir: Option<PathBuf>,
    /// Conversations synced at the same time by `convo sync`.
    pub max_workers: usize,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            max_pages_per_run: 10,
            poll_interval_secs: 60,
            lock_dir: None,
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VerifySection {
    pub window_hours: i64,
}

impl Default for VerifySection {
    fn default() -> Self {
        Self { window_hours: 24 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyticsSection {
    pub max_workers: usize,
}

impl Default for AnalyticsSection {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSection {
    pub log_dir: Option<PathBuf>,
}

impl ConvoConfig {
    /// A missing default file means defaults; a missing file that was asked
    /// for explicitly is an error.
    pub fn load(path: &Path, explicit: bool) -> Result<Self> {
        if !path.exists() {
            if explicit {
                bail!("config file {} does not exist", path.display());
            }
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        if config.fetch.page_size == 0 {
            bail!("fetch.page_size must be at least 1");
        }
        if config.verify.window_hours <= 0 {
            bail!("verify.window_hours must be positive");
        }
        Ok(config)
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            min_delay: Duration::from_millis(self.fetch.min_delay_ms),
            backoff: self.fetch.backoff,
        }
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            page_size: self.fetch.page_size,
            max_pages_per_run: self.sync.max_pages_per_run,
            lock_dir: self.sync.lock_dir.clone(),
        }
    }

    pub fn analytics_config(&self) -> AnalyticsConfig {
        AnalyticsConfig {
            max_workers: self.analytics.max_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ConvoConfig::parse("").expect("parse");
        assert_eq!(config, ConvoConfig::default());
        assert_eq!(config.fetcher_config(), FetcherConfig::default());
        assert_eq!(config.ingestion_config(), IngestionConfig::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = ConvoConfig::parse(
            r#"
            [storage]
            db_path = "/var/lib/convo/chats.db"

            [fetch]
            page_size = 200
            backoff = { strategy = "wait", max_retries = 5 }

            [sync]
            lock_dir = "/run/convo"

            [verify]
            window_hours = 72
            "#,
        )
        .expect("parse");

        assert_eq!(config.storage.db_path, PathBuf::from("/var/lib/convo/chats.db"));
        assert_eq!(config.fetch.page_size, 200);
        assert_eq!(config.fetch.min_delay_ms, 250);
        assert_eq!(config.fetch.backoff, BackoffPolicy::Wait { max_retries: 5 });
        assert_eq!(
            config.ingestion_config().lock_dir,
            Some(PathBuf::from("/run/convo"))
        );
        assert_eq!(config.verify.window_hours, 72);
        assert_eq!(config.analytics.max_workers, 4);
    }

    #[test]
    fn exponential_backoff_parses() {
        let config = ConvoConfig::parse(
            r#"
            [fetch.backoff]
            strategy = "exponential"
            base_ms = 100
            cap_ms = 5000
            max_attempts = 3
            "#,
        )
        .expect("parse");
        assert_eq!(
            config.fetch.backoff,
            BackoffPolicy::Exponential {
                base_ms: 100,
                cap_ms: 5000,
                max_attempts: 3
            }
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(ConvoConfig::parse("[fetch]\npage_size = 0\n").is_err());
        assert!(ConvoConfig::parse("[fetch.backoff]\nstrategy = \"linear\"\n").is_err());
    }

    #[test]
    fn missing_file_is_only_an_error_when_explicit() {
        let missing = Path::new("/nonexistent/convo.toml");
        assert!(ConvoConfig::load(missing, false).is_ok());
        assert!(ConvoConfig::load(missing, true).is_err());

        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "[analytics]\nmax_workers = 2").expect("write");
        let config = ConvoConfig::load(file.path(), true).expect("load");
        assert_eq!(config.analytics_config().max_workers, 2);
    }
}
