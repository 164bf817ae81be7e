use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "idecache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Expiry and capacity of one in-memory cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum duration a computed value is kept. `None` keeps it until invalidated.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// How long a negative entry suppresses recomputation. `None` never retries.
    #[serde(with = "humantime_serde")]
    pub retry_misses_after: Option<Duration>,
    /// Maximum number of entries. `None` means unbounded.
    pub in_memory_capacity: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: None,
            retry_misses_after: Some(Duration::from_secs(300)),
            in_memory_capacity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Parsed ctags indices, keyed by tags file.
    pub tag_indexes: CacheConfig,
    /// Make targets per source file.
    pub make_targets: CacheConfig,
    /// Compiler flags per source file.
    pub make_flags: CacheConfig,
}

/// Which tool regenerates tags files after a save.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagsBuilderKind {
    /// Invoke ctags directly.
    #[default]
    Ctags,
    /// Invoke `make ctags`, as automake projects provide.
    Make,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TagsConfig {
    /// Whether `tags` and `.tags` in the home directory are loaded.
    pub mine_home: bool,
    /// System directories that are mined recursively.
    pub system_include_dirs: Vec<PathBuf>,
    /// Delay before a queued mining walk starts.
    #[serde(with = "humantime_serde")]
    pub mine_delay: Duration,
    /// Delay between a save and the tags rebuild of its directory.
    #[serde(with = "humantime_serde")]
    pub rebuild_delay: Duration,
    pub builder: TagsBuilderKind,
    pub ctags_program: String,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            mine_home: true,
            system_include_dirs: vec![PathBuf::from("/usr/include")],
            mine_delay: Duration::from_millis(250),
            rebuild_delay: Duration::from_secs(5),
            builder: TagsBuilderKind::default(),
            ctags_program: "ctags".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MakeConfig {
    pub make_program: String,
    pub clang_program: String,
}

impl Default for MakeConfig {
    fn default() -> Self {
        Self {
            make_program: "make".into(),
            clang_program: "clang".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for tags and makecache files.
    ///
    /// Defaults to `<user cache dir>/<program_name>`.
    pub cache_dir: Option<PathBuf>,

    /// Name of the program, used to derive the default cache directory.
    pub program_name: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to.
    pub sentry_dsn: Option<Dsn>,

    /// Number of concurrent cache populations doing blocking work.
    pub workers: usize,

    /// Fine-tune cache expiry.
    pub caches: CacheConfigs,

    pub tags: TagsConfig,

    pub make: MakeConfig,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 4)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            program_name: "idecache".into(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            workers: default_workers(),
            caches: CacheConfigs::default(),
            tags: TagsConfig::default(),
            make: MakeConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The root of all on-disk state.
    pub fn cache_root(&self) -> PathBuf {
        match self.cache_dir {
            Some(ref dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(env::temp_dir)
                .join(&self.program_name),
        }
    }

    /// Return a directory below the cache root.
    pub fn cache_path(&self, dir: &str) -> PathBuf {
        self.cache_root().join(dir)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
