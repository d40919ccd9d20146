use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

/// Tunables for the sync cache. Durations are carried as milliseconds so the
/// config stays a flat TOML table; the accessor methods hand out `Duration`s.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Entry lifetime applied by `set` and batch flushes.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Trailing-edge delay between a `set` call and its merge.
    #[serde(default = "default_debounce_delay_ms")]
    pub debounce_delay_ms: u64,
    /// Interval of the shared batch flush timer.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Acquisition attempts before a keyed lock reports `TimedOut`.
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
    /// First backoff sleep; doubles after every failed attempt.
    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
    /// How long a just-sent record keeps suppressing push echoes.
    #[serde(default = "default_recently_sent_ttl_ms")]
    pub recently_sent_ttl_ms: u64,
    #[serde(default = "default_recently_sent_capacity")]
    pub recently_sent_capacity: usize,
    /// Timestamp distance inside which same-sender same-content records are
    /// treated as one logical message.
    #[serde(default = "default_collision_window_ms")]
    pub collision_window_ms: u64,
    /// Target file for explicit snapshots; none disables the snapshot store.
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            debounce_delay_ms: default_debounce_delay_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            lock_attempts: default_lock_attempts(),
            lock_backoff_ms: default_lock_backoff_ms(),
            recently_sent_ttl_ms: default_recently_sent_ttl_ms(),
            recently_sent_capacity: default_recently_sent_capacity(),
            collision_window_ms: default_collision_window_ms(),
            snapshot_path: None,
        }
    }
}

impl SyncConfig {
    const CONFIG_ENV: &'static str = "CHARLA_CONFIG_FILE";
    const TTL_ENV: &'static str = "CHARLA_TTL_MS";
    const FLUSH_INTERVAL_ENV: &'static str = "CHARLA_FLUSH_INTERVAL_MS";
    const SNAPSHOT_PATH_ENV: &'static str = "CHARLA_SNAPSHOT_PATH";

    /// Load configuration from defaults layered with optional config files and
    /// environment variables.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    pub fn load_with(config_path: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::resolve_config_path(config_path)? {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let file_config: Self = toml::from_str(&contents)
                .with_context(|| format!("invalid config file: {}", path.display()))?;

            config = file_config;
        }

        if let Ok(ttl) = env::var(Self::TTL_ENV) {
            config.ttl_ms = ttl
                .parse()
                .with_context(|| format!("invalid {name}", name = Self::TTL_ENV))?;
        }

        if let Ok(interval) = env::var(Self::FLUSH_INTERVAL_ENV) {
            config.flush_interval_ms = interval
                .parse()
                .with_context(|| format!("invalid {name}", name = Self::FLUSH_INTERVAL_ENV))?;
        }

        if let Ok(path) = env::var(Self::SNAPSHOT_PATH_ENV) {
            config.snapshot_path = Some(path);
        }

        Ok(config)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_backoff_ms)
    }

    pub fn recently_sent_ttl(&self) -> Duration {
        Duration::from_millis(self.recently_sent_ttl_ms)
    }

    pub fn collision_window(&self) -> Duration {
        Duration::from_millis(self.collision_window_ms)
    }

    fn resolve_config_path(explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            return Self::validate_path(path);
        }

        if let Ok(path) = env::var(Self::CONFIG_ENV) {
            return Self::validate_path(PathBuf::from(path));
        }

        let mut candidates = vec![PathBuf::from("charla.toml")];
        if let Some(dir) = Self::default_config_dir() {
            candidates.push(dir.join("config.toml"));
        }

        for candidate in candidates {
            if candidate.exists() {
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    fn validate_path(path: PathBuf) -> Result<Option<PathBuf>> {
        if path.exists() {
            Ok(Some(path))
        } else {
            Err(anyhow!(
                "configuration file does not exist: {}",
                path.display()
            ))
        }
    }

    fn default_config_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".charla"))
    }
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_debounce_delay_ms() -> u64 {
    300
}

fn default_flush_interval_ms() -> u64 {
    2_000
}

fn default_lock_attempts() -> u32 {
    3
}

fn default_lock_backoff_ms() -> u64 {
    100
}

fn default_recently_sent_ttl_ms() -> u64 {
    10_000
}

fn default_recently_sent_capacity() -> usize {
    20
}

fn default_collision_window_ms() -> u64 {
    5_000
}

fn home_dir() -> Option<PathBuf> {
    if let Some(path) = env::var_os("HOME") {
        return Some(PathBuf::from(path));
    }

    if let Some(path) = env::var_os("USERPROFILE") {
        return Some(PathBuf::from(path));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_carry_the_reference_tunables() {
        let config = SyncConfig::default();

        assert_eq!(config.ttl(), Duration::from_secs(5 * 60));
        assert_eq!(config.debounce_delay(), Duration::from_millis(300));
        assert_eq!(config.flush_interval(), Duration::from_secs(2));
        assert_eq!(config.lock_attempts, 3);
        assert_eq!(config.lock_backoff(), Duration::from_millis(100));
        assert_eq!(config.recently_sent_ttl(), Duration::from_secs(10));
        assert_eq!(config.recently_sent_capacity, 20);
        assert_eq!(config.collision_window(), Duration::from_secs(5));
        assert!(config.snapshot_path.is_none());
    }

    #[test]
    fn toml_values_override_defaults_field_by_field() {
        let config: SyncConfig = toml::from_str(
            r#"
            ttl_ms = 60000
            lock_attempts = 5
            snapshot_path = "/tmp/charla-snapshot.json"
            "#,
        )
        .expect("config parses");

        assert_eq!(config.ttl(), Duration::from_secs(60));
        assert_eq!(config.lock_attempts, 5);
        assert_eq!(
            config.snapshot_path.as_deref(),
            Some("/tmp/charla-snapshot.json")
        );
        // Unset fields fall back to the defaults.
        assert_eq!(config.flush_interval(), Duration::from_secs(2));
        assert_eq!(config.recently_sent_capacity, 20);
    }

    #[test]
    fn explicit_missing_config_path_is_an_error() {
        let err = SyncConfig::load_with(Some(PathBuf::from("/nonexistent/charla.toml")))
            .expect_err("missing explicit path must fail");
        assert!(err.to_string().contains("configuration file does not exist"));
    }

    #[test]
    fn config_file_loads_and_env_values_override_it() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("charla.toml");
        fs::write(&path, "ttl_ms = 60000\nflush_interval_ms = 7000\n").expect("write config");

        let from_file = SyncConfig::load_with(Some(path.clone())).expect("config loads");
        assert_eq!(from_file.ttl(), Duration::from_secs(60));
        assert_eq!(from_file.flush_interval(), Duration::from_secs(7));
        assert_eq!(from_file.lock_attempts, 3);

        unsafe { env::set_var(SyncConfig::TTL_ENV, "1500") };
        let layered = SyncConfig::load_with(Some(path));
        unsafe { env::remove_var(SyncConfig::TTL_ENV) };

        let layered = layered.expect("config loads");
        assert_eq!(layered.ttl(), Duration::from_millis(1_500));
        // The env override is per variable; file values elsewhere stand.
        assert_eq!(layered.flush_interval(), Duration::from_secs(7));
    }
}
